use crate::tree::DerivationTree;
use tracing::debug;

/// The hyper-parameters a tuner may adjust between generations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rates {
    pub mutation_rate: f64,
    pub crossover_rate: f64,
    pub max_repetitions: usize,
}

/// Adjusts rates once per generation.
pub trait AdaptiveTuner: Send {
    /// # Arguments
    /// * `previous_best`: Best fitness of the previous generation.
    /// * `current_best`: Best fitness of the generation just evaluated.
    /// * `population`: The live population, read-only.
    /// * `rates`: The rates used for the generation just evaluated.
    ///
    /// # Returns
    /// The rates for the next generation.
    fn tune(
        &mut self,
        previous_best: f64,
        current_best: f64,
        population: &[DerivationTree],
        rates: Rates,
    ) -> Rates;
}

/// Keeps every rate unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConstantRates;

impl AdaptiveTuner for ConstantRates {
    fn tune(&mut self, _previous: f64, _current: f64, _population: &[DerivationTree], rates: Rates) -> Rates {
        rates
    }
}

/// Raises mutation (and lowers crossover) after `patience` generations
/// without improvement; drifts back to the base rates once fitness improves.
#[derive(Debug, Clone)]
pub struct StagnationTuner {
    base: Rates,
    pub patience: usize,
    pub step: f64,
    pub max_mutation_rate: f64,
    pub min_crossover_rate: f64,
    pub max_repetitions_cap: usize,
    stagnant: usize,
}

impl StagnationTuner {
    pub fn new(base: Rates) -> Self {
        Self {
            base,
            patience: 5,
            step: 0.05,
            max_mutation_rate: 0.9,
            min_crossover_rate: 0.1,
            max_repetitions_cap: base.max_repetitions.saturating_mul(2).max(1),
            stagnant: 0,
        }
    }

    pub fn stagnant_generations(&self) -> usize {
        self.stagnant
    }
}

impl AdaptiveTuner for StagnationTuner {
    fn tune(
        &mut self,
        previous_best: f64,
        current_best: f64,
        _population: &[DerivationTree],
        rates: Rates,
    ) -> Rates {
        if current_best > previous_best + f64::EPSILON {
            self.stagnant = 0;
            return Rates {
                mutation_rate: (rates.mutation_rate - self.step).max(self.base.mutation_rate),
                crossover_rate: (rates.crossover_rate + self.step).min(self.base.crossover_rate),
                max_repetitions: rates.max_repetitions.min(self.base.max_repetitions).max(1),
            };
        }
        self.stagnant += 1;
        if self.stagnant < self.patience {
            return rates;
        }
        self.stagnant = 0;
        let tuned = Rates {
            mutation_rate: (rates.mutation_rate + self.step).min(self.max_mutation_rate),
            crossover_rate: (rates.crossover_rate - self.step).max(self.min_crossover_rate),
            max_repetitions: (rates.max_repetitions + 1).min(self.max_repetitions_cap),
        };
        debug!(
            mutation = tuned.mutation_rate,
            crossover = tuned.crossover_rate,
            max_repetitions = tuned.max_repetitions,
            "Fitness stagnated, raising exploration"
        );
        tuned
    }
}
