use crate::scheduler::{ScheduleError, Scheduler, uniform_index};
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use rand_core::RngCore;
use std::collections::BTreeMap;
use tracing::debug;

/// Exponent of the inverse-frequency term.
pub const DEFAULT_EXPONENT: f64 = 2.0;

/// AFL-style power schedule over packet types.
///
/// A type's energy is `(1 / frequency^exponent) * (1 - coverage)`: types
/// that were produced rarely and whose structure is poorly covered get
/// most of the weight. Types that are tracked by coverage but were never
/// produced get `1 - coverage`.
#[derive(Debug, Clone)]
pub struct PowerSchedule<K: Ord + Clone> {
    exponent: f64,
    frequencies: BTreeMap<K, usize>,
    coverage: BTreeMap<K, f64>,
    energies: BTreeMap<K, f64>,
}

impl<K: Ord + Clone> Default for PowerSchedule<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone> PowerSchedule<K> {
    pub fn new() -> Self {
        Self {
            exponent: DEFAULT_EXPONENT,
            frequencies: BTreeMap::new(),
            coverage: BTreeMap::new(),
            energies: BTreeMap::new(),
        }
    }

    pub fn exponent(&self) -> f64 {
        self.exponent
    }

    fn raw_energy(&self, frequency: usize, coverage: f64) -> f64 {
        let uncovered = 1.0 - coverage.clamp(0.0, 1.0);
        if frequency == 0 {
            uncovered
        } else {
            uncovered / (frequency as f64).powf(self.exponent)
        }
    }

    /// Recomputes normalized energies.
    ///
    /// # Arguments
    ///
    /// * `observed` - Every packet type produced so far; repeats are the
    ///   frequencies.
    /// * `coverage_by_type` - Covered fraction per type. Types missing here
    ///   count as uncovered.
    ///
    /// # Returns
    ///
    /// The normalized energies, summing to 1, or
    /// `ScheduleError::DegenerateWeights` when every energy is zero.
    pub fn assign_energy(
        &mut self,
        observed: &[K],
        coverage_by_type: &BTreeMap<K, f64>,
    ) -> Result<&BTreeMap<K, f64>, ScheduleError> {
        self.frequencies.clear();
        for key in observed {
            *self.frequencies.entry(key.clone()).or_default() += 1;
        }
        self.coverage = coverage_by_type.clone();

        let mut energies = BTreeMap::new();
        for (key, frequency) in &self.frequencies {
            let coverage = self.coverage.get(key).copied().unwrap_or(0.0);
            energies.insert(key.clone(), self.raw_energy(*frequency, coverage));
        }
        for (key, coverage) in &self.coverage {
            if !energies.contains_key(key) {
                energies.insert(key.clone(), self.raw_energy(0, *coverage));
            }
        }

        let total: f64 = energies.values().sum();
        if total <= 0.0 {
            self.energies.clear();
            return Err(ScheduleError::DegenerateWeights(energies.len()));
        }
        for energy in energies.values_mut() {
            *energy /= total;
        }
        self.energies = energies;
        Ok(&self.energies)
    }

    /// Normalized energy from the last `assign_energy`, 0 if unknown.
    pub fn energy(&self, key: &K) -> f64 {
        self.energies.get(key).copied().unwrap_or(0.0)
    }

    /// Draws a type by weighted sampling over the normalized energies.
    pub fn choose(&self, rng: &mut dyn RngCore) -> Result<K, ScheduleError> {
        if self.energies.is_empty() {
            return Err(ScheduleError::NoCandidates);
        }
        let keys: Vec<&K> = self.energies.keys().collect();
        let dist = WeightedIndex::new(self.energies.values().copied())
            .map_err(|_| ScheduleError::DegenerateWeights(keys.len()))?;
        Ok(keys[dist.sample(rng)].clone())
    }
}

impl<K: Ord + Clone + Send> Scheduler<K> for PowerSchedule<K> {
    /// Weighted choice among `candidates`; all-zero energies fall back to a
    /// uniform choice.
    fn next(&mut self, candidates: &[K], rng: &mut dyn RngCore) -> Result<usize, ScheduleError> {
        if candidates.is_empty() {
            return Err(ScheduleError::NoCandidates);
        }
        let weights: Vec<f64> = candidates
            .iter()
            .map(|c| {
                let frequency = self.frequencies.get(c).copied().unwrap_or(0);
                let coverage = self.coverage.get(c).copied().unwrap_or(0.0);
                self.raw_energy(frequency, coverage)
            })
            .collect();
        match WeightedIndex::new(&weights) {
            Ok(dist) => Ok(dist.sample(rng)),
            Err(_) => {
                debug!(
                    candidates = candidates.len(),
                    "Degenerate energies, choosing uniformly"
                );
                uniform_index(candidates.len(), rng)
            }
        }
    }

    fn report_feedback(&mut self, chosen: &K, coverage_by_type: &BTreeMap<K, f64>) {
        *self.frequencies.entry(chosen.clone()).or_default() += 1;
        self.coverage = coverage_by_type.clone();
    }
}
