use crate::adaptation::{AdaptiveTuner, ConstantRates, Rates};
use crate::config::{BraidConfig, ConfigError, CoverageSettings, EvolutionSettings, IoSettings};
use crate::constraint::Constraint;
use crate::corpus::{CorpusError, SolutionCorpus};
use crate::crossover::crossover;
use crate::evaluation::{Evaluation, Evaluator};
use crate::exchange::{ExchangeError, Transport};
use crate::fitness::FailingTree;
use crate::fuzz::FuzzSettings;
use crate::grammar::{Grammar, GrammarError};
use crate::io_fuzzer::IoFuzzer;
use crate::mutator::{Mutator, SubtreeMutator};
use crate::population::PopulationManager;
use crate::scheduler::ScheduleError;
use crate::selection::{chance, elite_indices};
use crate::tree::DerivationTree;
use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum EvolutionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Grammar(#[from] GrammarError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error(transparent)]
    Corpus(#[from] CorpusError),
    /// Fuzzing the start symbol produced no individual at all.
    #[error("Could not generate an initial population")]
    Initialization,
}

/// Phases of one run. `step` performs exactly one transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvolutionState {
    Initialize,
    Evaluate,
    CheckTermination,
    Select,
    Crossover,
    Mutate,
    Done,
}

/// Summary of one evaluated generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationStats {
    pub generation: usize,
    pub best_fitness: f64,
    pub mean_fitness: f64,
    /// Distinct solutions found so far.
    pub solutions: usize,
    pub population_size: usize,
    pub mutation_rate: f64,
    pub crossover_rate: f64,
}

/// What [`Braid::generate`] produces.
pub enum GenerationMode<'t> {
    /// Each new solution as soon as the evolution finds it.
    Solutions,
    /// One assembled exchange per round against the given transport.
    Io(&'t mut dyn Transport),
}

/// An offspring on its way through crossover and mutation, with the nodes
/// its parent was blamed for.
struct Offspring {
    tree: DerivationTree,
    failing: Vec<FailingTree>,
}

/// Evolves derivation trees of a grammar towards satisfying a set of
/// constraints.
pub struct Braid {
    grammar: Grammar,
    evaluator: Evaluator,
    settings: EvolutionSettings,
    io_settings: IoSettings,
    coverage_settings: CoverageSettings,
    tuner: Box<dyn AdaptiveTuner>,
    mutator: Box<dyn Mutator<ChaCha8Rng>>,
    rng: ChaCha8Rng,
    manager: PopulationManager,
    corpus: SolutionCorpus,
    population: Vec<DerivationTree>,
    evaluations: Vec<Evaluation>,
    offspring: Vec<Offspring>,
    state: EvolutionState,
    generation: usize,
    rates: Rates,
    best_fitness: f64,
    cancel: Arc<AtomicBool>,
    stats: Vec<GenerationStats>,
}

fn fuzz_settings(settings: &EvolutionSettings) -> FuzzSettings {
    FuzzSettings {
        max_nodes: settings.max_nodes,
        max_repetitions: settings.max_repetitions,
    }
}

fn base_rates(settings: &EvolutionSettings) -> Rates {
    Rates {
        mutation_rate: settings.mutation_rate,
        crossover_rate: settings.crossover_rate,
        max_repetitions: settings.max_repetitions,
    }
}

impl Braid {
    /// # Arguments
    ///
    /// * `grammar` - The grammar individuals derive from.
    /// * `constraints` - Hard and soft constraints, in any order.
    /// * `config` - Validated before anything else happens.
    ///
    /// # Returns
    ///
    /// The engine, or `EvolutionError::Config` for unusable settings.
    pub fn new(
        grammar: Grammar,
        constraints: Vec<Box<dyn Constraint>>,
        config: &BraidConfig,
    ) -> Result<Self, EvolutionError> {
        config.validate()?;
        let settings = config.evolution.clone();
        let seed = settings
            .seed
            .unwrap_or_else(|| ChaCha8Rng::from_os_rng().next_u64());
        info!(seed, "Seeding random source");
        Ok(Self {
            evaluator: Evaluator::new(constraints),
            io_settings: config.io.clone(),
            coverage_settings: config.coverage.clone(),
            tuner: Box::new(ConstantRates),
            mutator: Box::new(SubtreeMutator::new(fuzz_settings(&settings))),
            rng: ChaCha8Rng::seed_from_u64(seed),
            manager: PopulationManager::new(fuzz_settings(&settings)),
            corpus: SolutionCorpus::new(),
            population: Vec::new(),
            evaluations: Vec::new(),
            offspring: Vec::new(),
            state: EvolutionState::Initialize,
            generation: 0,
            rates: base_rates(&settings),
            best_fitness: 0.0,
            cancel: Arc::new(AtomicBool::new(false)),
            stats: Vec::new(),
            grammar,
            settings,
        })
    }

    pub fn with_tuner(mut self, tuner: Box<dyn AdaptiveTuner>) -> Self {
        self.tuner = tuner;
        self
    }

    pub fn with_mutator(mut self, mutator: Box<dyn Mutator<ChaCha8Rng>>) -> Self {
        self.mutator = mutator;
        self
    }

    pub fn grammar(&self) -> &Grammar {
        &self.grammar
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    pub fn settings(&self) -> &EvolutionSettings {
        &self.settings
    }

    pub fn state(&self) -> EvolutionState {
        self.state
    }

    pub fn generation(&self) -> usize {
        self.generation
    }

    pub fn population(&self) -> &[DerivationTree] {
        &self.population
    }

    pub fn corpus(&self) -> &SolutionCorpus {
        &self.corpus
    }

    pub fn stats(&self) -> &[GenerationStats] {
        &self.stats
    }

    /// Setting the returned flag stops the run at the next generation
    /// boundary.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Forgets the current run; the next `step` starts a new population.
    pub fn restart(&mut self) {
        self.state = EvolutionState::Initialize;
        self.generation = 0;
        self.population.clear();
        self.evaluations.clear();
        self.offspring.clear();
        self.corpus = SolutionCorpus::new();
        self.stats.clear();
        self.rates = base_rates(&self.settings);
        self.best_fitness = 0.0;
        self.manager = PopulationManager::new(fuzz_settings(&self.settings));
    }

    /// Runs a fresh evolution to completion.
    ///
    /// # Arguments
    ///
    /// * `max_generations` - Generation cap.
    /// * `desired_solutions` - Stop once this many distinct solutions exist.
    /// * `population_size` - Individuals per generation.
    /// * `mutation_rate` - Chance an offspring is mutated.
    /// * `crossover_rate` - Chance a pair of offspring is crossed over.
    /// * `random_seed` - Reseeds the random source, so equal arguments
    ///   reproduce a run.
    ///
    /// # Returns
    ///
    /// Distinct solutions ranked by soft score, at most `desired_solutions`
    /// of them. Fewer are returned if the run ends early. The arguments
    /// apply to this run only; the configured settings are kept.
    pub fn evolve(
        &mut self,
        max_generations: usize,
        desired_solutions: usize,
        population_size: usize,
        mutation_rate: f64,
        crossover_rate: f64,
        random_seed: u64,
    ) -> Result<Vec<DerivationTree>, EvolutionError> {
        let candidate = EvolutionSettings {
            max_generations,
            desired_solutions: Some(desired_solutions),
            population_size,
            mutation_rate,
            crossover_rate,
            seed: Some(random_seed),
            ..self.settings.clone()
        };
        BraidConfig {
            evolution: candidate.clone(),
            io: self.io_settings.clone(),
            coverage: self.coverage_settings.clone(),
        }
        .validate()?;
        let configured = std::mem::replace(&mut self.settings, candidate);
        self.rng = ChaCha8Rng::seed_from_u64(random_seed);
        self.restart();
        let result = self.run();
        self.settings = configured;
        result
    }

    /// Steps the current run until it is done.
    pub fn run(&mut self) -> Result<Vec<DerivationTree>, EvolutionError> {
        while self.step()? != EvolutionState::Done {}
        Ok(self
            .corpus
            .ranked(&self.evaluator, Some(self.settings.desired_solutions())))
    }

    /// Performs one state transition and returns the new state.
    pub fn step(&mut self) -> Result<EvolutionState, EvolutionError> {
        self.state = match self.state {
            EvolutionState::Initialize => self.initialize()?,
            EvolutionState::Evaluate => self.evaluate(),
            EvolutionState::CheckTermination => self.check_termination(),
            EvolutionState::Select => self.select()?,
            EvolutionState::Crossover => self.crossover(),
            EvolutionState::Mutate => self.mutate(),
            EvolutionState::Done => EvolutionState::Done,
        };
        Ok(self.state)
    }

    fn initialize(&mut self) -> Result<EvolutionState, EvolutionError> {
        self.population =
            self.manager
                .generate(&self.grammar, self.settings.population_size, &mut self.rng);
        if self.population.is_empty() {
            return Err(EvolutionError::Initialization);
        }
        debug!(size = self.population.len(), "Initial population generated");
        Ok(EvolutionState::Evaluate)
    }

    fn evaluate(&mut self) -> EvolutionState {
        self.evaluations = self.evaluator.evaluate_population(&self.population);
        for (tree, evaluation) in self.population.iter().zip(&self.evaluations) {
            self.corpus.add(tree, evaluation, self.generation);
        }
        let fitness: Vec<f64> = self.evaluations.iter().map(|e| e.fitness).collect();
        let best_fitness = fitness.iter().copied().fold(0.0, f64::max);
        let mean_fitness = if fitness.is_empty() {
            0.0
        } else {
            fitness.iter().sum::<f64>() / fitness.len() as f64
        };
        let stats = GenerationStats {
            generation: self.generation,
            best_fitness,
            mean_fitness,
            solutions: self.corpus.len(),
            population_size: self.population.len(),
            mutation_rate: self.rates.mutation_rate,
            crossover_rate: self.rates.crossover_rate,
        };
        info!(
            generation = stats.generation,
            best = stats.best_fitness,
            mean = stats.mean_fitness,
            solutions = stats.solutions,
            "Generation evaluated"
        );
        self.stats.push(stats);
        EvolutionState::CheckTermination
    }

    fn check_termination(&mut self) -> EvolutionState {
        if self.cancelled() {
            info!(generation = self.generation, "Run cancelled");
            return EvolutionState::Done;
        }
        if self.corpus.len() >= self.settings.desired_solutions() {
            info!(solutions = self.corpus.len(), "Found enough solutions");
            return EvolutionState::Done;
        }
        if self.generation >= self.settings.max_generations {
            info!(
                generation = self.generation,
                solutions = self.corpus.len(),
                "Generation limit reached"
            );
            return EvolutionState::Done;
        }
        let current_best = self.stats.last().map_or(0.0, |s| s.best_fitness);
        self.rates = self
            .tuner
            .tune(self.best_fitness, current_best, &self.population, self.rates);
        self.best_fitness = current_best;
        self.manager.set_max_repetitions(self.rates.max_repetitions);
        EvolutionState::Select
    }

    /// Keeps the elites and picks parents for the rest of the next
    /// generation. Parents are repaired from their suggestions first.
    fn select(&mut self) -> Result<EvolutionState, EvolutionError> {
        let fitness: Vec<f64> = self.evaluations.iter().map(|e| e.fitness).collect();
        let target = self.settings.population_size;
        let elites = elite_indices(&fitness, self.settings.elite_count().min(target));

        self.manager.reset();
        let mut next = Vec::with_capacity(target);
        for idx in &elites {
            self.manager.add_unique(&mut next, self.population[*idx].clone());
        }

        let tournament_size = self.settings.tournament_size();
        self.offspring.clear();
        for _ in next.len()..target {
            let idx = self
                .settings
                .selection
                .select(&fitness, tournament_size, &mut self.rng)?;
            let evaluation = &self.evaluations[idx];
            let (tree, repaired) = PopulationManager::fix_individual(
                &self.grammar,
                &self.population[idx],
                &evaluation.failing_trees,
            );
            let failing = if repaired {
                Vec::new()
            } else {
                evaluation.failing_trees.clone()
            };
            self.offspring.push(Offspring { tree, failing });
        }
        self.population = next;
        Ok(EvolutionState::Crossover)
    }

    fn crossover(&mut self) -> EvolutionState {
        let mut crossed = 0;
        for pair in self.offspring.chunks_exact_mut(2) {
            if !chance(&mut self.rng, self.rates.crossover_rate) {
                continue;
            }
            let [a, b] = pair else {
                continue;
            };
            if let Some((child_a, child_b)) = crossover(&a.tree, &b.tree, &a.failing, &mut self.rng) {
                a.tree = child_a;
                b.tree = child_b;
                crossed += 1;
            }
        }
        debug!(crossed, "Crossover done");
        EvolutionState::Mutate
    }

    fn mutate(&mut self) -> EvolutionState {
        let mut next = std::mem::take(&mut self.population);
        for offspring in std::mem::take(&mut self.offspring) {
            let tree = if chance(&mut self.rng, self.rates.mutation_rate) {
                match self
                    .mutator
                    .mutate(&self.grammar, &offspring.tree, &offspring.failing, &mut self.rng)
                {
                    Ok(mutated) => mutated,
                    Err(e) => {
                        warn!(error = %e, "Mutation failed, keeping the offspring unchanged");
                        offspring.tree
                    }
                }
            } else {
                offspring.tree
            };
            self.manager.add_unique(&mut next, tree);
        }
        self.manager.refill(
            &self.grammar,
            &mut next,
            self.settings.population_size,
            &mut self.rng,
        );
        self.population = next;
        self.generation += 1;
        EvolutionState::Evaluate
    }

    /// A lazy sequence of results.
    ///
    /// Each call starts over: in `Solutions` mode a new run begins and every
    /// solution is yielded as soon as it is found; in `Io` mode every item is
    /// one exchange round, and a failed round yields an error without ending
    /// the sequence. Both stop once the cancel token is set.
    pub fn generate<'a>(
        &'a mut self,
        mode: GenerationMode<'a>,
    ) -> Box<dyn Iterator<Item = Result<DerivationTree, EvolutionError>> + 'a> {
        match mode {
            GenerationMode::Solutions => {
                self.restart();
                Box::new(SolutionStream {
                    braid: self,
                    emitted: 0,
                })
            }
            GenerationMode::Io(transport) => {
                let fuzzer = IoFuzzer::new(
                    &self.grammar,
                    self.io_settings.clone(),
                    &self.coverage_settings,
                    fuzz_settings(&self.settings),
                );
                match fuzzer {
                    Ok(fuzzer) => Box::new(ExchangeStream {
                        braid: self,
                        fuzzer,
                        transport,
                    }),
                    Err(e) => Box::new(std::iter::once(Err::<DerivationTree, _>(
                        EvolutionError::from(e),
                    ))),
                }
            }
        }
    }
}

struct SolutionStream<'a> {
    braid: &'a mut Braid,
    emitted: usize,
}

impl Iterator for SolutionStream<'_> {
    type Item = Result<DerivationTree, EvolutionError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(solution) = self.braid.corpus.get(self.emitted) {
                self.emitted += 1;
                return Some(Ok(solution.tree.clone()));
            }
            if self.braid.state == EvolutionState::Done {
                return None;
            }
            if let Err(e) = self.braid.step() {
                self.braid.state = EvolutionState::Done;
                return Some(Err(e));
            }
        }
    }
}

struct ExchangeStream<'a> {
    braid: &'a mut Braid,
    fuzzer: IoFuzzer,
    transport: &'a mut dyn Transport,
}

impl Iterator for ExchangeStream<'_> {
    type Item = Result<DerivationTree, EvolutionError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.braid.cancelled() {
            return None;
        }
        let braid = &mut *self.braid;
        let result = self
            .fuzzer
            .run_round(&mut *self.transport, &mut braid.evaluator, &mut braid.rng);
        if let Err(e) = &result {
            warn!(error = %e, "Exchange round failed");
        }
        Some(result.map_err(EvolutionError::from))
    }
}
