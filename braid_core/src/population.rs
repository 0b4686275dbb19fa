use crate::constraint::Comparison;
use crate::fitness::FailingTree;
use crate::fuzz::{FuzzSettings, Fuzzer};
use crate::grammar::Grammar;
use crate::parser::ParsingMode;
use crate::tree::DerivationTree;
use rand::Rng;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Fresh-candidate attempts allowed per missing individual.
const ATTEMPTS_PER_INDIVIDUAL: usize = 10;

/// Keeps a population free of structural duplicates.
///
/// Uniqueness is by [`DerivationTree::structural_hash`], so two different
/// derivations of the same string are distinct individuals.
#[derive(Debug, Default, Clone)]
pub struct PopulationManager {
    settings: FuzzSettings,
    known_hashes: HashSet<[u8; 16]>,
}

impl PopulationManager {
    pub fn new(settings: FuzzSettings) -> Self {
        Self {
            settings,
            known_hashes: HashSet::new(),
        }
    }

    pub fn settings(&self) -> FuzzSettings {
        self.settings
    }

    pub fn set_max_repetitions(&mut self, max_repetitions: usize) {
        self.settings.max_repetitions = max_repetitions.max(1);
    }

    /// Forgets every hash; the next population starts from scratch.
    pub fn reset(&mut self) {
        self.known_hashes.clear();
    }

    /// Adds `tree` to `population` unless an identical tree is already in it.
    pub fn add_unique(&mut self, population: &mut Vec<DerivationTree>, tree: DerivationTree) -> bool {
        if self.known_hashes.insert(tree.structural_hash()) {
            population.push(tree);
            true
        } else {
            false
        }
    }

    /// Tops `population` up to `target` with freshly fuzzed, unique trees.
    ///
    /// Gives up after `10 * missing` attempts, so a grammar with fewer
    /// distinct trees than `target` yields a smaller population instead of
    /// looping forever.
    pub fn refill<R: Rng + ?Sized>(
        &mut self,
        grammar: &Grammar,
        population: &mut Vec<DerivationTree>,
        target: usize,
        rng: &mut R,
    ) {
        let missing = target.saturating_sub(population.len());
        if missing == 0 {
            return;
        }
        let fuzzer = Fuzzer::new(grammar, self.settings);
        let mut attempts = missing * ATTEMPTS_PER_INDIVIDUAL;
        while population.len() < target && attempts > 0 {
            attempts -= 1;
            match fuzzer.fuzz(rng) {
                Ok(tree) => {
                    self.add_unique(population, tree);
                }
                Err(e) => warn!(error = %e, "failed to fuzz a fresh individual"),
            }
        }
        if population.len() < target {
            debug!(
                have = population.len(),
                target, "ran out of attempts generating unique individuals"
            );
        }
    }

    /// Starts a new population of up to `size` unique trees.
    pub fn generate<R: Rng + ?Sized>(
        &mut self,
        grammar: &Grammar,
        size: usize,
        rng: &mut R,
    ) -> Vec<DerivationTree> {
        self.reset();
        let mut population = Vec::with_capacity(size);
        self.refill(grammar, &mut population, size, rng);
        population
    }

    /// Applies `==` suggestions from `failing` by parsing the suggested value
    /// into the blamed node. Suggestions that do not parse, or whose node
    /// has changed or is read-only, are skipped.
    ///
    /// # Returns
    /// The repaired tree and whether any suggestion was applied.
    pub fn fix_individual(
        grammar: &Grammar,
        tree: &DerivationTree,
        failing: &[FailingTree],
    ) -> (DerivationTree, bool) {
        let mut fixed = tree.clone();
        let mut applied = false;
        let mut ordered: Vec<&FailingTree> = failing.iter().collect();
        ordered.sort_by_key(|f| std::cmp::Reverse(f.path.len()));
        for failing_tree in ordered {
            let Some(suggestion) = failing_tree
                .suggestions
                .iter()
                .find(|s| s.op == Comparison::Eq)
            else {
                continue;
            };
            let Some(name) = failing_tree.symbol.name() else {
                continue;
            };
            let writable = fixed
                .get(&failing_tree.path)
                .is_some_and(|n| *n.symbol() == failing_tree.symbol && !n.is_read_only());
            if !writable {
                continue;
            }
            let value = suggestion.value.to_string();
            let Ok(parsed) = grammar.parse(value.as_bytes(), name, ParsingMode::Complete) else {
                continue;
            };
            if fixed.replace_at(&failing_tree.path, parsed).is_ok() {
                applied = true;
            }
        }
        if applied {
            fixed.strip_nested_parties();
        }
        (fixed, applied)
    }
}
