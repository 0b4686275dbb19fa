use crate::fitness::FailingTree;
use crate::fuzz::{FuzzSettings, Fuzzer};
use crate::grammar::{Grammar, GrammarError};
use crate::tree::{DerivationTree, TreePath};
use rand::Rng;
use rand::seq::IndexedRandom;

/// Chance of targeting a failing node when the tree has any.
const DEFAULT_FAILING_BIAS: f64 = 0.9;

/// A `Mutator` transforms a derivation tree into a new, still
/// grammar-valid derivation tree.
///
/// # Type Parameters
/// * `R`: The type of random number generator used for mutation decisions.
pub trait Mutator<R: Rng + ?Sized> {
    /// Produces a mutated copy of `tree`.
    ///
    /// # Arguments
    /// * `grammar`: The grammar `tree` derives from.
    /// * `tree`: The individual to mutate; left untouched.
    /// * `failing`: Nodes blamed by the last evaluation of `tree`. May be
    ///   empty or stale; stale entries are ignored.
    /// * `rng`: A mutable reference to the run's random number generator.
    ///
    /// # Returns
    /// `Result<DerivationTree, GrammarError>`:
    ///   - `Ok(mutated)`: The mutated tree.
    ///   - `Err(error)`: The regenerated subtree could not be produced.
    fn mutate(
        &mut self,
        grammar: &Grammar,
        tree: &DerivationTree,
        failing: &[FailingTree],
        rng: &mut R,
    ) -> Result<DerivationTree, GrammarError>;
}

/// Replaces one non-terminal subtree wholesale with a freshly fuzzed
/// expansion of the same symbol.
///
/// Terminals and generator-produced (read-only) nodes are never edited in
/// place: the mutation climbs to the nearest writable non-terminal ancestor
/// and regenerates that instead.
#[derive(Debug, Clone, Copy)]
pub struct SubtreeMutator {
    pub settings: FuzzSettings,
    pub failing_bias: f64,
}

impl SubtreeMutator {
    pub fn new(settings: FuzzSettings) -> Self {
        Self {
            settings,
            failing_bias: DEFAULT_FAILING_BIAS,
        }
    }

    fn pick_target<R: Rng + ?Sized>(
        &self,
        tree: &DerivationTree,
        failing: &[FailingTree],
        rng: &mut R,
    ) -> TreePath {
        let live: Vec<&TreePath> = failing
            .iter()
            .filter(|f| tree.get(&f.path).is_some_and(|n| *n.symbol() == f.symbol))
            .map(|f| &f.path)
            .collect();
        if !live.is_empty() && rng.random_bool(self.failing_bias.clamp(0.0, 1.0)) {
            if let Some(path) = live.choose(rng) {
                return (*path).clone();
            }
        }
        tree.non_terminal_paths()
            .choose(rng)
            .cloned()
            .unwrap_or_default()
    }
}

/// Shortens `path` until it names a writable non-terminal; the root is
/// the last resort.
fn writable_ancestor(tree: &DerivationTree, mut path: TreePath) -> TreePath {
    while !path.is_empty() {
        match tree.get(&path) {
            Some(node) if node.symbol().is_non_terminal() && !node.is_read_only() => break,
            _ => {
                path.pop();
            }
        }
    }
    path
}

impl<R: Rng + ?Sized> Mutator<R> for SubtreeMutator {
    fn mutate(
        &mut self,
        grammar: &Grammar,
        tree: &DerivationTree,
        failing: &[FailingTree],
        rng: &mut R,
    ) -> Result<DerivationTree, GrammarError> {
        let target = self.pick_target(tree, failing, rng);
        let path = writable_ancestor(tree, target);
        let Some(old) = tree.get(&path) else {
            return Ok(tree.clone());
        };
        let Some(name) = old.symbol().name() else {
            return Ok(tree.clone());
        };
        let rest = tree.size() - old.size();
        let budget = self.settings.max_nodes.saturating_sub(rest).max(1);
        let fresh = Fuzzer::new(grammar, self.settings).fuzz_symbol(name, budget, rng)?;
        let mut mutated = tree.clone();
        mutated.replace_at(&path, fresh)?;
        mutated.strip_nested_parties();
        Ok(mutated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::tests::list_grammar;
    use crate::grammar::{FnGenerator, GrammarBuilder};
    use crate::parser::ParsingMode;
    use crate::symbol::Symbol;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::sync::Arc;

    #[test]
    fn mutation_keeps_trees_valid() {
        let grammar = list_grammar();
        let mut mutator = SubtreeMutator::new(FuzzSettings::default());
        let mut rng = ChaCha8Rng::from_seed([12; 32]);
        let mut tree = grammar
            .parse("12,34", "start", ParsingMode::Complete)
            .expect("parses");
        let mut changed = false;
        for i in 0..500 {
            let next = mutator
                .mutate(&grammar, &tree, &[], &mut rng)
                .expect("mutation succeeds");
            if let Err(e) = grammar.validate(&next) {
                panic!("Mutation {} produced invalid tree {}: {}", i, next, e);
            }
            changed |= next != tree;
            tree = next;
        }
        assert!(changed, "500 mutations should change the tree at least once");
    }

    #[test]
    fn failing_node_is_the_target() {
        let grammar = list_grammar();
        let mut mutator = SubtreeMutator::new(FuzzSettings::default());
        mutator.failing_bias = 1.0;
        let tree = grammar
            .parse("1,2,3", "start", ParsingMode::Complete)
            .expect("parses");
        let number = Symbol::non_terminal("number");
        let first = tree.find_all(&number)[0].clone();
        let failing = vec![FailingTree {
            path: first.clone(),
            symbol: number,
            clause: "int(<number>) > 5".into(),
            suggestions: Vec::new(),
        }];
        let mut rng = ChaCha8Rng::from_seed([13; 32]);
        for _ in 0..50 {
            let mutated = mutator
                .mutate(&grammar, &tree, &failing, &mut rng)
                .expect("mutation succeeds");
            let rendered = mutated.to_string();
            assert!(
                rendered.ends_with(",2,3"),
                "Only the first number may change, got {}",
                rendered
            );
        }
    }

    #[test]
    fn read_only_target_climbs_to_writable_ancestor() {
        let mut b = GrammarBuilder::new();
        let id = b.non_terminal("id");
        let colon = b.text(":");
        let payload = b.non_terminal("payload");
        let body = b.concat(vec![id, colon, payload]);
        b.rule("start", body);
        let digit = b.char_range('0', '9');
        b.rule("id", digit);
        let letter = b.char_range('a', 'c');
        let letters = b.plus(letter);
        b.rule("payload", letters);
        b.generator(
            "id",
            Arc::new(FnGenerator::new(Vec::new(), |_| Ok(b"7".to_vec()))),
        );
        let grammar = b.build().expect("grammar builds");
        let mut rng = ChaCha8Rng::from_seed([14; 32]);
        let tree = Fuzzer::new(&grammar, FuzzSettings::default())
            .fuzz(&mut rng)
            .expect("fuzz succeeds");
        let id_path = tree.find_all(&Symbol::non_terminal("id"))[0].clone();
        assert!(tree.get(&id_path).is_some_and(DerivationTree::is_read_only));
        assert!(writable_ancestor(&tree, id_path.clone()).is_empty());

        let failing = vec![FailingTree {
            path: id_path,
            symbol: Symbol::non_terminal("id"),
            clause: "int(<id>) == 3".into(),
            suggestions: Vec::new(),
        }];
        let mut mutator = SubtreeMutator::new(FuzzSettings::default());
        let mutated = mutator
            .mutate(&grammar, &tree, &failing, &mut rng)
            .expect("mutation succeeds");
        assert!(mutated.to_string().starts_with("7:"));
        assert!(grammar.validate(&mutated).is_ok());
    }
}
