use crate::fitness::FailingTree;
use crate::symbol::Symbol;
use crate::tree::{DerivationTree, TreePath};
use rand::Rng;
use rand::seq::IndexedRandom;
use std::collections::BTreeMap;
use tracing::debug;

/// Writable, non-root non-terminal positions grouped by symbol.
fn swap_points(tree: &DerivationTree) -> BTreeMap<Symbol, Vec<TreePath>> {
    let mut points: BTreeMap<Symbol, Vec<TreePath>> = BTreeMap::new();
    tree.walk(&mut |path, node| {
        if !path.is_empty() && node.symbol().is_non_terminal() && !node.is_read_only() {
            points.entry(node.symbol().clone()).or_default().push(path.clone());
        }
    });
    points
}

/// Swaps two subtrees with the same symbol between `a` and `b`.
///
/// Positions listed in `failing_a` are tried first, so a crossover tends to
/// replace the part of `a` that violates a constraint. Roots and
/// generator-produced subtrees are never swapped, so both children keep
/// deriving from the grammar.
///
/// # Returns
/// The two children, or `None` when the parents share no swappable symbol.
pub fn crossover<R: Rng + ?Sized>(
    a: &DerivationTree,
    b: &DerivationTree,
    failing_a: &[FailingTree],
    rng: &mut R,
) -> Option<(DerivationTree, DerivationTree)> {
    let points_a = swap_points(a);
    let points_b = swap_points(b);

    let preferred: Vec<&TreePath> = failing_a
        .iter()
        .filter(|f| f.symbol.is_non_terminal() && points_b.contains_key(&f.symbol))
        .filter(|f| {
            points_a
                .get(&f.symbol)
                .is_some_and(|paths| paths.contains(&f.path))
        })
        .map(|f| &f.path)
        .collect();
    let shared: Vec<&TreePath> = points_a
        .iter()
        .filter(|(symbol, _)| points_b.contains_key(*symbol))
        .flat_map(|(_, paths)| paths)
        .collect();

    let path_a = match preferred.choose(rng) {
        Some(path) => *path,
        None => *shared.choose(rng)?,
    };
    let sub_a = a.get(path_a)?;
    let path_b = points_b.get(sub_a.symbol())?.choose(rng)?;
    let sub_b = b.get(path_b)?;

    let mut child_a = a.clone();
    let mut child_b = b.clone();
    if let Err(e) = child_a
        .replace_at(path_a, sub_b.clone())
        .and_then(|_| child_b.replace_at(path_b, sub_a.clone()))
    {
        debug!(error = %e, "crossover swap rejected");
        return None;
    }
    child_a.strip_nested_parties();
    child_b.strip_nested_parties();
    Some((child_a, child_b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fuzz::{FuzzSettings, Fuzzer};
    use crate::grammar::{Grammar, GrammarBuilder};
    use crate::grammar::tests::list_grammar;
    use crate::parser::ParsingMode;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    /// Nested expressions with several shared non-terminals.
    fn expr_grammar() -> Grammar {
        let mut b = GrammarBuilder::new();
        let term = b.non_terminal("term");
        let plus = b.text("+");
        let expr_ref = b.non_terminal("expr");
        let sum = b.concat(vec![term, plus, expr_ref]);
        let single = b.non_terminal("term");
        let expr = b.alt(vec![sum, single]);
        b.rule("expr", expr);
        let open = b.text("(");
        let inner = b.non_terminal("expr");
        let close = b.text(")");
        let paren = b.concat(vec![open, inner, close]);
        let number = b.non_terminal("number");
        let term_body = b.alt(vec![paren, number]);
        b.rule("term", term_body);
        let digit = b.char_range('0', '9');
        let digits = b.plus(digit);
        b.rule("number", digits);
        let start = b.non_terminal("expr");
        b.rule("start", start);
        b.build().expect("expr grammar builds")
    }

    #[test]
    fn ten_thousand_crossovers_keep_children_valid() {
        let grammar = expr_grammar();
        let fuzzer = Fuzzer::new(&grammar, FuzzSettings::default());
        let mut rng = ChaCha8Rng::from_seed([9; 32]);
        let pool: Vec<DerivationTree> = (0..50)
            .map(|_| fuzzer.fuzz(&mut rng).expect("fuzz succeeds"))
            .collect();
        let mut swaps = 0;
        for i in 0..10_000 {
            let a = &pool[rng.random_range(0..pool.len())];
            let b = &pool[rng.random_range(0..pool.len())];
            if let Some((child_a, child_b)) = crossover(a, b, &[], &mut rng) {
                swaps += 1;
                for child in [&child_a, &child_b] {
                    if let Err(e) = grammar.validate(child) {
                        panic!("Crossover {} produced an invalid child {}: {}", i, child, e);
                    }
                }
            }
        }
        assert!(swaps > 5_000, "Most pairs share <term>, got {} swaps", swaps);
    }

    #[test]
    fn failing_positions_are_preferred() {
        let grammar = list_grammar();
        let a = grammar
            .parse("1,2,3", "start", ParsingMode::Complete)
            .expect("parses");
        let b = grammar
            .parse("7", "start", ParsingMode::Complete)
            .expect("parses");
        let number = Symbol::non_terminal("number");
        let last = a.find_all(&number).pop().expect("three numbers");
        let failing = vec![FailingTree {
            path: last,
            symbol: number,
            clause: "int(<number>) < 3".into(),
            suggestions: Vec::new(),
        }];
        let mut rng = ChaCha8Rng::from_seed([10; 32]);
        for _ in 0..20 {
            let (child_a, child_b) =
                crossover(&a, &b, &failing, &mut rng).expect("shared <number>");
            assert_eq!(child_a.to_string(), "1,2,7");
            assert_eq!(child_b.to_string(), "3");
        }
    }

    #[test]
    fn read_only_subtrees_are_not_swapped() {
        let grammar = list_grammar();
        let a = grammar
            .parse("1", "start", ParsingMode::Complete)
            .expect("parses")
            .into_read_only();
        let b = grammar
            .parse("2", "start", ParsingMode::Complete)
            .expect("parses");
        let mut rng = ChaCha8Rng::from_seed([11; 32]);
        assert!(crossover(&a, &b, &[], &mut rng).is_none());
    }
}
