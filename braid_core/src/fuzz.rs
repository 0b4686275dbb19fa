use crate::grammar::{
    DEFAULT_MAX_REPETITIONS, Generator, Grammar, GrammarError, GrammarNode, NodeId,
    RepetitionKind,
};
use crate::parser::ParsingMode;
use crate::symbol::{Symbol, TerminalValue, strip_brackets};
use crate::tree::DerivationTree;
use rand::Rng;
use std::sync::Arc;
use tracing::warn;

/// Size knobs for random expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuzzSettings {
    /// Soft node budget per tree. Exceeded only when the cheapest completion
    /// of a symbol is already larger.
    pub max_nodes: usize,
    /// Upper bound used for `*`, `+` and `{n,}`.
    pub max_repetitions: usize,
}

impl Default for FuzzSettings {
    fn default() -> Self {
        Self {
            max_nodes: 50,
            max_repetitions: DEFAULT_MAX_REPETITIONS,
        }
    }
}

/// Expands grammar symbols into random derivation trees.
///
/// Choices are budget-aware: an alternative is only picked if its cheapest
/// completion fits into the remaining budget, and sequences reserve room for
/// the parts that still follow. Once the budget is exhausted every node
/// takes its cheapest completion, so expansion always terminates.
///
/// Structural hints are applied outermost-first: once a quantifier's hint
/// has fixed its count, hints nested inside the same rule body are not
/// consulted for that expansion.
pub struct Fuzzer<'g> {
    grammar: &'g Grammar,
    settings: FuzzSettings,
}

struct Walk<'r, R: ?Sized> {
    rng: &'r mut R,
    generating: Vec<String>,
}

impl<'g> Fuzzer<'g> {
    pub fn new(grammar: &'g Grammar, settings: FuzzSettings) -> Self {
        Self { grammar, settings }
    }

    pub fn settings(&self) -> FuzzSettings {
        self.settings
    }

    /// Fuzzes the grammar's start symbol with the configured node budget.
    pub fn fuzz<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<DerivationTree, GrammarError> {
        self.fuzz_symbol(self.grammar.start_symbol(), self.settings.max_nodes, rng)
    }

    /// Fuzzes `<name>` within `max_nodes`.
    ///
    /// # Arguments
    /// * `name`: Non-terminal to expand, with or without angle brackets.
    /// * `max_nodes`: Soft budget for the size of the returned tree.
    /// * `rng`: Source of every random choice.
    ///
    /// # Returns
    /// The tree, or `GrammarError::UndefinedSymbol` if there is no such rule.
    pub fn fuzz_symbol<R: Rng + ?Sized>(
        &self,
        name: &str,
        max_nodes: usize,
        rng: &mut R,
    ) -> Result<DerivationTree, GrammarError> {
        let name = strip_brackets(name);
        self.grammar.rule(name)?;
        let mut walk = Walk {
            rng,
            generating: Vec::new(),
        };
        self.expand_symbol(&mut walk, name, None, None, max_nodes, false)
    }

    fn expand_symbol<R: Rng + ?Sized>(
        &self,
        walk: &mut Walk<'_, R>,
        name: &str,
        sender: Option<&String>,
        recipient: Option<&String>,
        budget: usize,
        in_message: bool,
    ) -> Result<DerivationTree, GrammarError> {
        // Only the outermost message carries party annotations.
        let (sender, recipient) = if in_message {
            (None, None)
        } else {
            (sender.cloned(), recipient.cloned())
        };
        let inner_message = in_message || sender.is_some();

        if let Some(generator) = self.grammar.generator(name) {
            if !walk.generating.iter().any(|g| g == name) {
                match self.generate_value(walk, name, generator, budget) {
                    Ok(tree) => return Ok(tree.with_party(sender, recipient)),
                    Err(e) => warn!(symbol = name, error = %e, "value generator failed, expanding rule instead"),
                }
            }
        }

        let root = self.grammar.rule(name)?;
        let mut node = DerivationTree::new(Symbol::NonTerminal(name.to_string()))
            .with_party(sender, recipient);
        let mut children = Vec::new();
        self.expand_node(
            walk,
            root,
            &mut children,
            budget.saturating_sub(1),
            inner_message,
            false,
        )?;
        node.extend_children(children);
        Ok(node)
    }

    fn generate_value<R: Rng + ?Sized>(
        &self,
        walk: &mut Walk<'_, R>,
        name: &str,
        generator: &Arc<dyn Generator>,
        budget: usize,
    ) -> anyhow::Result<DerivationTree> {
        walk.generating.push(name.to_string());
        let mut params = Vec::new();
        for dependency in generator.dependencies() {
            match self.expand_symbol(walk, &dependency, None, None, budget, true) {
                Ok(tree) => params.push(tree),
                Err(e) => {
                    walk.generating.pop();
                    return Err(e.into());
                }
            }
        }
        walk.generating.pop();
        let value = generator.generate(&params)?;
        let tree = self.grammar.parse(&value, name, ParsingMode::Complete)?;
        Ok(tree.into_read_only().with_sources(params))
    }

    /// Appends the expansion of `id` to `out` and returns how many tree
    /// nodes were added.
    fn expand_node<R: Rng + ?Sized>(
        &self,
        walk: &mut Walk<'_, R>,
        id: NodeId,
        out: &mut Vec<DerivationTree>,
        budget: usize,
        in_message: bool,
        hint_fixed: bool,
    ) -> Result<usize, GrammarError> {
        let grammar = self.grammar;
        match grammar.node(id) {
            GrammarNode::Terminal(value) => {
                out.push(DerivationTree::terminal(value.clone()));
                Ok(1)
            }
            GrammarNode::CharSet(chars) => {
                if chars.is_empty() {
                    return Ok(0);
                }
                let c = chars[walk.rng.random_range(0..chars.len())];
                out.push(DerivationTree::terminal(TerminalValue::Text(c.to_string())));
                Ok(1)
            }
            GrammarNode::NonTerminal {
                name,
                sender,
                recipient,
            } => {
                let repeat = grammar.settings(id).nonterminal_should_repeat;
                let copies = if !hint_fixed && fires(&mut *walk.rng, repeat) {
                    if walk.rng.random_bool(0.5) {
                        0
                    } else {
                        walk.rng
                            .random_range(2..=self.settings.max_repetitions.max(2))
                    }
                } else {
                    1
                };
                let mut added = 0;
                for _ in 0..copies {
                    let tree = self.expand_symbol(
                        walk,
                        name,
                        sender.as_ref(),
                        recipient.as_ref(),
                        budget.saturating_sub(added),
                        in_message,
                    )?;
                    added += tree.size();
                    out.push(tree);
                }
                Ok(added)
            }
            GrammarNode::Concatenation(parts) => {
                let mut remaining = budget;
                let mut added = 0;
                for (idx, part) in parts.iter().enumerate() {
                    let part_budget = if grammar.distance(*part) >= remaining {
                        0
                    } else {
                        let reserved = parts[idx + 1..]
                            .iter()
                            .fold(0usize, |acc, p| acc.saturating_add(grammar.distance(*p)));
                        remaining.saturating_sub(reserved)
                    };
                    let n =
                        self.expand_node(walk, *part, out, part_budget, in_message, hint_fixed)?;
                    remaining = remaining.saturating_sub(n);
                    added += n;
                }
                Ok(added)
            }
            GrammarNode::Alternative(options) => {
                let in_range: Vec<NodeId> = options
                    .iter()
                    .copied()
                    .filter(|o| grammar.distance(*o) < budget)
                    .collect();
                if in_range.is_empty() {
                    let cheapest = options
                        .iter()
                        .map(|o| grammar.distance(*o))
                        .min()
                        .unwrap_or(0);
                    let candidates: Vec<NodeId> = options
                        .iter()
                        .copied()
                        .filter(|o| grammar.distance(*o) <= cheapest)
                        .collect();
                    let pick = candidates[walk.rng.random_range(0..candidates.len())];
                    return self.expand_node(walk, pick, out, 0, in_message, hint_fixed);
                }
                let pick = in_range[walk.rng.random_range(0..in_range.len())];
                self.expand_node(walk, pick, out, budget, in_message, hint_fixed)
            }
            GrammarNode::Repetition {
                node,
                min,
                max,
                kind,
            } => {
                let max = max.unwrap_or_else(|| self.settings.max_repetitions.max(*min));
                let settings = grammar.settings(id);
                let multiple = self.settings.max_repetitions.max(2);
                let (goal, forced) = match kind {
                    RepetitionKind::Plus
                        if !hint_fixed && fires(&mut *walk.rng, settings.plus_should_return_nothing) =>
                    {
                        (0, true)
                    }
                    RepetitionKind::Optional
                        if !hint_fixed
                            && fires(&mut *walk.rng, settings.option_should_return_multiple) =>
                    {
                        (walk.rng.random_range(2..=multiple), true)
                    }
                    _ => (walk.rng.random_range(*min..=max), false),
                };

                let child_distance = grammar.distance(*node);
                let mut reserved = grammar.distance(id);
                let mut remaining = budget;
                let mut added = 0;
                for rep in 0..goal {
                    let rep_budget = if child_distance >= remaining {
                        if !forced && rep >= *min {
                            break;
                        }
                        0
                    } else {
                        reserved = reserved.saturating_sub(child_distance);
                        remaining.saturating_sub(reserved)
                    };
                    let n = self.expand_node(
                        walk,
                        *node,
                        out,
                        rep_budget,
                        in_message,
                        hint_fixed || forced,
                    )?;
                    remaining = remaining.saturating_sub(n);
                    added += n;
                }
                Ok(added)
            }
        }
    }
}

fn fires<R: Rng + ?Sized>(rng: &mut R, probability: f64) -> bool {
    probability > 0.0 && rng.random_bool(probability.min(1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::tests::{ab_grammar, list_grammar};
    use crate::grammar::{FnGenerator, GrammarBuilder, GrammarSetting, SettingOverrides};
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    const SAMPLES: usize = 1000;

    fn setting(selector: &str, overrides: SettingOverrides) -> GrammarSetting {
        GrammarSetting {
            selector: selector.parse().expect("valid selector"),
            overrides,
        }
    }

    /// `<start> ::= <wrap>; <wrap> ::= <nonterminal>; <nonterminal> ::= "a"`
    /// with an optional hint on the `<nonterminal>` reference.
    fn single_a_grammar(
        body: impl FnOnce(&mut GrammarBuilder, NodeId) -> NodeId,
        settings: Vec<GrammarSetting>,
    ) -> Grammar {
        let mut b = GrammarBuilder::new();
        let nt = b.non_terminal("nonterminal");
        let root = body(&mut b, nt);
        b.rule("start", root);
        let a = b.text("a");
        b.rule("nonterminal", a);
        for s in settings {
            b.setting(s);
        }
        b.build().expect("grammar builds")
    }

    #[test]
    fn fuzzed_trees_derive_from_the_grammar() {
        let grammar = list_grammar();
        let fuzzer = Fuzzer::new(&grammar, FuzzSettings::default());
        let mut rng = ChaCha8Rng::from_seed([3; 32]);
        for i in 0..200 {
            let tree = fuzzer.fuzz(&mut rng).expect("start symbol exists");
            grammar
                .validate(&tree)
                .unwrap_or_else(|e| panic!("Fuzzed tree {i} ({tree}) is invalid: {e}"));
        }
    }

    #[test]
    fn budget_is_respected_for_recursive_grammars() {
        let grammar = ab_grammar();
        let settings = FuzzSettings {
            max_nodes: 12,
            ..Default::default()
        };
        let fuzzer = Fuzzer::new(&grammar, settings);
        let mut rng = ChaCha8Rng::from_seed([5; 32]);
        for _ in 0..SAMPLES {
            let tree = fuzzer.fuzz(&mut rng).expect("start symbol exists");
            assert!(
                tree.size() <= 12,
                "Tree {tree} has {} nodes, budget was 12",
                tree.size()
            );
        }
    }

    #[test]
    fn minimal_expansion_is_used_when_budget_is_too_small() {
        let grammar = list_grammar();
        let fuzzer = Fuzzer::new(&grammar, FuzzSettings::default());
        let mut rng = ChaCha8Rng::from_seed([8; 32]);
        let tree = fuzzer
            .fuzz_symbol("start", 1, &mut rng)
            .expect("start symbol exists");
        assert_eq!(tree.size(), 3, "start -> number -> digit is the cheapest tree");
        grammar.validate(&tree).expect("minimal tree is valid");
    }

    #[test]
    fn unknown_symbol_is_reported() {
        let grammar = ab_grammar();
        let fuzzer = Fuzzer::new(&grammar, FuzzSettings::default());
        let mut rng = ChaCha8Rng::from_seed([0; 32]);
        assert_eq!(
            fuzzer.fuzz_symbol("<nope>", 10, &mut rng).err(),
            Some(GrammarError::UndefinedSymbol("nope".into()))
        );
    }

    #[test]
    fn nonterminal_should_repeat_never_emits_exactly_one_copy() {
        let grammar = single_a_grammar(
            |_, nt| nt,
            vec![setting(
                "<nonterminal>",
                SettingOverrides {
                    nonterminal_should_repeat: Some(1.0),
                    ..Default::default()
                },
            )],
        );
        let fuzzer = Fuzzer::new(&grammar, FuzzSettings::default());
        let mut rng = ChaCha8Rng::from_seed([11; 32]);
        let (mut empty, mut multiple) = (false, false);
        for _ in 0..SAMPLES {
            let rendered = fuzzer.fuzz(&mut rng).expect("fuzz succeeds").to_string();
            assert!(rendered.chars().all(|c| c == 'a'), "Unexpected output {rendered}");
            assert_ne!(rendered.len(), 1, "Exactly one copy must never be produced");
            if rendered.is_empty() {
                empty = true;
            } else {
                multiple = true;
            }
        }
        assert!(empty, "Zero copies should occur over {SAMPLES} samples");
        assert!(multiple, "Multiple copies should occur over {SAMPLES} samples");
    }

    #[test]
    fn plus_should_return_nothing_always_yields_empty() {
        let grammar = single_a_grammar(
            |b, nt| b.plus(nt),
            vec![setting(
                "all_with_type(Plus)",
                SettingOverrides {
                    plus_should_return_nothing: Some(1.0),
                    ..Default::default()
                },
            )],
        );
        let fuzzer = Fuzzer::new(&grammar, FuzzSettings::default());
        let mut rng = ChaCha8Rng::from_seed([12; 32]);
        for _ in 0..SAMPLES {
            let tree = fuzzer.fuzz(&mut rng).expect("fuzz succeeds");
            assert_eq!(tree.to_string(), "", "A `+` with the hint must produce nothing");
        }
    }

    #[test]
    fn option_should_return_multiple_always_yields_two_or_more() {
        let grammar = single_a_grammar(
            |b, nt| b.optional(nt),
            vec![setting(
                "all_with_type(Option)",
                SettingOverrides {
                    option_should_return_multiple: Some(1.0),
                    ..Default::default()
                },
            )],
        );
        let fuzzer = Fuzzer::new(&grammar, FuzzSettings::default());
        let mut rng = ChaCha8Rng::from_seed([13; 32]);
        for _ in 0..SAMPLES {
            let rendered = fuzzer.fuzz(&mut rng).expect("fuzz succeeds").to_string();
            assert!(rendered.len() >= 2, "Got {rendered:?}");
            assert!(rendered.chars().all(|c| c == 'a'));
        }
    }

    #[test]
    fn outer_quantifier_hint_takes_precedence_over_inner_hint() {
        // `<nonterminal>?` where the option must repeat and the reference
        // itself would otherwise be dropped half of the time.
        let grammar = single_a_grammar(
            |b, nt| b.optional(nt),
            vec![
                setting(
                    "all_with_type(Option)",
                    SettingOverrides {
                        option_should_return_multiple: Some(1.0),
                        ..Default::default()
                    },
                ),
                setting(
                    "<nonterminal>",
                    SettingOverrides {
                        nonterminal_should_repeat: Some(1.0),
                        ..Default::default()
                    },
                ),
            ],
        );
        let settings = FuzzSettings::default();
        let fuzzer = Fuzzer::new(&grammar, settings);
        let mut rng = ChaCha8Rng::from_seed([14; 32]);
        for _ in 0..SAMPLES {
            let rendered = fuzzer.fuzz(&mut rng).expect("fuzz succeeds").to_string();
            assert!(
                (2..=settings.max_repetitions).contains(&rendered.len()),
                "Outer hint fixes the count; got {rendered:?}"
            );
        }

        // Without an outer hint firing, the inner hint still applies.
        let inner_only = single_a_grammar(
            |b, nt| b.optional(nt),
            vec![setting(
                "<nonterminal>",
                SettingOverrides {
                    nonterminal_should_repeat: Some(1.0),
                    ..Default::default()
                },
            )],
        );
        let fuzzer = Fuzzer::new(&inner_only, settings);
        let saw_multiple = (0..SAMPLES).any(|_| {
            fuzzer
                .fuzz(&mut rng)
                .map(|t| t.to_string().len() >= 2)
                .unwrap_or(false)
        });
        assert!(saw_multiple, "Inner hint should fire when the outer one does not");
    }

    #[test]
    fn sender_annotation_is_kept_on_outermost_message_only() {
        let mut b = GrammarBuilder::new();
        let outer = b.message("outer", "Client", Some("Server"));
        b.rule("start", outer);
        let inner = b.message("inner", "Server", None);
        b.rule("outer", inner);
        let x = b.text("x");
        b.rule("inner", x);
        let grammar = b.build().expect("grammar builds");
        let fuzzer = Fuzzer::new(&grammar, FuzzSettings::default());
        let mut rng = ChaCha8Rng::from_seed([15; 32]);
        let tree = fuzzer.fuzz(&mut rng).expect("fuzz succeeds");
        let msgs = tree.protocol_msgs();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].sender, "Client");
        assert_eq!(tree.get(&[0, 0]).and_then(|n| n.sender()), None);
    }

    #[test]
    fn generator_output_is_parsed_and_marked_read_only() {
        let mut b = GrammarBuilder::new();
        let number = b.non_terminal("number");
        b.rule("start", number);
        let digit = b.char_range('0', '9');
        let digits = b.plus(digit);
        b.rule("number", digits);
        let seed = b.char_range('1', '3');
        b.rule("seed", seed);
        b.generator(
            "number",
            Arc::new(FnGenerator::new(vec!["<seed>".into()], |params| {
                let base = params[0].to_int().unwrap_or(1);
                Ok((base * 111).to_string().into_bytes())
            })),
        );
        let grammar = b.build().expect("grammar builds");
        let fuzzer = Fuzzer::new(&grammar, FuzzSettings::default());
        let mut rng = ChaCha8Rng::from_seed([16; 32]);

        let tree = fuzzer.fuzz(&mut rng).expect("fuzz succeeds");
        let number = tree.get(&[0]).expect("number child");
        assert!(number.is_read_only());
        assert_eq!(number.sources().len(), 1);
        let seed = number.sources()[0].to_int().expect("seed is a digit");
        assert_eq!(number.to_int(), Some(seed * 111));
        grammar.validate(&tree).expect("generated value is derivable");
    }

    #[test]
    fn failing_generator_falls_back_to_rule_expansion() {
        let mut b = GrammarBuilder::new();
        let word = b.non_terminal("word");
        b.rule("start", word);
        let letters = b.char_range('a', 'c');
        b.rule("word", letters);
        b.generator(
            "word",
            Arc::new(FnGenerator::new(vec![], |_| Ok(b"not a letter".to_vec()))),
        );
        let grammar = b.build().expect("grammar builds");
        let fuzzer = Fuzzer::new(&grammar, FuzzSettings::default());
        let mut rng = ChaCha8Rng::from_seed([17; 32]);
        let tree = fuzzer.fuzz(&mut rng).expect("fallback succeeds");
        grammar.validate(&tree).expect("fallback tree is valid");
        assert!(!tree.get(&[0]).is_some_and(DerivationTree::is_read_only));
    }
}
