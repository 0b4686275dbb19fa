use crate::grammar::{Grammar, GrammarError, GrammarNode, NodeId};
use crate::symbol::{TerminalValue, strip_brackets};
use crate::tree::DerivationTree;
use std::collections::{BTreeSet, HashMap, HashSet};
use thiserror::Error;

/// How much of the input a parse must account for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParsingMode {
    /// The whole input must derive from the target symbol.
    #[default]
    Complete,
    /// The input must be a prefix of something the target symbol derives.
    /// The last terminal may be cut short.
    Incomplete,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    /// No derivation exists; `position` is the furthest byte offset any
    /// partial derivation reached.
    #[error("Input does not match <{symbol}> (stuck at byte {position} of {length})")]
    NoMatch {
        symbol: String,
        position: usize,
        length: usize,
    },
    #[error(transparent)]
    Grammar(#[from] GrammarError),
}

impl ParseError {
    pub fn position(&self) -> Option<usize> {
        match self {
            ParseError::NoMatch { position, .. } => Some(*position),
            ParseError::Grammar(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
enum Atom {
    Term(TerminalValue),
    Rule {
        rule: usize,
        sender: Option<String>,
        recipient: Option<String>,
    },
}

#[derive(Debug, Clone)]
struct Production {
    lhs: usize,
    atoms: Vec<Atom>,
}

#[derive(Debug, Clone)]
struct RuleInfo {
    /// `None` for helper rules introduced while flattening; their children
    /// are spliced into the enclosing node.
    name: Option<String>,
    productions: Vec<usize>,
    nullable: bool,
}

/// The grammar flattened into plain productions for the Earley recognizer.
#[derive(Debug, Clone)]
pub(crate) struct CompiledGrammar {
    rules: Vec<RuleInfo>,
    productions: Vec<Production>,
    by_name: HashMap<String, usize>,
}

struct Lowering<'g> {
    grammar: &'g Grammar,
    compiled: CompiledGrammar,
    helpers: HashMap<NodeId, usize>,
}

impl<'g> Lowering<'g> {
    fn new_rule(&mut self, name: Option<String>) -> usize {
        self.compiled.rules.push(RuleInfo {
            name,
            productions: Vec::new(),
            nullable: false,
        });
        self.compiled.rules.len() - 1
    }

    fn add_production(&mut self, lhs: usize, atoms: Vec<Atom>) {
        self.compiled.productions.push(Production { lhs, atoms });
        let idx = self.compiled.productions.len() - 1;
        self.compiled.rules[lhs].productions.push(idx);
    }

    fn helper(rule: usize) -> Atom {
        Atom::Rule {
            rule,
            sender: None,
            recipient: None,
        }
    }

    fn lower(&mut self, id: NodeId) -> Vec<Atom> {
        let grammar = self.grammar;
        match grammar.node(id) {
            GrammarNode::Terminal(value) => vec![Atom::Term(value.clone())],
            GrammarNode::NonTerminal {
                name,
                sender,
                recipient,
            } => vec![Atom::Rule {
                rule: self.compiled.by_name[name],
                sender: sender.clone(),
                recipient: recipient.clone(),
            }],
            GrammarNode::Concatenation(parts) => {
                parts.iter().flat_map(|p| self.lower(*p)).collect()
            }
            node => {
                if let Some(rule) = self.helpers.get(&id) {
                    return vec![Self::helper(*rule)];
                }
                let rule = self.new_rule(None);
                self.helpers.insert(id, rule);
                match node {
                    GrammarNode::CharSet(chars) => {
                        for c in chars {
                            self.add_production(
                                rule,
                                vec![Atom::Term(TerminalValue::Text(c.to_string()))],
                            );
                        }
                    }
                    GrammarNode::Alternative(options) => {
                        for option in options {
                            let atoms = self.lower(*option);
                            self.add_production(rule, atoms);
                        }
                    }
                    GrammarNode::Repetition { node, min, max, .. } => {
                        let (min, max) = (*min, *max);
                        let element = self.lower(*node);
                        let mut body: Vec<Atom> = Vec::new();
                        for _ in 0..min {
                            body.extend(element.iter().cloned());
                        }
                        match max {
                            None => {
                                let tail = self.new_rule(None);
                                self.add_production(tail, Vec::new());
                                let mut more = element.clone();
                                more.push(Self::helper(tail));
                                self.add_production(tail, more);
                                body.push(Self::helper(tail));
                            }
                            Some(max) if max > min => {
                                // tail_k ::= "" | element tail_{k-1}
                                let mut previous: Option<usize> = None;
                                for _ in min..max {
                                    let tail = self.new_rule(None);
                                    self.add_production(tail, Vec::new());
                                    let mut more = element.clone();
                                    if let Some(prev) = previous {
                                        more.push(Self::helper(prev));
                                    }
                                    self.add_production(tail, more);
                                    previous = Some(tail);
                                }
                                if let Some(tail) = previous {
                                    body.push(Self::helper(tail));
                                }
                            }
                            Some(_) => {}
                        }
                        self.add_production(rule, body);
                    }
                    _ => {}
                }
                vec![Self::helper(rule)]
            }
        }
    }
}

impl CompiledGrammar {
    pub(crate) fn compile(grammar: &Grammar) -> Self {
        let mut lowering = Lowering {
            grammar,
            compiled: CompiledGrammar {
                rules: Vec::new(),
                productions: Vec::new(),
                by_name: HashMap::new(),
            },
            helpers: HashMap::new(),
        };
        let named: Vec<(String, NodeId)> = grammar
            .rules()
            .map(|(name, root)| (name.to_string(), root))
            .collect();
        for (name, _) in &named {
            let idx = lowering.new_rule(Some(name.clone()));
            lowering.compiled.by_name.insert(name.clone(), idx);
        }
        for (name, root) in &named {
            let lhs = lowering.compiled.by_name[name];
            match grammar.node(*root) {
                GrammarNode::Alternative(options) => {
                    for option in options.clone() {
                        let atoms = lowering.lower(option);
                        lowering.add_production(lhs, atoms);
                    }
                }
                _ => {
                    let atoms = lowering.lower(*root);
                    lowering.add_production(lhs, atoms);
                }
            }
        }
        let mut compiled = lowering.compiled;
        compiled.compute_nullable();
        compiled
    }

    fn compute_nullable(&mut self) {
        loop {
            let mut changed = false;
            for prod in &self.productions {
                if self.rules[prod.lhs].nullable {
                    continue;
                }
                let nullable = prod.atoms.iter().all(|atom| match atom {
                    Atom::Term(t) => t.is_empty(),
                    Atom::Rule { rule, .. } => self.rules[*rule].nullable,
                });
                if nullable {
                    self.rules[prod.lhs].nullable = true;
                    changed = true;
                }
            }
            if !changed {
                return;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Item {
    prod: usize,
    dot: usize,
    origin: usize,
}

struct Chart {
    sets: Vec<Vec<Item>>,
    seen: Vec<HashSet<Item>>,
    /// (rule, start) -> ends of complete derivations.
    completed: HashMap<(usize, usize), BTreeSet<usize>>,
}

impl Chart {
    fn add(&mut self, set: usize, item: Item) {
        if self.seen[set].insert(item) {
            self.sets[set].push(item);
        }
    }

    fn ends(&self, rule: usize, start: usize) -> Vec<usize> {
        self.completed
            .get(&(rule, start))
            .map(|ends| ends.iter().copied().collect())
            .unwrap_or_default()
    }

    fn furthest(&self) -> usize {
        self.sets
            .iter()
            .rposition(|set| !set.is_empty())
            .unwrap_or(0)
    }
}

/// Earley recognizer with the Aycock-Horspool treatment of nullable rules.
fn recognize_chart(compiled: &CompiledGrammar, input: &[u8], start: usize) -> Chart {
    let n = input.len();
    let mut chart = Chart {
        sets: vec![Vec::new(); n + 1],
        seen: vec![HashSet::new(); n + 1],
        completed: HashMap::new(),
    };
    for prod in &compiled.rules[start].productions {
        chart.add(
            0,
            Item {
                prod: *prod,
                dot: 0,
                origin: 0,
            },
        );
    }

    for i in 0..=n {
        let mut j = 0;
        while j < chart.sets[i].len() {
            let item = chart.sets[i][j];
            j += 1;
            let production = &compiled.productions[item.prod];
            let advanced = Item {
                dot: item.dot + 1,
                ..item
            };
            match production.atoms.get(item.dot) {
                None => {
                    chart
                        .completed
                        .entry((production.lhs, item.origin))
                        .or_default()
                        .insert(i);
                    let waiting: Vec<Item> = chart.sets[item.origin]
                        .iter()
                        .filter(|w| {
                            matches!(
                                compiled.productions[w.prod].atoms.get(w.dot),
                                Some(Atom::Rule { rule, .. }) if *rule == production.lhs
                            )
                        })
                        .copied()
                        .collect();
                    for w in waiting {
                        chart.add(
                            i,
                            Item {
                                dot: w.dot + 1,
                                ..w
                            },
                        );
                    }
                }
                Some(Atom::Term(value)) => {
                    let bytes = value.as_bytes();
                    if bytes.is_empty() {
                        chart.add(i, advanced);
                    } else if input[i..].starts_with(bytes) {
                        chart.add(i + bytes.len(), advanced);
                    }
                }
                Some(Atom::Rule { rule, .. }) => {
                    for prod in &compiled.rules[*rule].productions {
                        chart.add(
                            i,
                            Item {
                                prod: *prod,
                                dot: 0,
                                origin: i,
                            },
                        );
                    }
                    if compiled.rules[*rule].nullable {
                        chart.add(i, advanced);
                    }
                }
            }
        }
    }
    chart
}

/// Rebuilds one derivation from a finished chart.
struct TreeBuilder<'a> {
    compiled: &'a CompiledGrammar,
    input: &'a [u8],
    chart: &'a Chart,
    failed_rules: HashSet<(usize, usize, usize)>,
    active_rules: HashSet<(usize, usize, usize)>,
    failed_seqs: HashSet<(usize, usize, usize, usize)>,
    failed_partials: HashSet<(usize, usize)>,
    active_partials: HashSet<(usize, usize)>,
}

impl<'a> TreeBuilder<'a> {
    fn new(compiled: &'a CompiledGrammar, input: &'a [u8], chart: &'a Chart) -> Self {
        Self {
            compiled,
            input,
            chart,
            failed_rules: HashSet::new(),
            active_rules: HashSet::new(),
            failed_seqs: HashSet::new(),
            failed_partials: HashSet::new(),
            active_partials: HashSet::new(),
        }
    }

    fn wrap(
        &self,
        rule: usize,
        sender: &Option<String>,
        recipient: &Option<String>,
        children: Vec<DerivationTree>,
    ) -> Vec<DerivationTree> {
        match &self.compiled.rules[rule].name {
            Some(name) => vec![
                DerivationTree::non_terminal(name, children)
                    .with_party(sender.clone(), recipient.clone()),
            ],
            None => children,
        }
    }

    /// Children of `rule` deriving exactly `input[start..end]`.
    fn rule_children(&mut self, rule: usize, start: usize, end: usize) -> Option<Vec<DerivationTree>> {
        let key = (rule, start, end);
        if self.failed_rules.contains(&key) || self.active_rules.contains(&key) {
            return None;
        }
        if !self
            .chart
            .completed
            .get(&(rule, start))
            .is_some_and(|ends| ends.contains(&end))
        {
            return None;
        }
        self.active_rules.insert(key);
        let productions = self.compiled.rules[rule].productions.clone();
        for prod in productions {
            if let Some(children) = self.seq(prod, 0, start, end) {
                self.active_rules.remove(&key);
                return Some(children);
            }
        }
        self.active_rules.remove(&key);
        self.failed_rules.insert(key);
        None
    }

    fn seq(&mut self, prod: usize, dot: usize, start: usize, end: usize) -> Option<Vec<DerivationTree>> {
        let compiled = self.compiled;
        let atoms = &compiled.productions[prod].atoms;
        let Some(atom) = atoms.get(dot) else {
            return (start == end).then(Vec::new);
        };
        let key = (prod, dot, start, end);
        if self.failed_seqs.contains(&key) {
            return None;
        }
        let found = match atom {
            Atom::Term(value) => {
                let mid = start + value.len();
                if mid <= end && self.input[start..mid] == *value.as_bytes() {
                    self.seq(prod, dot + 1, mid, end).map(|tail| {
                        let mut out = vec![DerivationTree::terminal(value.clone())];
                        out.extend(tail);
                        out
                    })
                } else {
                    None
                }
            }
            Atom::Rule {
                rule,
                sender,
                recipient,
            } => {
                let mut found = None;
                for mid in self.chart.ends(*rule, start) {
                    if mid > end {
                        break;
                    }
                    let Some(tail) = self.seq(prod, dot + 1, mid, end) else {
                        continue;
                    };
                    if let Some(children) = self.rule_children(*rule, start, mid) {
                        let mut out = self.wrap(*rule, sender, recipient, children);
                        out.extend(tail);
                        found = Some(out);
                        break;
                    }
                }
                found
            }
        };
        if found.is_none() {
            self.failed_seqs.insert(key);
        }
        found
    }

    /// Children of `rule` deriving a prefix-compatible reading of
    /// `input[start..]`; everything after the end of input is omitted.
    fn partial_rule(&mut self, rule: usize, start: usize) -> Option<Vec<DerivationTree>> {
        let key = (rule, start);
        if self.failed_partials.contains(&key) || self.active_partials.contains(&key) {
            return None;
        }
        self.active_partials.insert(key);
        let productions = self.compiled.rules[rule].productions.clone();
        for prod in productions {
            if let Some(children) = self.partial_seq(prod, 0, start) {
                self.active_partials.remove(&key);
                return Some(children);
            }
        }
        self.active_partials.remove(&key);
        self.failed_partials.insert(key);
        None
    }

    fn partial_seq(&mut self, prod: usize, dot: usize, start: usize) -> Option<Vec<DerivationTree>> {
        let n = self.input.len();
        if start == n {
            return Some(Vec::new());
        }
        let compiled = self.compiled;
        let atom = compiled.productions[prod].atoms.get(dot)?;
        match atom {
            Atom::Term(value) => {
                let rest = &self.input[start..];
                let bytes = value.as_bytes();
                if rest.starts_with(bytes) {
                    let mut tail = self.partial_seq(prod, dot + 1, start + bytes.len())?;
                    tail.insert(0, DerivationTree::terminal(value.clone()));
                    Some(tail)
                } else if bytes.starts_with(rest) {
                    Some(vec![DerivationTree::terminal(truncated(value, rest))])
                } else {
                    None
                }
            }
            Atom::Rule {
                rule,
                sender,
                recipient,
            } => {
                for mid in self.chart.ends(*rule, start) {
                    let Some(tail) = self.partial_seq(prod, dot + 1, mid) else {
                        continue;
                    };
                    if let Some(children) = self.rule_children(*rule, start, mid) {
                        let mut out = self.wrap(*rule, sender, recipient, children);
                        out.extend(tail);
                        return Some(out);
                    }
                }
                let children = self.partial_rule(*rule, start)?;
                Some(self.wrap(*rule, sender, recipient, children))
            }
        }
    }
}

fn truncated(value: &TerminalValue, prefix: &[u8]) -> TerminalValue {
    match (value, std::str::from_utf8(prefix)) {
        (TerminalValue::Text(_), Ok(text)) => TerminalValue::Text(text.to_string()),
        _ => TerminalValue::Bytes(prefix.to_vec()),
    }
}

fn prefix_viable(compiled: &CompiledGrammar, chart: &Chart, input: &[u8]) -> bool {
    let n = input.len();
    if n == 0 || !chart.sets[n].is_empty() {
        return true;
    }
    // The input may end inside a terminal.
    chart.sets.iter().enumerate().any(|(i, set)| {
        set.iter().any(|item| {
            matches!(
                compiled.productions[item.prod].atoms.get(item.dot),
                Some(Atom::Term(value)) if value.as_bytes().starts_with(&input[i..])
            )
        })
    })
}

impl Grammar {
    /// Reconstructs a derivation tree for `input` rooted at `<symbol>`.
    ///
    /// In `Complete` mode the whole input must match and no tree is returned
    /// on failure. In `Incomplete` mode the input only has to be a prefix of
    /// a sentence; the returned tree covers exactly the given input.
    pub fn parse(
        &self,
        input: impl AsRef<[u8]>,
        symbol: &str,
        mode: ParsingMode,
    ) -> Result<DerivationTree, ParseError> {
        let input = input.as_ref();
        let name = strip_brackets(symbol);
        self.rule(name)?;
        let compiled = self.compiled();
        let start = compiled.by_name[name];
        let chart = recognize_chart(compiled, input, start);
        let no_match = || ParseError::NoMatch {
            symbol: name.to_string(),
            position: chart.furthest(),
            length: input.len(),
        };

        let mut builder = TreeBuilder::new(compiled, input, &chart);
        let children = match mode {
            ParsingMode::Complete => builder.rule_children(start, 0, input.len()),
            ParsingMode::Incomplete => {
                if !prefix_viable(compiled, &chart, input) {
                    return Err(no_match());
                }
                builder
                    .rule_children(start, 0, input.len())
                    .or_else(|| builder.partial_rule(start, 0))
            }
        };
        let children = children.ok_or_else(no_match)?;
        let mut tree = DerivationTree::non_terminal(name, children);
        tree.strip_nested_parties();
        Ok(tree)
    }

    /// Like [`Grammar::parse`] without building a tree.
    pub fn recognize(&self, input: impl AsRef<[u8]>, symbol: &str, mode: ParsingMode) -> bool {
        let input = input.as_ref();
        let name = strip_brackets(symbol);
        if !self.has_rule(name) {
            return false;
        }
        let compiled = self.compiled();
        let start = compiled.by_name[name];
        let chart = recognize_chart(compiled, input, start);
        match mode {
            ParsingMode::Complete => chart
                .completed
                .get(&(start, 0))
                .is_some_and(|ends| ends.contains(&input.len())),
            ParsingMode::Incomplete => prefix_viable(compiled, &chart, input),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fuzz::{FuzzSettings, Fuzzer};
    use crate::grammar::GrammarBuilder;
    use crate::grammar::tests::{ab_grammar, list_grammar};
    use proptest::prelude::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    /// `<expr> ::= <expr> "+" <num> | <num>; <num> ::= [0-9]`
    fn left_recursive_grammar() -> Grammar {
        let mut b = GrammarBuilder::new();
        let expr = b.non_terminal("expr");
        b.rule("start", expr);
        let inner = b.non_terminal("expr");
        let plus = b.text("+");
        let num = b.non_terminal("num");
        let sum = b.concat(vec![inner, plus, num]);
        let single = b.non_terminal("num");
        let body = b.alt(vec![sum, single]);
        b.rule("expr", body);
        let digit = b.char_range('0', '9');
        b.rule("num", digit);
        b.build().expect("grammar builds")
    }

    #[test]
    fn parses_ambiguous_recursive_grammar() {
        let grammar = ab_grammar();
        for input in ["", "a", "b", "aabb", "abbb"] {
            let tree = grammar
                .parse(input, "start", ParsingMode::Complete)
                .unwrap_or_else(|e| panic!("{input:?} should parse: {e}"));
            assert_eq!(tree.to_string(), input);
            grammar.validate(&tree).expect("parsed tree is valid");
        }
        assert!(grammar.parse("ba", "start", ParsingMode::Complete).is_err());
    }

    #[test]
    fn parses_left_recursion() {
        let grammar = left_recursive_grammar();
        let tree = grammar
            .parse("1+2+3", "<start>", ParsingMode::Complete)
            .expect("sum parses");
        assert_eq!(tree.to_string(), "1+2+3");
        grammar.validate(&tree).expect("parsed tree is valid");
        let expr = tree.get(&[0]).expect("expr child");
        assert_eq!(expr.children().len(), 3, "Top-level sum splits off the last operand");
        assert_eq!(expr.children()[0].to_string(), "1+2");
    }

    #[test]
    fn failure_reports_furthest_position() {
        let grammar = list_grammar();
        match grammar.parse("12,x4", "start", ParsingMode::Complete) {
            Err(ParseError::NoMatch {
                position, length, ..
            }) => {
                assert_eq!(position, 3, "Parsing got stuck after '12,'");
                assert_eq!(length, 5);
            }
            other => panic!("Expected NoMatch, got {other:?}"),
        }
        assert!(matches!(
            grammar.parse("1", "nope", ParsingMode::Complete),
            Err(ParseError::Grammar(GrammarError::UndefinedSymbol(_)))
        ));
    }

    #[test]
    fn incomplete_mode_accepts_prefixes_only() {
        let grammar = list_grammar();
        assert!(grammar.parse("12,", "start", ParsingMode::Complete).is_err());
        let prefix = grammar
            .parse("12,", "start", ParsingMode::Incomplete)
            .expect("a dangling comma is a valid prefix");
        assert_eq!(prefix.to_string(), "12,");
        assert!(grammar.recognize("12,3", "start", ParsingMode::Incomplete));
        assert!(!grammar.recognize(",", "start", ParsingMode::Incomplete));
    }

    #[test]
    fn incomplete_mode_cuts_the_last_terminal() {
        let mut b = GrammarBuilder::new();
        let hello = b.text("hello");
        let space = b.text(" ");
        let world = b.bytes(b"world");
        let body = b.concat(vec![hello, space, world]);
        b.rule("start", body);
        let grammar = b.build().expect("grammar builds");

        let tree = grammar
            .parse("hello wo", "start", ParsingMode::Incomplete)
            .expect("prefix parses");
        assert_eq!(tree.to_string(), "hello wo");
        assert!(tree.contains_bytes());
        assert!(!grammar.recognize("hello wx", "start", ParsingMode::Incomplete));
        assert!(grammar.recognize(b"hello world", "start", ParsingMode::Complete));
    }

    #[test]
    fn bounded_repetition_counts_are_enforced() {
        let mut b = GrammarBuilder::new();
        let x = b.text("x");
        let rep = b.repeat(x, 2, Some(3));
        b.rule("start", rep);
        let grammar = b.build().expect("grammar builds");
        for (input, ok) in [("x", false), ("xx", true), ("xxx", true), ("xxxx", false)] {
            assert_eq!(
                grammar.recognize(input, "start", ParsingMode::Complete),
                ok,
                "Unexpected verdict for {input:?}"
            );
        }
    }

    #[test]
    fn message_annotations_survive_parsing_on_outermost_node() {
        let mut b = GrammarBuilder::new();
        let hello = b.message("hello", "Client", Some("Server"));
        b.rule("start", hello);
        let inner = b.message("word", "Server", None);
        b.rule("hello", inner);
        let hi = b.text("hi");
        b.rule("word", hi);
        let grammar = b.build().expect("grammar builds");
        let tree = grammar
            .parse("hi", "start", ParsingMode::Complete)
            .expect("parses");
        let msgs = tree.protocol_msgs();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].sender, "Client");
        assert_eq!(tree.get(&[0, 0]).and_then(|n| n.sender()), None);
    }

    proptest! {
        #[test]
        fn fuzzed_trees_round_trip_through_the_parser(seed in any::<u64>()) {
            let grammar = list_grammar();
            let fuzzer = Fuzzer::new(&grammar, FuzzSettings::default());
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let tree = fuzzer.fuzz(&mut rng).expect("fuzz succeeds");
            let reparsed = grammar
                .parse(tree.to_bytes(), "start", ParsingMode::Complete)
                .expect("fuzzed output parses");
            prop_assert_eq!(reparsed, tree);
        }
    }
}
