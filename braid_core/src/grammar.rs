use crate::parser::CompiledGrammar;
use crate::symbol::{Symbol, TerminalValue, strip_brackets};
use crate::tree::{DerivationTree, TreePath};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// Default cap for unbounded repetitions (`*`, `+`, `{n,}`) while fuzzing.
pub const DEFAULT_MAX_REPETITIONS: usize = 5;

const UNREACHABLE_DISTANCE: usize = usize::MAX;

/// Errors raised while building a grammar or checking a tree against it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GrammarError {
    /// A rule body references a non-terminal that has no rule.
    #[error("Undefined symbol <{0}>")]
    UndefinedSymbol(String),
    /// The rule can never derive a finite tree.
    #[error("Rule <{0}> is unproductive: it cannot derive a finite tree")]
    Unproductive(String),
    /// Repetition bounds are inconsistent (e.g. `max < min` or `max == 0`).
    #[error("Invalid repetition bounds {{{min},{max:?}}}")]
    InvalidRepetition { min: usize, max: Option<usize> },
    /// An alternative with no options.
    #[error("Empty alternative in rule <{0}>")]
    EmptyAlternative(String),
    /// A party named in a slice request does not appear in the grammar.
    #[error("Unknown party '{0}'; known parties: {1:?}")]
    UnknownParty(String, Vec<String>),
    /// A tree is inconsistent with the production rules.
    #[error("Tree node {symbol} at {path:?} does not derive from its rule: {reason}")]
    Validity {
        path: TreePath,
        symbol: String,
        reason: String,
    },
    /// A grammar setting selector could not be parsed.
    #[error("Invalid setting selector '{0}'")]
    InvalidSelector(String),
}

/// Handle of a node in a grammar arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

/// Surface syntax a repetition was written with. Selectors such as
/// `all_with_type(Plus)` match on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepetitionKind {
    Star,
    Plus,
    Optional,
    Bounded,
}

/// A production-rule node. Children are arena handles, so a node may be
/// shared by several parents.
#[derive(Debug, Clone, PartialEq)]
pub enum GrammarNode {
    Terminal(TerminalValue),
    NonTerminal {
        name: String,
        sender: Option<String>,
        recipient: Option<String>,
    },
    Concatenation(Vec<NodeId>),
    Alternative(Vec<NodeId>),
    Repetition {
        node: NodeId,
        min: usize,
        max: Option<usize>,
        kind: RepetitionKind,
    },
    CharSet(Vec<char>),
}

/// Node kinds as they are named in `all_with_type(...)` selectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Terminal,
    NonTerminal,
    Concatenation,
    Alternative,
    Star,
    Plus,
    Option,
    Repetition,
    CharSet,
}

impl GrammarNode {
    pub fn kind(&self) -> NodeKind {
        match self {
            GrammarNode::Terminal(_) => NodeKind::Terminal,
            GrammarNode::NonTerminal { .. } => NodeKind::NonTerminal,
            GrammarNode::Concatenation(_) => NodeKind::Concatenation,
            GrammarNode::Alternative(_) => NodeKind::Alternative,
            GrammarNode::Repetition { kind, .. } => match kind {
                RepetitionKind::Star => NodeKind::Star,
                RepetitionKind::Plus => NodeKind::Plus,
                RepetitionKind::Optional => NodeKind::Option,
                RepetitionKind::Bounded => NodeKind::Repetition,
            },
            GrammarNode::CharSet(_) => NodeKind::CharSet,
        }
    }

    /// Direct children inside the same rule body. Non-terminal references
    /// have none; their expansion lives in another rule.
    pub fn children(&self) -> Vec<NodeId> {
        match self {
            GrammarNode::Concatenation(nodes) | GrammarNode::Alternative(nodes) => nodes.clone(),
            GrammarNode::Repetition { node, .. } => vec![*node],
            _ => Vec::new(),
        }
    }
}

impl FromStr for NodeKind {
    type Err = GrammarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "Terminal" => NodeKind::Terminal,
            "NonTerminal" => NodeKind::NonTerminal,
            "Concatenation" => NodeKind::Concatenation,
            "Alternative" => NodeKind::Alternative,
            "Star" => NodeKind::Star,
            "Plus" => NodeKind::Plus,
            "Option" => NodeKind::Option,
            "Repetition" => NodeKind::Repetition,
            "CharSet" => NodeKind::CharSet,
            other => return Err(GrammarError::InvalidSelector(other.to_string())),
        })
    }
}

/// Which nodes a [`GrammarSetting`] applies to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum SettingSelector {
    /// `*`
    All,
    /// `all_with_type(Plus)`
    NodeKind(NodeKind),
    /// `<name>`: every reference to the non-terminal.
    Symbol(String),
}

impl FromStr for SettingSelector {
    type Err = GrammarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "*" {
            return Ok(SettingSelector::All);
        }
        if let Some(inner) = s
            .strip_prefix("all_with_type(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            return Ok(SettingSelector::NodeKind(inner.parse()?));
        }
        if s.starts_with('<') && s.ends_with('>') && s.len() > 2 {
            return Ok(SettingSelector::Symbol(strip_brackets(s).to_string()));
        }
        Err(GrammarError::InvalidSelector(s.to_string()))
    }
}

impl TryFrom<String> for SettingSelector {
    type Error = GrammarError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Per-node knobs after all matching settings have been applied.
///
/// The three `*_should_*` fields are structural hints: probabilities with
/// which the fuzzer deliberately leaves the declared quantifier bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeSettings {
    pub havoc_probability: f64,
    pub max_stack_pow: u32,
    /// Referenced non-terminal is emitted zero or at least two times.
    pub nonterminal_should_repeat: f64,
    /// A `+` repetition produces nothing.
    pub plus_should_return_nothing: f64,
    /// A `?` repetition produces two or more copies.
    pub option_should_return_multiple: f64,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            havoc_probability: 0.0,
            max_stack_pow: 7,
            nonterminal_should_repeat: 0.0,
            plus_should_return_nothing: 0.0,
            option_should_return_multiple: 0.0,
        }
    }
}

/// Partial settings as written next to a selector. Unset fields keep the
/// value of earlier settings (or the default).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SettingOverrides {
    pub havoc_probability: Option<f64>,
    pub max_stack_pow: Option<u32>,
    pub nonterminal_should_repeat: Option<f64>,
    pub plus_should_return_nothing: Option<f64>,
    pub option_should_return_multiple: Option<f64>,
}

impl SettingOverrides {
    fn apply(&self, settings: &mut NodeSettings) {
        if let Some(v) = self.havoc_probability {
            settings.havoc_probability = v;
        }
        if let Some(v) = self.max_stack_pow {
            settings.max_stack_pow = v;
        }
        if let Some(v) = self.nonterminal_should_repeat {
            settings.nonterminal_should_repeat = v;
        }
        if let Some(v) = self.plus_should_return_nothing {
            settings.plus_should_return_nothing = v;
        }
        if let Some(v) = self.option_should_return_multiple {
            settings.option_should_return_multiple = v;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GrammarSetting {
    pub selector: SettingSelector,
    #[serde(flatten)]
    pub overrides: SettingOverrides,
}

impl GrammarSetting {
    fn matches(&self, node: &GrammarNode) -> bool {
        match &self.selector {
            SettingSelector::All => true,
            SettingSelector::NodeKind(kind) => node.kind() == *kind,
            SettingSelector::Symbol(name) => {
                matches!(node, GrammarNode::NonTerminal { name: n, .. } if n == name)
            }
        }
    }
}

/// Produces the value of a non-terminal from the trees of its dependencies.
///
/// The returned bytes are parsed back against the non-terminal, so they must
/// be derivable from its rule.
pub trait Generator: Send + Sync {
    /// Non-terminals whose freshly fuzzed trees are passed to `generate`.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn generate(&self, params: &[DerivationTree]) -> anyhow::Result<Vec<u8>>;
}

/// Adapts a closure into a [`Generator`].
pub struct FnGenerator<F> {
    dependencies: Vec<String>,
    f: F,
}

impl<F> FnGenerator<F>
where
    F: Fn(&[DerivationTree]) -> anyhow::Result<Vec<u8>> + Send + Sync,
{
    pub fn new(dependencies: Vec<String>, f: F) -> Self {
        Self {
            dependencies: dependencies
                .into_iter()
                .map(|d| strip_brackets(&d).to_string())
                .collect(),
            f,
        }
    }
}

impl<F> Generator for FnGenerator<F>
where
    F: Fn(&[DerivationTree]) -> anyhow::Result<Vec<u8>> + Send + Sync,
{
    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    fn generate(&self, params: &[DerivationTree]) -> anyhow::Result<Vec<u8>> {
        (self.f)(params)
    }
}

/// Incrementally assembles a [`Grammar`].
///
/// Node constructors return handles that can be reused in several places;
/// `build` checks the whole arena.
#[derive(Default)]
pub struct GrammarBuilder {
    nodes: Vec<GrammarNode>,
    rules: BTreeMap<String, NodeId>,
    start: Option<String>,
    settings: Vec<GrammarSetting>,
    generators: BTreeMap<String, Arc<dyn Generator>>,
}

impl GrammarBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from a copy of an existing grammar so it can be edited.
    pub fn from_grammar(grammar: &Grammar) -> Self {
        Self {
            nodes: grammar.nodes.clone(),
            rules: grammar.rules.clone(),
            start: Some(grammar.start.clone()),
            settings: grammar.setting_list.clone(),
            generators: grammar.generators.clone(),
        }
    }

    pub fn add(&mut self, node: GrammarNode) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut GrammarNode> {
        self.nodes.get_mut(id.0)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn text(&mut self, value: &str) -> NodeId {
        self.add(GrammarNode::Terminal(TerminalValue::Text(value.to_string())))
    }

    pub fn bytes(&mut self, value: &[u8]) -> NodeId {
        self.add(GrammarNode::Terminal(TerminalValue::Bytes(value.to_vec())))
    }

    pub fn non_terminal(&mut self, name: &str) -> NodeId {
        self.add(GrammarNode::NonTerminal {
            name: strip_brackets(name).to_string(),
            sender: None,
            recipient: None,
        })
    }

    /// A reference to a message non-terminal played by `sender`.
    pub fn message(&mut self, name: &str, sender: &str, recipient: Option<&str>) -> NodeId {
        self.add(GrammarNode::NonTerminal {
            name: strip_brackets(name).to_string(),
            sender: Some(sender.to_string()),
            recipient: recipient.map(str::to_string),
        })
    }

    pub fn concat(&mut self, nodes: Vec<NodeId>) -> NodeId {
        self.add(GrammarNode::Concatenation(nodes))
    }

    pub fn alt(&mut self, nodes: Vec<NodeId>) -> NodeId {
        self.add(GrammarNode::Alternative(nodes))
    }

    pub fn star(&mut self, node: NodeId) -> NodeId {
        self.add(GrammarNode::Repetition {
            node,
            min: 0,
            max: None,
            kind: RepetitionKind::Star,
        })
    }

    pub fn plus(&mut self, node: NodeId) -> NodeId {
        self.add(GrammarNode::Repetition {
            node,
            min: 1,
            max: None,
            kind: RepetitionKind::Plus,
        })
    }

    pub fn optional(&mut self, node: NodeId) -> NodeId {
        self.add(GrammarNode::Repetition {
            node,
            min: 0,
            max: Some(1),
            kind: RepetitionKind::Optional,
        })
    }

    pub fn repeat(&mut self, node: NodeId, min: usize, max: Option<usize>) -> NodeId {
        self.add(GrammarNode::Repetition {
            node,
            min,
            max,
            kind: RepetitionKind::Bounded,
        })
    }

    pub fn char_set(&mut self, chars: impl IntoIterator<Item = char>) -> NodeId {
        let mut chars: Vec<char> = chars.into_iter().collect();
        chars.sort_unstable();
        chars.dedup();
        self.add(GrammarNode::CharSet(chars))
    }

    pub fn char_range(&mut self, from: char, to: char) -> NodeId {
        self.char_set(from..=to)
    }

    pub fn rule(&mut self, name: &str, body: NodeId) -> &mut Self {
        self.rules.insert(strip_brackets(name).to_string(), body);
        self
    }

    pub fn start(&mut self, name: &str) -> &mut Self {
        self.start = Some(strip_brackets(name).to_string());
        self
    }

    pub fn setting(&mut self, setting: GrammarSetting) -> &mut Self {
        self.settings.push(setting);
        self
    }

    pub fn generator(&mut self, name: &str, generator: Arc<dyn Generator>) -> &mut Self {
        self.generators
            .insert(strip_brackets(name).to_string(), generator);
        self
    }

    /// Checks references, bounds and productivity, then resolves settings
    /// and completion distances.
    pub fn build(self) -> Result<Grammar, GrammarError> {
        let start = self.start.unwrap_or_else(|| "start".to_string());
        if !self.rules.contains_key(&start) {
            return Err(GrammarError::UndefinedSymbol(start));
        }

        let rule_of = owning_rules(&self.nodes, &self.rules);
        for (idx, node) in self.nodes.iter().enumerate() {
            match node {
                GrammarNode::NonTerminal { name, .. } if !self.rules.contains_key(name) => {
                    return Err(GrammarError::UndefinedSymbol(name.clone()));
                }
                GrammarNode::Repetition { min, max, .. } => {
                    if let Some(max) = max {
                        if *max == 0 || max < min {
                            return Err(GrammarError::InvalidRepetition {
                                min: *min,
                                max: Some(*max),
                            });
                        }
                    }
                }
                GrammarNode::Alternative(options) if options.is_empty() => {
                    let owner = rule_of.get(&NodeId(idx)).cloned().unwrap_or_default();
                    return Err(GrammarError::EmptyAlternative(owner));
                }
                _ => {}
            }
        }
        for (name, generator) in &self.generators {
            if !self.rules.contains_key(name) {
                return Err(GrammarError::UndefinedSymbol(name.clone()));
            }
            for dependency in generator.dependencies() {
                if !self.rules.contains_key(&dependency) {
                    return Err(GrammarError::UndefinedSymbol(dependency));
                }
            }
        }

        let distances = completion_distances(&self.nodes, &self.rules);
        for (name, root) in &self.rules {
            if distances[root.0] == UNREACHABLE_DISTANCE {
                return Err(GrammarError::Unproductive(name.clone()));
            }
        }

        let node_settings = self
            .nodes
            .iter()
            .map(|node| {
                let mut resolved = NodeSettings::default();
                for setting in self.settings.iter().filter(|s| s.matches(node)) {
                    setting.overrides.apply(&mut resolved);
                }
                resolved
            })
            .collect();

        Ok(Grammar {
            nodes: self.nodes,
            rules: self.rules,
            start,
            setting_list: self.settings,
            node_settings,
            distances,
            generators: self.generators,
            compiled: OnceLock::new(),
        })
    }
}

/// Maps every node to the rule whose body contains it (first owner wins).
fn owning_rules(nodes: &[GrammarNode], rules: &BTreeMap<String, NodeId>) -> HashMap<NodeId, String> {
    let mut owner = HashMap::new();
    for (name, root) in rules {
        let mut stack = vec![*root];
        while let Some(id) = stack.pop() {
            if owner.contains_key(&id) {
                continue;
            }
            owner.insert(id, name.clone());
            if let Some(node) = nodes.get(id.0) {
                stack.extend(node.children());
            }
        }
    }
    owner
}

/// Minimal number of tree nodes needed to complete each grammar node,
/// computed as a least fixpoint. Unproductive nodes keep `usize::MAX`.
fn completion_distances(nodes: &[GrammarNode], rules: &BTreeMap<String, NodeId>) -> Vec<usize> {
    let mut dist = vec![UNREACHABLE_DISTANCE; nodes.len()];
    loop {
        let mut changed = false;
        for (idx, node) in nodes.iter().enumerate() {
            let d = match node {
                GrammarNode::Terminal(_) | GrammarNode::CharSet(_) => 1,
                GrammarNode::NonTerminal { name, .. } => rules
                    .get(name)
                    .map(|root| dist[root.0].saturating_add(1))
                    .unwrap_or(UNREACHABLE_DISTANCE),
                GrammarNode::Concatenation(children) => children
                    .iter()
                    .fold(0usize, |acc, c| acc.saturating_add(dist[c.0])),
                GrammarNode::Alternative(options) => options
                    .iter()
                    .map(|o| dist[o.0])
                    .min()
                    .unwrap_or(UNREACHABLE_DISTANCE),
                GrammarNode::Repetition { node, min, .. } => {
                    if *min == 0 {
                        0
                    } else {
                        dist[node.0].saturating_mul(*min)
                    }
                }
            };
            if d < dist[idx] {
                dist[idx] = d;
                changed = true;
            }
        }
        if !changed {
            return dist;
        }
    }
}

/// An immutable grammar: an arena of production nodes plus a rule table.
///
/// Derivation trees never embed grammar nodes; they are checked against the
/// grammar by symbol name through [`Grammar::validate`].
#[derive(Clone)]
pub struct Grammar {
    nodes: Vec<GrammarNode>,
    rules: BTreeMap<String, NodeId>,
    start: String,
    setting_list: Vec<GrammarSetting>,
    node_settings: Vec<NodeSettings>,
    distances: Vec<usize>,
    generators: BTreeMap<String, Arc<dyn Generator>>,
    compiled: OnceLock<CompiledGrammar>,
}

impl fmt::Debug for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Grammar")
            .field("start", &self.start)
            .field("rules", &self.rules.keys().collect::<Vec<_>>())
            .field("nodes", &self.nodes.len())
            .field("generators", &self.generators.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Grammar {
    pub fn start_symbol(&self) -> &str {
        &self.start
    }

    pub fn node(&self, id: NodeId) -> &GrammarNode {
        &self.nodes[id.0]
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(NodeId)
    }

    pub fn rule(&self, name: &str) -> Result<NodeId, GrammarError> {
        self.rules
            .get(strip_brackets(name))
            .copied()
            .ok_or_else(|| GrammarError::UndefinedSymbol(strip_brackets(name).to_string()))
    }

    pub fn rules(&self) -> impl Iterator<Item = (&str, NodeId)> + '_ {
        self.rules.iter().map(|(name, id)| (name.as_str(), *id))
    }

    pub fn has_rule(&self, name: &str) -> bool {
        self.rules.contains_key(strip_brackets(name))
    }

    /// Minimal number of derivation-tree nodes this node expands to.
    pub fn distance(&self, id: NodeId) -> usize {
        self.distances[id.0]
    }

    /// Minimal size of a tree rooted at `<name>`.
    pub fn symbol_distance(&self, name: &str) -> Result<usize, GrammarError> {
        Ok(self.distance(self.rule(name)?).saturating_add(1))
    }

    pub fn settings(&self, id: NodeId) -> &NodeSettings {
        &self.node_settings[id.0]
    }

    pub fn generator(&self, name: &str) -> Option<&Arc<dyn Generator>> {
        self.generators.get(name)
    }

    pub(crate) fn compiled(&self) -> &CompiledGrammar {
        self.compiled.get_or_init(|| CompiledGrammar::compile(self))
    }

    /// Terminal, character-set and non-terminal leaves below `id` within
    /// its rule body, in left-to-right order.
    pub fn leaves(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            match self.node(current) {
                GrammarNode::Terminal(_)
                | GrammarNode::CharSet(_)
                | GrammarNode::NonTerminal { .. } => out.push(current),
                node => stack.extend(node.children().into_iter().rev()),
            }
        }
        out
    }

    /// Non-terminals reachable from `<name>`, excluding `name` unless it is recursive.
    pub fn reachable_symbols(&self, name: &str) -> Result<BTreeSet<String>, GrammarError> {
        let mut seen = BTreeSet::new();
        let mut pending = vec![self.rule(name)?];
        while let Some(root) = pending.pop() {
            for leaf in self.leaves(root) {
                if let GrammarNode::NonTerminal { name, .. } = self.node(leaf) {
                    if seen.insert(name.clone()) {
                        pending.push(self.rule(name)?);
                    }
                }
            }
        }
        Ok(seen)
    }

    /// Parties that send (and optionally receive) messages.
    pub fn msg_parties(&self, include_recipients: bool) -> BTreeSet<String> {
        let mut parties = BTreeSet::new();
        for node in &self.nodes {
            if let GrammarNode::NonTerminal {
                sender, recipient, ..
            } = node
            {
                if let Some(sender) = sender {
                    parties.insert(sender.clone());
                }
                if include_recipients {
                    if let Some(recipient) = recipient {
                        parties.insert(recipient.clone());
                    }
                }
            }
        }
        parties
    }

    /// Restricts a multi-party grammar to the messages sent by `parties`.
    ///
    /// Message references from other parties are dropped from sequences and
    /// alternatives. Naming a party that never sends or receives is an error.
    pub fn slice_parties(&self, parties: &[&str]) -> Result<Grammar, GrammarError> {
        let known = self.msg_parties(true);
        for party in parties {
            if !known.contains(*party) {
                return Err(GrammarError::UnknownParty(
                    party.to_string(),
                    known.iter().cloned().collect(),
                ));
            }
        }
        let in_parties = |node: &GrammarNode| match node {
            GrammarNode::NonTerminal {
                sender: Some(sender),
                ..
            } => parties.contains(&sender.as_str()),
            _ => true,
        };

        let mut builder = GrammarBuilder::from_grammar(self);
        for idx in 0..self.nodes.len() {
            let sliced = match &self.nodes[idx] {
                GrammarNode::Concatenation(children) => Some(GrammarNode::Concatenation(
                    children
                        .iter()
                        .copied()
                        .filter(|c| in_parties(self.node(*c)))
                        .collect(),
                )),
                GrammarNode::Alternative(options) => Some(GrammarNode::Alternative(
                    options
                        .iter()
                        .copied()
                        .filter(|c| in_parties(self.node(*c)))
                        .collect(),
                )),
                _ => None,
            };
            if let (Some(sliced), Some(slot)) = (sliced, builder.node_mut(NodeId(idx))) {
                *slot = sliced;
            }
        }
        builder.build()
    }

    /// Renders one node back to grammar notation.
    pub fn format_node(&self, id: NodeId) -> String {
        match self.node(id) {
            GrammarNode::Terminal(value) => value.to_string(),
            GrammarNode::NonTerminal {
                name,
                sender,
                recipient,
            } => match (sender, recipient) {
                (Some(s), Some(r)) => format!("<{s}:{r}:{name}>"),
                (Some(s), None) => format!("<{s}:{name}>"),
                _ => format!("<{name}>"),
            },
            GrammarNode::Concatenation(children) => children
                .iter()
                .map(|c| self.format_node(*c))
                .collect::<Vec<_>>()
                .join(" "),
            GrammarNode::Alternative(options) => format!(
                "({})",
                options
                    .iter()
                    .map(|o| self.format_node(*o))
                    .collect::<Vec<_>>()
                    .join(" | ")
            ),
            GrammarNode::Repetition {
                node,
                min,
                max,
                kind,
            } => {
                let inner = match self.node(*node) {
                    GrammarNode::Concatenation(c) if c.len() > 1 => {
                        format!("({})", self.format_node(*node))
                    }
                    _ => self.format_node(*node),
                };
                match (kind, max) {
                    (RepetitionKind::Star, _) => format!("{inner}*"),
                    (RepetitionKind::Plus, _) => format!("{inner}+"),
                    (RepetitionKind::Optional, _) => format!("{inner}?"),
                    (RepetitionKind::Bounded, Some(max)) if max == min => {
                        format!("{inner}{{{min}}}")
                    }
                    (RepetitionKind::Bounded, Some(max)) => format!("{inner}{{{min},{max}}}"),
                    (RepetitionKind::Bounded, None) => format!("{inner}{{{min},}}"),
                }
            }
            GrammarNode::CharSet(chars) => {
                let body: String = chars
                    .iter()
                    .flat_map(|c| match c {
                        ']' | '\\' | '-' => vec!['\\', *c],
                        c => vec![*c],
                    })
                    .collect();
                format!("[{body}]")
            }
        }
    }

    /// Renders the whole grammar, start rule first.
    pub fn format_as_spec(&self) -> String {
        let mut lines = Vec::with_capacity(self.rules.len());
        if let Some(root) = self.rules.get(&self.start) {
            lines.push(format!("<{}> ::= {}", self.start, self.format_node(*root)));
        }
        for (name, root) in self.rules.iter().filter(|(n, _)| **n != self.start) {
            lines.push(format!("<{}> ::= {}", name, self.format_node(*root)));
        }
        lines.join("\n")
    }

    /// Checks that every non-terminal in `tree` has a child sequence its rule
    /// can produce and that terminals are leaves.
    pub fn validate(&self, tree: &DerivationTree) -> Result<(), GrammarError> {
        let mut path = Vec::new();
        self.validate_at(tree, &mut path)
    }

    fn validate_at(&self, tree: &DerivationTree, path: &mut TreePath) -> Result<(), GrammarError> {
        let invalid = |path: &TreePath, reason: String| GrammarError::Validity {
            path: path.clone(),
            symbol: tree.symbol().to_string(),
            reason,
        };
        match tree.symbol() {
            Symbol::Terminal(_) => {
                if !tree.children().is_empty() {
                    return Err(invalid(path, "terminal with children".into()));
                }
                Ok(())
            }
            Symbol::Slice => Err(invalid(path, "slice marker inside a tree".into())),
            Symbol::NonTerminal(name) => {
                let root = self
                    .rules
                    .get(name)
                    .ok_or_else(|| invalid(path, format!("no rule for <{name}>")))?;
                let ends = self.match_children(*root, tree.children(), 0);
                if !ends.contains(&tree.children().len()) {
                    return Err(invalid(
                        path,
                        format!("children do not match {}", self.format_node(*root)),
                    ));
                }
                for (idx, child) in tree.children().iter().enumerate() {
                    path.push(idx);
                    self.validate_at(child, path)?;
                    path.pop();
                }
                Ok(())
            }
        }
    }

    /// Positions in `children` where a match of `id` starting at `pos` can end.
    fn match_children(
        &self,
        id: NodeId,
        children: &[DerivationTree],
        pos: usize,
    ) -> BTreeSet<usize> {
        let mut ends = BTreeSet::new();
        match self.node(id) {
            GrammarNode::Terminal(value) => {
                if let Some(Symbol::Terminal(actual)) = children.get(pos).map(|c| c.symbol()) {
                    if actual == value {
                        ends.insert(pos + 1);
                    }
                }
            }
            GrammarNode::CharSet(chars) => {
                if let Some(Symbol::Terminal(TerminalValue::Text(actual))) =
                    children.get(pos).map(|c| c.symbol())
                {
                    let mut it = actual.chars();
                    if let (Some(c), None) = (it.next(), it.next()) {
                        if chars.binary_search(&c).is_ok() {
                            ends.insert(pos + 1);
                        }
                    }
                }
            }
            GrammarNode::NonTerminal { name, .. } => {
                if children.get(pos).and_then(|c| c.symbol().name()) == Some(name.as_str()) {
                    ends.insert(pos + 1);
                }
            }
            GrammarNode::Concatenation(parts) => {
                let mut current = BTreeSet::from([pos]);
                for part in parts {
                    let mut next = BTreeSet::new();
                    for p in current {
                        next.extend(self.match_children(*part, children, p));
                    }
                    if next.is_empty() {
                        return next;
                    }
                    current = next;
                }
                ends = current;
            }
            GrammarNode::Alternative(options) => {
                for option in options {
                    ends.extend(self.match_children(*option, children, pos));
                }
            }
            GrammarNode::Repetition { node, min, max, .. } => {
                let mut frontier = BTreeSet::from([pos]);
                let mut seen = BTreeSet::new();
                let mut count = 0usize;
                loop {
                    if count >= *min {
                        // A position revisited later has fewer repetitions left.
                        frontier.retain(|p| seen.insert(*p));
                        ends.extend(frontier.iter().copied());
                    }
                    if frontier.is_empty() || max.is_some_and(|m| count >= m) {
                        break;
                    }
                    let mut next = BTreeSet::new();
                    for p in &frontier {
                        next.extend(self.match_children(*node, children, *p));
                    }
                    count += 1;
                    frontier = next;
                }
            }
        }
        ends
    }
}

fn default_start() -> String {
    "start".to_string()
}

/// Serialized grammar description, as read by the command line front-end.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct GrammarDocument {
    #[serde(default = "default_start")]
    pub start: String,
    pub rules: BTreeMap<String, Expr>,
    #[serde(default)]
    pub settings: Vec<GrammarSetting>,
}

/// Rule body expression of a [`GrammarDocument`].
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub enum Expr {
    Text(String),
    Bytes(Vec<u8>),
    Ref(String),
    Message {
        name: String,
        sender: String,
        #[serde(default)]
        recipient: Option<String>,
    },
    Seq(Vec<Expr>),
    Alt(Vec<Expr>),
    Star(Box<Expr>),
    Plus(Box<Expr>),
    Optional(Box<Expr>),
    Repeat {
        expr: Box<Expr>,
        min: usize,
        #[serde(default)]
        max: Option<usize>,
    },
    Chars(String),
}

impl GrammarDocument {
    pub fn into_grammar(self) -> Result<Grammar, GrammarError> {
        let mut builder = GrammarBuilder::new();
        for (name, expr) in &self.rules {
            let root = lower_expr(&mut builder, expr);
            builder.rule(name, root);
        }
        builder.start(&self.start);
        for setting in self.settings {
            builder.setting(setting);
        }
        builder.build()
    }
}

fn lower_expr(builder: &mut GrammarBuilder, expr: &Expr) -> NodeId {
    match expr {
        Expr::Text(s) => builder.text(s),
        Expr::Bytes(b) => builder.bytes(b),
        Expr::Ref(name) => builder.non_terminal(name),
        Expr::Message {
            name,
            sender,
            recipient,
        } => builder.message(name, sender, recipient.as_deref()),
        Expr::Seq(parts) => {
            let ids = parts.iter().map(|p| lower_expr(builder, p)).collect();
            builder.concat(ids)
        }
        Expr::Alt(options) => {
            let ids = options.iter().map(|o| lower_expr(builder, o)).collect();
            builder.alt(ids)
        }
        Expr::Star(inner) => {
            let id = lower_expr(builder, inner);
            builder.star(id)
        }
        Expr::Plus(inner) => {
            let id = lower_expr(builder, inner);
            builder.plus(id)
        }
        Expr::Optional(inner) => {
            let id = lower_expr(builder, inner);
            builder.optional(id)
        }
        Expr::Repeat { expr, min, max } => {
            let id = lower_expr(builder, expr);
            builder.repeat(id, *min, *max)
        }
        Expr::Chars(chars) => builder.char_set(chars.chars()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// `<start> ::= <ab>; <ab> ::= "a" <ab> | <ab> "b" | ""`
    pub(crate) fn ab_grammar() -> Grammar {
        let mut b = GrammarBuilder::new();
        let ab = b.non_terminal("ab");
        b.rule("start", ab);
        let a = b.text("a");
        let ab1 = b.non_terminal("ab");
        let left = b.concat(vec![a, ab1]);
        let ab2 = b.non_terminal("ab");
        let bt = b.text("b");
        let right = b.concat(vec![ab2, bt]);
        let empty = b.text("");
        let body = b.alt(vec![left, right, empty]);
        b.rule("ab", body);
        b.build().expect("ab grammar should build")
    }

    /// `<start> ::= <number> ("," <number>)*; <number> ::= [0-9]+`
    pub(crate) fn list_grammar() -> Grammar {
        let mut b = GrammarBuilder::new();
        let first = b.non_terminal("number");
        let comma = b.text(",");
        let next = b.non_terminal("number");
        let pair = b.concat(vec![comma, next]);
        let tail = b.star(pair);
        let body = b.concat(vec![first, tail]);
        b.rule("start", body);
        let digit = b.char_range('0', '9');
        let digits = b.plus(digit);
        b.rule("number", digits);
        b.build().expect("list grammar should build")
    }

    #[test]
    fn build_rejects_undefined_references() {
        let mut b = GrammarBuilder::new();
        let missing = b.non_terminal("missing");
        b.rule("start", missing);
        match b.build() {
            Err(GrammarError::UndefinedSymbol(name)) => assert_eq!(name, "missing"),
            other => panic!("Expected UndefinedSymbol, got {other:?}"),
        }
    }

    #[test]
    fn build_rejects_unproductive_rules() {
        let mut b = GrammarBuilder::new();
        let loop_ref = b.non_terminal("loop");
        b.rule("start", loop_ref);
        let x = b.text("x");
        let again = b.non_terminal("loop");
        let body = b.concat(vec![x, again]);
        b.rule("loop", body);
        match b.build() {
            Err(GrammarError::Unproductive(name)) => {
                assert!(name == "loop" || name == "start", "Unexpected rule {name}")
            }
            other => panic!("Expected Unproductive, got {other:?}"),
        }
    }

    #[test]
    fn build_rejects_inverted_repetition_bounds() {
        let mut b = GrammarBuilder::new();
        let x = b.text("x");
        let rep = b.repeat(x, 3, Some(2));
        b.rule("start", rep);
        assert_eq!(
            b.build().err(),
            Some(GrammarError::InvalidRepetition {
                min: 3,
                max: Some(2)
            })
        );
    }

    #[test]
    fn completion_distances_follow_cheapest_expansion() {
        let grammar = ab_grammar();
        let ab_root = grammar.rule("ab").expect("rule <ab> exists");
        assert_eq!(grammar.distance(ab_root), 1, "Empty alternative costs one leaf");
        assert_eq!(grammar.symbol_distance("start").expect("start exists"), 3);

        let list = list_grammar();
        assert_eq!(list.symbol_distance("number").expect("number exists"), 2);
        assert_eq!(list.symbol_distance("start").expect("start exists"), 3);
    }

    #[test]
    fn format_as_spec_renders_rules_start_first() {
        let grammar = list_grammar();
        let text = grammar.format_as_spec();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("<start> ::= <number> (\",\" <number>)*"));
        assert_eq!(lines.next(), Some("<number> ::= [0123456789]+"));
    }

    #[test]
    fn settings_resolve_by_selector_in_declaration_order() {
        let mut b = GrammarBuilder::new();
        let x = b.non_terminal("x");
        let plus = b.plus(x);
        b.rule("start", plus);
        let a = b.text("a");
        b.rule("x", a);
        b.setting(GrammarSetting {
            selector: "*".parse().expect("valid selector"),
            overrides: SettingOverrides {
                havoc_probability: Some(0.5),
                ..Default::default()
            },
        });
        b.setting(GrammarSetting {
            selector: "all_with_type(Plus)".parse().expect("valid selector"),
            overrides: SettingOverrides {
                plus_should_return_nothing: Some(1.0),
                havoc_probability: Some(0.25),
                ..Default::default()
            },
        });
        b.setting(GrammarSetting {
            selector: "<x>".parse().expect("valid selector"),
            overrides: SettingOverrides {
                nonterminal_should_repeat: Some(0.75),
                ..Default::default()
            },
        });
        let grammar = b.build().expect("grammar builds");

        assert_eq!(grammar.settings(plus).plus_should_return_nothing, 1.0);
        assert_eq!(grammar.settings(plus).havoc_probability, 0.25);
        assert_eq!(grammar.settings(x).nonterminal_should_repeat, 0.75);
        assert_eq!(grammar.settings(x).havoc_probability, 0.5);
        assert_eq!(grammar.settings(a).max_stack_pow, 7);
        assert!("all_with_type(Bogus)".parse::<SettingSelector>().is_err());
    }

    #[test]
    fn slice_parties_drops_foreign_messages_and_rejects_unknown_parties() {
        let mut b = GrammarBuilder::new();
        let hello = b.message("hello", "Client", Some("Server"));
        let reply = b.message("reply", "Server", Some("Client"));
        let body = b.concat(vec![hello, reply]);
        b.rule("start", body);
        let h = b.text("HELLO");
        b.rule("hello", h);
        let r = b.text("OK");
        b.rule("reply", r);
        let grammar = b.build().expect("grammar builds");

        assert_eq!(
            grammar.msg_parties(false).into_iter().collect::<Vec<_>>(),
            vec!["Client".to_string(), "Server".to_string()]
        );

        let client_only = grammar.slice_parties(&["Client"]).expect("Client is known");
        let root = client_only.rule("start").expect("start exists");
        assert_eq!(client_only.format_node(root), "<Client:Server:hello>");

        match grammar.slice_parties(&["Mallory"]) {
            Err(GrammarError::UnknownParty(party, _)) => assert_eq!(party, "Mallory"),
            other => panic!("Expected UnknownParty, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_children_out_of_sync_with_rule() {
        let grammar = list_grammar();
        let good = DerivationTree::non_terminal(
            "start",
            vec![DerivationTree::non_terminal(
                "number",
                vec![DerivationTree::text("4"), DerivationTree::text("2")],
            )],
        );
        grammar.validate(&good).expect("42 is a valid list");

        let bad = DerivationTree::non_terminal(
            "start",
            vec![
                DerivationTree::non_terminal("number", vec![DerivationTree::text("4")]),
                DerivationTree::text(","),
            ],
        );
        match grammar.validate(&bad) {
            Err(GrammarError::Validity { path, .. }) => assert!(path.is_empty()),
            other => panic!("Expected a validity error at the root, got {other:?}"),
        }
    }

    #[test]
    fn grammar_document_lowers_to_equivalent_grammar() {
        let json = r#"{
            "rules": {
                "start": {"seq": [{"ref": "greeting"}, {"optional": {"text": "!"}}]},
                "greeting": {"alt": [{"text": "hi"}, {"text": "hello"}]}
            },
            "settings": [{"selector": "all_with_type(Option)", "option_should_return_multiple": 1.0}]
        }"#;
        let doc: GrammarDocument = serde_json::from_str(json).expect("document parses");
        let grammar = doc.into_grammar().expect("document builds");
        let start = grammar.rule("start").expect("start exists");
        assert_eq!(grammar.format_node(start), "<greeting> \"!\"?");
        let optional = grammar
            .node_ids()
            .find(|id| grammar.node(*id).kind() == NodeKind::Option)
            .expect("optional node exists");
        assert_eq!(grammar.settings(optional).option_should_return_multiple, 1.0);
    }
}
