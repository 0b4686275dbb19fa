use crate::grammar::{Grammar, GrammarBuilder, GrammarError, GrammarNode, NodeId};
use crate::graph::{GrammarGraph, GraphNode};
use crate::parser::{ParseError, ParsingMode};
use crate::symbol::{Symbol, TerminalValue};
use crate::tree::DerivationTree;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

const PACKET_RULE_PREFIX: &str = "_packet_";
const LITERAL_RULE_PREFIX: &str = "_literal_";

/// A message non-terminal together with the parties that send and receive
/// it. Equality and ordering are over `(sender, recipient, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketNonTerminal {
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub name: String,
}

impl PacketNonTerminal {
    pub fn new(name: &str, sender: Option<&str>, recipient: Option<&str>) -> Self {
        Self {
            sender: sender.map(str::to_string),
            recipient: recipient.map(str::to_string),
            name: crate::symbol::strip_brackets(name).to_string(),
        }
    }

    pub fn symbol(&self) -> Symbol {
        Symbol::NonTerminal(self.name.clone())
    }

    /// Every sender-annotated reference in `grammar`, sorted.
    pub fn all(grammar: &Grammar) -> Vec<PacketNonTerminal> {
        let set: BTreeSet<PacketNonTerminal> = grammar
            .node_ids()
            .filter_map(|id| match grammar.node(id) {
                GrammarNode::NonTerminal {
                    name,
                    sender: Some(sender),
                    recipient,
                } => Some(PacketNonTerminal::new(
                    name,
                    Some(sender),
                    recipient.as_deref(),
                )),
                _ => None,
            })
            .collect();
        set.into_iter().collect()
    }
}

impl fmt::Display for PacketNonTerminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<")?;
        if let Some(sender) = &self.sender {
            write!(f, "{sender}:")?;
        }
        if let Some(recipient) = &self.recipient {
            write!(f, "{recipient}:")?;
        }
        write!(f, "{}>", self.name)
    }
}

/// The protocol skeleton of a multi-party grammar.
///
/// Every message reference reachable from the start symbol outside of any
/// message is redirected to a rule `_packet_<k>` whose body is a unique
/// token, and every literal in that control structure to an empty
/// `_literal_<id>` rule. A sequence of packets then becomes a token string
/// that the ordinary parser can check for (prefix) membership.
#[derive(Debug, Clone)]
pub struct ReducedGrammar {
    grammar: Grammar,
    packets: Vec<PacketNonTerminal>,
    literals: BTreeMap<String, TerminalValue>,
}

pub struct GrammarReducer;

impl GrammarReducer {
    pub fn reduce(grammar: &Grammar) -> Result<ReducedGrammar, GrammarError> {
        let packets = PacketNonTerminal::all(grammar);
        let index: BTreeMap<&PacketNonTerminal, usize> =
            packets.iter().enumerate().map(|(k, p)| (p, k)).collect();

        let mut builder = GrammarBuilder::from_grammar(grammar);
        let mut literals = BTreeMap::new();
        for id in control_nodes(grammar)? {
            let replacement = match grammar.node(id) {
                GrammarNode::NonTerminal {
                    name,
                    sender: Some(sender),
                    recipient,
                } => {
                    let packet = PacketNonTerminal::new(name, Some(sender), recipient.as_deref());
                    let Some(k) = index.get(&packet) else {
                        continue;
                    };
                    GrammarNode::NonTerminal {
                        name: packet_rule(*k),
                        sender: Some(sender.clone()),
                        recipient: recipient.clone(),
                    }
                }
                GrammarNode::Terminal(value) => {
                    literals.insert(literal_rule(id), value.clone());
                    literal_ref(id)
                }
                GrammarNode::CharSet(chars) => {
                    let first = chars.first().map(char::to_string).unwrap_or_default();
                    literals.insert(literal_rule(id), TerminalValue::Text(first));
                    literal_ref(id)
                }
                _ => continue,
            };
            if let Some(slot) = builder.node_mut(id) {
                *slot = replacement;
            }
        }
        for k in 0..packets.len() {
            let token = builder.text(&packet_token(k));
            builder.rule(&packet_rule(k), token);
        }
        for name in literals.keys() {
            let empty = builder.text("");
            builder.rule(name, empty);
        }
        Ok(ReducedGrammar {
            grammar: builder.build()?,
            packets,
            literals,
        })
    }
}

fn packet_rule(k: usize) -> String {
    format!("{PACKET_RULE_PREFIX}{k}")
}

fn packet_token(k: usize) -> String {
    format!("<{k}>")
}

fn literal_rule(id: NodeId) -> String {
    format!("{LITERAL_RULE_PREFIX}{}", id.0)
}

fn literal_ref(id: NodeId) -> GrammarNode {
    GrammarNode::NonTerminal {
        name: literal_rule(id),
        sender: None,
        recipient: None,
    }
}

/// Nodes of the rules reachable from the start symbol without entering a
/// message.
fn control_nodes(grammar: &Grammar) -> Result<Vec<NodeId>, GrammarError> {
    let mut rules = BTreeSet::from([grammar.start_symbol().to_string()]);
    let mut pending = vec![grammar.rule(grammar.start_symbol())?];
    let mut nodes = BTreeSet::new();
    while let Some(id) = pending.pop() {
        if !nodes.insert(id) {
            continue;
        }
        match grammar.node(id) {
            GrammarNode::NonTerminal {
                name, sender: None, ..
            } => {
                if rules.insert(name.clone()) {
                    pending.push(grammar.rule(name)?);
                }
            }
            node => pending.extend(node.children()),
        }
    }
    Ok(nodes.into_iter().collect())
}

impl ReducedGrammar {
    pub fn grammar(&self) -> &Grammar {
        &self.grammar
    }

    pub fn packets(&self) -> &[PacketNonTerminal] {
        &self.packets
    }

    fn packet_index(&self, packet: &PacketNonTerminal) -> Option<usize> {
        self.packets.iter().position(|p| p == packet)
    }

    /// The packet a `_packet_<k>` rule stands for.
    pub fn packet_of_rule(&self, rule: &str) -> Option<&PacketNonTerminal> {
        let k: usize = rule.strip_prefix(PACKET_RULE_PREFIX)?.parse().ok()?;
        self.packets.get(k)
    }

    /// Token string of a packet sequence; `None` if a packet is unknown.
    pub fn tokens(&self, history: &[PacketNonTerminal]) -> Option<String> {
        history
            .iter()
            .map(|p| self.packet_index(p).map(packet_token))
            .collect()
    }

    /// The terminal node holding a packet's token.
    fn token_node(&self, packet: &PacketNonTerminal) -> Option<NodeId> {
        let rule = self.grammar.rule(&packet_rule(self.packet_index(packet)?)).ok()?;
        Some(rule)
    }
}

/// Tells which packets may come next in an exchange.
#[derive(Debug, Clone)]
pub struct PacketForecaster {
    reduced: ReducedGrammar,
}

impl PacketForecaster {
    pub fn new(reduced: ReducedGrammar) -> Self {
        Self { reduced }
    }

    pub fn reduced(&self) -> &ReducedGrammar {
        &self.reduced
    }

    /// Packets that extend `history` to a prefix of some complete exchange.
    pub fn predict(&self, history: &[PacketNonTerminal]) -> Vec<PacketNonTerminal> {
        let Some(prefix) = self.reduced.tokens(history) else {
            return Vec::new();
        };
        let grammar = &self.reduced.grammar;
        let start = grammar.start_symbol();
        self.reduced
            .packets
            .iter()
            .enumerate()
            .filter(|(k, _)| {
                let candidate = format!("{prefix}{}", packet_token(*k));
                grammar.recognize(candidate, start, ParsingMode::Incomplete)
            })
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Whether `history` is a complete exchange.
    pub fn is_complete(&self, history: &[PacketNonTerminal]) -> bool {
        let grammar = &self.reduced.grammar;
        self.reduced
            .tokens(history)
            .is_some_and(|tokens| grammar.recognize(tokens, grammar.start_symbol(), ParsingMode::Complete))
    }

    /// Builds the full derivation tree of a complete exchange from its
    /// message trees.
    ///
    /// The control structure is parsed from the packet tokens; each packet
    /// position then receives its message tree, annotated with the
    /// packet's parties, and each control literal its original terminal.
    pub fn assemble(
        &self,
        history: &[(PacketNonTerminal, DerivationTree)],
    ) -> Result<DerivationTree, ParseError> {
        let grammar = &self.reduced.grammar;
        let start = grammar.start_symbol();
        let packets: Vec<PacketNonTerminal> = history.iter().map(|(p, _)| p.clone()).collect();
        let no_match = || ParseError::NoMatch {
            symbol: start.to_string(),
            position: 0,
            length: history.len(),
        };
        let tokens = self.reduced.tokens(&packets).ok_or_else(no_match)?;
        let skeleton = grammar.parse(tokens, start, ParsingMode::Complete)?;
        let mut messages = history.iter().map(|(_, tree)| tree);
        self.substitute(&skeleton, &mut messages).ok_or_else(no_match)
    }

    fn substitute<'a>(
        &self,
        node: &DerivationTree,
        messages: &mut impl Iterator<Item = &'a DerivationTree>,
    ) -> Option<DerivationTree> {
        let Some(name) = node.symbol().name() else {
            return Some(node.clone());
        };
        if let Some(packet) = self.reduced.packet_of_rule(name) {
            let message = messages.next()?;
            return Some(
                message
                    .clone()
                    .with_party(packet.sender.clone(), packet.recipient.clone()),
            );
        }
        if let Some(value) = self.reduced.literals.get(name) {
            return Some(DerivationTree::terminal(value.clone()));
        }
        let children = node
            .children()
            .iter()
            .map(|child| self.substitute(child, messages))
            .collect::<Option<Vec<_>>>()?;
        Some(DerivationTree::non_terminal(name, children))
    }
}

/// Packet-level path finding over the reduced grammar's graph.
#[derive(Debug, Clone)]
pub struct PacketNavigator {
    reduced: ReducedGrammar,
    graph: GrammarGraph,
    /// Reference nodes that enter a packet.
    entries: BTreeMap<NodeId, PacketNonTerminal>,
}

impl PacketNavigator {
    pub fn new(reduced: ReducedGrammar) -> Self {
        let graph = GrammarGraph::new(&reduced.grammar);
        let mut entries = BTreeMap::new();
        for id in reduced.grammar.node_ids() {
            if let GrammarNode::NonTerminal { name, .. } = reduced.grammar.node(id) {
                if let Some(packet) = reduced.packet_of_rule(name) {
                    entries.insert(id, packet.clone());
                }
            }
        }
        Self {
            reduced,
            graph,
            entries,
        }
    }

    fn packets_on(&self, path: &[GraphNode]) -> Vec<PacketNonTerminal> {
        path.iter()
            .filter_map(|vertex| match vertex {
                GraphNode::Node(id) => self.entries.get(id).cloned(),
                GraphNode::RuleExit(_) => None,
            })
            .collect()
    }

    /// Cheapest packet sequence leading from right after `from` up to and
    /// including `to`, with its cost in turns.
    pub fn shortest_path(
        &self,
        from: &PacketNonTerminal,
        to: &PacketNonTerminal,
    ) -> Option<(Vec<PacketNonTerminal>, usize)> {
        let start = self.reduced.token_node(from)?;
        let goal = self.reduced.token_node(to)?;
        let (path, cost) = self.graph.shortest_path(start, goal)?;
        Some((self.packets_on(&path), cost))
    }

    /// Packets that can directly follow `packet`.
    pub fn successors(&self, packet: &PacketNonTerminal) -> BTreeSet<PacketNonTerminal> {
        let mut found = BTreeSet::new();
        let Some(start) = self.reduced.token_node(packet) else {
            return found;
        };
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([GraphNode::Node(start)]);
        while let Some(vertex) = queue.pop_front() {
            for next in self.graph.successors(&vertex) {
                if let GraphNode::Node(id) = next {
                    if let Some(entered) = self.entries.get(id) {
                        found.insert(entered.clone());
                        continue;
                    }
                }
                if seen.insert(next.clone()) {
                    queue.push_back(next.clone());
                }
            }
        }
        found
    }
}
