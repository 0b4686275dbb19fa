use crate::grammar::{Grammar, GrammarNode, NodeId};
use crate::symbol::TerminalValue;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};

/// A vertex of the grammar graph: a grammar node, or the point where the
/// expansion of a rule is left.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GraphNode {
    Node(NodeId),
    RuleExit(String),
}

/// Direct-derivability graph over a grammar.
///
/// An edge `a -> b` means `b` can be visited right after `a` in a
/// left-to-right expansion: a concatenation reaches its first child and
/// each child reaches its successor, an alternative reaches its options, a
/// repetition loops back into its body, a non-terminal reference reaches
/// its rule's root. Leaving a rule goes through that rule's exit vertex,
/// which reaches whatever follows any reference to the rule. This makes the
/// follow relation context-insensitive, but keeps the graph finite for
/// recursive grammars.
#[derive(Debug, Clone)]
pub struct GrammarGraph {
    edges: BTreeMap<GraphNode, BTreeSet<GraphNode>>,
    terminals: BTreeMap<NodeId, TerminalValue>,
    senders: BTreeMap<NodeId, String>,
}

struct Builder<'g> {
    grammar: &'g Grammar,
    edges: BTreeMap<GraphNode, BTreeSet<GraphNode>>,
    ends: HashMap<NodeId, BTreeSet<GraphNode>>,
    rules_done: BTreeSet<String>,
}

impl<'g> Builder<'g> {
    fn edge(&mut self, from: GraphNode, to: GraphNode) {
        self.edges.entry(from).or_default().insert(to);
    }

    /// Can be passed without visiting any vertex inside it.
    fn skippable(&self, id: NodeId) -> bool {
        let grammar = self.grammar;
        match grammar.node(id) {
            GrammarNode::Repetition { min, .. } => *min == 0,
            GrammarNode::Alternative(options) => options.iter().any(|o| self.skippable(*o)),
            GrammarNode::Concatenation(children) => children.iter().all(|c| self.skippable(*c)),
            _ => false,
        }
    }

    /// Adds the edges inside `id` and returns the vertices control leaves
    /// it from.
    fn visit(&mut self, id: NodeId) -> BTreeSet<GraphNode> {
        if let Some(ends) = self.ends.get(&id) {
            return ends.clone();
        }
        let grammar = self.grammar;
        let me = GraphNode::Node(id);
        let ends = match grammar.node(id) {
            GrammarNode::Terminal(_) | GrammarNode::CharSet(_) => BTreeSet::from([me]),
            GrammarNode::NonTerminal { name, .. } => {
                let name = name.clone();
                if let Ok(root) = grammar.rule(&name) {
                    self.edge(me, GraphNode::Node(root));
                    self.visit_rule(&name, root);
                }
                BTreeSet::from([GraphNode::RuleExit(name)])
            }
            GrammarNode::Concatenation(children) => {
                let mut frontier = BTreeSet::from([me]);
                for child in children.clone() {
                    let child_ends = self.visit(child);
                    for from in &frontier {
                        self.edge(from.clone(), GraphNode::Node(child));
                    }
                    if self.skippable(child) {
                        frontier.extend(child_ends);
                    } else {
                        frontier = child_ends;
                    }
                }
                frontier
            }
            GrammarNode::Alternative(options) => {
                let mut ends = BTreeSet::new();
                for option in options.clone() {
                    self.edge(me.clone(), GraphNode::Node(option));
                    ends.extend(self.visit(option));
                }
                ends
            }
            GrammarNode::Repetition { node, min, max, .. } => {
                let (node, min, max) = (*node, *min, *max);
                let mut ends = self.visit(node);
                self.edge(me.clone(), GraphNode::Node(node));
                if max.is_none_or(|m| m > 1) {
                    for end in ends.clone() {
                        self.edge(end, GraphNode::Node(node));
                    }
                }
                if min == 0 {
                    ends.insert(me);
                }
                ends
            }
        };
        self.ends.insert(id, ends.clone());
        ends
    }

    fn visit_rule(&mut self, name: &str, root: NodeId) {
        if !self.rules_done.insert(name.to_string()) {
            return;
        }
        for end in self.visit(root) {
            self.edge(end, GraphNode::RuleExit(name.to_string()));
        }
    }
}

/// A* frontier entry: lowest `f`, then fewest steps, then insertion order.
type Entry = Reverse<(usize, usize, usize, usize)>;

impl GrammarGraph {
    pub fn new(grammar: &Grammar) -> Self {
        let mut builder = Builder {
            grammar,
            edges: BTreeMap::new(),
            ends: HashMap::new(),
            rules_done: BTreeSet::new(),
        };
        for (name, root) in grammar.rules() {
            builder.visit_rule(name, root);
        }
        let mut terminals = BTreeMap::new();
        let mut senders = BTreeMap::new();
        for id in grammar.node_ids() {
            match grammar.node(id) {
                GrammarNode::Terminal(value) => {
                    terminals.insert(id, value.clone());
                }
                GrammarNode::NonTerminal {
                    sender: Some(sender),
                    ..
                } => {
                    senders.insert(id, sender.clone());
                }
                _ => {}
            }
        }
        Self {
            edges: builder.edges,
            terminals,
            senders,
        }
    }

    pub fn successors(&self, node: &GraphNode) -> impl Iterator<Item = &GraphNode> {
        self.edges.get(node).into_iter().flatten()
    }

    /// Terminal vertices whose literal equals `value`.
    pub fn terminal_occurrences(&self, value: &TerminalValue) -> Vec<NodeId> {
        self.terminals
            .iter()
            .filter(|(_, v)| *v == value)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Entering a message sent by some party costs one turn.
    fn cost(&self, to: &GraphNode) -> usize {
        match to {
            GraphNode::Node(id) if self.senders.contains_key(id) => 1,
            _ => 0,
        }
    }

    /// Constant, hence trivially admissible, estimate of the remaining cost.
    fn heuristic(&self, _node: &GraphNode) -> usize {
        0
    }

    fn is_goal(&self, node: &GraphNode, goal: &TerminalValue) -> bool {
        match node {
            GraphNode::Node(id) => self.terminals.get(id) == Some(goal),
            GraphNode::RuleExit(_) => false,
        }
    }

    /// A* search from the terminal `from` to any terminal vertex carrying
    /// the same literal as `to`.
    ///
    /// The start vertex itself never satisfies the goal, so searching from
    /// a terminal to an equal literal finds the next occurrence rather than
    /// an empty path.
    ///
    /// # Returns
    /// The vertices from `from` to the goal, both included, and the path's
    /// cost; `None` when no goal is reachable.
    pub fn shortest_path(&self, from: NodeId, to: NodeId) -> Option<(Vec<GraphNode>, usize)> {
        let goal = self.terminals.get(&to)?;
        self.search(GraphNode::Node(from), |node| self.is_goal(node, goal))
    }

    /// A* search from `start` until `is_goal` holds for a vertex other
    /// than `start`. Coming back to `start` through a cycle counts.
    pub fn search(
        &self,
        start: GraphNode,
        is_goal: impl Fn(&GraphNode) -> bool,
    ) -> Option<(Vec<GraphNode>, usize)> {
        let mut vertices: Vec<GraphNode> = vec![start];
        let mut index: HashMap<GraphNode, usize> = HashMap::new();
        let mut best: Vec<usize> = vec![0];
        let mut steps: Vec<usize> = vec![0];
        let mut parent: Vec<Option<usize>> = vec![None];
        let mut heap: BinaryHeap<Entry> = BinaryHeap::new();
        let mut seq = 0;
        heap.push(Reverse((self.heuristic(&vertices[0]), 0, seq, 0)));

        while let Some(Reverse((f, step, _, current))) = heap.pop() {
            if f != best[current] + self.heuristic(&vertices[current]) || step != steps[current] {
                continue;
            }
            if current != 0 && is_goal(&vertices[current]) {
                let mut path = vec![vertices[current].clone()];
                let mut at = current;
                while let Some(prev) = parent[at] {
                    path.push(vertices[prev].clone());
                    at = prev;
                }
                path.reverse();
                return Some((path, best[current]));
            }
            let successors: Vec<GraphNode> = self.successors(&vertices[current]).cloned().collect();
            for next in successors {
                let cost = best[current] + self.cost(&next);
                let next_steps = steps[current] + 1;
                let idx = match index.get(&next) {
                    Some(idx) => {
                        if (cost, next_steps) >= (best[*idx], steps[*idx]) {
                            continue;
                        }
                        *idx
                    }
                    None => {
                        vertices.push(next.clone());
                        best.push(usize::MAX);
                        steps.push(usize::MAX);
                        parent.push(None);
                        index.insert(next.clone(), vertices.len() - 1);
                        vertices.len() - 1
                    }
                };
                best[idx] = cost;
                steps[idx] = next_steps;
                parent[idx] = Some(current);
                seq += 1;
                heap.push(Reverse((cost + self.heuristic(&next), next_steps, seq, idx)));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::GrammarBuilder;
    use crate::grammar::tests::ab_grammar;

    /// `<start> ::= <A><B>; <A> ::= "x"; <B> ::= "y"`
    fn xy_grammar() -> Grammar {
        let mut b = GrammarBuilder::new();
        let a = b.non_terminal("A");
        let bb = b.non_terminal("B");
        let body = b.concat(vec![a, bb]);
        b.rule("start", body);
        let x = b.text("x");
        b.rule("A", x);
        let y = b.text("y");
        b.rule("B", y);
        b.build().expect("xy grammar builds")
    }

    fn terminal(grammar: &Grammar, graph: &GrammarGraph, text: &str) -> NodeId {
        let found = graph.terminal_occurrences(&TerminalValue::Text(text.into()));
        assert_eq!(found.len(), 1, "Expected one {text:?} in {}", grammar.format_as_spec());
        found[0]
    }

    fn non_terminal_hops(grammar: &Grammar, path: &[GraphNode]) -> usize {
        path.iter()
            .filter(|n| matches!(n, GraphNode::Node(id) if matches!(grammar.node(*id), GrammarNode::NonTerminal { .. })))
            .count()
    }

    #[test]
    fn forward_path_crosses_one_symbol() {
        let grammar = xy_grammar();
        let graph = GrammarGraph::new(&grammar);
        let x = terminal(&grammar, &graph, "x");
        let y = terminal(&grammar, &graph, "y");
        let (path, cost) = graph.shortest_path(x, y).expect("x reaches y");
        assert_eq!(path.first(), Some(&GraphNode::Node(x)));
        assert_eq!(path.last(), Some(&GraphNode::Node(y)));
        assert_eq!(non_terminal_hops(&grammar, &path), 1, "Path {:?}", path);
        assert_eq!(cost, 0, "No sender annotations, no turns");
    }

    #[test]
    fn backward_path_does_not_exist() {
        let grammar = xy_grammar();
        let graph = GrammarGraph::new(&grammar);
        let x = terminal(&grammar, &graph, "x");
        let y = terminal(&grammar, &graph, "y");
        assert!(graph.shortest_path(y, x).is_none());
    }

    #[test]
    fn recursion_and_repetition_stay_finite() {
        let grammar = ab_grammar();
        let graph = GrammarGraph::new(&grammar);
        let a = terminal(&grammar, &graph, "a");
        let b = terminal(&grammar, &graph, "b");
        assert!(graph.shortest_path(a, b).is_some(), "a<ab> can be followed by b");
        assert!(graph.shortest_path(b, a).is_none(), "after b only b or the end");
        assert!(graph.shortest_path(a, a).is_some(), "a<ab> recurses into another a");
    }

    #[test]
    fn crossing_into_a_message_costs_a_turn() {
        let mut b = GrammarBuilder::new();
        let hello = b.message("hello", "Client", Some("Server"));
        let reply = b.message("reply", "Server", Some("Client"));
        let pair = b.concat(vec![hello, reply]);
        let many = b.plus(pair);
        b.rule("start", many);
        let hi = b.text("hi");
        b.rule("hello", hi);
        let ok = b.text("ok");
        b.rule("reply", ok);
        let grammar = b.build().expect("grammar builds");
        let graph = GrammarGraph::new(&grammar);
        let hi = terminal(&grammar, &graph, "hi");
        let ok = terminal(&grammar, &graph, "ok");
        let (_, cost) = graph.shortest_path(hi, ok).expect("hi reaches ok");
        assert_eq!(cost, 1);
        let (_, back) = graph.shortest_path(ok, hi).expect("repetition loops back");
        assert_eq!(back, 1);
        let (_, again) = graph.shortest_path(hi, hi).expect("next round");
        assert_eq!(again, 2, "hi -> reply -> next hello");
    }
}
