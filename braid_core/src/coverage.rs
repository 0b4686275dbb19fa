use crate::grammar::{Grammar, GrammarNode};
use crate::tree::DerivationTree;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

/// What counts toward the coverage signal.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CoverageGoal {
    /// Message types seen, i.e. protocol state transitions.
    #[default]
    States,
    /// Plus the structure of messages this process sends.
    StatesInputs,
    /// Plus the structure of messages received from remote parties.
    StatesInputsOutputs,
}

/// A numeric coverage signal, either computed from generated trees or
/// supplied by an external analysis.
pub trait CoverageSource: Send {
    /// Records a finished exchange or generated input.
    fn observe(&mut self, tree: &DerivationTree);

    /// Overall covered fraction in `[0, 1]`.
    fn coverage(&self) -> f64;

    /// Covered fraction per message type name.
    fn coverage_by_type(&self) -> BTreeMap<String, f64>;
}

/// Tracks which non-terminals have been produced inside each message type.
pub struct GrammarCoverage {
    goal: CoverageGoal,
    local_parties: BTreeSet<String>,
    /// Message name to the non-terminals reachable from it.
    universe: BTreeMap<String, BTreeSet<String>>,
    /// Message name to the non-terminals seen under it, when the goal counts
    /// that message's structure.
    covered: BTreeMap<String, BTreeSet<String>>,
    seen_messages: BTreeSet<String>,
    /// Message name to its sender.
    senders: BTreeMap<String, String>,
}

impl GrammarCoverage {
    /// # Arguments
    ///
    /// * `grammar` - A multi-party grammar with sender-annotated messages.
    /// * `goal` - Which message parts count toward coverage.
    /// * `local_parties` - Parties this process plays; their messages are
    ///   inputs to the system under test, everything else is output.
    pub fn new(grammar: &Grammar, goal: CoverageGoal, local_parties: &[String]) -> Self {
        let mut universe = BTreeMap::new();
        let mut senders = BTreeMap::new();
        for id in grammar.node_ids() {
            if let GrammarNode::NonTerminal {
                name,
                sender: Some(sender),
                ..
            } = grammar.node(id)
            {
                senders.insert(name.clone(), sender.clone());
                let reachable = grammar.reachable_symbols(name).unwrap_or_default();
                universe.insert(name.clone(), reachable);
            }
        }
        Self {
            goal,
            local_parties: local_parties.iter().cloned().collect(),
            universe,
            covered: BTreeMap::new(),
            seen_messages: BTreeSet::new(),
            senders,
        }
    }

    pub fn goal(&self) -> CoverageGoal {
        self.goal
    }

    fn counts_structure(&self, message: &str) -> bool {
        let is_input = self
            .senders
            .get(message)
            .is_some_and(|s| self.local_parties.is_empty() || self.local_parties.contains(s));
        match self.goal {
            CoverageGoal::States => false,
            CoverageGoal::StatesInputs => is_input,
            CoverageGoal::StatesInputsOutputs => true,
        }
    }

    /// Coverable items of one message type under the current goal.
    fn items(&self, message: &str) -> usize {
        let structure = if self.counts_structure(message) {
            self.universe.get(message).map_or(0, BTreeSet::len)
        } else {
            0
        };
        1 + structure
    }

    fn covered_items(&self, message: &str) -> usize {
        let state = usize::from(self.seen_messages.contains(message));
        let structure = if self.counts_structure(message) {
            self.covered.get(message).map_or(0, BTreeSet::len)
        } else {
            0
        };
        state + structure
    }
}

impl CoverageSource for GrammarCoverage {
    fn observe(&mut self, tree: &DerivationTree) {
        for msg in tree.protocol_msgs() {
            let Some(name) = msg.symbol.name().map(str::to_string) else {
                continue;
            };
            let Some(node) = tree.get(&msg.path) else {
                continue;
            };
            self.seen_messages.insert(name.clone());
            let reachable = self.universe.get(&name).cloned().unwrap_or_default();
            let covered = self.covered.entry(name).or_default();
            node.walk(&mut |path, sub| {
                if path.is_empty() {
                    return;
                }
                if let Some(inner) = sub.symbol().name() {
                    if reachable.contains(inner) {
                        covered.insert(inner.to_string());
                    }
                }
            });
        }
    }

    fn coverage(&self) -> f64 {
        let (covered, total) = self.universe.keys().fold((0, 0), |(c, t), name| {
            (c + self.covered_items(name), t + self.items(name))
        });
        if total == 0 {
            0.0
        } else {
            covered as f64 / total as f64
        }
    }

    fn coverage_by_type(&self) -> BTreeMap<String, f64> {
        self.universe
            .keys()
            .map(|name| {
                let fraction = self.covered_items(name) as f64 / self.items(name) as f64;
                (name.clone(), fraction)
            })
            .collect()
    }
}

/// Coverage samples over a run, at most one per interval.
#[derive(Debug, Clone)]
pub struct CoverageLog {
    started: Instant,
    interval: Duration,
    entries: Vec<(Duration, f64)>,
}

impl CoverageLog {
    pub fn new(interval: Duration) -> Self {
        Self::starting_at(Instant::now(), interval)
    }

    pub fn starting_at(started: Instant, interval: Duration) -> Self {
        Self {
            started,
            interval,
            entries: Vec::new(),
        }
    }

    /// Appends `(elapsed, coverage)` if an interval has passed since the
    /// last entry. Returns whether a sample was taken.
    pub fn sample(&mut self, now: Instant, coverage: f64) -> bool {
        let elapsed = now.saturating_duration_since(self.started);
        let due = match self.entries.last() {
            None => true,
            Some((last, _)) => elapsed.saturating_sub(*last) >= self.interval,
        };
        if due {
            self.entries.push((elapsed, coverage));
        }
        due
    }

    pub fn entries(&self) -> &[(Duration, f64)] {
        &self.entries
    }
}
