use crate::fitness::{ConstraintFitness, FailingTree, Fitness, Suggestion, ValueFitness};
use crate::grammar::{Grammar, GrammarError};
use crate::symbol::{Symbol, strip_brackets};
use crate::tree::{DerivationTree, TreePath};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Upper bound on the occurrence combinations checked for one clause.
const MAX_BINDINGS: usize = 10_000;

/// A declarative requirement on a derivation tree.
///
/// Evaluation is pure: it never touches the tree and may run concurrently for
/// many individuals.
pub trait Constraint: Send + Sync {
    /// Scores `tree`, returning a fresh fitness value.
    fn evaluate(&self, tree: &DerivationTree) -> Fitness;

    /// Soft constraints are optimized, not required.
    fn is_soft(&self) -> bool {
        false
    }

    /// Non-terminal names (without brackets) the constraint ranges over.
    fn bound_symbols(&self) -> Vec<String>;

    fn describe(&self) -> String;

    /// Optimization direction for soft constraints.
    fn goal(&self) -> Option<Goal> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
}

impl Comparison {
    pub fn holds(self, ord: Ordering) -> bool {
        match self {
            Comparison::Eq => ord == Ordering::Equal,
            Comparison::Ne => ord != Ordering::Equal,
            Comparison::Lt => ord == Ordering::Less,
            Comparison::Le => ord != Ordering::Greater,
            Comparison::Gt => ord == Ordering::Greater,
            Comparison::Ge => ord != Ordering::Less,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Comparison::Eq => "==",
            Comparison::Ne => "!=",
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
        };
        f.write_str(op)
    }
}

/// A scalar produced by an operand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(x) => Some(*x),
            Value::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Orders two values. Text compares with text, numbers with numbers;
    /// anything else is incomparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Text(_), _) | (_, Value::Text(_)) => None,
            (a, b) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

/// The node an operand reads from: the whole tree, or each occurrence of a
/// non-terminal. Written as `"root"` or `"<name>"`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Selector {
    #[default]
    Root,
    Symbol(String),
}

impl Selector {
    pub fn symbol(name: &str) -> Self {
        Selector::Symbol(strip_brackets(name).to_string())
    }

    fn bound_name(&self) -> Option<&str> {
        match self {
            Selector::Root => None,
            Selector::Symbol(name) => Some(name),
        }
    }
}

impl TryFrom<String> for Selector {
    type Error = GrammarError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let s = value.trim();
        if s == "root" {
            Ok(Selector::Root)
        } else if s.starts_with('<') && s.ends_with('>') && s.len() > 2 {
            Ok(Selector::symbol(s))
        } else {
            Err(GrammarError::InvalidSelector(s.to_string()))
        }
    }
}

impl From<Selector> for String {
    fn from(selector: Selector) -> Self {
        selector.to_string()
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Root => f.write_str("root"),
            Selector::Symbol(name) => write!(f, "<{name}>"),
        }
    }
}

/// One side of a comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operand {
    Literal(Value),
    /// Rendered text of the node.
    Text(Selector),
    Int(Selector),
    Float(Selector),
    /// Rendered length in bytes.
    Len(Selector),
    /// Occurrences of `symbol` inside the node, the node itself included.
    Count {
        #[serde(default)]
        within: Selector,
        symbol: String,
    },
}

impl Operand {
    pub fn literal(value: impl Into<Value>) -> Self {
        Operand::Literal(value.into())
    }

    pub fn int(symbol: &str) -> Self {
        Operand::Int(Selector::symbol(symbol))
    }

    pub fn text(symbol: &str) -> Self {
        Operand::Text(Selector::symbol(symbol))
    }

    /// Occurrences of `symbol` in the whole tree.
    pub fn count(symbol: &str) -> Self {
        Operand::Count {
            within: Selector::Root,
            symbol: strip_brackets(symbol).to_string(),
        }
    }

    fn selector(&self) -> Option<&Selector> {
        match self {
            Operand::Literal(_) => None,
            Operand::Text(s) | Operand::Int(s) | Operand::Float(s) | Operand::Len(s) => Some(s),
            Operand::Count { within, .. } => Some(within),
        }
    }

    fn bound_name(&self) -> Option<&str> {
        self.selector().and_then(Selector::bound_name)
    }

    fn referenced_symbols(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.bound_name().into_iter().collect();
        if let Operand::Count { symbol, .. } = self {
            names.push(strip_brackets(symbol));
        }
        names
    }

    fn eval(&self, tree: &DerivationTree, binding: &Binding) -> Option<Value> {
        if let Operand::Literal(value) = self {
            return Some(value.clone());
        }
        let node = match self.selector()? {
            Selector::Root => tree,
            Selector::Symbol(name) => tree.get(binding.get(name)?)?,
        };
        match self {
            Operand::Literal(_) => None,
            Operand::Text(_) => Some(Value::Text(node.to_string())),
            Operand::Int(_) => node.to_int().map(Value::Int),
            Operand::Float(_) => node.to_float().map(Value::Float),
            Operand::Len(_) => Some(Value::Int(node.to_bytes().len() as i64)),
            Operand::Count { symbol, .. } => {
                Some(Value::Int(node.count(&Symbol::non_terminal(symbol)) as i64))
            }
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Literal(Value::Text(s)) => write!(f, "{s:?}"),
            Operand::Literal(value) => write!(f, "{value}"),
            Operand::Text(s) => write!(f, "str({s})"),
            Operand::Int(s) => write!(f, "int({s})"),
            Operand::Float(s) => write!(f, "float({s})"),
            Operand::Len(s) => write!(f, "len({s})"),
            Operand::Count {
                within: Selector::Root,
                symbol,
            } => write!(f, "count(<{}>)", strip_brackets(symbol)),
            Operand::Count { within, symbol } => {
                write!(f, "count({within}, <{}>)", strip_brackets(symbol))
            }
        }
    }
}

/// Occurrence chosen for each bound non-terminal.
type Binding = BTreeMap<String, TreePath>;

/// Occurrence combinations of a clause. Past `MAX_BINDINGS` the rest are
/// only counted in `skipped`, never checked.
struct Bindings {
    combos: Vec<Binding>,
    skipped: usize,
}

/// Every combination of occurrences of `names`. An absent symbol yields no
/// combination at all.
fn bindings(tree: &DerivationTree, names: &BTreeSet<&str>) -> Bindings {
    let mut combos = vec![Binding::new()];
    let mut possible: usize = 1;
    for name in names {
        let occurrences = tree.find_all(&Symbol::non_terminal(name));
        possible = possible.saturating_mul(occurrences.len());
        let mut next = Vec::with_capacity((combos.len() * occurrences.len()).min(MAX_BINDINGS));
        'outer: for combo in &combos {
            for path in &occurrences {
                if next.len() == MAX_BINDINGS {
                    break 'outer;
                }
                let mut extended = combo.clone();
                extended.insert(name.to_string(), path.clone());
                next.push(extended);
            }
        }
        combos = next;
    }
    let skipped = possible.saturating_sub(combos.len());
    if skipped > 0 {
        debug!(checked = combos.len(), skipped, ?names, "Binding combinations truncated");
    }
    Bindings { combos, skipped }
}

/// `left op right`, checked for every combination of bound occurrences.
#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonConstraint {
    pub left: Operand,
    pub op: Comparison,
    pub right: Operand,
}

impl ComparisonConstraint {
    pub fn new(left: Operand, op: Comparison, right: Operand) -> Self {
        Self { left, op, right }
    }

    fn holds(&self, tree: &DerivationTree, binding: &Binding) -> bool {
        let (Some(left), Some(right)) = (
            self.left.eval(tree, binding),
            self.right.eval(tree, binding),
        ) else {
            return false;
        };
        left.compare(&right).is_some_and(|ord| self.op.holds(ord))
    }

    /// For `node == literal`, the literal is a direct fix for the node.
    fn suggestion_for(&self, name: &str) -> Vec<Suggestion> {
        if self.op != Comparison::Eq {
            return Vec::new();
        }
        let fix = |side: &Operand, other: &Operand| match (side, other) {
            (Operand::Text(_) | Operand::Int(_) | Operand::Float(_), Operand::Literal(value))
                if side.bound_name() == Some(name) =>
            {
                Some(Suggestion {
                    op: Comparison::Eq,
                    value: value.clone(),
                })
            }
            _ => None,
        };
        fix(&self.left, &self.right)
            .or_else(|| fix(&self.right, &self.left))
            .into_iter()
            .collect()
    }

    /// Nodes to blame when an unbound clause (e.g. a count over the whole
    /// tree) fails: the counted occurrences, or the root.
    fn unbound_culprits(&self, tree: &DerivationTree) -> Vec<(TreePath, Symbol)> {
        let mut culprits = Vec::new();
        for operand in [&self.left, &self.right] {
            if let Operand::Count { symbol, .. } = operand {
                let symbol = Symbol::non_terminal(symbol);
                culprits.extend(tree.find_all(&symbol).into_iter().map(|p| (p, symbol.clone())));
            }
        }
        if culprits.is_empty() {
            culprits.push((Vec::new(), tree.symbol().clone()));
        }
        culprits
    }
}

impl Constraint for ComparisonConstraint {
    fn evaluate(&self, tree: &DerivationTree) -> Fitness {
        let names: BTreeSet<&str> = [self.left.bound_name(), self.right.bound_name()]
            .into_iter()
            .flatten()
            .collect();
        let clause = self.describe();
        let Bindings { combos, skipped } = bindings(tree, &names);
        let mut solved = 0;
        let mut failing = Vec::new();
        let mut blamed = BTreeSet::new();
        for binding in &combos {
            if self.holds(tree, binding) {
                solved += 1;
                continue;
            }
            if binding.is_empty() {
                for (path, symbol) in self.unbound_culprits(tree) {
                    if blamed.insert(path.clone()) {
                        failing.push(FailingTree {
                            path,
                            symbol,
                            clause: clause.clone(),
                            suggestions: Vec::new(),
                        });
                    }
                }
            }
            for (name, path) in binding {
                if blamed.insert(path.clone()) {
                    failing.push(FailingTree {
                        path: path.clone(),
                        symbol: Symbol::non_terminal(name),
                        clause: clause.clone(),
                        suggestions: self.suggestion_for(name),
                    });
                }
            }
        }
        // Unchecked combinations count as unsolved.
        Fitness::Constraint(ConstraintFitness::new(
            solved,
            combos.len().saturating_add(skipped),
            failing,
        ))
    }

    fn bound_symbols(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .left
            .referenced_symbols()
            .into_iter()
            .chain(self.right.referenced_symbols())
            .map(str::to_string)
            .collect();
        names.dedup();
        names
    }

    fn describe(&self) -> String {
        format!("{} {} {}", self.left, self.op, self.right)
    }
}

type PredicateFn = dyn Fn(&DerivationTree) -> bool + Send + Sync;

/// A closure checked against each occurrence of a non-terminal, or against
/// the whole tree when unbound.
#[derive(Clone)]
pub struct PredicateConstraint {
    name: String,
    symbol: Option<String>,
    predicate: Arc<PredicateFn>,
}

impl PredicateConstraint {
    pub fn new<F>(name: &str, predicate: F) -> Self
    where
        F: Fn(&DerivationTree) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            symbol: None,
            predicate: Arc::new(predicate),
        }
    }

    pub fn bound_to(mut self, symbol: &str) -> Self {
        self.symbol = Some(strip_brackets(symbol).to_string());
        self
    }
}

impl Constraint for PredicateConstraint {
    fn evaluate(&self, tree: &DerivationTree) -> Fitness {
        let targets = match &self.symbol {
            Some(name) => tree.find_all(&Symbol::non_terminal(name)),
            None => vec![Vec::new()],
        };
        let mut solved = 0;
        let mut failing = Vec::new();
        for path in &targets {
            let Some(node) = tree.get(path) else {
                continue;
            };
            if (self.predicate)(node) {
                solved += 1;
            } else {
                failing.push(FailingTree {
                    path: path.clone(),
                    symbol: node.symbol().clone(),
                    clause: self.name.clone(),
                    suggestions: Vec::new(),
                });
            }
        }
        Fitness::Constraint(ConstraintFitness::new(solved, targets.len(), failing))
    }

    fn bound_symbols(&self) -> Vec<String> {
        self.symbol.iter().cloned().collect()
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

fn hard_parts(constraints: &[Box<dyn Constraint>], tree: &DerivationTree) -> Vec<ConstraintFitness> {
    constraints
        .iter()
        .map(|c| match c.evaluate(tree) {
            Fitness::Constraint(fitness) => fitness,
            Fitness::Value(value) => ConstraintFitness::new(1, 1, value.failing_trees),
        })
        .collect()
}

/// Holds when every member holds. With more than one member, the conjunction
/// itself counts as one extra clause.
pub struct AllOf(pub Vec<Box<dyn Constraint>>);

impl Constraint for AllOf {
    fn evaluate(&self, tree: &DerivationTree) -> Fitness {
        let parts = hard_parts(&self.0, tree);
        let all = parts.iter().all(|p| p.success);
        let mut solved: usize = parts.iter().map(|p| p.solved).sum();
        let mut total: usize = parts.iter().map(|p| p.total).sum();
        if parts.len() > 1 {
            total += 1;
            solved += usize::from(all);
        }
        let failing = parts.into_iter().flat_map(|p| p.failing_trees).collect();
        let mut fitness = ConstraintFitness::new(solved, total, failing);
        fitness.success = all;
        Fitness::Constraint(fitness)
    }

    fn bound_symbols(&self) -> Vec<String> {
        collect_symbols(&self.0)
    }

    fn describe(&self) -> String {
        join_described(&self.0, " and ")
    }
}

/// Holds when any member holds; a satisfied disjunction is fully solved.
pub struct AnyOf(pub Vec<Box<dyn Constraint>>);

impl Constraint for AnyOf {
    fn evaluate(&self, tree: &DerivationTree) -> Fitness {
        let parts = hard_parts(&self.0, tree);
        let any = parts.iter().any(|p| p.success);
        let mut total: usize = parts.iter().map(|p| p.total).sum();
        if parts.len() > 1 {
            total += 1;
        }
        if any {
            let mut fitness = ConstraintFitness::new(total, total, Vec::new());
            fitness.success = true;
            return Fitness::Constraint(fitness);
        }
        let solved = parts.iter().map(|p| p.solved).sum();
        let failing = parts.into_iter().flat_map(|p| p.failing_trees).collect();
        let mut fitness = ConstraintFitness::new(solved, total, failing);
        fitness.success = false;
        Fitness::Constraint(fitness)
    }

    fn bound_symbols(&self) -> Vec<String> {
        collect_symbols(&self.0)
    }

    fn describe(&self) -> String {
        join_described(&self.0, " or ")
    }
}

fn collect_symbols(constraints: &[Box<dyn Constraint>]) -> Vec<String> {
    let set: BTreeSet<String> = constraints.iter().flat_map(|c| c.bound_symbols()).collect();
    set.into_iter().collect()
}

fn join_described(constraints: &[Box<dyn Constraint>], sep: &str) -> String {
    let parts: Vec<String> = constraints
        .iter()
        .map(|c| format!("({})", c.describe()))
        .collect();
    parts.join(sep)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Goal {
    Maximize,
    Minimize,
}

/// A quantity to push up or down. Collects one value per combination of
/// bound occurrences; values that are not numeric are skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct SoftValue {
    pub goal: Goal,
    pub operand: Operand,
}

impl SoftValue {
    pub fn maximize(operand: Operand) -> Self {
        Self {
            goal: Goal::Maximize,
            operand,
        }
    }

    pub fn minimize(operand: Operand) -> Self {
        Self {
            goal: Goal::Minimize,
            operand,
        }
    }
}

impl Constraint for SoftValue {
    fn evaluate(&self, tree: &DerivationTree) -> Fitness {
        let names: BTreeSet<&str> = self.operand.bound_name().into_iter().collect();
        let values = bindings(tree, &names)
            .combos
            .iter()
            .filter_map(|binding| self.operand.eval(tree, binding))
            .filter_map(|value| value.as_f64())
            .collect();
        Fitness::Value(ValueFitness::new(values))
    }

    fn is_soft(&self) -> bool {
        true
    }

    fn bound_symbols(&self) -> Vec<String> {
        self.operand
            .referenced_symbols()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    fn describe(&self) -> String {
        match self.goal {
            Goal::Maximize => format!("maximizing {}", self.operand),
            Goal::Minimize => format!("minimizing {}", self.operand),
        }
    }

    fn goal(&self) -> Option<Goal> {
        Some(self.goal)
    }
}

/// Serialized constraint, as loaded from a JSON constraint file.
///
/// ```json
/// [{ "compare": { "left": { "count": { "symbol": "<ab>" } }, "op": "==", "right": { "literal": 4 } } }]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConstraintSpec {
    Compare {
        left: Operand,
        op: Comparison,
        right: Operand,
    },
    AllOf(Vec<ConstraintSpec>),
    AnyOf(Vec<ConstraintSpec>),
    Maximize(Operand),
    Minimize(Operand),
}

impl ConstraintSpec {
    /// Builds the constraint, checking that every referenced non-terminal has
    /// a rule in `grammar`.
    pub fn build(&self, grammar: &Grammar) -> Result<Box<dyn Constraint>, GrammarError> {
        let check = |operand: &Operand| -> Result<(), GrammarError> {
            for name in operand.referenced_symbols() {
                if !grammar.has_rule(name) {
                    return Err(GrammarError::UndefinedSymbol(name.to_string()));
                }
            }
            Ok(())
        };
        Ok(match self {
            ConstraintSpec::Compare { left, op, right } => {
                check(left)?;
                check(right)?;
                Box::new(ComparisonConstraint::new(left.clone(), *op, right.clone()))
            }
            ConstraintSpec::AllOf(members) => Box::new(AllOf(
                members
                    .iter()
                    .map(|m| m.build(grammar))
                    .collect::<Result<_, _>>()?,
            )),
            ConstraintSpec::AnyOf(members) => Box::new(AnyOf(
                members
                    .iter()
                    .map(|m| m.build(grammar))
                    .collect::<Result<_, _>>()?,
            )),
            ConstraintSpec::Maximize(operand) => {
                check(operand)?;
                Box::new(SoftValue::maximize(operand.clone()))
            }
            ConstraintSpec::Minimize(operand) => {
                check(operand)?;
                Box::new(SoftValue::minimize(operand.clone()))
            }
        })
    }
}
