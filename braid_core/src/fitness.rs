use crate::constraint::{Comparison, Value};
use crate::symbol::Symbol;
use crate::tree::TreePath;

/// A proposed fix for a failing node: making the node compare `op` to `value`
/// would satisfy the clause.
#[derive(Debug, Clone, PartialEq)]
pub struct Suggestion {
    pub op: Comparison,
    pub value: Value,
}

/// A node implicated in a clause that did not hold.
///
/// This is a coordinate into the evaluated tree (a path from the root), not
/// an owning reference; it is resolved again against the tree when used.
#[derive(Debug, Clone, PartialEq)]
pub struct FailingTree {
    pub path: TreePath,
    pub symbol: Symbol,
    pub clause: String,
    pub suggestions: Vec<Suggestion>,
}

/// Mean of the values collected for a soft constraint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueFitness {
    pub values: Vec<f64>,
    pub failing_trees: Vec<FailingTree>,
}

impl ValueFitness {
    pub fn new(values: Vec<f64>) -> Self {
        Self {
            values,
            failing_trees: Vec::new(),
        }
    }

    /// Arithmetic mean; an empty match set scores 0.
    pub fn fitness(&self) -> f64 {
        self.mean().unwrap_or(0.0)
    }

    /// Arithmetic mean, or `None` when nothing matched.
    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            None
        } else {
            Some(self.values.iter().sum::<f64>() / self.values.len() as f64)
        }
    }
}

/// Ratio of satisfied clause instances for a hard constraint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstraintFitness {
    pub solved: usize,
    pub total: usize,
    pub success: bool,
    pub failing_trees: Vec<FailingTree>,
}

impl ConstraintFitness {
    pub fn new(solved: usize, total: usize, failing_trees: Vec<FailingTree>) -> Self {
        Self {
            solved,
            total,
            success: solved == total,
            failing_trees,
        }
    }

    /// `solved / total`, or 0 when nothing was checked.
    pub fn fitness(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.solved as f64 / self.total as f64
        }
    }
}

/// Result of evaluating one constraint against one tree. Always produced
/// fresh; evaluations of different individuals never share an accumulator.
#[derive(Debug, Clone, PartialEq)]
pub enum Fitness {
    Value(ValueFitness),
    Constraint(ConstraintFitness),
}

impl Fitness {
    pub fn fitness(&self) -> f64 {
        match self {
            Fitness::Value(v) => v.fitness(),
            Fitness::Constraint(c) => c.fitness(),
        }
    }

    /// Soft values always count as satisfied.
    pub fn success(&self) -> bool {
        match self {
            Fitness::Value(_) => true,
            Fitness::Constraint(c) => c.success,
        }
    }

    pub fn failing_trees(&self) -> &[FailingTree] {
        match self {
            Fitness::Value(v) => &v.failing_trees,
            Fitness::Constraint(c) => &c.failing_trees,
        }
    }
}
