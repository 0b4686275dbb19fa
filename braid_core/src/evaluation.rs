use crate::constraint::{Constraint, Goal};
use crate::fitness::{FailingTree, Fitness};
use crate::tree::DerivationTree;
use rayon::prelude::*;

/// Aggregate score of one individual against every constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Blended fitness in `[0, 1]`; reaches 1.0 only when every hard
    /// constraint holds and every soft value is at its best seen so far.
    pub fitness: f64,
    /// Mean over hard constraints; a satisfied constraint counts as 1.0.
    pub hard_fitness: f64,
    /// Every hard constraint holds.
    pub success: bool,
    pub failing_trees: Vec<FailingTree>,
    /// Raw mean of each soft constraint, in constraint order. `None` when
    /// the constraint matched nothing in the tree.
    pub soft_values: Vec<Option<f64>>,
}

/// Running range of one soft constraint, used to map raw values to `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct MinMax {
    range: Option<(f64, f64)>,
}

impl MinMax {
    fn observe(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.range = Some(match self.range {
            None => (value, value),
            Some((lo, hi)) => (lo.min(value), hi.max(value)),
        });
    }

    /// Maps a raw value into `[0, 1]`, best at 1. An empty match is always
    /// the worst value, whatever the goal.
    fn scale(&self, value: Option<f64>, goal: Goal) -> f64 {
        let Some(value) = value.filter(|v| v.is_finite()) else {
            return 0.0;
        };
        let scaled = match self.range {
            Some((lo, hi)) if hi > lo => ((value - lo) / (hi - lo)).clamp(0.0, 1.0),
            _ => 0.5,
        };
        match goal {
            Goal::Maximize => scaled,
            Goal::Minimize => 1.0 - scaled,
        }
    }
}

/// Scores trees against hard and soft constraints.
///
/// Raw evaluation of each tree is independent and runs on the rayon pool;
/// soft-value normalization is then applied sequentially in population
/// order, so results do not depend on thread scheduling.
pub struct Evaluator {
    hard: Vec<Box<dyn Constraint>>,
    soft: Vec<Box<dyn Constraint>>,
    scalers: Vec<MinMax>,
}

impl Evaluator {
    pub fn new(constraints: Vec<Box<dyn Constraint>>) -> Self {
        let (soft, hard): (Vec<_>, Vec<_>) = constraints.into_iter().partition(|c| c.is_soft());
        let scalers = vec![MinMax::default(); soft.len()];
        Self {
            hard,
            soft,
            scalers,
        }
    }

    pub fn hard_constraints(&self) -> &[Box<dyn Constraint>] {
        &self.hard
    }

    pub fn soft_constraints(&self) -> &[Box<dyn Constraint>] {
        &self.soft
    }

    /// Every constraint, hard first, by its textual form.
    pub fn describe(&self) -> Vec<String> {
        self.hard
            .iter()
            .chain(&self.soft)
            .map(|c| c.describe())
            .collect()
    }

    /// Evaluates a whole population. The output is in input order.
    pub fn evaluate_population(&mut self, population: &[DerivationTree]) -> Vec<Evaluation> {
        let raw: Vec<RawScore> = population
            .par_iter()
            .map(|tree| self.raw_score(tree))
            .collect();
        for score in &raw {
            for (scaler, value) in self.scalers.iter_mut().zip(&score.soft_values) {
                if let Some(value) = value {
                    scaler.observe(*value);
                }
            }
        }
        raw.into_iter().map(|score| self.blend(score)).collect()
    }

    /// Evaluates a single tree against the current soft-value ranges.
    pub fn evaluate(&mut self, tree: &DerivationTree) -> Evaluation {
        let mut out = self.evaluate_population(std::slice::from_ref(tree));
        out.pop().unwrap_or_else(|| Evaluation {
            fitness: 0.0,
            hard_fitness: 0.0,
            success: false,
            failing_trees: Vec::new(),
            soft_values: Vec::new(),
        })
    }

    /// Mean normalized soft score, or 0 without soft constraints. Used to
    /// rank solutions once the ranges have settled.
    pub fn soft_score(&self, soft_values: &[Option<f64>]) -> f64 {
        if self.soft.is_empty() {
            return 0.0;
        }
        let total: f64 = self
            .soft
            .iter()
            .zip(&self.scalers)
            .zip(soft_values)
            .map(|((constraint, scaler), value)| {
                scaler.scale(*value, constraint.goal().unwrap_or(Goal::Maximize))
            })
            .sum();
        total / self.soft.len() as f64
    }

    fn raw_score(&self, tree: &DerivationTree) -> RawScore {
        let mut hard_sum = 0.0;
        let mut success = true;
        let mut failing_trees = Vec::new();
        for constraint in &self.hard {
            let fitness = constraint.evaluate(tree);
            if fitness.success() {
                hard_sum += 1.0;
            } else {
                success = false;
                hard_sum += fitness.fitness();
                failing_trees.extend(fitness.failing_trees().iter().cloned());
            }
        }
        let hard_fitness = if self.hard.is_empty() {
            1.0
        } else {
            hard_sum / self.hard.len() as f64
        };
        let soft_values = self
            .soft
            .iter()
            .map(|c| match c.evaluate(tree) {
                Fitness::Value(v) => v.mean(),
                other => Some(other.fitness()),
            })
            .collect();
        RawScore {
            hard_fitness,
            success,
            failing_trees,
            soft_values,
        }
    }

    /// Soft constraints only contribute once every hard constraint holds.
    fn blend(&self, score: RawScore) -> Evaluation {
        let n_hard = self.hard.len() as f64;
        let n_soft = self.soft.len() as f64;
        let fitness = if n_soft == 0.0 {
            score.hard_fitness
        } else if score.success {
            let soft = self.soft_score(&score.soft_values) * n_soft;
            (score.hard_fitness * n_hard + soft) / (n_hard + n_soft)
        } else {
            score.hard_fitness * n_hard / (n_hard + n_soft)
        };
        Evaluation {
            fitness,
            hard_fitness: score.hard_fitness,
            success: score.success,
            failing_trees: score.failing_trees,
            soft_values: score.soft_values,
        }
    }
}

struct RawScore {
    hard_fitness: f64,
    success: bool,
    failing_trees: Vec<FailingTree>,
    soft_values: Vec<Option<f64>>,
}
