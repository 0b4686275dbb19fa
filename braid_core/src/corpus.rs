use crate::evaluation::{Evaluation, Evaluator};
use crate::tree::DerivationTree;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CorpusError {
    #[error("Corpus I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Corpus serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A tree that satisfied every hard constraint.
#[derive(Debug, Clone)]
pub struct Solution {
    pub tree: DerivationTree,
    /// Raw soft-constraint means at the time it was found.
    pub soft_values: Vec<Option<f64>>,
    /// Generation in which it was found.
    pub generation: usize,
}

/// Distinct solutions in discovery order.
#[derive(Debug, Default, Clone)]
pub struct SolutionCorpus {
    entries: Vec<Solution>,
    known_hashes: HashSet<[u8; 16]>,
}

impl SolutionCorpus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `tree` if `evaluation` succeeded and the tree is new.
    pub fn add(&mut self, tree: &DerivationTree, evaluation: &Evaluation, generation: usize) -> bool {
        if !evaluation.success || !self.known_hashes.insert(tree.structural_hash()) {
            return false;
        }
        self.entries.push(Solution {
            tree: tree.clone(),
            soft_values: evaluation.soft_values.clone(),
            generation,
        });
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Solution> {
        self.entries.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Solution> {
        self.entries.iter()
    }

    /// Solutions by soft score, best first, truncated to `limit`. Ties
    /// keep discovery order.
    pub fn ranked(&self, evaluator: &Evaluator, limit: Option<usize>) -> Vec<DerivationTree> {
        let mut scored: Vec<(f64, &Solution)> = self
            .entries
            .iter()
            .map(|s| (evaluator.soft_score(&s.soft_values), s))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored
            .into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(|(_, s)| s.tree.clone())
            .collect()
    }

    /// Writes each tree's bytes to `solution_<n>.bin` and its derivation to
    /// `solution_<n>.json` inside `dir`.
    pub fn save_to_dir(trees: &[DerivationTree], dir: &Path) -> Result<(), CorpusError> {
        fs::create_dir_all(dir)?;
        for (idx, tree) in trees.iter().enumerate() {
            fs::write(dir.join(format!("solution_{idx:04}.bin")), tree.to_bytes())?;
            let json = serde_json::to_vec_pretty(tree)?;
            fs::write(dir.join(format!("solution_{idx:04}.json")), json)?;
        }
        Ok(())
    }
}
