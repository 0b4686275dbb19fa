use rand::Rng;
use rand_core::RngCore;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors that can occur while picking among candidates.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
    /// There was nothing to choose from.
    #[error("No candidates to schedule")]
    NoCandidates,
    /// Every candidate has zero weight, so the weights cannot be normalized.
    #[error("All {0} candidate weights are zero")]
    DegenerateWeights(usize),
}

/// A `Scheduler` decides which of several eligible candidates (message
/// types, in I/O mode) is produced next.
///
/// Schedulers can range from uniform choice to coverage-guided weighting;
/// they learn from what was chosen and the coverage it yielded.
pub trait Scheduler<K>: Send {
    /// Selects the index of the next candidate.
    ///
    /// # Arguments
    /// * `candidates`: The eligible candidates, in a stable order.
    /// * `rng`: The run's random source.
    ///
    /// # Returns
    /// The index into `candidates`, or `ScheduleError::NoCandidates` if the
    /// slice is empty.
    fn next(&mut self, candidates: &[K], rng: &mut dyn RngCore) -> Result<usize, ScheduleError>;

    /// Reports that `chosen` was produced, together with the coverage per
    /// candidate type measured afterwards.
    fn report_feedback(&mut self, chosen: &K, coverage_by_type: &BTreeMap<K, f64>);
}

/// Picks uniformly at random and ignores feedback.
#[derive(Default, Debug)]
pub struct RandomScheduler;

impl RandomScheduler {
    pub fn new() -> Self {
        RandomScheduler
    }
}

impl<K> Scheduler<K> for RandomScheduler {
    fn next(&mut self, candidates: &[K], rng: &mut dyn RngCore) -> Result<usize, ScheduleError> {
        uniform_index(candidates.len(), rng)
    }

    fn report_feedback(&mut self, _chosen: &K, _coverage_by_type: &BTreeMap<K, f64>) {}
}

/// Uniform choice in `0..len`; the fallback for degenerate weights too.
pub(crate) fn uniform_index(len: usize, rng: &mut dyn RngCore) -> Result<usize, ScheduleError> {
    if len == 0 {
        return Err(ScheduleError::NoCandidates);
    }
    Ok(rng.random_range(0..len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use std::collections::HashSet;

    #[test]
    fn random_scheduler_with_no_candidates_errors() {
        let mut scheduler = RandomScheduler::new();
        let mut rng = ChaCha8Rng::from_seed([0; 32]);
        let candidates: [&str; 0] = [];
        match scheduler.next(&candidates, &mut rng) {
            Err(ScheduleError::NoCandidates) => {}
            other => panic!("Expected ScheduleError::NoCandidates, got {:?}", other),
        }
    }

    #[test]
    fn random_scheduler_reaches_every_candidate() {
        let mut scheduler = RandomScheduler::new();
        let mut rng = ChaCha8Rng::from_seed([1; 32]);
        let candidates = ["hello", "data", "bye"];
        let mut selected = HashSet::new();
        for i in 0..60 {
            let idx = scheduler
                .next(&candidates, &mut rng)
                .unwrap_or_else(|e| panic!("next() failed on iteration {}: {:?}", i, e));
            assert!(idx < candidates.len(), "Index {} out of bounds", idx);
            selected.insert(idx);
        }
        assert_eq!(
            selected.len(),
            candidates.len(),
            "Every candidate should be picked over 60 draws, got {:?}",
            selected
        );
        scheduler.report_feedback(&"hello", &BTreeMap::new());
    }
}
