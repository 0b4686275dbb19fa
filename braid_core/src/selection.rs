use crate::config::SelectionStrategy;
use crate::scheduler::{ScheduleError, uniform_index};
use rand::Rng;
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use rand::seq::index;
use rand_core::RngCore;

/// Indices of the `count` fittest individuals, best first. Ties keep
/// population order.
pub fn elite_indices(fitness: &[f64], count: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..fitness.len()).collect();
    order.sort_by(|a, b| fitness[*b].total_cmp(&fitness[*a]));
    order.truncate(count);
    order
}

/// Best of `size` distinct individuals drawn uniformly.
pub fn tournament(
    fitness: &[f64],
    size: usize,
    rng: &mut dyn RngCore,
) -> Result<usize, ScheduleError> {
    if fitness.is_empty() {
        return Err(ScheduleError::NoCandidates);
    }
    let size = size.clamp(1, fitness.len());
    let mut best: Option<usize> = None;
    for idx in index::sample(rng, fitness.len(), size).into_iter() {
        if best.is_none_or(|b| fitness[idx] > fitness[b]) {
            best = Some(idx);
        }
    }
    best.ok_or(ScheduleError::NoCandidates)
}

/// Fitness-proportional choice; uniform when every fitness is zero.
pub fn roulette(fitness: &[f64], rng: &mut dyn RngCore) -> Result<usize, ScheduleError> {
    let weights = fitness.iter().map(|f| f.max(0.0));
    match WeightedIndex::new(weights) {
        Ok(dist) => Ok(dist.sample(rng)),
        Err(_) => uniform_index(fitness.len(), rng),
    }
}

/// Choice weighted by rank: the best of `n` gets weight `n`, the worst 1.
pub fn rank(fitness: &[f64], rng: &mut dyn RngCore) -> Result<usize, ScheduleError> {
    if fitness.is_empty() {
        return Err(ScheduleError::NoCandidates);
    }
    let order = elite_indices(fitness, fitness.len());
    let n = order.len();
    let pick = match WeightedIndex::new((0..n).map(|pos| (n - pos) as f64)) {
        Ok(dist) => dist.sample(rng),
        Err(_) => uniform_index(n, rng)?,
    };
    Ok(order[pick])
}

impl SelectionStrategy {
    /// Picks one parent index.
    pub fn select(
        self,
        fitness: &[f64],
        tournament_size: usize,
        rng: &mut dyn RngCore,
    ) -> Result<usize, ScheduleError> {
        match self {
            SelectionStrategy::Tournament => tournament(fitness, tournament_size, rng),
            SelectionStrategy::Roulette => roulette(fitness, rng),
            SelectionStrategy::Rank => rank(fitness, rng),
        }
    }
}

/// True with probability `p`; out-of-range rates are clamped.
pub(crate) fn chance(rng: &mut dyn RngCore, p: f64) -> bool {
    rng.random_bool(p.clamp(0.0, 1.0))
}
