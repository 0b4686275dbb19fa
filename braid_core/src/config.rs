use crate::coverage::CoverageGoal;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Hard ceiling for the per-individual node budget.
pub const MAX_NODES_CAP: usize = 5000;

#[derive(Error, Debug)]
pub enum ConfigError {
    /// A rate outside `[0, 1]`.
    #[error("{name} must be within [0, 1], got {value}")]
    InvalidRate { name: &'static str, value: f64 },
    /// A size that must be positive is zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    /// Any other inconsistent combination of settings.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Failed to read config file at {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML from config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    #[default]
    Tournament,
    /// Fitness-proportional.
    Roulette,
    Rank,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EvolutionSettings {
    #[serde(default = "default_population_size")]
    pub population_size: usize,
    #[serde(default = "default_max_generations")]
    pub max_generations: usize,
    /// Stop once this many distinct solutions exist. Defaults to the
    /// population size.
    #[serde(default)]
    pub desired_solutions: Option<usize>,
    #[serde(default = "default_mutation_rate")]
    pub mutation_rate: f64,
    #[serde(default = "default_crossover_rate")]
    pub crossover_rate: f64,
    #[serde(default = "default_elitism_rate")]
    pub elitism_rate: f64,
    #[serde(default)]
    pub selection: SelectionStrategy,
    /// Defaults to `max(10, population_size / 10)`.
    #[serde(default)]
    pub tournament_size: Option<usize>,
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,
    #[serde(default = "default_max_repetitions")]
    pub max_repetitions: usize,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Rayon worker threads for evaluation; 0 keeps rayon's default.
    #[serde(default = "default_threads")]
    pub threads: usize,
}

pub fn default_population_size() -> usize {
    100
}
pub fn default_max_generations() -> usize {
    500
}
fn default_mutation_rate() -> f64 {
    0.2
}
fn default_crossover_rate() -> f64 {
    0.8
}
fn default_elitism_rate() -> f64 {
    0.1
}
pub fn default_max_nodes() -> usize {
    50
}
fn default_max_repetitions() -> usize {
    crate::grammar::DEFAULT_MAX_REPETITIONS
}
pub fn default_threads() -> usize {
    0
}

impl EvolutionSettings {
    pub fn desired_solutions(&self) -> usize {
        self.desired_solutions.unwrap_or(self.population_size)
    }

    pub fn tournament_size(&self) -> usize {
        self.tournament_size
            .unwrap_or_else(|| (self.population_size / 10).max(10))
    }

    pub fn elite_count(&self) -> usize {
        (self.elitism_rate * self.population_size as f64) as usize
    }
}

impl Default for EvolutionSettings {
    fn default() -> Self {
        Self {
            population_size: default_population_size(),
            max_generations: default_max_generations(),
            desired_solutions: None,
            mutation_rate: default_mutation_rate(),
            crossover_rate: default_crossover_rate(),
            elitism_rate: default_elitism_rate(),
            selection: SelectionStrategy::default(),
            tournament_size: None,
            max_nodes: default_max_nodes(),
            max_repetitions: default_max_repetitions(),
            seed: None,
            threads: default_threads(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct IoSettings {
    /// Parties whose messages this process synthesizes. Empty means every
    /// party in the grammar.
    #[serde(default)]
    pub local_parties: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Messages per exchange round before the round is cut off.
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    /// Chance to keep going once the exchange could stop.
    #[serde(default = "default_continue_probability")]
    pub continue_probability: f64,
    /// Fuzzed candidates tried when synthesizing one message.
    #[serde(default = "default_candidates_per_packet")]
    pub candidates_per_packet: usize,
}

fn default_timeout_ms() -> u64 {
    2000
}
fn default_max_messages() -> usize {
    32
}
fn default_continue_probability() -> f64 {
    0.5
}
fn default_candidates_per_packet() -> usize {
    20
}

impl Default for IoSettings {
    fn default() -> Self {
        Self {
            local_parties: Vec::new(),
            timeout_ms: default_timeout_ms(),
            max_messages: default_max_messages(),
            continue_probability: default_continue_probability(),
            candidates_per_packet: default_candidates_per_packet(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CoverageSettings {
    #[serde(default)]
    pub goal: CoverageGoal,
    #[serde(default = "default_log_interval_ms")]
    pub log_interval_ms: u64,
}

fn default_log_interval_ms() -> u64 {
    1000
}

impl Default for CoverageSettings {
    fn default() -> Self {
        Self {
            goal: CoverageGoal::default(),
            log_interval_ms: default_log_interval_ms(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BraidConfig {
    #[serde(default)]
    pub evolution: EvolutionSettings,
    #[serde(default)]
    pub io: IoSettings,
    #[serde(default)]
    pub coverage: CoverageSettings,
}

impl BraidConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: BraidConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects hyper-parameters no run could use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let evo = &self.evolution;
        check_rate("mutation-rate", evo.mutation_rate)?;
        check_rate("crossover-rate", evo.crossover_rate)?;
        check_rate("elitism-rate", evo.elitism_rate)?;
        check_rate("continue-probability", self.io.continue_probability)?;
        if evo.population_size == 0 {
            return Err(ConfigError::Zero("population-size"));
        }
        if evo.max_nodes == 0 {
            return Err(ConfigError::Zero("max-nodes"));
        }
        if evo.max_nodes > MAX_NODES_CAP {
            return Err(ConfigError::Invalid(format!(
                "max-nodes {} exceeds the cap of {MAX_NODES_CAP}",
                evo.max_nodes
            )));
        }
        if evo.desired_solutions == Some(0) {
            return Err(ConfigError::Zero("desired-solutions"));
        }
        if evo.tournament_size == Some(0) {
            return Err(ConfigError::Zero("tournament-size"));
        }
        if self.io.timeout_ms == 0 {
            return Err(ConfigError::Zero("timeout-ms"));
        }
        if self.io.candidates_per_packet == 0 {
            return Err(ConfigError::Zero("candidates-per-packet"));
        }
        if self.coverage.log_interval_ms == 0 {
            return Err(ConfigError::Zero("log-interval-ms"));
        }
        Ok(())
    }
}

fn check_rate(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidRate { name, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = BraidConfig::default();
        assert_eq!(config.evolution.population_size, 100);
        assert_eq!(config.evolution.max_generations, 500);
        assert_eq!(config.evolution.mutation_rate, 0.2);
        assert_eq!(config.evolution.crossover_rate, 0.8);
        assert_eq!(config.evolution.max_nodes, 50);
        assert_eq!(config.evolution.tournament_size(), 10);
        assert_eq!(config.evolution.desired_solutions(), 100);
        assert_eq!(config.evolution.elite_count(), 10);
        assert_eq!(config.io.timeout_ms, 2000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "[evolution]\npopulation-size = 400\nselection = \"rank\"\n\n[coverage]\ngoal = \"states-inputs\""
        )
        .expect("write config");
        let config = BraidConfig::load_from_file(file.path()).expect("config loads");
        assert_eq!(config.evolution.population_size, 400);
        assert_eq!(config.evolution.selection, SelectionStrategy::Rank);
        assert_eq!(config.evolution.tournament_size(), 40);
        assert_eq!(config.coverage.goal, CoverageGoal::StatesInputs);
        assert_eq!(config.io.max_messages, 32);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "[evolution]\npopulation = 4").expect("write config");
        assert!(matches!(
            BraidConfig::load_from_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn invalid_hyper_parameters_fail_validation() {
        let mut config = BraidConfig::default();
        config.evolution.mutation_rate = -0.1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRate { name: "mutation-rate", .. })
        ));

        let mut config = BraidConfig::default();
        config.evolution.population_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Zero("population-size"))));

        let mut config = BraidConfig::default();
        config.evolution.max_nodes = MAX_NODES_CAP + 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = BraidConfig::load_from_file(Path::new("/nonexistent/braid.toml"))
            .expect_err("missing file must fail");
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
