pub mod adaptation;
pub mod config;
pub mod constraint;
pub mod corpus;
pub mod coverage;
pub mod crossover;
pub mod evaluation;
pub mod evolution;
pub mod exchange;
pub mod fitness;
pub mod fuzz;
pub mod grammar;
pub mod graph;
pub mod io_fuzzer;
pub mod mutator;
pub mod packet;
pub mod parser;
pub mod population;
pub mod power_schedule;
pub mod scheduler;
pub mod selection;
pub mod symbol;
pub mod tree;

pub use adaptation::{AdaptiveTuner, ConstantRates, Rates, StagnationTuner};
pub use config::{BraidConfig, ConfigError, SelectionStrategy};
pub use constraint::{Comparison, Constraint, ConstraintSpec, Operand, Value};
pub use corpus::{CorpusError, SolutionCorpus};
pub use coverage::{CoverageGoal, CoverageLog, CoverageSource, GrammarCoverage};
pub use evaluation::{Evaluation, Evaluator};
pub use evolution::{Braid, EvolutionError, EvolutionState, GenerationMode, GenerationStats};
pub use exchange::{ExchangeError, InProcessEndpoint, Message, Transport};
pub use fitness::{ConstraintFitness, FailingTree, Fitness, ValueFitness};
pub use fuzz::{FuzzSettings, Fuzzer};
pub use grammar::{Grammar, GrammarBuilder, GrammarDocument, GrammarError};
pub use graph::GrammarGraph;
pub use io_fuzzer::IoFuzzer;
pub use mutator::{Mutator, SubtreeMutator};
pub use packet::{GrammarReducer, PacketForecaster, PacketNavigator, PacketNonTerminal};
pub use parser::{ParseError, ParsingMode};
pub use power_schedule::PowerSchedule;
pub use scheduler::{RandomScheduler, ScheduleError, Scheduler};
pub use symbol::{Symbol, TerminalValue};
pub use tree::{DerivationTree, TreePath};
