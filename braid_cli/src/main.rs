use braid_core::config::BraidConfig;
use braid_core::constraint::{Constraint, ConstraintSpec};
use braid_core::corpus::SolutionCorpus;
use braid_core::evolution::Braid;
use braid_core::grammar::{Grammar, GrammarDocument};
use braid_core::tree::DerivationTree;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "braid.toml";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Log at debug level regardless of RUST_LOG.
    #[clap(short, long, global = true)]
    verbose: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evolve inputs that satisfy the constraints.
    Run(RunArgs),
    /// Print a grammar file back in BNF-style notation.
    Show {
        #[clap(short, long, value_parser)]
        grammar: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,
    /// JSON grammar description.
    #[clap(short, long, value_parser)]
    grammar: PathBuf,
    /// JSON list of constraints.
    #[clap(long, value_parser)]
    constraints: Option<PathBuf>,
    #[clap(long)]
    generations: Option<usize>,
    #[clap(long)]
    seed: Option<u64>,
    /// Write solutions here instead of printing them.
    #[clap(short, long, value_parser)]
    output: Option<PathBuf>,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<BraidConfig, anyhow::Error> {
    match path {
        Some(path) => {
            info!(?path, "Loading configuration");
            Ok(BraidConfig::load_from_file(path)?)
        }
        None => {
            let default_path = PathBuf::from(DEFAULT_CONFIG);
            if default_path.exists() {
                info!(path = ?default_path, "Loading default configuration");
                Ok(BraidConfig::load_from_file(&default_path)?)
            } else {
                info!("No configuration file, using built-in defaults");
                Ok(BraidConfig::default())
            }
        }
    }
}

fn load_grammar(path: &Path) -> Result<Grammar, anyhow::Error> {
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read grammar {path:?}"))?;
    let document: GrammarDocument =
        serde_json::from_str(&text).with_context(|| format!("Invalid grammar file {path:?}"))?;
    Ok(document.into_grammar()?)
}

fn load_constraints(path: &Path, grammar: &Grammar) -> Result<Vec<Box<dyn Constraint>>, anyhow::Error> {
    let text =
        fs::read_to_string(path).with_context(|| format!("Failed to read constraints {path:?}"))?;
    let specs: Vec<ConstraintSpec> =
        serde_json::from_str(&text).with_context(|| format!("Invalid constraints file {path:?}"))?;
    specs
        .iter()
        .map(|spec| spec.build(grammar).map_err(anyhow::Error::from))
        .collect()
}

fn render(tree: &DerivationTree) -> String {
    if tree.contains_bytes() {
        tree.to_bytes().escape_ascii().to_string()
    } else {
        tree.to_string()
    }
}

fn run(args: RunArgs) -> Result<(), anyhow::Error> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(generations) = args.generations {
        config.evolution.max_generations = generations;
    }
    if let Some(seed) = args.seed {
        config.evolution.seed = Some(seed);
    }
    config.validate()?;
    debug!("Effective configuration: {config:#?}");

    if config.evolution.threads > 0 {
        if let Err(e) = rayon::ThreadPoolBuilder::new()
            .num_threads(config.evolution.threads)
            .build_global()
        {
            warn!(error = %e, "Could not size the evaluation thread pool");
        }
    }

    let grammar = load_grammar(&args.grammar)?;
    let constraints = match &args.constraints {
        Some(path) => load_constraints(path, &grammar)?,
        None => Vec::new(),
    };
    let mut braid = Braid::new(grammar, constraints, &config)?;
    for description in braid.evaluator().describe() {
        info!(constraint = %description, "Constraint loaded");
    }

    let started = Instant::now();
    let solutions = braid.run()?;
    info!(
        solutions = solutions.len(),
        generations = braid.generation(),
        elapsed = ?started.elapsed(),
        "Evolution finished"
    );

    match &args.output {
        Some(dir) => {
            SolutionCorpus::save_to_dir(&solutions, dir)?;
            info!(count = solutions.len(), ?dir, "Solutions written");
        }
        None => {
            for tree in &solutions {
                println!("{}", render(tree));
            }
        }
    }
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Command::Run(args) => run(args),
        Command::Show { grammar } => {
            print!("{}", load_grammar(&grammar)?.format_as_spec());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = fs::File::create(&path).expect("create file");
        file.write_all(content.as_bytes()).expect("write file");
        path
    }

    const AB_GRAMMAR: &str = r#"{
        "rules": {
            "start": { "ref": "ab" },
            "ab": { "alt": [
                { "seq": [{ "text": "a" }, { "ref": "ab" }] },
                { "seq": [{ "ref": "ab" }, { "text": "b" }] },
                { "text": "" }
            ] }
        }
    }"#;

    #[test]
    fn grammar_and_constraints_load_from_json() {
        let dir = tempfile::tempdir().expect("temp dir");
        let grammar_path = write_file(dir.path(), "ab.json", AB_GRAMMAR);
        let constraints_path = write_file(
            dir.path(),
            "constraints.json",
            r#"[{ "compare": { "left": { "count": { "symbol": "<ab>" } }, "op": "==", "right": { "literal": 4 } } }]"#,
        );
        let grammar = load_grammar(&grammar_path).expect("grammar loads");
        assert!(grammar.has_rule("ab"));
        let constraints = load_constraints(&constraints_path, &grammar).expect("constraints load");
        assert_eq!(constraints.len(), 1);
        assert_eq!(constraints[0].describe(), "count(<ab>) == 4");
    }

    #[test]
    fn constraint_on_unknown_symbol_fails() {
        let dir = tempfile::tempdir().expect("temp dir");
        let grammar = load_grammar(&write_file(dir.path(), "ab.json", AB_GRAMMAR)).expect("grammar loads");
        let path = write_file(
            dir.path(),
            "bad.json",
            r#"[{ "maximize": { "int": "<missing>" } }]"#,
        );
        assert!(load_constraints(&path, &grammar).is_err());
    }

    #[test]
    fn run_writes_solutions_to_the_output_dir() {
        let dir = tempfile::tempdir().expect("temp dir");
        let grammar = write_file(dir.path(), "ab.json", AB_GRAMMAR);
        let config = write_file(
            dir.path(),
            "braid.toml",
            "[evolution]\npopulation-size = 10\ndesired-solutions = 3\n",
        );
        let output = dir.path().join("out");
        run(RunArgs {
            config: Some(config),
            grammar,
            constraints: None,
            generations: Some(5),
            seed: Some(7),
            output: Some(output.clone()),
        })
        .expect("run succeeds");
        let written = fs::read_dir(&output).expect("output dir exists").count();
        assert_eq!(written, 6, "A .bin and a .json per solution");
    }
}
