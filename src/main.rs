use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use miette::{miette, IntoDiagnostic, Result};
use tracing_subscriber::{fmt, EnvFilter};

use umbra::compiler::compile_set;
use umbra::engine::{CancelToken, CheckInput, Engine, EngineConf};
use umbra::index::{Index, Snapshot};
use umbra::loader;
use umbra::planner::{PlanInput, Planner};
use umbra::schema::SchemaRegistry;
use umbra::settings::Settings;

#[derive(Parser, Debug)]
#[command(name = "umbra", version, about = "Policy decision point")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Parser, Debug)]
enum Command {
    /// Load and compile the policy directory, reporting the result
    Compile {
        /// Policy directory (overrides the configured one)
        #[arg(short, long)]
        policies: Option<String>,
    },
    /// Evaluate a check request from a JSON file
    Check {
        /// Policy directory (overrides the configured one)
        #[arg(short, long)]
        policies: Option<String>,
        /// Path to the CheckInput JSON document
        #[arg(short, long)]
        request: String,
    },
    /// Produce a query plan for a principal, resource kind and action
    Plan {
        /// Policy directory (overrides the configured one)
        #[arg(short, long)]
        policies: Option<String>,
        /// Path to the PlanInput JSON document
        #[arg(short, long)]
        request: String,
    },
}

fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)?;

    match cli.command {
        Command::Compile { policies } => {
            let index = build_index(&settings, policies.as_deref())?;
            let snapshot = index.snapshot();
            println!("compiled {} unit(s)", snapshot.len());
            for unit in snapshot.units() {
                println!("  {} ({:016x})", unit.fqn, unit.hash);
            }
            Ok(())
        }
        Command::Check { policies, request } => {
            let index = build_index(&settings, policies.as_deref())?;
            let schemas = build_schemas(&settings)?;
            let engine = Engine::new(
                index,
                schemas,
                EngineConf {
                    default_policy_version: settings.engine.default_policy_version.clone(),
                    schema_validation: settings.engine.schema_validation,
                },
            );

            let input: CheckInput = read_json(&request)?;
            let output = engine
                .check(&input, &CancelToken::new())
                .map_err(|e| miette!("{e}"))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&output).into_diagnostic()?
            );
            Ok(())
        }
        Command::Plan { policies, request } => {
            let index = build_index(&settings, policies.as_deref())?;
            let planner = Planner::new(index, settings.engine.default_policy_version.clone());

            let input: PlanInput = read_json(&request)?;
            let output = planner.plan(&input);
            println!(
                "{}",
                serde_json::to_string_pretty(&output).into_diagnostic()?
            );
            Ok(())
        }
    }
}

fn build_index(settings: &Settings, override_dir: Option<&str>) -> Result<Index> {
    let dir = override_dir
        .map(Path::new)
        .unwrap_or(settings.storage.policy_dir.as_path());
    let policies = loader::load_dir(dir)?;
    let units = compile_set(&policies)?;
    Ok(Index::new(Snapshot::build(units)))
}

fn build_schemas(settings: &Settings) -> Result<Arc<SchemaRegistry>> {
    let mut registry = SchemaRegistry::new();
    if let Some(dir) = &settings.storage.schema_dir {
        registry.load_dir(dir)?;
    }
    Ok(Arc::new(registry))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &str) -> Result<T> {
    let data = std::fs::read(path).into_diagnostic()?;
    serde_json::from_slice(&data).into_diagnostic()
}
