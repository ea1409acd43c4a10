//! Binary entry point for the Quarry plan inspection CLI.
#![forbid(unsafe_code)]

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use quarry::{
    MemoryRegistry, MemoryTable, PlanBuilder, PlannerConfig, QueryResult, SelectPlan, Statement,
    SystemVariables, Value,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "quarry",
    version,
    about = "Build, explain and run SELECT plans over in-memory sources",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "FILE",
        env = "QUARRY_CONFIG",
        help = "TOML planner configuration"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Print the plan built for a workload's statement")]
    Explain(ExplainCmd),

    #[command(about = "Build and execute a workload's statement")]
    Run(WorkloadArg),

    #[command(about = "Print the effective planner configuration")]
    Config,
}

#[derive(Args, Debug)]
struct WorkloadArg {
    #[arg(value_name = "FILE", help = "JSON workload: tables, variables and statement")]
    path: PathBuf,
}

#[derive(Args, Debug)]
struct ExplainCmd {
    #[command(flatten)]
    workload: WorkloadArg,

    #[arg(long, help = "Hide literal values in predicates")]
    redact: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

/// Input file: in-memory tables, session variable overrides and the
/// statement to plan.
#[derive(Debug, Deserialize)]
struct Workload {
    #[serde(default)]
    tables: BTreeMap<String, MemoryTable>,
    #[serde(default)]
    variables: BTreeMap<String, Value>,
    statement: Statement,
}

impl Workload {
    fn load(path: &Path) -> Result<Self, Box<dyn Error>> {
        let contents = fs::read_to_string(path)
            .map_err(|err| format!("failed to read workload {}: {err}", path.display()))?;
        let workload = serde_json::from_str(&contents)
            .map_err(|err| format!("invalid workload {}: {err}", path.display()))?;
        Ok(workload)
    }

    fn registry(&self, config: &PlannerConfig) -> MemoryRegistry {
        let registry = MemoryRegistry::new();
        for (name, table) in &self.tables {
            registry.register_table(name.clone(), table.clone());
        }
        let vars = self
            .variables
            .iter()
            .fold(SystemVariables::new(), |vars, (name, value)| {
                vars.set(name, value.clone())
            });
        registry.register(config.system_source.clone(), vars.into_capabilities());
        registry
    }

    fn plan(&self, config: &PlannerConfig) -> Result<SelectPlan, Box<dyn Error>> {
        let builder = PlanBuilder::new(config.clone(), Arc::new(self.registry(config)));
        Ok(builder.plan(&self.statement)?)
    }
}

#[derive(Serialize)]
struct ExplainReport<'a> {
    plan_hash: String,
    plan: &'a quarry::ExplainNode,
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("QUARRY_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => PlannerConfig::load(path)?,
        None => PlannerConfig::default(),
    };

    match cli.command {
        Command::Explain(cmd) => {
            let plan = Workload::load(&cmd.workload.path)?.plan(&config)?;
            let tree = if cmd.redact {
                Cow::Owned(plan.explain.redacted())
            } else {
                Cow::Borrowed(&plan.explain)
            };
            let report = ExplainReport {
                plan_hash: format!("{:016x}", plan.plan_hash),
                plan: &tree,
            };
            emit(&cli.format, &report, |_| {
                print!("{}", tree.render_text(false));
                println!("plan_hash: {}", report.plan_hash);
            })?;
        }
        Command::Run(arg) => {
            let result = Workload::load(&arg.path)?.plan(&config)?.execute()?;
            emit(&cli.format, &result, |_| print_rows_text(&result))?;
        }
        Command::Config => {
            let rendered = config.to_toml_string()?;
            emit(&cli.format, &config, |_| print!("{rendered}"))?;
        }
    }
    Ok(())
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(OutputFormat),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(OutputFormat::Text),
    }
    Ok(())
}

fn print_rows_text(result: &QueryResult) {
    for row in &result.rows {
        let cells: Vec<String> = row
            .columns()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        println!("{}", cells.join(", "));
    }
    println!(
        "({} rows; scanned={} joined={} filtered={})",
        result.rows.len(),
        result.stats.rows_scanned,
        result.stats.rows_joined,
        result.stats.rows_filtered
    );
}
