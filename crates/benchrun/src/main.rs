//! benchrun - run a workload with concurrent agent groups
//!
//! Engine and workload options are given as trailing `--key value` pairs:
//!
//! ```text
//! benchrun --log-level debug -- --bench counter --agents 4 --runs 10000 --report 5
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use libbenchrun::config::keys;
use libbenchrun::runner::Configured;
use libbenchrun::{BenchmarkRunner, ConfigurationBuilder, Result, RunOutcome, WorkloadRegistry};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "benchrun", about = "Concurrent agent-group benchmark runner", version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// TOML file of options; command-line pairs override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// List available workloads and exit
    #[arg(long)]
    list: bool,

    /// `--key value` pairs passed to the engine and the workload (after `--`)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    options: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr; stdout belongs to the console reporter
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(code = e.error_code(), "{}", e);
            eprintln!("error: {}", e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let registry = WorkloadRegistry::builtin();

    if cli.list {
        for (name, description) in registry.list() {
            println!("{:<12} {}", name, description);
        }
        return Ok(());
    }

    let base = match cli.config {
        Some(ref path) => {
            info!("Loading options from {}", path.display());
            ConfigurationBuilder::default().load_toml(path)?
        }
        None => ConfigurationBuilder::default(),
    };

    let runner = match BenchmarkRunner::configure(base, &cli.options, &registry)? {
        Configured::Help(text) => {
            print!("{}", text);
            return Ok(());
        }
        Configured::Ready(runner) => runner,
    };

    let json_report = runner.config().get_non_empty(keys::JSON_REPORT).map(PathBuf::from);
    let outcome = runner.run_and_shutdown()?;

    if let Some(path) = json_report {
        write_report(&outcome, &path)?;
    }
    if !outcome.is_clean() {
        error!(
            failed = outcome.agents_failed,
            total = outcome.agents_total,
            "Some agents failed; see warnings above"
        );
    }
    Ok(())
}

fn write_report(outcome: &RunOutcome, path: &Path) -> Result<()> {
    let report = serde_json::to_string_pretty(outcome)?;
    std::fs::write(path, report)?;
    info!("Report saved to {}", path.display());
    Ok(())
}
