//! kwrun CLI - Main Entry Point
//!
//! Runs declarative API and browser suites and prints per-case verdicts.
//! Exit code 0 when every suite passed, 1 when any case did not pass,
//! 2 when a suite or the invocation itself could not be processed.

use clap::{Parser, Subcommand};

mod commands;
mod output;

use commands::{plan, run};

/// kwrun - keyword-driven test runner
#[derive(Parser)]
#[command(name = "kwrun")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute suites
    Run(run::RunArgs),

    /// Print the resolved execution order
    Plan(plan::PlanArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Run(args) => run::execute(args, cli.format).await,
        Commands::Plan(args) => plan::execute(args, cli.format).await,
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            output::print_error(&format!("{:#}", e));
            2
        }
    };
    std::process::exit(code);
}
