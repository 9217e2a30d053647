mod commands;
mod input;
mod output;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::process;

use commands::assumptions::AssumptionsArgs;
use commands::backsolve::BacksolveArgs;
use commands::breakpoints::{AllocateArgs, BreakpointsArgs};
use commands::hybrid::HybridArgs;
use commands::sensitivity::SensitivityArgs;

/// Option Pricing Model valuation of multi-class equity
#[derive(Parser)]
#[command(
    name = "opm",
    version,
    about = "Option Pricing Model breakpoint valuation",
    long_about = "A CLI for allocating equity value across share classes with the \
                  Option Pricing Model. Supports breakpoint derivation, forward \
                  allocation, backsolve from a known share price, hybrid PWERM \
                  scenario weighting and sensitivity grids."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format
    #[arg(long, default_value = "json", global = true)]
    output: OutputFormat,

    /// Log solver progress to stderr (overridden by RUST_LOG)
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Derive the breakpoint schedule for a capital structure
    Breakpoints(BreakpointsArgs),
    /// Allocate a known equity value across share classes
    Allocate(AllocateArgs),
    /// Solve for the equity value implied by a class's FMV per share
    Backsolve(BacksolveArgs),
    /// Probability-weighted valuation across scenarios (hybrid PWERM)
    Hybrid(HybridArgs),
    /// Two-way FMV sensitivity grid
    Sensitivity(SensitivityArgs),
    /// Convert an assumptions payload into Black-Scholes parameters
    Assumptions(AssumptionsArgs),
    /// Print version information
    Version,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Csv,
    Minimal,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "opm_core=debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result: Result<serde_json::Value, Box<dyn std::error::Error>> = match cli.command {
        Commands::Breakpoints(args) => commands::breakpoints::run_breakpoints(args),
        Commands::Allocate(args) => commands::breakpoints::run_allocate(args),
        Commands::Backsolve(args) => commands::backsolve::run_backsolve(args),
        Commands::Hybrid(args) => commands::hybrid::run_hybrid(args),
        Commands::Sensitivity(args) => commands::sensitivity::run_sensitivity(args),
        Commands::Assumptions(args) => commands::assumptions::run_assumptions(args),
        Commands::Version => {
            println!("opm {}", env!("CARGO_PKG_VERSION"));
            return;
        }
    };

    match result {
        Ok(value) => {
            output::format_output(&cli.output, &value);
            process::exit(output::exit_code(&value));
        }
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e);
            process::exit(1);
        }
    }
}
