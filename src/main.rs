//! Fibonacci retracement short engine - main entry point
//!
//! This binary provides three subcommands:
//! - run: Scan and trade continuously (paper or live)
//! - scan: One dry evaluation of the universe
//! - report: Performance metrics from the trade log

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "fib-short")]
#[command(about = "Fibonacci retracement short-selling engine for crypto perpetual futures", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scan and monitor loops
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/fib_short.json")]
        config: String,

        /// Paper trading mode (safe, no real money)
        #[arg(long)]
        paper: bool,

        /// Live trading mode (CAUTION - REAL MONEY!)
        #[arg(long)]
        live: bool,

        /// Scan interval in seconds (overrides config file)
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Evaluate the universe once and print the setups found
    Scan {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/fib_short.json")]
        config: String,

        /// Pairs to scan (comma-separated). E.g., "BTCUSDT,ETHUSDT"
        #[arg(short, long)]
        pairs: Option<String>,
    },

    /// Show performance of closed trades
    Report {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/fib_short.json")]
        config: String,

        /// Only trades of this symbol
        #[arg(short, long)]
        symbol: Option<String>,

        /// Export trades to a CSV file
        #[arg(long)]
        csv: Option<String>,
    },
}

fn setup_logging(verbose: bool, command_name: &str, file_only: bool) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    // {command}_{date}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    // Filter out noisy external crates
    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    if file_only {
        // Keep the console clean for the progress bar
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .init();
    } else {
        let console_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(true);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        info!("Logging initialized");
        info!("Log file: {}", log_path.display());
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Credentials may live in a local .env file
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    let (command_name, file_only) = match &cli.command {
        Commands::Run { .. } => ("run", false),
        Commands::Scan { .. } => ("scan", true),
        Commands::Report { .. } => ("report", false),
    };

    setup_logging(cli.verbose, command_name, file_only)?;

    match cli.command {
        Commands::Run {
            config,
            paper,
            live,
            interval,
        } => commands::run::run(config, paper, live, interval).await,

        Commands::Scan { config, pairs } => commands::scan::run(config, pairs).await,

        Commands::Report {
            config,
            symbol,
            csv,
        } => commands::report::run(config, symbol, csv),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::try_parse_from(["fib-short", "run", "--paper", "--interval", "30", "-v"]).unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Run {
                config,
                paper,
                live,
                interval,
            } => {
                assert_eq!(config, "configs/fib_short.json");
                assert!(paper);
                assert!(!live);
                assert_eq!(interval, Some(30));
            }
            other => panic!("expected run, got {:?}", other),
        }
    }

    // Only test that installs the global subscriber
    #[test]
    fn test_console_and_file_logging_initialize() {
        setup_logging(false, "test", false).unwrap();
        info!("console and file layers active");
        let written = std::fs::read_dir("logs")
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with("test_"));
        assert!(written);
    }
}
