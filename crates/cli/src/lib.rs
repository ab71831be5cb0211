pub mod bootstrap;
pub mod commands;

use chatcart_core::config::{AppConfig, LoadOptions, LogFormat};
use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "chatcart",
    about = "Chatcart operator CLI",
    long_about = "Operate the cart store: migrations, config inspection, expiry sweeps, and abandoned-cart queries.",
    after_help = "Examples:\n  chatcart doctor --json\n  chatcart sweep\n  chatcart abandoned --limit 20\n  chatcart show +15550100001"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution"
    )]
    Config,
    #[command(about = "Validate config, DB connectivity, and cart schema readiness")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Expire every active cart past its expiry, in batches")]
    Sweep,
    #[command(about = "List carts idle past the abandonment window, for reminder scheduling")]
    Abandoned {
        #[arg(long, default_value_t = 50, help = "Maximum number of carts to return")]
        limit: u32,
    },
    #[command(about = "Show a customer's active cart as stored")]
    Show {
        #[arg(help = "Customer phone number")]
        customer_key: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    if let Ok(config) = AppConfig::load(LoadOptions::default()) {
        init_logging(&config);
    }

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Sweep => commands::sweep::run(),
        Command::Abandoned { limit } => commands::abandoned::run(limit),
        Command::Show { customer_key } => commands::show::run(&customer_key),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

/// Logs go to stderr; stdout carries command output.
pub fn init_logging(config: &AppConfig) {
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(log_level)
        .with_writer(std::io::stderr);

    let _ = match config.logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}
