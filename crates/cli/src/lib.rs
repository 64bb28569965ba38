pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "pledge",
    about = "Pledge operator CLI",
    long_about = "Check pledge readiness, apply migrations, inspect config, and run one-shot chat sweeps or deadline scans.",
    after_help = "Examples:\n  pledge doctor --json\n  pledge config\n  pledge sweep"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Run startup preflight checks and return structured status output")]
    Start,
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, Slack readiness, DB connectivity and stored prompts")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Run one pass of the chat sweep over every stored thread")]
    Sweep,
    #[command(about = "Run one deadline scan: send due reminders and expire overdue promises")]
    Deadlines,
    #[command(about = "List stored threads with their open promise counts")]
    Threads,
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Start => commands::start::run(),
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Sweep => commands::sweep::run(),
        Command::Deadlines => commands::deadlines::run(),
        Command::Threads => commands::threads::run(),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
