pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "callquote",
    about = "Callquote operator CLI",
    long_about = "Inspect configuration, check readiness, apply migrations, price jobs and rehearse calls offline.",
    after_help = "Examples:\n  callquote doctor --json\n  callquote quote piano_moving_001 -f piano_type=grand -f stairs_count=3\n  callquote simulate piano_moving_001 --say \"a baby grand\" --say \"1 Main St\"\n  callquote eval piano_moving_001 --suite scenarios.json"
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
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, database connectivity and business profiles")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Price a field set with a business profile's rules")]
    Quote {
        #[arg(help = "Business id of a loaded profile")]
        business: String,
        #[arg(short = 'f', long = "field", value_name = "NAME=VALUE", help = "Collected field value")]
        fields: Vec<String>,
        #[arg(long, help = "Route distance; defaults to the profile's fallback distance")]
        distance_km: Option<f64>,
    },
    #[command(about = "Run caller utterances through the keyword strategy and print each turn")]
    Simulate {
        #[arg(help = "Business id of a loaded profile")]
        business: String,
        #[arg(long = "say", value_name = "UTTERANCE", help = "Caller utterance, in order")]
        utterances: Vec<String>,
        #[arg(long, help = "File with one caller utterance per line")]
        script: Option<PathBuf>,
        #[arg(long, help = "Route distance used when pricing the finished call")]
        distance_km: Option<f64>,
    },
    #[command(about = "Score scripted call scenarios against expected fields and outcomes")]
    Eval {
        #[arg(help = "Business id of a loaded profile")]
        business: String,
        #[arg(long, help = "JSON scenario suite; defaults to the built-in piano-moving suite")]
        suite: Option<PathBuf>,
        #[arg(long, help = "Route distance used when pricing finished calls")]
        distance_km: Option<f64>,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Quote { business, fields, distance_km } => {
            commands::quote::run(&commands::quote::QuoteArgs { business, fields, distance_km })
        }
        Command::Simulate { business, utterances, script, distance_km } => {
            commands::simulate::run(&commands::simulate::SimulateArgs {
                business,
                utterances,
                script,
                distance_km,
            })
        }
        Command::Eval { business, suite, distance_km } => {
            commands::eval::run(&commands::eval::EvalArgs { business, suite, distance_km })
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
