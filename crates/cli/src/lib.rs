pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use claimflow_core::config::{AppConfig, LoadOptions, LogFormat};
use rust_decimal::Decimal;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "claimflow",
    about = "Claimflow expense approval CLI",
    long_about = "Apply migrations, inspect configuration, and evaluate or decide expense claims against approval rules.",
    after_help = "Examples:\n  claimflow migrate\n  claimflow evaluate --claim exp-demo-002\n  claimflow decide --claim exp-demo-002 --actor u-demo-fin-1 --action approve"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Load the demo organization, rules and claims (idempotent)")]
    Seed,
    #[command(about = "Inspect effective configuration values with source attribution")]
    Config,
    #[command(about = "Evaluate a claim against its active rules without recording a decision")]
    Evaluate {
        #[arg(long = "claim", help = "Expense claim id")]
        claim_id: String,
        #[arg(long, help = "Correlation id to attach to logs (generated when omitted)")]
        correlation_id: Option<String>,
    },
    #[command(about = "Record an approve or reject decision on a claim")]
    Decide {
        #[arg(long = "claim", help = "Expense claim id")]
        claim_id: String,
        #[arg(long = "actor", help = "User recording the decision")]
        actor_id: String,
        #[arg(long, value_enum)]
        action: commands::decide::DecisionAction,
        #[arg(long)]
        comment: Option<String>,
        #[arg(long, help = "Correlation id to attach to logs and audit events")]
        correlation_id: Option<String>,
    },
    #[command(about = "Administer approval rules", subcommand)]
    Rules(RulesCommand),
}

#[derive(Debug, Subcommand)]
enum RulesCommand {
    #[command(about = "List every rule of an organization in evaluation order")]
    List {
        #[arg(long = "org")]
        organization_id: String,
        #[arg(long, help = "Only active rules whose threshold covers this base-currency amount")]
        amount: Option<Decimal>,
    },
    #[command(about = "Create a rule from a JSON draft file")]
    Create {
        #[arg(long = "org")]
        organization_id: String,
        #[arg(long = "actor")]
        actor_id: String,
        #[arg(long, help = "Path to the rule draft JSON")]
        draft: PathBuf,
    },
    #[command(about = "Delete a rule")]
    Delete {
        #[arg(long = "rule")]
        rule_id: String,
        #[arg(long = "actor")]
        actor_id: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed => commands::seed::run(),
        Command::Config => commands::config::run(),
        Command::Evaluate { claim_id, correlation_id } => {
            commands::evaluate::run(&claim_id, correlation_id)
        }
        Command::Decide { claim_id, actor_id, action, comment, correlation_id } => {
            commands::decide::run(commands::decide::DecideArgs {
                claim_id,
                actor_id,
                action,
                comment,
                correlation_id,
            })
        }
        Command::Rules(RulesCommand::List { organization_id, amount }) => {
            commands::rules::list(&organization_id, amount)
        }
        Command::Rules(RulesCommand::Create { organization_id, actor_id, draft }) => {
            commands::rules::create(&organization_id, &actor_id, &draft)
        }
        Command::Rules(RulesCommand::Delete { rule_id, actor_id }) => {
            commands::rules::delete(&rule_id, &actor_id)
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

/// Logs go to stderr so stdout stays a single JSON document. A config that
/// fails to load falls back to defaults here; the command itself reports it.
fn init_logging() {
    let config = AppConfig::load(LoadOptions::default()).unwrap_or_default();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    // A subscriber may already be installed when embedded; keep the existing one.
    let _ = match config.logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}
