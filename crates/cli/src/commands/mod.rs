pub mod config;
pub mod decide;
pub mod evaluate;
pub mod migrate;
pub mod rules;
pub mod seed;

use std::sync::Arc;

use claimflow_core::audit::{AuditEvent, InMemoryAuditSink};
use claimflow_core::config::{AppConfig, LoadOptions};
use claimflow_core::errors::{ApplicationError, InterfaceError};
use claimflow_db::repositories::{
    SqlApprovalRuleRepository, SqlExpenseRepository, SqlIdentityRepository,
};
use claimflow_db::{connect_with_config, migrations, DbPool, DecisionWorkflow, RuleAdministration};
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Runtime;

/// `(error_class, message, exit_code)` carried out of a command's async body.
pub(crate) type CommandFailure = (&'static str, String, u8);

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            correlation_id: None,
            data: None,
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn success_with(command: &str, message: impl Into<String>, data: impl Serialize) -> Self {
        let data = match serde_json::to_value(data) {
            Ok(data) => data,
            Err(error) => return Self::failure(command, "serialization", error.to_string(), 3),
        };
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            correlation_id: None,
            data: Some(data),
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            correlation_id: None,
            data: None,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }

    /// Failure raised by the application layer: user-safe message with the
    /// detail and correlation id alongside.
    pub fn rejected(command: &str, error: InterfaceError) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error.code().to_string()),
            message: format!("{} ({error})", error.user_message()),
            correlation_id: Some(error.correlation_id().to_string()),
            data: None,
        };
        Self { exit_code: exit_code_for(&error), output: serialize_payload(payload) }
    }
}

fn exit_code_for(error: &InterfaceError) -> u8 {
    match error {
        InterfaceError::Internal { .. } => 3,
        InterfaceError::ServiceUnavailable { .. } => 4,
        InterfaceError::BadRequest { .. } => 7,
        InterfaceError::Forbidden { .. } => 8,
        InterfaceError::Conflict { .. } => 9,
        InterfaceError::NotFound { .. } => 10,
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

/// Loads configuration and builds the single-threaded runtime every command runs on.
pub(crate) fn prepare(command: &str) -> Result<(AppConfig, Runtime), CommandResult> {
    let config = AppConfig::load(LoadOptions::default()).map_err(|error| {
        CommandResult::failure(command, "config_validation", format!("configuration issue: {error}"), 2)
    })?;

    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(
        |error| {
            CommandResult::failure(
                command,
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            )
        },
    )?;

    Ok((config, runtime))
}

pub(crate) async fn open_database(config: &AppConfig) -> Result<DbPool, CommandFailure> {
    let pool = connect_with_config(&config.database)
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
    migrations::run_pending(&pool).await.map_err(|error| ("migration", error.to_string(), 5u8))?;
    Ok(pool)
}

/// SQL-backed services sharing one audit sink whose events are echoed in the
/// command output.
pub(crate) struct Services {
    pub workflow: DecisionWorkflow,
    pub administration: RuleAdministration,
    pub audit: InMemoryAuditSink,
}

impl Services {
    pub fn new(pool: &DbPool, config: &AppConfig) -> Self {
        let audit = InMemoryAuditSink::default();
        let rules = Arc::new(SqlApprovalRuleRepository::new(pool.clone()));
        let workflow = DecisionWorkflow::new(
            rules.clone(),
            Arc::new(SqlIdentityRepository::new(pool.clone())),
            Arc::new(SqlExpenseRepository::new(pool.clone())),
            Arc::new(audit.clone()),
            config.approvals.clone(),
        );
        let administration = RuleAdministration::new(rules, Arc::new(audit.clone()));
        Self { workflow, administration, audit }
    }

    pub fn audit_events(&self) -> Vec<AuditEvent> {
        self.audit.events()
    }
}

pub(crate) enum CommandError {
    Infrastructure(CommandFailure),
    Application(InterfaceError),
}

impl CommandError {
    pub fn application(error: ApplicationError, correlation_id: &str) -> Self {
        Self::Application(error.into_interface(correlation_id))
    }

    pub fn into_result(self, command: &str) -> CommandResult {
        match self {
            Self::Infrastructure((error_class, message, exit_code)) => {
                CommandResult::failure(command, error_class, message, exit_code)
            }
            Self::Application(error) => CommandResult::rejected(command, error),
        }
    }
}

impl From<CommandFailure> for CommandError {
    fn from(value: CommandFailure) -> Self {
        Self::Infrastructure(value)
    }
}

pub(crate) fn new_correlation_id() -> String {
    format!("req-{}", uuid::Uuid::new_v4())
}
