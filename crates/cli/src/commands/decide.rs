use claimflow_core::audit::AuditEvent;
use claimflow_core::domain::expense::{ApprovalAction, ExpenseId};
use claimflow_core::domain::identity::UserId;
use claimflow_db::{DecisionCommand, DecisionReceipt};
use clap::ValueEnum;
use serde::Serialize;

use crate::commands::{open_database, prepare, CommandError, CommandResult, Services};

/// Action accepted on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum DecisionAction {
    Approve,
    Reject,
}

impl From<DecisionAction> for ApprovalAction {
    fn from(value: DecisionAction) -> Self {
        match value {
            DecisionAction::Approve => Self::Approved,
            DecisionAction::Reject => Self::Rejected,
        }
    }
}

pub struct DecideArgs {
    pub claim_id: String,
    pub actor_id: String,
    pub action: DecisionAction,
    pub comment: Option<String>,
    pub correlation_id: Option<String>,
}

#[derive(Serialize)]
struct DecideOutput {
    receipt: DecisionReceipt,
    audit_events: Vec<AuditEvent>,
}

pub fn run(args: DecideArgs) -> CommandResult {
    let action = ApprovalAction::from(args.action);

    let (config, runtime) = match prepare("decide") {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };
    let correlation_id = args.correlation_id.unwrap_or_else(super::new_correlation_id);
    let command = DecisionCommand {
        claim_id: ExpenseId(args.claim_id),
        actor_id: UserId(args.actor_id),
        action,
        comment: args.comment.filter(|comment| !comment.trim().is_empty()),
        correlation_id: correlation_id.clone(),
    };

    let result = runtime.block_on(async {
        let pool = open_database(&config).await?;
        let services = Services::new(&pool, &config);
        let receipt = services.workflow.decide(command).await;
        let audit_events = services.audit_events();
        pool.close().await;

        let receipt = receipt.map_err(|error| CommandError::application(error, &correlation_id))?;
        Ok::<_, CommandError>(DecideOutput { receipt, audit_events })
    });

    match result {
        Ok(output) => {
            let message = format!(
                "recorded {} on claim {}: {} -> {}",
                action.as_str(),
                output.receipt.claim.id,
                output.receipt.previous_status.as_str(),
                output.receipt.claim.status.as_str()
            );
            CommandResult::success_with("decide", message, &output)
        }
        Err(error) => error.into_result("decide"),
    }
}
