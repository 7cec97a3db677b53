use claimflow_core::domain::expense::ExpenseId;
use tracing::info;

use crate::commands::{open_database, prepare, CommandError, CommandResult, Services};

/// Shows what the rules currently say about a claim without recording anything.
pub fn run(claim_id: &str, correlation_id: Option<String>) -> CommandResult {
    let (config, runtime) = match prepare("evaluate") {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };
    let correlation_id = correlation_id.unwrap_or_else(super::new_correlation_id);
    let claim_id = ExpenseId(claim_id.to_string());

    let result = runtime.block_on(async {
        let pool = open_database(&config).await?;
        let services = Services::new(&pool, &config);
        let assessment = services.workflow.assess(&claim_id).await;
        pool.close().await;

        let assessment =
            assessment.map_err(|error| CommandError::application(error, &correlation_id))?;
        info!(
            event_name = "cli.claim_evaluated",
            correlation_id = %correlation_id,
            claim_id = %claim_id,
            status = assessment.evaluation.status.as_str(),
            "claim evaluated"
        );
        Ok::<_, CommandError>(assessment)
    });

    match result {
        Ok(assessment) => {
            let message = format!(
                "claim {} evaluates to {} against {} applicable rules",
                assessment.claim.id,
                assessment.evaluation.status.as_str(),
                assessment.rules_considered
            );
            CommandResult::success_with("evaluate", message, &assessment)
        }
        Err(error) => error.into_result("evaluate"),
    }
}
