use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use claimflow_core::audit::AuditEvent;
use claimflow_core::domain::identity::OrganizationId;
use claimflow_core::domain::rule::{ApprovalRule, ApprovalRuleDraft, RuleId};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::commands::{
    new_correlation_id, open_database, prepare, CommandError, CommandResult, Services,
};

#[derive(Serialize)]
struct CreatedRule {
    rule: ApprovalRule,
    audit_events: Vec<AuditEvent>,
}

#[derive(Serialize)]
struct DeletedRule {
    rule_id: RuleId,
    audit_events: Vec<AuditEvent>,
}

/// With `amount`, only the rules that would be evaluated for a claim of that
/// converted amount.
pub fn list(organization_id: &str, amount: Option<Decimal>) -> CommandResult {
    let (config, runtime) = match prepare("rules.list") {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };
    let correlation_id = new_correlation_id();
    let organization_id = OrganizationId(organization_id.to_string());

    let result = runtime.block_on(async {
        let pool = open_database(&config).await?;
        let administration = Services::new(&pool, &config).administration;
        let rules = match amount {
            Some(amount) => administration.list_applicable(&organization_id, amount).await,
            None => administration.list(&organization_id).await,
        };
        pool.close().await;

        let rules = rules.map_err(|error| CommandError::application(error, &correlation_id))?;
        Ok::<_, CommandError>(rules)
    });

    match result {
        Ok(rules) => {
            let message = match amount {
                Some(amount) => format!(
                    "{} rules in organization {organization_id} apply to {amount}",
                    rules.len()
                ),
                None => format!("{} rules in organization {organization_id}", rules.len()),
            };
            CommandResult::success_with("rules.list", message, &rules)
        }
        Err(error) => error.into_result("rules.list"),
    }
}

pub fn create(organization_id: &str, actor: &str, draft_path: &Path) -> CommandResult {
    let draft = match read_draft(draft_path) {
        Ok(draft) => draft,
        Err(error) => {
            return CommandResult::failure("rules.create", "invalid_argument", format!("{error:#}"), 7)
        }
    };
    let (config, runtime) = match prepare("rules.create") {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };
    let correlation_id = new_correlation_id();
    let organization_id = OrganizationId(organization_id.to_string());

    let result = runtime.block_on(async {
        let pool = open_database(&config).await?;
        let services = Services::new(&pool, &config);
        let created =
            services.administration.create(organization_id, draft, actor, &correlation_id).await;
        let audit_events = services.audit_events();
        pool.close().await;

        let rule = created.map_err(|error| CommandError::application(error, &correlation_id))?;
        Ok::<_, CommandError>(CreatedRule { rule, audit_events })
    });

    match result {
        Ok(created) => {
            let message =
                format!("created {} rule {}", created.rule.rule_type().as_str(), created.rule.id);
            CommandResult::success_with("rules.create", message, &created)
        }
        Err(error) => error.into_result("rules.create"),
    }
}

pub fn delete(rule_id: &str, actor: &str) -> CommandResult {
    let (config, runtime) = match prepare("rules.delete") {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };
    let correlation_id = new_correlation_id();
    let rule_id = RuleId(rule_id.to_string());

    let result = runtime.block_on(async {
        let pool = open_database(&config).await?;
        let services = Services::new(&pool, &config);
        let deleted = services.administration.delete(&rule_id, actor, &correlation_id).await;
        let audit_events = services.audit_events();
        pool.close().await;

        deleted.map_err(|error| CommandError::application(error, &correlation_id))?;
        Ok::<_, CommandError>(DeletedRule { rule_id: rule_id.clone(), audit_events })
    });

    match result {
        Ok(deleted) => CommandResult::success_with(
            "rules.delete",
            format!("deleted rule {}", deleted.rule_id),
            &deleted,
        ),
        Err(error) => error.into_result("rules.delete"),
    }
}

/// Drafts are read from JSON files in the flat administrator shape.
fn read_draft(path: &Path) -> Result<ApprovalRuleDraft> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read rule draft {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("rule draft {} is not valid JSON for a rule", path.display()))
}
