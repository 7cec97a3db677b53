use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::identity::{OrganizationId, UserId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleId(pub String);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Sequential,
    Percentage,
    SpecificApprover,
    Hybrid,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Percentage => "percentage",
            Self::SpecificApprover => "specific_approver",
            Self::Hybrid => "hybrid",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sequential" => Some(Self::Sequential),
            "percentage" => Some(Self::Percentage),
            "specific_approver" => Some(Self::SpecificApprover),
            "hybrid" => Some(Self::Hybrid),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencedApprover {
    pub approver: UserId,
    pub sequence: u32,
}

impl SequencedApprover {
    pub fn new(approver: impl Into<String>, sequence: u32) -> Self {
        Self { approver: UserId(approver.into()), sequence }
    }
}

/// Inclusive converted-amount range a rule is scoped to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmountThreshold {
    #[serde(default)]
    pub min: Decimal,
    #[serde(default)]
    pub max: Option<Decimal>,
}

impl AmountThreshold {
    pub fn covers(&self, amount: Decimal) -> bool {
        if amount < self.min {
            return false;
        }
        self.max.map_or(true, |max| amount <= max)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
    Sequential {
        approvers: Vec<SequencedApprover>,
    },
    Percentage {
        approvers: Vec<SequencedApprover>,
        percentage_required: u8,
    },
    SpecificApprover {
        designated: Vec<UserId>,
    },
    Hybrid {
        designated: Vec<UserId>,
        #[serde(default)]
        approvers: Vec<SequencedApprover>,
        #[serde(default)]
        percentage_required: Option<u8>,
    },
}

impl RuleKind {
    pub fn rule_type(&self) -> RuleType {
        match self {
            Self::Sequential { .. } => RuleType::Sequential,
            Self::Percentage { .. } => RuleType::Percentage,
            Self::SpecificApprover { .. } => RuleType::SpecificApprover,
            Self::Hybrid { .. } => RuleType::Hybrid,
        }
    }

    pub fn validate(&self) -> Result<(), RuleValidationError> {
        let rule_type = self.rule_type();
        match self {
            Self::Sequential { approvers } => {
                if approvers.is_empty() {
                    return Err(RuleValidationError::NoApprovers { rule_type });
                }
                validate_sequence(approvers)
            }
            Self::Percentage { approvers, percentage_required } => {
                validate_percentage(*percentage_required)?;
                if approvers.is_empty() {
                    return Err(RuleValidationError::NoApprovers { rule_type });
                }
                Ok(())
            }
            Self::SpecificApprover { designated } => {
                if designated.is_empty() {
                    return Err(RuleValidationError::NoDesignatedApprovers { rule_type });
                }
                Ok(())
            }
            Self::Hybrid { designated, percentage_required, .. } => {
                if designated.is_empty() {
                    return Err(RuleValidationError::NoDesignatedApprovers { rule_type });
                }
                if let Some(percentage_required) = percentage_required {
                    validate_percentage(*percentage_required)?;
                }
                Ok(())
            }
        }
    }
}

fn validate_percentage(value: u8) -> Result<(), RuleValidationError> {
    if (1..=100).contains(&value) {
        Ok(())
    } else {
        Err(RuleValidationError::PercentageOutOfRange { value })
    }
}

/// Sequence numbers must be exactly `1..=N`.
fn validate_sequence(approvers: &[SequencedApprover]) -> Result<(), RuleValidationError> {
    let mut seen = BTreeSet::new();
    for entry in approvers {
        if !seen.insert(entry.sequence) {
            return Err(RuleValidationError::DuplicateSequence { sequence: entry.sequence });
        }
    }

    let expected_len = u32::try_from(approvers.len()).unwrap_or(u32::MAX);
    match (1..=expected_len).find(|sequence| !seen.contains(sequence)) {
        Some(sequence) => Err(RuleValidationError::MissingSequence { sequence }),
        None => Ok(()),
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RuleValidationError {
    #[error("rule name must not be empty")]
    EmptyName,
    #[error("{} rules require at least one approver", .rule_type.as_str())]
    NoApprovers { rule_type: RuleType },
    #[error("{} rules require at least one designated approver", .rule_type.as_str())]
    NoDesignatedApprovers { rule_type: RuleType },
    #[error("{} rules require a percentage value", .rule_type.as_str())]
    MissingPercentage { rule_type: RuleType },
    #[error("percentage_required must be in range 1..=100, got {value}")]
    PercentageOutOfRange { value: u8 },
    #[error("approver sequence {sequence} is assigned more than once")]
    DuplicateSequence { sequence: u32 },
    #[error("approver sequence {sequence} is missing")]
    MissingSequence { sequence: u32 },
    #[error("amount threshold min must not be negative, got {min}")]
    NegativeThreshold { min: Decimal },
    #[error("amount threshold max {max} is below min {min}")]
    InvertedThreshold { min: Decimal, max: Decimal },
}

fn validate_threshold(threshold: Option<&AmountThreshold>) -> Result<(), RuleValidationError> {
    let Some(threshold) = threshold else {
        return Ok(());
    };

    if threshold.min < Decimal::ZERO {
        return Err(RuleValidationError::NegativeThreshold { min: threshold.min });
    }
    if let Some(max) = threshold.max {
        if max < threshold.min {
            return Err(RuleValidationError::InvertedThreshold { min: threshold.min, max });
        }
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub id: RuleId,
    pub organization_id: OrganizationId,
    pub name: String,
    pub kind: RuleKind,
    pub amount_threshold: Option<AmountThreshold>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalRule {
    pub fn rule_type(&self) -> RuleType {
        self.kind.rule_type()
    }

    /// Active and scoped to `converted_amount`.
    pub fn applies_to(&self, converted_amount: Decimal) -> bool {
        self.is_active
            && self
                .amount_threshold
                .as_ref()
                .map_or(true, |threshold| threshold.covers(converted_amount))
    }

    pub fn validate(&self) -> Result<(), RuleValidationError> {
        if self.name.trim().is_empty() {
            return Err(RuleValidationError::EmptyName);
        }
        validate_threshold(self.amount_threshold.as_ref())?;
        self.kind.validate()
    }

    /// Applies `update` and revalidates. The rule is left untouched on error.
    pub fn apply_update(
        &mut self,
        update: RuleUpdate,
        now: DateTime<Utc>,
    ) -> Result<(), RuleValidationError> {
        let mut next = self.clone();
        if let Some(name) = update.name {
            next.name = name;
        }
        if let Some(kind) = update.kind {
            next.kind = kind;
        }
        if let Some(amount_threshold) = update.amount_threshold {
            next.amount_threshold = amount_threshold;
        }
        if let Some(is_active) = update.is_active {
            next.is_active = is_active;
        }
        next.validate()?;

        next.updated_at = now;
        *self = next;
        Ok(())
    }
}

/// A rule as an administrator submits it: flat fields, checked on `build`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRuleDraft {
    pub name: String,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    #[serde(default)]
    pub approvers: Vec<SequencedApprover>,
    #[serde(default)]
    pub percentage_required: Option<u8>,
    #[serde(default)]
    pub specific_approvers: Vec<UserId>,
    #[serde(default)]
    pub amount_threshold: Option<AmountThreshold>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl ApprovalRuleDraft {
    pub fn into_kind(self) -> Result<RuleKind, RuleValidationError> {
        let rule_type = self.rule_type;
        let kind = match rule_type {
            RuleType::Sequential => RuleKind::Sequential { approvers: self.approvers },
            RuleType::Percentage => RuleKind::Percentage {
                percentage_required: self
                    .percentage_required
                    .ok_or(RuleValidationError::MissingPercentage { rule_type })?,
                approvers: self.approvers,
            },
            RuleType::SpecificApprover => {
                RuleKind::SpecificApprover { designated: self.specific_approvers }
            }
            RuleType::Hybrid => RuleKind::Hybrid {
                designated: self.specific_approvers,
                approvers: self.approvers,
                percentage_required: self.percentage_required,
            },
        };
        kind.validate()?;
        Ok(kind)
    }

    pub fn build(
        self,
        id: RuleId,
        organization_id: OrganizationId,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRule, RuleValidationError> {
        let name = self.name.trim().to_string();
        let amount_threshold = self.amount_threshold.clone();
        let is_active = self.is_active;
        let kind = self.into_kind()?;

        let rule = ApprovalRule {
            id,
            organization_id,
            name,
            kind,
            amount_threshold,
            is_active,
            created_at: now,
            updated_at: now,
        };
        rule.validate()?;
        Ok(rule)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleUpdate {
    pub name: Option<String>,
    pub kind: Option<RuleKind>,
    pub amount_threshold: Option<Option<AmountThreshold>>,
    pub is_active: Option<bool>,
}
