pub mod administration;
pub mod connection;
pub mod fixtures;
pub mod migrations;
pub mod repositories;
pub mod workflow;

pub use administration::RuleAdministration;
pub use connection::{connect, connect_with_config, connect_with_settings, DbPool};
pub use fixtures::{DemoSeedDataset, SeedResult, VerificationResult, DEMO_ORGANIZATION_ID};
pub use repositories::RepositoryError;
pub use workflow::{ClaimAssessment, DecisionCommand, DecisionReceipt, DecisionWorkflow};
