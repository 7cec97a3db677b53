use crate::commands::{open_database, prepare, CommandFailure, CommandResult};
use claimflow_db::{DemoSeedDataset, SeedResult};

pub fn run() -> CommandResult {
    let (config, runtime) = match prepare("seed") {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = open_database(&config).await?;

        let seed_result = DemoSeedDataset::load(&pool)
            .await
            .map_err(|error| ("seed_execution", error.to_string(), 5u8))?;
        let verification = DemoSeedDataset::verify(&pool)
            .await
            .map_err(|error| ("seed_verification", error.to_string(), 6u8))?;

        let run_result: Result<SeedResult, CommandFailure> = if verification.all_present {
            Ok(seed_result)
        } else {
            let failed_checks = verification
                .checks
                .iter()
                .filter_map(|(check, passed)| (!passed).then_some(*check))
                .collect::<Vec<_>>();
            Err((
                "seed_verification",
                format!("seed verification failed for checks: {}", failed_checks.join(", ")),
                6u8,
            ))
        };

        pool.close().await;
        run_result
    });

    match result {
        Ok(seeded) => {
            let claim_lines: Vec<String> = seeded
                .claims
                .iter()
                .map(|claim| format!("  - {} ({})", claim.claim_id, claim.description))
                .collect();
            let message = format!(
                "seeded organization {} with {} profiles, {} rules and {} claims:\n{}",
                seeded.organization_id,
                seeded.profiles,
                seeded.rules,
                seeded.claims.len(),
                claim_lines.join("\n")
            );
            CommandResult::success_with("seed", message, &seeded)
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("seed", error_class, message, exit_code)
        }
    }
}
