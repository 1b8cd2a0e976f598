//! One-shot operator commands: read or drive the lock once, no broker.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use doorlock_core::{BridgeConfig, CommandDriver, DriveOutcome, Target};

use crate::commands::phone;
use crate::error::BridgeError;

fn driver(config: &BridgeConfig) -> CommandDriver {
    CommandDriver::new(
        phone(config),
        &config.calibration,
        config.reconcile.clone(),
        config.maintenance.failure_shot_dir.clone(),
    )
}

/// Wake, capture, classify, print.
pub async fn status(config: &BridgeConfig) -> Result<(), BridgeError> {
    let observation = driver(config).observe().await;
    println!("{}", serde_json::to_string_pretty(&observation)?);
    Ok(())
}

/// One drive toward `target`. Ctrl-C aborts it.
pub async fn drive(config: &BridgeConfig, target: Target) -> Result<(), BridgeError> {
    let driver = Arc::new(driver(config));
    let cancel = CancellationToken::new();

    let run = tokio::spawn({
        let driver = Arc::clone(&driver);
        let cancel = cancel.clone();
        async move { driver.execute(target, 1, &cancel).await }
    });
    let abort = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    let outcome = run.await.map_err(|e| BridgeError::Internal {
        message: format!("drive task failed: {e}"),
    })?;
    abort.abort();

    let payload = serde_json::json!({
        "target": target.state(),
        "outcome": describe(outcome),
    });
    println!("{payload}");

    match outcome {
        DriveOutcome::Confirmed => {
            info!(%target, "confirmed");
            Ok(())
        }
        other => Err(BridgeError::NotConfirmed {
            target,
            outcome: describe(other),
        }),
    }
}

fn describe(outcome: DriveOutcome) -> String {
    match outcome {
        DriveOutcome::Confirmed => "confirmed".into(),
        DriveOutcome::TimedOut { last_observed } => {
            format!("timed out (last observed {last_observed})")
        }
        DriveOutcome::Aborted => "aborted".into(),
    }
}

#[cfg(test)]
mod tests {
    use doorlock_core::LockState;

    use super::*;

    #[test]
    fn outcome_descriptions() {
        assert_eq!(describe(DriveOutcome::Confirmed), "confirmed");
        assert_eq!(
            describe(DriveOutcome::TimedOut {
                last_observed: LockState::Unlocked
            }),
            "timed out (last observed UNLOCKED)"
        );
    }
}
