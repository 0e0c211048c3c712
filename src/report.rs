use crate::models::{AcquisitionOutcome, FinalStatus};
use tracing::{info, warn};

/// Receives each finished outcome exactly once. Calls are fire-and-forget:
/// implementations must not block the worker and have no way to fail it.
pub trait OutcomeReporter: Send + Sync {
    fn report(&self, outcome: &AcquisitionOutcome);
}

/// Default reporter: one structured log line per item.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl OutcomeReporter for TracingReporter {
    fn report(&self, outcome: &AcquisitionOutcome) {
        let source = outcome.source_strategy().unwrap_or("none");
        match outcome.final_status {
            FinalStatus::Failed => {
                let last_reason = outcome
                    .attempts
                    .last()
                    .and_then(|attempt| attempt.reason())
                    .map(|reason| reason.to_string())
                    .unwrap_or_default();
                warn!(
                    target = "valuer.report",
                    lot_ref = %outcome.logical_id,
                    status = outcome.final_status.as_str(),
                    attempts = outcome.attempts.len(),
                    reason = %last_reason,
                    elapsed_ms = outcome.duration_ms,
                    "item_failed"
                );
            }
            status => {
                info!(
                    target = "valuer.report",
                    lot_ref = %outcome.logical_id,
                    status = status.as_str(),
                    strategy = source,
                    attempts = outcome.attempts.len(),
                    uri = outcome.storage_uri.as_deref().unwrap_or_default(),
                    elapsed_ms = outcome.duration_ms,
                    "item_finished"
                );
            }
        }
    }
}
