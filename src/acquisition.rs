//! Per-item walk over the strategy chain.
//!
//! States move strictly forward: `Pending -> Attempting(0) -> ... ->
//! Attempting(n)` and then into exactly one of `Succeeded` or `Exhausted`.
//! Strategies are tried one at a time in chain order; the first success
//! ends the walk and later strategies are never invoked.

use crate::metrics;
use crate::models::{AttemptRecord, ImageReference, ReasonCode, StrategyResult};
use crate::strategy::{ChainEntry, FailureHint, PreviousFailure, StrategyChain};
use bytes::Bytes;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    Pending,
    Attempting(usize),
    Succeeded,
    Exhausted,
}

impl AcquisitionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AcquisitionState::Succeeded | AcquisitionState::Exhausted)
    }

    fn permits(&self, next: AcquisitionState) -> bool {
        use AcquisitionState::*;
        match (*self, next) {
            (Pending, Attempting(0)) => true,
            (Attempting(i), Attempting(j)) => j == i + 1,
            (Attempting(_), Succeeded | Exhausted) => true,
            _ => false,
        }
    }
}

/// Bytes produced by the successful attempt, held only until they are
/// normalized and stored.
#[derive(Debug, Clone)]
pub struct Payload {
    pub bytes: Bytes,
    pub content_type: String,
    pub strategy: String,
    pub is_placeholder: bool,
}

#[derive(Debug)]
pub struct ChainWalk {
    pub state: AcquisitionState,
    pub attempts: Vec<AttemptRecord>,
    pub payload: Option<Payload>,
    pub cancelled: bool,
}

struct Machine {
    state: AcquisitionState,
}

impl Machine {
    fn advance(&mut self, next: AcquisitionState) {
        debug_assert!(
            self.state.permits(next),
            "illegal transition {:?} -> {next:?}",
            self.state
        );
        self.state = next;
    }
}

/// Walks `chain` for `reference` until one strategy succeeds or every
/// strategy has failed. Never returns an error: every failure, including
/// cancellation, is recorded as an attempt.
pub async fn acquire(
    chain: &StrategyChain,
    reference: &ImageReference,
    cancel: &CancellationToken,
) -> ChainWalk {
    let mut machine = Machine {
        state: AcquisitionState::Pending,
    };
    let mut attempts = Vec::with_capacity(chain.len());
    let mut hint = FailureHint::default();
    let mut cancelled = false;

    for (idx, entry) in chain.entries().iter().enumerate() {
        machine.advance(AcquisitionState::Attempting(idx));
        let (record, result) = run_entry(entry, reference, &hint, cancel).await;
        attempts.push(record);

        match result {
            StrategyResult::Success {
                bytes,
                content_type,
                ..
            } => {
                machine.advance(AcquisitionState::Succeeded);
                return ChainWalk {
                    state: machine.state,
                    attempts,
                    payload: Some(Payload {
                        bytes,
                        content_type,
                        strategy: entry.strategy.name().to_string(),
                        is_placeholder: entry.strategy.is_placeholder(),
                    }),
                    cancelled,
                };
            }
            StrategyResult::Failure { reason_code, .. } => {
                if reason_code == ReasonCode::Cancelled {
                    cancelled = true;
                    break;
                }
                hint = FailureHint {
                    position: idx + 1,
                    previous: Some(PreviousFailure {
                        strategy: entry.strategy.name().to_string(),
                        reason: reason_code,
                    }),
                };
            }
        }
    }

    machine.advance(AcquisitionState::Exhausted);
    warn!(
        target = "valuer.acquire",
        lot_ref = %reference.logical_id,
        attempts = attempts.len(),
        cancelled,
        "chain_exhausted"
    );
    ChainWalk {
        state: machine.state,
        attempts,
        payload: None,
        cancelled,
    }
}

/// Runs only the chain's terminal synthesis strategy. Used when bytes from
/// an earlier success turn out to be unusable after the walk finished.
pub async fn synthesize(
    chain: &StrategyChain,
    reference: &ImageReference,
    after: PreviousFailure,
    cancel: &CancellationToken,
) -> Option<(AttemptRecord, Option<Payload>)> {
    let entry = chain.entries().last().filter(|e| e.strategy.is_placeholder())?;
    let hint = FailureHint {
        position: chain.len() - 1,
        previous: Some(after),
    };
    let (record, result) = run_entry(entry, reference, &hint, cancel).await;
    let payload = match result {
        StrategyResult::Success {
            bytes,
            content_type,
            ..
        } => Some(Payload {
            bytes,
            content_type,
            strategy: entry.strategy.name().to_string(),
            is_placeholder: true,
        }),
        StrategyResult::Failure { .. } => None,
    };
    Some((record, payload))
}

/// One attempt under the entry's timeout and the batch cancellation token.
/// The synthesis strategy is not subject to a timeout.
async fn run_entry(
    entry: &ChainEntry,
    reference: &ImageReference,
    hint: &FailureHint,
    cancel: &CancellationToken,
) -> (AttemptRecord, StrategyResult) {
    let name = entry.strategy.name();
    let started = Instant::now();

    let result = if cancel.is_cancelled() {
        StrategyResult::failure(name, ReasonCode::Cancelled)
    } else if entry.strategy.is_placeholder() {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => StrategyResult::failure(name, ReasonCode::Cancelled),
            result = entry.strategy.attempt(reference, hint) => result,
        }
    } else {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => StrategyResult::failure(name, ReasonCode::Cancelled),
            outcome = tokio::time::timeout(entry.timeout, entry.strategy.attempt(reference, hint)) => {
                outcome.unwrap_or_else(|_| StrategyResult::failure(name, ReasonCode::Timeout))
            }
        }
    };

    // A success must carry bytes; the recorded name is always the entry's.
    let result = match result {
        StrategyResult::Success { ref bytes, .. } if bytes.is_empty() => {
            StrategyResult::failure(name, ReasonCode::EmptyBody)
        }
        other => other,
    };
    let elapsed = started.elapsed();
    let mut record = AttemptRecord::from_result(&result, elapsed);
    record.strategy = name.to_string();

    metrics::strategy_attempt(name, record.is_success(), elapsed.as_millis());
    debug!(
        target = "valuer.acquire",
        lot_ref = %reference.logical_id,
        strategy = name,
        position = hint.position,
        success = record.is_success(),
        reason = record.reason().map(|r| r.to_string()).unwrap_or_default(),
        elapsed_ms = record.elapsed_ms,
        "strategy_attempt"
    );
    (record, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::testing::*;
    use std::{sync::Arc, time::Duration};

    fn reference(id: &str) -> ImageReference {
        ImageReference::new(id, "https://image.example.com/a.jpg", "House")
    }

    #[test]
    fn transitions_only_move_forward() {
        use AcquisitionState::*;
        assert!(Pending.permits(Attempting(0)));
        assert!(Attempting(0).permits(Attempting(1)));
        assert!(Attempting(2).permits(Succeeded));
        assert!(Attempting(2).permits(Exhausted));
        assert!(!Attempting(1).permits(Attempting(0)));
        assert!(!Attempting(0).permits(Attempting(2)));
        assert!(!Succeeded.permits(Attempting(0)));
        assert!(!Pending.permits(Succeeded));
        assert!(Exhausted.is_terminal());
    }

    #[tokio::test]
    async fn first_success_short_circuits() {
        let direct = Arc::new(
            ScriptedStrategy::new("direct").with("L-1", Script::Fail(ReasonCode::HttpStatus(403))),
        );
        let alternate = Arc::new(
            ScriptedStrategy::new("alternate_host")
                .with("L-1", Script::Bytes(jpeg_fixture(8, 8), "image/jpeg")),
        );
        let origin = Arc::new(ScriptedStrategy::new("origin_ip"));
        let chain = StrategyChain::new(
            vec![
                entry(direct.clone()),
                entry(alternate.clone()),
                entry(origin.clone()),
                placeholder_entry(),
            ],
            false,
        )
        .expect("chain");

        let walk = acquire(&chain, &reference("L-1"), &CancellationToken::new()).await;
        assert_eq!(walk.state, AcquisitionState::Succeeded);
        assert_eq!(walk.attempts.len(), 2);
        assert_eq!(walk.attempts[0].reason(), Some(ReasonCode::HttpStatus(403)));
        assert!(walk.attempts[1].is_success());
        let payload = walk.payload.expect("payload");
        assert_eq!(payload.strategy, "alternate_host");
        assert!(!payload.is_placeholder);
        assert_eq!(direct.calls(), 1);
        assert_eq!(alternate.calls(), 1);
        assert_eq!(origin.calls(), 0);
    }

    #[tokio::test]
    async fn exhausted_network_chain_ends_in_placeholder() {
        let direct = Arc::new(ScriptedStrategy::new("direct"));
        let alternate = Arc::new(ScriptedStrategy::new("alternate_host"));
        let chain = StrategyChain::new(
            vec![entry(direct), entry(alternate), placeholder_entry()],
            false,
        )
        .expect("chain");

        let walk = acquire(&chain, &reference("L-2"), &CancellationToken::new()).await;
        assert_eq!(walk.state, AcquisitionState::Succeeded);
        assert_eq!(walk.attempts.len(), 3);
        let names: Vec<_> = walk.attempts.iter().map(|a| a.strategy.as_str()).collect();
        assert_eq!(names, vec!["direct", "alternate_host", "placeholder"]);
        assert!(walk.payload.expect("payload").is_placeholder);
    }

    #[tokio::test]
    async fn strict_chain_can_exhaust() {
        let direct = Arc::new(ScriptedStrategy::new("direct"));
        let chain = StrategyChain::new(vec![entry(direct)], true).expect("chain");
        let walk = acquire(&chain, &reference("L-3"), &CancellationToken::new()).await;
        assert_eq!(walk.state, AcquisitionState::Exhausted);
        assert!(walk.payload.is_none());
        assert_eq!(walk.attempts.len(), 1);
    }

    #[tokio::test]
    async fn stalled_strategy_times_out_and_walk_continues() {
        let stall = Arc::new(ScriptedStrategy::new("direct").with("L-4", Script::Stall));
        let chain = StrategyChain::new(
            vec![
                ChainEntry::new(stall, Duration::from_millis(50)),
                placeholder_entry(),
            ],
            false,
        )
        .expect("chain");
        let walk = acquire(&chain, &reference("L-4"), &CancellationToken::new()).await;
        assert_eq!(walk.attempts[0].reason(), Some(ReasonCode::Timeout));
        assert!(walk.attempts[1].is_success());
    }

    #[tokio::test]
    async fn cancellation_abandons_in_flight_attempt() {
        let stall = Arc::new(ScriptedStrategy::new("direct").with("L-5", Script::Stall));
        let chain = StrategyChain::new(vec![entry(stall), placeholder_entry()], false)
            .expect("chain");
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let walk = acquire(&chain, &reference("L-5"), &token).await;
        assert!(walk.cancelled);
        assert_eq!(walk.state, AcquisitionState::Exhausted);
        assert_eq!(walk.attempts.len(), 1);
        assert_eq!(walk.attempts[0].reason(), Some(ReasonCode::Cancelled));
    }

    #[tokio::test]
    async fn empty_success_is_recorded_as_failure() {
        let empty = Arc::new(
            ScriptedStrategy::new("direct").with("L-6", Script::Bytes(Vec::new(), "image/jpeg")),
        );
        let chain = StrategyChain::new(vec![entry(empty), placeholder_entry()], false)
            .expect("chain");
        let walk = acquire(&chain, &reference("L-6"), &CancellationToken::new()).await;
        assert_eq!(walk.attempts[0].reason(), Some(ReasonCode::EmptyBody));
        assert_eq!(walk.attempts.len(), 2);
    }

    #[tokio::test]
    async fn synthesize_requires_placeholder() {
        let strict = StrategyChain::new(
            vec![entry(Arc::new(ScriptedStrategy::new("direct")))],
            true,
        )
        .expect("chain");
        let after = PreviousFailure {
            strategy: "direct".into(),
            reason: ReasonCode::Undecodable,
        };
        assert!(
            synthesize(&strict, &reference("L-7"), after.clone(), &CancellationToken::new())
                .await
                .is_none()
        );

        let lenient = StrategyChain::new(vec![placeholder_entry()], false).expect("chain");
        let (record, payload) =
            synthesize(&lenient, &reference("L-7"), after, &CancellationToken::new())
                .await
                .expect("placeholder");
        assert!(record.is_success());
        assert!(payload.is_some());
    }
}
