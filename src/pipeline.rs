use crate::acquisition::{self, Payload};
use crate::config::PipelineConfig;
use crate::metrics;
use crate::models::{
    AcquisitionOutcome, AttemptRecord, FinalStatus, ImageReference, ReasonCode, StrategyResult,
};
use crate::normalize::Normalizer;
use crate::report::{OutcomeReporter, TracingReporter};
use crate::storage::{StorageSink, sink_from_config, storage_key};
use crate::strategy::{PreviousFailure, StrategyChain};
use chrono::Utc;
use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Per-item processor: acquire, normalize, store, report.
///
/// Cheap to clone; every collaborator is shared behind an `Arc` and the
/// chain is never mutated after construction.
#[derive(Clone)]
pub struct Pipeline {
    chain: Arc<StrategyChain>,
    normalizer: Normalizer,
    sink: Arc<dyn StorageSink>,
    reporter: Arc<dyn OutcomeReporter>,
}

impl Pipeline {
    pub fn new(
        chain: StrategyChain,
        normalizer: Normalizer,
        sink: Arc<dyn StorageSink>,
        reporter: Arc<dyn OutcomeReporter>,
    ) -> Self {
        Self {
            chain: Arc::new(chain),
            normalizer,
            sink,
            reporter,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let chain = StrategyChain::from_config(config)?;
        let sink = sink_from_config(config)
            .map_err(|err| PipelineError::config("storage", err.to_string()))?;
        Ok(Self::new(
            chain,
            Normalizer::from_config(config),
            sink,
            Arc::new(TracingReporter),
        ))
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn OutcomeReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn chain(&self) -> &StrategyChain {
        &self.chain
    }

    /// Rejects the batch before any work starts if a reference is malformed
    /// or two references share a logical id.
    pub fn validate_batch(references: &[ImageReference]) -> Result<(), PipelineError> {
        let mut seen = HashSet::with_capacity(references.len());
        for reference in references {
            reference
                .validate()
                .map_err(|msg| PipelineError::invalid_input("validate_input", msg))?;
            if !seen.insert(reference.logical_id.as_str()) {
                return Err(PipelineError::invalid_input(
                    "validate_input",
                    format!("duplicate logical_id {}", reference.logical_id),
                ));
            }
        }
        Ok(())
    }

    /// Runs one item end to end and hands the outcome to the reporter.
    pub async fn process(
        &self,
        reference: &ImageReference,
        cancel: &CancellationToken,
    ) -> AcquisitionOutcome {
        let started_at = Utc::now();
        let clock = Instant::now();

        let walk = acquisition::acquire(&self.chain, reference, cancel).await;
        let mut attempts = walk.attempts;
        let (final_status, storage_uri) = match walk.payload {
            Some(payload) => self.settle(reference, payload, &mut attempts, cancel).await,
            None => (FinalStatus::Failed, None),
        };

        let outcome = AcquisitionOutcome {
            logical_id: reference.logical_id.clone(),
            final_status,
            storage_uri,
            attempts,
            duration_ms: clock.elapsed().as_millis() as u64,
            started_at,
        };
        metrics::item_finished(outcome.final_status.as_str(), clock.elapsed().as_millis());
        self.reporter.report(&outcome);
        outcome
    }

    /// Outcome for an item that never ran to completion: the batch was
    /// cancelled before it started, or its worker died.
    pub fn abandoned_outcome(&self, reference: &ImageReference) -> AcquisitionOutcome {
        let first = self.chain.names().first().copied().unwrap_or_default();
        let outcome = AcquisitionOutcome {
            logical_id: reference.logical_id.clone(),
            final_status: FinalStatus::Failed,
            storage_uri: None,
            attempts: vec![AttemptRecord::from_result(
                &StrategyResult::failure(first, ReasonCode::Cancelled),
                Duration::ZERO,
            )],
            duration_ms: 0,
            started_at: Utc::now(),
        };
        self.reporter.report(&outcome);
        outcome
    }

    /// Normalizes and stores the payload. When either step rejects the bytes
    /// the success is rewritten as that failure and the placeholder is tried
    /// in its place; a rejected placeholder ends the item as `Failed`.
    async fn settle(
        &self,
        reference: &ImageReference,
        payload: Payload,
        attempts: &mut Vec<AttemptRecord>,
        cancel: &CancellationToken,
    ) -> (FinalStatus, Option<String>) {
        let key = storage_key(reference);
        let mut current = payload;
        loop {
            let reason = match self.finish(reference, &key, &current).await {
                Ok(uri) => {
                    let status = if current.is_placeholder {
                        FinalStatus::Placeholder
                    } else {
                        FinalStatus::Stored
                    };
                    return (status, Some(uri));
                }
                Err(reason) => reason,
            };
            if let Some(last) = attempts.last_mut() {
                last.downgrade(reason);
            }
            if current.is_placeholder {
                return (FinalStatus::Failed, None);
            }

            let after = PreviousFailure {
                strategy: current.strategy.clone(),
                reason,
            };
            let Some((record, next)) =
                acquisition::synthesize(&self.chain, reference, after, cancel).await
            else {
                return (FinalStatus::Failed, None);
            };
            attempts.push(record);
            match next {
                Some(next) => current = next,
                None => return (FinalStatus::Failed, None),
            }
        }
    }

    async fn finish(
        &self,
        reference: &ImageReference,
        key: &str,
        payload: &Payload,
    ) -> Result<String, ReasonCode> {
        let normalized = self
            .normalizer
            .normalize_blocking(payload.bytes.clone())
            .await
            .map_err(|err| {
                warn!(
                    target = "valuer.normalize",
                    lot_ref = %reference.logical_id,
                    strategy = %payload.strategy,
                    content_type = %payload.content_type,
                    error = %err,
                    "normalize_failed"
                );
                ReasonCode::Undecodable
            })?;
        let content_type = normalized.content_type();
        self.sink
            .put(key, normalized.bytes, content_type)
            .await
            .map_err(|err| {
                error!(
                    target = "valuer.storage",
                    lot_ref = %reference.logical_id,
                    key,
                    error = %err,
                    "store_failed"
                );
                ReasonCode::Storage
            })
    }
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    Config,
    Internal,
}

impl PipelineError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::InvalidInput,
        }
    }

    pub fn config(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Config,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Internal,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeMode;
    use crate::report::testing::CollectingReporter;
    use crate::storage::testing::MemorySink;
    use crate::strategy::testing::*;
    use crate::strategy::{ChainEntry, LocalCacheLookup, StrategyKind};

    fn reference(id: &str) -> ImageReference {
        ImageReference::new(
            id,
            format!("https://image.example.com/housePhotos/h/{id}.jpg"),
            "Test House",
        )
    }

    fn pipeline(
        entries: Vec<ChainEntry>,
        sink: Arc<MemorySink>,
        reporter: Arc<CollectingReporter>,
    ) -> Pipeline {
        let chain = StrategyChain::new(entries, false).expect("chain");
        Pipeline::new(chain, Normalizer::new(1200, 85), sink, reporter)
    }

    fn status_of(outcomes: &[AcquisitionOutcome], id: &str) -> FinalStatus {
        outcomes
            .iter()
            .find(|o| o.logical_id == id)
            .map(|o| o.final_status)
            .expect("outcome present")
    }

    #[tokio::test]
    async fn mixed_batch_settles_each_item() {
        let first = Arc::new(ScriptedStrategy::new("direct"));
        let second = Arc::new(
            ScriptedStrategy::new("alternate_host")
                .with("A", Script::Bytes(jpeg_fixture(32, 24), "image/jpeg"))
                .with("C", Script::Bytes(b"<html>denied</html>".to_vec(), "image/jpeg")),
        );
        let sink = Arc::new(MemorySink::default());
        let reporter = Arc::new(CollectingReporter::default());
        let pipeline = pipeline(
            vec![entry(first.clone()), entry(second.clone()), placeholder_entry()],
            sink.clone(),
            reporter.clone(),
        );

        let cancel = CancellationToken::new();
        let mut outcomes = Vec::new();
        for id in ["A", "B", "C"] {
            outcomes.push(pipeline.process(&reference(id), &cancel).await);
        }

        assert_eq!(status_of(&outcomes, "A"), FinalStatus::Stored);
        assert_eq!(status_of(&outcomes, "B"), FinalStatus::Placeholder);
        assert_eq!(status_of(&outcomes, "C"), FinalStatus::Placeholder);
        assert_eq!(first.calls(), 3);

        let a = &outcomes[0];
        assert_eq!(a.source_strategy(), Some("alternate_host"));
        assert_eq!(a.attempts.len(), 2);
        assert!(sink.get("test_house/A/A.jpg").is_some());

        let c = &outcomes[2];
        let reasons: Vec<_> = c.attempts.iter().map(|at| at.reason()).collect();
        assert_eq!(
            reasons,
            vec![
                Some(ReasonCode::HttpStatus(404)),
                Some(ReasonCode::Undecodable),
                None
            ]
        );
        assert_eq!(c.source_strategy(), Some("placeholder"));

        for outcome in &outcomes {
            let last = outcome.attempts.last().expect("attempts");
            assert_eq!(
                last.is_success(),
                outcome.final_status != FinalStatus::Failed
            );
            assert!(outcome.storage_uri.is_some());
            assert!(outcome.attempts.len() <= pipeline.chain().len());
        }
        assert_eq!(reporter.ids(), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn development_local_cache_serves_after_direct_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("D.jpg"), jpeg_fixture(20, 20)).expect("seed cache");

        let config = PipelineConfig {
            mode: RuntimeMode::Development,
            chain: vec![
                StrategyKind::Direct,
                StrategyKind::LocalCache,
                StrategyKind::Placeholder,
            ],
            local_cache_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let configured = StrategyChain::from_config(&config).expect("dev chain");
        assert_eq!(configured.names(), vec!["direct", "local_cache", "placeholder"]);

        let direct = Arc::new(
            ScriptedStrategy::new("direct").with("D", Script::Fail(ReasonCode::Connect)),
        );
        let entries = vec![
            entry(direct.clone()),
            entry(Arc::new(LocalCacheLookup::new(config.local_cache_dir.clone()))),
            placeholder_entry(),
        ];
        let sink = Arc::new(MemorySink::default());
        let reporter = Arc::new(CollectingReporter::default());
        let pipeline = pipeline(entries, sink, reporter);

        let outcome = pipeline
            .process(&reference("D"), &CancellationToken::new())
            .await;
        assert_eq!(outcome.final_status, FinalStatus::Stored);
        assert_eq!(outcome.source_strategy(), Some("local_cache"));
        assert_eq!(outcome.attempts[0].strategy, "direct");
        assert_eq!(outcome.attempts[0].reason(), Some(ReasonCode::Connect));
        assert_eq!(direct.calls(), 1);
    }

    #[tokio::test]
    async fn storage_failure_falls_back_to_placeholder() {
        let direct = Arc::new(
            ScriptedStrategy::new("direct")
                .with("E", Script::Bytes(jpeg_fixture(8, 8), "image/jpeg")),
        );
        let sink = Arc::new(MemorySink::failing(1));
        let pipeline = pipeline(
            vec![entry(direct), placeholder_entry()],
            sink.clone(),
            Arc::new(CollectingReporter::default()),
        );
        let outcome = pipeline
            .process(&reference("E"), &CancellationToken::new())
            .await;
        assert_eq!(outcome.final_status, FinalStatus::Placeholder);
        assert_eq!(outcome.attempts[0].reason(), Some(ReasonCode::Storage));
        assert!(outcome.attempts[1].is_success());
        assert!(sink.get("test_house/E/E.jpg").is_some());
    }

    #[tokio::test]
    async fn failed_placeholder_storage_fails_the_item() {
        let sink = Arc::new(MemorySink::failing(usize::MAX));
        let pipeline = pipeline(
            vec![
                entry(Arc::new(ScriptedStrategy::new("direct"))),
                placeholder_entry(),
            ],
            sink,
            Arc::new(CollectingReporter::default()),
        );
        let outcome = pipeline
            .process(&reference("F"), &CancellationToken::new())
            .await;
        assert_eq!(outcome.final_status, FinalStatus::Failed);
        assert!(outcome.storage_uri.is_none());
        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(outcome.attempts[1].reason(), Some(ReasonCode::Storage));
    }

    #[tokio::test]
    async fn strict_chain_without_placeholder_can_fail() {
        let direct = entry(Arc::new(ScriptedStrategy::new("direct")));
        let chain = StrategyChain::new(vec![direct], true).expect("strict chain");
        let pipeline = Pipeline::new(
            chain,
            Normalizer::new(1200, 85),
            Arc::new(MemorySink::default()),
            Arc::new(CollectingReporter::default()),
        );
        let outcome = pipeline
            .process(&reference("G"), &CancellationToken::new())
            .await;
        assert_eq!(outcome.final_status, FinalStatus::Failed);
        assert!(!outcome.attempts.last().expect("attempt").is_success());
    }

    #[test]
    fn batch_validation_rejects_duplicates_and_bad_references() {
        let ok = vec![reference("A"), reference("B")];
        assert!(Pipeline::validate_batch(&ok).is_ok());

        let dup = vec![reference("A"), reference("A")];
        let err = Pipeline::validate_batch(&dup).expect_err("duplicate");
        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
        assert!(err.detail().contains("duplicate"));

        let bad = vec![ImageReference::new("A", "not a url", "House")];
        let err = Pipeline::validate_batch(&bad).expect_err("bad url");
        assert_eq!(err.stage(), "validate_input");
    }
}
