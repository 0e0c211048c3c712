use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// One lot image to acquire, as produced by the export parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReference {
    pub logical_id: String,
    pub primary_url: String,
    pub house_name: String,
    #[serde(default)]
    pub candidate_hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl ImageReference {
    pub fn new(
        logical_id: impl Into<String>,
        primary_url: impl Into<String>,
        house_name: impl Into<String>,
    ) -> Self {
        Self {
            logical_id: logical_id.into(),
            primary_url: primary_url.into(),
            house_name: house_name.into(),
            candidate_hosts: Vec::new(),
            title: None,
        }
    }

    pub fn with_candidate_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.candidate_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Checks the invariants the pipeline relies on. The logical id doubles
    /// as a path segment for cache lookups and storage keys, so separators
    /// and dot segments are rejected.
    pub fn validate(&self) -> Result<(), String> {
        let id = self.logical_id.trim();
        if id.is_empty() {
            return Err("empty logical_id".into());
        }
        if id != self.logical_id
            || id == "."
            || id == ".."
            || id.contains(['/', '\\', '\0'])
        {
            return Err(format!("logical_id not path safe: {:?}", self.logical_id));
        }
        if self.house_name.trim().is_empty() {
            return Err(format!("empty house_name for {id}"));
        }
        match reqwest::Url::parse(&self.primary_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.host_str().is_some() => {
                Ok(())
            }
            Ok(_) => Err(format!("unsupported primary_url for {id}: {}", self.primary_url)),
            Err(err) => Err(format!("invalid primary_url for {id}: {err}")),
        }
    }
}

/// Why a single strategy attempt did not produce bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "code", content = "status")]
pub enum ReasonCode {
    Timeout,
    Connect,
    HttpStatus(u16),
    NotAnImage,
    EmptyBody,
    NoCandidates,
    NotConfigured,
    CacheMiss,
    Io,
    Undecodable,
    Storage,
    Synthesis,
    Cancelled,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::Timeout => "timeout",
            ReasonCode::Connect => "connect",
            ReasonCode::HttpStatus(_) => "http_status",
            ReasonCode::NotAnImage => "not_an_image",
            ReasonCode::EmptyBody => "empty_body",
            ReasonCode::NoCandidates => "no_candidates",
            ReasonCode::NotConfigured => "not_configured",
            ReasonCode::CacheMiss => "cache_miss",
            ReasonCode::Io => "io",
            ReasonCode::Undecodable => "undecodable",
            ReasonCode::Storage => "storage",
            ReasonCode::Synthesis => "synthesis",
            ReasonCode::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReasonCode::HttpStatus(status) => write!(f, "http_status {status}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// What a strategy hands back. Either all success fields are present or the
/// failure pair is; there is no partial state.
#[derive(Debug, Clone)]
pub enum StrategyResult {
    Success {
        bytes: Bytes,
        content_type: String,
        source_strategy: String,
    },
    Failure {
        reason_code: ReasonCode,
        strategy_name: String,
    },
}

impl StrategyResult {
    pub fn success(
        strategy: impl Into<String>,
        bytes: impl Into<Bytes>,
        content_type: impl Into<String>,
    ) -> Self {
        StrategyResult::Success {
            bytes: bytes.into(),
            content_type: content_type.into(),
            source_strategy: strategy.into(),
        }
    }

    pub fn failure(strategy: impl Into<String>, reason_code: ReasonCode) -> Self {
        StrategyResult::Failure {
            reason_code,
            strategy_name: strategy.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StrategyResult::Success { .. })
    }

    pub fn strategy(&self) -> &str {
        match self {
            StrategyResult::Success {
                source_strategy, ..
            } => source_strategy,
            StrategyResult::Failure { strategy_name, .. } => strategy_name,
        }
    }
}

/// The recorded form of one attempt. Payload bytes are not retained so that
/// finished outcomes stay small however large the batch is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub strategy: String,
    #[serde(flatten)]
    pub result: AttemptResult,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AttemptResult {
    Success { content_type: String, byte_len: usize },
    Failure { reason: ReasonCode },
}

impl AttemptRecord {
    pub fn from_result(result: &StrategyResult, elapsed: Duration) -> Self {
        let elapsed_ms = elapsed.as_millis() as u64;
        match result {
            StrategyResult::Success {
                bytes,
                content_type,
                source_strategy,
            } => Self {
                strategy: source_strategy.clone(),
                result: AttemptResult::Success {
                    content_type: content_type.clone(),
                    byte_len: bytes.len(),
                },
                elapsed_ms,
            },
            StrategyResult::Failure {
                reason_code,
                strategy_name,
            } => Self {
                strategy: strategy_name.clone(),
                result: AttemptResult::Failure {
                    reason: *reason_code,
                },
                elapsed_ms,
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.result, AttemptResult::Success { .. })
    }

    pub fn reason(&self) -> Option<ReasonCode> {
        match self.result {
            AttemptResult::Failure { reason } => Some(reason),
            AttemptResult::Success { .. } => None,
        }
    }

    /// Turns a success whose bytes were later rejected (undecodable, not
    /// storable) into the failure that actually happened.
    pub fn downgrade(&mut self, reason: ReasonCode) {
        self.result = AttemptResult::Failure { reason };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Stored,
    Placeholder,
    Failed,
}

impl FinalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalStatus::Stored => "stored",
            FinalStatus::Placeholder => "placeholder",
            FinalStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionOutcome {
    pub logical_id: String,
    pub final_status: FinalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_uri: Option<String>,
    pub attempts: Vec<AttemptRecord>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
}

impl AcquisitionOutcome {
    /// Name of the strategy whose bytes ended up stored, if any.
    pub fn source_strategy(&self) -> Option<&str> {
        if self.final_status == FinalStatus::Failed {
            return None;
        }
        self.attempts
            .last()
            .filter(|attempt| attempt.is_success())
            .map(|attempt| attempt.strategy.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub stored: usize,
    pub placeholder: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
}

impl BatchSummary {
    pub fn from_outcomes(outcomes: &[AcquisitionOutcome], elapsed: Duration) -> Self {
        let mut summary = BatchSummary {
            total: outcomes.len(),
            elapsed_ms: elapsed.as_millis() as u64,
            ..Default::default()
        };
        for outcome in outcomes {
            match outcome.final_status {
                FinalStatus::Stored => summary.stored += 1,
                FinalStatus::Placeholder => summary.placeholder += 1,
                FinalStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }
}
