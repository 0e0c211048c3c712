//! Acquisition strategies and the ordered chain that holds them.
//!
//! A strategy is one self-contained way of getting image bytes for a lot.
//! The chain is built once from configuration and shared read-only by every
//! worker; its order is the precedence order.

mod alternate;
mod direct;
mod fetch;
mod host_header;
mod local_cache;
mod origin_ip;
mod placeholder;

pub use alternate::AlternateHostFetch;
pub use direct::DirectFetch;
pub use fetch::FetchError;
pub use host_header::HostHeaderFetch;
pub use local_cache::LocalCacheLookup;
pub use origin_ip::OriginIpFetch;
pub use placeholder::{PlaceholderSynthesis, render_placeholder};

use crate::config::{ConfigError, PipelineConfig};
use crate::http::{ClientOptions, build_client};
use crate::models::{ImageReference, ReasonCode, StrategyResult};
use crate::pipeline::PipelineError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, fmt, sync::Arc, time::Duration};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Direct,
    AlternateHost,
    HostHeader,
    OriginIp,
    LocalCache,
    Placeholder,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 6] = [
        StrategyKind::Direct,
        StrategyKind::AlternateHost,
        StrategyKind::HostHeader,
        StrategyKind::OriginIp,
        StrategyKind::LocalCache,
        StrategyKind::Placeholder,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Direct => "direct",
            StrategyKind::AlternateHost => "alternate_host",
            StrategyKind::HostHeader => "host_header",
            StrategyKind::OriginIp => "origin_ip",
            StrategyKind::LocalCache => "local_cache",
            StrategyKind::Placeholder => "placeholder",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let normalized = name.trim().to_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Context from the walk so far, handed to each strategy.
#[derive(Debug, Clone, Default)]
pub struct FailureHint {
    pub position: usize,
    pub previous: Option<PreviousFailure>,
}

#[derive(Debug, Clone)]
pub struct PreviousFailure {
    pub strategy: String,
    pub reason: ReasonCode,
}

/// A single acquisition technique.
///
/// Implementations must be idempotent and must not treat a failure as
/// anything other than a `StrategyResult::Failure`; the caller enforces the
/// timeout and cancellation.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    /// The synthesis strategy terminates the chain and yields a
    /// `Placeholder` outcome rather than `Stored`.
    fn is_placeholder(&self) -> bool {
        false
    }

    async fn attempt(&self, reference: &ImageReference, hint: &FailureHint) -> StrategyResult;
}

#[derive(Clone)]
pub struct ChainEntry {
    pub strategy: Arc<dyn Strategy>,
    pub timeout: Duration,
}

impl ChainEntry {
    pub fn new(strategy: Arc<dyn Strategy>, timeout: Duration) -> Self {
        Self { strategy, timeout }
    }
}

#[derive(Clone)]
pub struct StrategyChain {
    entries: Vec<ChainEntry>,
    strict: bool,
}

impl fmt::Debug for StrategyChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyChain")
            .field("strategies", &self.names())
            .field("strict", &self.strict)
            .finish()
    }
}

impl StrategyChain {
    /// Validates and freezes a chain.
    ///
    /// Rejected: an empty chain, duplicate names, a placeholder anywhere but
    /// last, and (unless `strict`) a chain without a placeholder.
    pub fn new(entries: Vec<ChainEntry>, strict: bool) -> Result<Self, PipelineError> {
        if entries.is_empty() {
            return Err(PipelineError::config("strategy_chain", "empty strategy chain"));
        }
        let mut seen = HashSet::new();
        for (idx, entry) in entries.iter().enumerate() {
            let name = entry.strategy.name();
            if !seen.insert(name.to_string()) {
                return Err(PipelineError::config(
                    "strategy_chain",
                    format!("duplicate strategy `{name}`"),
                ));
            }
            if entry.strategy.is_placeholder() && idx + 1 != entries.len() {
                return Err(PipelineError::config(
                    "strategy_chain",
                    format!("placeholder strategy `{name}` must be last"),
                ));
            }
            if entry.timeout.is_zero() && !entry.strategy.is_placeholder() {
                return Err(PipelineError::config(
                    "strategy_chain",
                    format!("zero timeout for `{name}`"),
                ));
            }
        }
        let ends_in_placeholder = entries
            .last()
            .is_some_and(|entry| entry.strategy.is_placeholder());
        if !strict && !ends_in_placeholder {
            return Err(PipelineError::config(
                "strategy_chain",
                "missing placeholder synthesis strategy",
            ));
        }
        Ok(Self { entries, strict })
    }

    /// Builds the concrete chain named by the configuration.
    ///
    /// The local-cache strategy is only constructed in development mode; in
    /// production it is dropped from the chain so it can never be attempted.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        // Each network strategy gets a client bounded by its own timeout.
        let client_for = |kind: StrategyKind| {
            build_client(ClientOptions {
                profile: &config.browser,
                mode: config.mode,
                request_timeout: config.timeout_for(kind),
                resolve: None,
            })
            .map_err(client_error)
        };

        let mut entries = Vec::with_capacity(config.chain.len());
        for kind in &config.chain {
            let strategy: Arc<dyn Strategy> = match kind {
                StrategyKind::Direct => Arc::new(DirectFetch::new(
                    client_for(*kind)?,
                    config.retry.clone(),
                )),
                StrategyKind::AlternateHost => Arc::new(AlternateHostFetch::new(
                    client_for(*kind)?,
                    config.retry.clone(),
                )),
                StrategyKind::HostHeader => Arc::new(HostHeaderFetch::new(
                    client_for(*kind)?,
                    config.edge_address.clone(),
                    config.edge_scheme.clone(),
                    config.retry.clone(),
                )),
                StrategyKind::OriginIp => {
                    Arc::new(OriginIpFetch::from_config(config).map_err(client_error)?)
                }
                StrategyKind::LocalCache => {
                    if !config.mode.is_development() {
                        info!(
                            target = "valuer.strategy",
                            "local_cache_skipped_in_production"
                        );
                        continue;
                    }
                    Arc::new(LocalCacheLookup::new(config.local_cache_dir.clone()))
                }
                StrategyKind::Placeholder => {
                    Arc::new(PlaceholderSynthesis::new(config.jpeg_quality))
                }
            };
            entries.push(ChainEntry::new(strategy, config.timeout_for(*kind)));
        }

        Self::new(entries, config.strict)
    }

    pub fn entries(&self) -> &[ChainEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries
            .iter()
            .map(|entry| entry.strategy.name())
            .collect()
    }

    /// The synthesis strategy, present whenever the chain ends in one.
    pub fn placeholder(&self) -> Option<&Arc<dyn Strategy>> {
        self.entries
            .last()
            .map(|entry| &entry.strategy)
            .filter(|strategy| strategy.is_placeholder())
    }
}

fn client_error(err: ConfigError) -> PipelineError {
    PipelineError::config("http_client", err.to_string())
}
