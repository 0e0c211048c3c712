use super::{FailureHint, Strategy, StrategyKind};
use crate::models::{ImageReference, ReasonCode, StrategyResult};
use crate::storage::storage_key;
use async_trait::async_trait;
use std::{io::ErrorKind, path::PathBuf};
use tracing::{debug, warn};

const EXTENSIONS: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("webp", "image/webp"),
    ("gif", "image/gif"),
];

/// Development-only lookup in a local image directory.
///
/// Candidates, in order: `{dir}/{logical_id}.{ext}` for each known
/// extension, then the storage-key layout `{dir}/{house}/{logical_id}/{file}`
/// so that a previous run's output doubles as a cache.
pub struct LocalCacheLookup {
    dir: PathBuf,
}

impl LocalCacheLookup {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn candidates(&self, reference: &ImageReference) -> Vec<(PathBuf, &'static str)> {
        let mut paths: Vec<(PathBuf, &'static str)> = EXTENSIONS
            .iter()
            .map(|(ext, mime)| {
                (
                    self.dir.join(format!("{}.{ext}", reference.logical_id)),
                    *mime,
                )
            })
            .collect();
        paths.push((self.dir.join(storage_key(reference)), "image/jpeg"));
        paths
    }
}

#[async_trait]
impl Strategy for LocalCacheLookup {
    fn name(&self) -> &str {
        StrategyKind::LocalCache.as_str()
    }

    async fn attempt(&self, reference: &ImageReference, _hint: &FailureHint) -> StrategyResult {
        let name = self.name();
        for (path, content_type) in self.candidates(reference) {
            match tokio::fs::read(&path).await {
                Ok(bytes) if bytes.is_empty() => {
                    debug!(
                        target = "valuer.strategy",
                        path = %path.display(),
                        "local_cache_empty_file"
                    );
                }
                Ok(bytes) => {
                    debug!(
                        target = "valuer.strategy",
                        lot_ref = %reference.logical_id,
                        path = %path.display(),
                        "local_cache_hit"
                    );
                    return StrategyResult::success(name, bytes, content_type);
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(
                        target = "valuer.strategy",
                        path = %path.display(),
                        error = %err,
                        "local_cache_read_failed"
                    );
                    return StrategyResult::failure(name, ReasonCode::Io);
                }
            }
        }
        StrategyResult::failure(name, ReasonCode::CacheMiss)
    }
}
