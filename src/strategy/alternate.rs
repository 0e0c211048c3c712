use super::fetch::{FetchError, fetch_image};
use super::{FailureHint, Strategy, StrategyKind};
use crate::config::RetryPolicy;
use crate::models::{ImageReference, ReasonCode, StrategyResult};
use async_trait::async_trait;
use reqwest::{Client, Url};
use tracing::{debug, warn};

/// Replays the primary path against each candidate host in order.
pub struct AlternateHostFetch {
    client: Client,
    retry: RetryPolicy,
}

impl AlternateHostFetch {
    pub fn new(client: Client, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }
}

/// Rewrites `url` onto `candidate`, which is `host` or `host:port`. Without
/// an explicit port the original one is kept.
pub(crate) fn rewrite_host(url: &Url, candidate: &str) -> Option<Url> {
    let candidate = candidate.trim();
    if candidate.is_empty() {
        return None;
    }
    let (host, port) = match candidate.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => (host, Some(port.parse::<u16>().ok()?)),
        _ => (candidate, None),
    };
    let mut rewritten = url.clone();
    rewritten.set_host(Some(host)).ok()?;
    if let Some(port) = port {
        rewritten.set_port(Some(port)).ok()?;
    }
    Some(rewritten)
}

#[async_trait]
impl Strategy for AlternateHostFetch {
    fn name(&self) -> &str {
        StrategyKind::AlternateHost.as_str()
    }

    async fn attempt(&self, reference: &ImageReference, _hint: &FailureHint) -> StrategyResult {
        let name = self.name();
        if reference.candidate_hosts.is_empty() {
            return StrategyResult::failure(name, ReasonCode::NoCandidates);
        }
        let Ok(primary) = Url::parse(&reference.primary_url) else {
            return StrategyResult::failure(name, ReasonCode::NotConfigured);
        };

        let mut last_error: Option<FetchError> = None;
        for candidate in &reference.candidate_hosts {
            let Some(url) = rewrite_host(&primary, candidate) else {
                debug!(
                    target = "valuer.strategy",
                    lot_ref = %reference.logical_id,
                    candidate = %candidate,
                    "alternate_host_unusable"
                );
                continue;
            };
            match fetch_image(&self.client, &url, None, &self.retry).await {
                Ok(fetched) => {
                    return StrategyResult::success(name, fetched.bytes, fetched.content_type);
                }
                Err(err) => {
                    debug!(
                        target = "valuer.strategy",
                        lot_ref = %reference.logical_id,
                        candidate = %candidate,
                        error = %err,
                        "alternate_host_failed"
                    );
                    last_error = Some(err);
                }
            }
        }

        let reason = last_error
            .as_ref()
            .map(FetchError::reason)
            .unwrap_or(ReasonCode::NoCandidates);
        warn!(
            target = "valuer.strategy",
            strategy = name,
            lot_ref = %reference.logical_id,
            candidates = reference.candidate_hosts.len(),
            reason = %reason,
            "strategy_attempt_failed"
        );
        StrategyResult::failure(name, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn rewrite_keeps_path_and_query() {
        let url = Url::parse("https://image.example.com/housePhotos/a/1.jpg?v=2").unwrap();
        let rewritten = rewrite_host(&url, "media.example.com").unwrap();
        assert_eq!(
            rewritten.as_str(),
            "https://media.example.com/housePhotos/a/1.jpg?v=2"
        );
        let with_port = rewrite_host(&url, "127.0.0.1:8081").unwrap();
        assert_eq!(
            with_port.as_str(),
            "https://127.0.0.1:8081/housePhotos/a/1.jpg?v=2"
        );
        assert!(rewrite_host(&url, "").is_none());
        assert!(rewrite_host(&url, "host:notaport").is_none());
    }

    #[tokio::test]
    async fn short_circuits_on_first_working_host() {
        let blocked = MockServer::start().await;
        let open = MockServer::start().await;
        let unused = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&blocked)
            .await;
        Mock::given(method("GET"))
            .and(path("/housePhotos/a.jpg"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(vec![1, 2, 3]),
            )
            .expect(1)
            .mount(&open)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&unused)
            .await;

        let authority = |server: &MockServer| server.address().to_string();
        let reference = ImageReference::new(
            "L-9",
            "http://image.invalid/housePhotos/a.jpg",
            "House",
        )
        .with_candidate_hosts([authority(&blocked), authority(&open), authority(&unused)]);

        let strategy = AlternateHostFetch::new(Client::new(), RetryPolicy::default());
        let result = strategy.attempt(&reference, &FailureHint::default()).await;
        assert!(result.is_success());
        assert_eq!(result.strategy(), "alternate_host");
    }

    #[tokio::test]
    async fn no_candidates_fails_fast() {
        let strategy = AlternateHostFetch::new(Client::new(), RetryPolicy::default());
        let reference = ImageReference::new("L-3", "https://image.example.com/a.jpg", "House");
        let result = strategy.attempt(&reference, &FailureHint::default()).await;
        assert!(matches!(
            result,
            StrategyResult::Failure {
                reason_code: ReasonCode::NoCandidates,
                ..
            }
        ));
    }
}
