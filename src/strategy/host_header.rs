use super::fetch::{fetch_image, into_result};
use super::{FailureHint, Strategy, StrategyKind};
use crate::config::RetryPolicy;
use crate::models::{ImageReference, ReasonCode, StrategyResult};
use async_trait::async_trait;
use reqwest::{Client, Url};

/// Connects to a fixed edge address while presenting the lot's real host
/// in the `Host` header, which gets past edges that block by hostname.
pub struct HostHeaderFetch {
    client: Client,
    edge_address: Option<String>,
    scheme: String,
    retry: RetryPolicy,
}

impl HostHeaderFetch {
    pub fn new(
        client: Client,
        edge_address: Option<String>,
        scheme: String,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            edge_address,
            scheme,
            retry,
        }
    }

    /// The edge URL and the logical host header for `primary`.
    fn edge_target(&self, primary: &Url) -> Option<(Url, String)> {
        let edge = self.edge_address.as_deref()?.trim();
        let host = primary.host_str()?;
        let logical_host = match primary.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let mut target = Url::parse(&format!("{}://{edge}", self.scheme)).ok()?;
        target.set_path(primary.path());
        target.set_query(primary.query());
        Some((target, logical_host))
    }
}

#[async_trait]
impl Strategy for HostHeaderFetch {
    fn name(&self) -> &str {
        StrategyKind::HostHeader.as_str()
    }

    async fn attempt(&self, reference: &ImageReference, _hint: &FailureHint) -> StrategyResult {
        let name = self.name();
        let Some((url, logical_host)) = Url::parse(&reference.primary_url)
            .ok()
            .and_then(|primary| self.edge_target(&primary))
        else {
            return StrategyResult::failure(name, ReasonCode::NotConfigured);
        };
        let fetched = fetch_image(&self.client, &url, Some(&logical_host), &self.retry).await;
        into_result(name, &reference.logical_id, fetched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn edge_target_swaps_authority_and_keeps_host() {
        let strategy = HostHeaderFetch::new(
            Client::new(),
            Some("203.0.113.5".into()),
            "http".into(),
            RetryPolicy::default(),
        );
        let primary = Url::parse("https://image.example.com/housePhotos/a.jpg?x=1").unwrap();
        let (url, host) = strategy.edge_target(&primary).unwrap();
        assert_eq!(url.as_str(), "http://203.0.113.5/housePhotos/a.jpg?x=1");
        assert_eq!(host, "image.example.com");
    }

    #[tokio::test]
    async fn presents_logical_host_to_edge() {
        let edge = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/housePhotos/a.jpg"))
            .and(header("host", "image.example.com"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/jpeg")
                    .set_body_bytes(vec![9, 9, 9]),
            )
            .expect(1)
            .mount(&edge)
            .await;

        let strategy = HostHeaderFetch::new(
            Client::new(),
            Some(edge.address().to_string()),
            "http".into(),
            RetryPolicy::default(),
        );
        let reference = ImageReference::new(
            "L-5",
            "https://image.example.com/housePhotos/a.jpg",
            "House",
        );
        let result = strategy.attempt(&reference, &FailureHint::default()).await;
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn missing_edge_is_not_configured() {
        let strategy =
            HostHeaderFetch::new(Client::new(), None, "http".into(), RetryPolicy::default());
        let reference = ImageReference::new("L-6", "https://image.example.com/a.jpg", "House");
        let result = strategy.attempt(&reference, &FailureHint::default()).await;
        assert!(matches!(
            result,
            StrategyResult::Failure {
                reason_code: ReasonCode::NotConfigured,
                ..
            }
        ));
    }
}
