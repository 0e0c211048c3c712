use super::fetch::{fetch_image, into_result};
use super::{FailureHint, Strategy, StrategyKind};
use crate::config::RetryPolicy;
use crate::models::{ImageReference, ReasonCode, StrategyResult};
use async_trait::async_trait;
use reqwest::{Client, Url};

/// Plain GET of the primary URL with the browser header set.
pub struct DirectFetch {
    client: Client,
    retry: RetryPolicy,
}

impl DirectFetch {
    pub fn new(client: Client, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }
}

#[async_trait]
impl Strategy for DirectFetch {
    fn name(&self) -> &str {
        StrategyKind::Direct.as_str()
    }

    async fn attempt(&self, reference: &ImageReference, _hint: &FailureHint) -> StrategyResult {
        let name = self.name();
        let Ok(url) = Url::parse(&reference.primary_url) else {
            return StrategyResult::failure(name, ReasonCode::NotConfigured);
        };
        let fetched = fetch_image(&self.client, &url, None, &self.retry).await;
        into_result(name, &reference.logical_id, fetched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn sends_browser_profile_and_returns_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/housePhotos/h/1.jpg"))
            .and(header("referer", "https://www.invaluable.com/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/jpeg")
                    .set_body_bytes(vec![0xFF, 0xD8, 0xFF]),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = crate::http::build_client(crate::http::ClientOptions {
            profile: &Default::default(),
            mode: crate::config::RuntimeMode::Production,
            request_timeout: Duration::from_secs(5),
            resolve: None,
        })
        .expect("client");
        let strategy = DirectFetch::new(client, RetryPolicy::default());
        let reference = ImageReference::new(
            "L-1",
            format!("{}/housePhotos/h/1.jpg", server.uri()),
            "House",
        );

        match strategy.attempt(&reference, &FailureHint::default()).await {
            StrategyResult::Success {
                bytes,
                content_type,
                source_strategy,
            } => {
                assert_eq!(bytes.as_ref(), &[0xFF, 0xD8, 0xFF]);
                assert_eq!(content_type, "image/jpeg");
                assert_eq!(source_strategy, "direct");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_2xx_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let strategy = DirectFetch::new(Client::new(), RetryPolicy::default());
        let reference = ImageReference::new("L-2", format!("{}/x.jpg", server.uri()), "House");
        let result = strategy.attempt(&reference, &FailureHint::default()).await;
        assert!(matches!(
            result,
            StrategyResult::Failure {
                reason_code: ReasonCode::HttpStatus(404),
                ..
            }
        ));
    }
}
