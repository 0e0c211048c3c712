use super::fetch::{fetch_image, into_result};
use super::{FailureHint, Strategy, StrategyKind};
use crate::config::{ConfigError, PipelineConfig, RetryPolicy};
use crate::http::{ClientOptions, build_client};
use crate::models::{ImageReference, ReasonCode, StrategyResult};
use async_trait::async_trait;
use reqwest::{Client, Url};
use std::{collections::HashMap, net::SocketAddr};

/// Skips the CDN by pinning the lot's hostname to a known origin address.
///
/// One client per configured host is built up front; the table is static
/// configuration, so lookups need no locking. TLS still validates against
/// the real hostname since only name resolution is overridden.
pub struct OriginIpFetch {
    clients: HashMap<String, Client>,
    retry: RetryPolicy,
}

impl OriginIpFetch {
    pub fn new(clients: HashMap<String, Client>, retry: RetryPolicy) -> Self {
        Self { clients, retry }
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self, ConfigError> {
        let timeout = config.timeout_for(StrategyKind::OriginIp);
        let clients = config
            .origin_ips
            .iter()
            .map(|(host, ip)| {
                let client = build_client(ClientOptions {
                    profile: &config.browser,
                    mode: config.mode,
                    request_timeout: timeout,
                    // port 0: the URL's own port is used
                    resolve: Some((host.as_str(), SocketAddr::new(*ip, 0))),
                })?;
                Ok((host.to_lowercase(), client))
            })
            .collect::<Result<_, ConfigError>>()?;
        Ok(Self::new(clients, config.retry.clone()))
    }
}

#[async_trait]
impl Strategy for OriginIpFetch {
    fn name(&self) -> &str {
        StrategyKind::OriginIp.as_str()
    }

    async fn attempt(&self, reference: &ImageReference, _hint: &FailureHint) -> StrategyResult {
        let name = self.name();
        let Ok(url) = Url::parse(&reference.primary_url) else {
            return StrategyResult::failure(name, ReasonCode::NotConfigured);
        };
        let Some(client) = url
            .host_str()
            .and_then(|host| self.clients.get(&host.to_lowercase()))
        else {
            return StrategyResult::failure(name, ReasonCode::NotConfigured);
        };
        let fetched = fetch_image(client, &url, None, &self.retry).await;
        into_result(name, &reference.logical_id, fetched)
    }
}
