use crate::config::{BrowserProfile, ConfigError, RuntimeMode};
use reqwest::{
    Client,
    header::{ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, HeaderMap, HeaderValue, PRAGMA, REFERER},
};
use std::{net::SocketAddr, time::Duration};

const ACCEPT_IMAGE: &str = "image/avif,image/webp,image/apng,image/svg+xml,image/*,*/*;q=0.8";

/// Headers a desktop browser sends when loading an `<img>` from the auction
/// site; bot filters in front of the image CDN key on these.
pub fn browser_headers(profile: &BrowserProfile) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_IMAGE));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    if let Ok(referer) = HeaderValue::from_str(&profile.referer) {
        headers.insert(REFERER, referer);
    }
    headers.insert(
        "sec-ch-ua",
        HeaderValue::from_static("\"Google Chrome\";v=\"123\", \"Not:A-Brand\";v=\"8\""),
    );
    headers.insert("sec-ch-ua-mobile", HeaderValue::from_static("?0"));
    headers.insert("sec-ch-ua-platform", HeaderValue::from_static("\"Windows\""));
    headers.insert("sec-fetch-dest", HeaderValue::from_static("image"));
    headers.insert("sec-fetch-mode", HeaderValue::from_static("no-cors"));
    headers.insert("sec-fetch-site", HeaderValue::from_static("same-site"));
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers
}

pub struct ClientOptions<'a> {
    pub profile: &'a BrowserProfile,
    pub mode: RuntimeMode,
    /// Ceiling for a single request. Strategy clients pass their own
    /// strategy's timeout so the two bounds agree.
    pub request_timeout: Duration,
    pub resolve: Option<(&'a str, SocketAddr)>,
}

/// Builds a browser-profiled client. Bypass clients (edge and origin
/// connections) relax certificate checks in development only.
///
/// A profile that cannot be sent as headers (a user agent with a newline,
/// say) is a configuration error rather than a silently plain client.
pub fn build_client(options: ClientOptions<'_>) -> Result<Client, ConfigError> {
    let connect = std::env::var("HTTP_CONNECT_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(5);
    let mut builder = Client::builder()
        .user_agent(options.profile.user_agent.clone())
        .default_headers(browser_headers(options.profile))
        .timeout(options.request_timeout)
        .connect_timeout(Duration::from_secs(connect))
        .redirect(reqwest::redirect::Policy::limited(5));

    if let Some((domain, addr)) = options.resolve {
        builder = builder.resolve(domain, addr);
    }
    if options.mode.is_development() {
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder.build().map_err(ConfigError::HttpClient)
}

/// Plain client for collaborators that talk to infrastructure rather than
/// hostile hosts (object storage).
pub fn build_service_client() -> Result<Client, ConfigError> {
    let timeout = std::env::var("HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(30);
    Client::builder()
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(5))
        .build()
        .map_err(ConfigError::HttpClient)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn browser_headers_carry_referer_and_accept() {
        let profile = BrowserProfile::default();
        let headers = browser_headers(&profile);
        assert_eq!(headers[REFERER], profile.referer.as_str());
        assert!(
            headers[ACCEPT]
                .to_str()
                .expect("ascii")
                .starts_with("image/")
        );
        assert_eq!(headers["sec-fetch-dest"], "image");
    }

    #[test]
    fn invalid_referer_is_skipped() {
        let profile = BrowserProfile {
            referer: "bad\nvalue".into(),
            ..Default::default()
        };
        let headers = browser_headers(&profile);
        assert!(headers.get(REFERER).is_none());
    }

    #[test]
    fn unsendable_user_agent_is_a_config_error() {
        let profile = BrowserProfile {
            user_agent: "Mozilla/5.0\nInjected".into(),
            ..Default::default()
        };
        let result = build_client(ClientOptions {
            profile: &profile,
            mode: RuntimeMode::Production,
            request_timeout: Duration::from_secs(5),
            resolve: None,
        });
        assert!(matches!(result, Err(ConfigError::HttpClient(_))));
    }
}
