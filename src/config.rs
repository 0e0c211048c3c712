use crate::strategy::StrategyKind;
use serde::Deserialize;
use std::{
    collections::HashMap,
    env,
    net::IpAddr,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

pub const DEFAULT_IMAGE_BASE_URL: &str = "https://image.invaluable.com/housePhotos/";
pub const DEFAULT_ALTERNATE_HOSTS: &[&str] = &[
    "media.invaluable.com",
    "www.invaluable.com",
    "cdn.invaluable.com",
];
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36";
pub const DEFAULT_REFERER: &str = "https://www.invaluable.com/";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("unknown strategy `{0}`")]
    UnknownStrategy(String),
    #[error("invalid origin ip entry `{0}`")]
    OriginIp(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("invalid storage configuration: {0}")]
    Storage(String),
    #[error("unable to build http client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    Production,
    Development,
}

impl RuntimeMode {
    pub fn is_development(&self) -> bool {
        matches!(self, RuntimeMode::Development)
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            backoff: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrowserProfile {
    pub user_agent: String,
    pub referer: String,
}

impl Default for BrowserProfile {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            referer: DEFAULT_REFERER.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum StorageConfig {
    LocalDisk {
        root: PathBuf,
    },
    ObjectStore {
        base_url: String,
        public_base_url: Option<String>,
        token: Option<String>,
    },
}

/// Process-wide settings, loaded once at startup and read-only afterwards.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_concurrency: NonZeroUsize,
    pub default_timeout: Duration,
    pub strategy_timeouts: HashMap<StrategyKind, Duration>,
    pub retry: RetryPolicy,
    pub max_dimension: u32,
    pub jpeg_quality: u8,
    pub mode: RuntimeMode,
    pub strict: bool,
    pub chain: Vec<StrategyKind>,
    pub origin_ips: HashMap<String, IpAddr>,
    pub edge_address: Option<String>,
    pub edge_scheme: String,
    pub browser: BrowserProfile,
    pub local_cache_dir: PathBuf,
    pub image_base_url: String,
    pub alternate_hosts: Vec<String>,
    pub storage: StorageConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: NonZeroUsize::new(10).unwrap_or(NonZeroUsize::MIN),
            default_timeout: Duration::from_secs(30),
            strategy_timeouts: HashMap::new(),
            retry: RetryPolicy::default(),
            max_dimension: 1200,
            jpeg_quality: 85,
            mode: RuntimeMode::Production,
            strict: false,
            chain: StrategyKind::ALL.to_vec(),
            origin_ips: HashMap::new(),
            edge_address: None,
            edge_scheme: "http".to_string(),
            browser: BrowserProfile::default(),
            local_cache_dir: PathBuf::from("./local_images"),
            image_base_url: DEFAULT_IMAGE_BASE_URL.to_string(),
            alternate_hosts: DEFAULT_ALTERNATE_HOSTS
                .iter()
                .map(|host| host.to_string())
                .collect(),
            storage: StorageConfig::LocalDisk {
                root: PathBuf::from("./stored_images"),
            },
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = env_parse::<usize>("MAX_CONCURRENCY")
            .or_else(|| env_parse::<usize>("IMAGE_PROCESSING_BATCH_SIZE"))
        {
            config.max_concurrency =
                NonZeroUsize::new(value).ok_or(ConfigError::Zero("MAX_CONCURRENCY"))?;
        }
        if let Some(secs) = env_parse::<u64>("STRATEGY_TIMEOUT_SECS").filter(|v| *v > 0) {
            config.default_timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = env_parse::<u32>("STRATEGY_RETRIES") {
            config.retry.max_retries = retries.min(1);
        }
        if let Some(ms) = env_parse::<u64>("RETRY_BACKOFF_MS") {
            config.retry.backoff = Duration::from_millis(ms);
        }
        if let Some(dim) = env_parse::<u32>("MAX_IMAGE_DIMENSION") {
            config.max_dimension = dim;
        }
        if let Some(quality) = env_parse::<u8>("JPEG_QUALITY") {
            config.jpeg_quality = quality.clamp(1, 100);
        }
        config.mode = mode_from_env();
        config.strict = parse_env_bool("STRICT_MODE");
        if let Ok(raw) = env::var("STRATEGY_CHAIN") {
            config.chain = parse_chain(&raw)?;
        }
        if let Ok(raw) = env::var("ORIGIN_IPS") {
            config.origin_ips = parse_origin_ips(&raw)?;
        }
        config.edge_address = env::var("EDGE_ADDRESS")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        if let Ok(scheme) = env::var("EDGE_SCHEME") {
            config.edge_scheme = scheme.trim().to_lowercase();
        }
        if let Ok(agent) = env::var("BROWSER_USER_AGENT") {
            config.browser.user_agent = agent;
        }
        if let Ok(referer) = env::var("BROWSER_REFERER") {
            config.browser.referer = referer;
        }
        if let Ok(dir) = env::var("LOCAL_CACHE_DIR") {
            config.local_cache_dir = PathBuf::from(dir);
        }
        if let Ok(base) = env::var("IMAGE_BASE_URL") {
            config.image_base_url = base;
        }
        if let Ok(raw) = env::var("ALTERNATE_HOSTS") {
            config.alternate_hosts = split_list(&raw);
        }
        config.storage = storage_from_env();

        if config.max_dimension == 0 {
            return Err(ConfigError::Zero("MAX_IMAGE_DIMENSION"));
        }
        Ok(config)
    }

    /// Loads a YAML file on top of the environment-derived defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_env()?.merge_yaml(&raw)
    }

    pub fn merge_yaml(mut self, raw: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = serde_yaml::from_str(raw)?;

        if let Some(value) = file.max_concurrency {
            self.max_concurrency =
                NonZeroUsize::new(value).ok_or(ConfigError::Zero("max_concurrency"))?;
        }
        if let Some(secs) = file.timeout_secs.filter(|v| *v > 0) {
            self.default_timeout = Duration::from_secs(secs);
        }
        for (name, secs) in file.timeouts {
            let kind = StrategyKind::from_name(&name)
                .ok_or_else(|| ConfigError::UnknownStrategy(name.clone()))?;
            self.strategy_timeouts.insert(kind, Duration::from_secs(secs));
        }
        if let Some(retries) = file.retries {
            self.retry.max_retries = retries.min(1);
        }
        if let Some(ms) = file.retry_backoff_ms {
            self.retry.backoff = Duration::from_millis(ms);
        }
        if let Some(dim) = file.max_dimension {
            if dim == 0 {
                return Err(ConfigError::Zero("max_dimension"));
            }
            self.max_dimension = dim;
        }
        if let Some(quality) = file.jpeg_quality {
            self.jpeg_quality = quality.clamp(1, 100);
        }
        if let Some(dev) = file.development {
            self.mode = if dev {
                RuntimeMode::Development
            } else {
                RuntimeMode::Production
            };
        }
        if let Some(strict) = file.strict {
            self.strict = strict;
        }
        if let Some(chain) = file.chain {
            self.chain = chain
                .iter()
                .map(|name| {
                    StrategyKind::from_name(name)
                        .ok_or_else(|| ConfigError::UnknownStrategy(name.clone()))
                })
                .collect::<Result<_, _>>()?;
        }
        for (host, ip) in file.origin_ips {
            let parsed = ip
                .parse::<IpAddr>()
                .map_err(|_| ConfigError::OriginIp(format!("{host}={ip}")))?;
            self.origin_ips.insert(host.to_lowercase(), parsed);
        }
        if let Some(edge) = file.edge_address {
            self.edge_address = Some(edge);
        }
        if let Some(hosts) = file.alternate_hosts {
            self.alternate_hosts = hosts;
        }
        if let Some(dir) = file.local_cache_dir {
            self.local_cache_dir = dir;
        }
        Ok(self)
    }

    pub fn timeout_for(&self, kind: StrategyKind) -> Duration {
        self.strategy_timeouts
            .get(&kind)
            .copied()
            .unwrap_or(self.default_timeout)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    max_concurrency: Option<usize>,
    timeout_secs: Option<u64>,
    #[serde(default)]
    timeouts: HashMap<String, u64>,
    retries: Option<u32>,
    retry_backoff_ms: Option<u64>,
    max_dimension: Option<u32>,
    jpeg_quality: Option<u8>,
    development: Option<bool>,
    strict: Option<bool>,
    chain: Option<Vec<String>>,
    #[serde(default)]
    origin_ips: HashMap<String, String>,
    edge_address: Option<String>,
    alternate_hosts: Option<Vec<String>>,
    local_cache_dir: Option<PathBuf>,
}

pub fn parse_chain(raw: &str) -> Result<Vec<StrategyKind>, ConfigError> {
    split_list(raw)
        .into_iter()
        .map(|name| StrategyKind::from_name(&name).ok_or(ConfigError::UnknownStrategy(name)))
        .collect()
}

pub fn parse_origin_ips(raw: &str) -> Result<HashMap<String, IpAddr>, ConfigError> {
    let mut table = HashMap::new();
    for entry in split_list(raw) {
        let Some((host, ip)) = entry.split_once('=') else {
            return Err(ConfigError::OriginIp(entry));
        };
        let ip = ip
            .trim()
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::OriginIp(entry.clone()))?;
        table.insert(host.trim().to_lowercase(), ip);
    }
    Ok(table)
}

fn storage_from_env() -> StorageConfig {
    match env::var("OBJECT_STORE_URL").ok().filter(|v| !v.trim().is_empty()) {
        Some(base_url) => StorageConfig::ObjectStore {
            base_url: base_url.trim_end_matches('/').to_string(),
            public_base_url: env::var("OBJECT_STORE_PUBLIC_URL")
                .ok()
                .map(|v| v.trim_end_matches('/').to_string()),
            token: env::var("OBJECT_STORE_TOKEN").ok(),
        },
        None => StorageConfig::LocalDisk {
            root: env::var("LOCAL_STORAGE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./stored_images")),
        },
    }
}

fn mode_from_env() -> RuntimeMode {
    let env_name = env::var("APP_ENV").unwrap_or_default().to_lowercase();
    if matches!(env_name.as_str(), "development" | "dev" | "local") || parse_env_bool("DEBUG") {
        RuntimeMode::Development
    } else {
        RuntimeMode::Production
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split([',', ' ', '\n', '\t'])
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

pub(crate) fn parse_env_bool(key: &str) -> bool {
    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
