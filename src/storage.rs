use crate::config::{ConfigError, PipelineConfig, StorageConfig};
use crate::http::build_service_client;
use crate::models::ImageReference;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{
    Client, Url,
    header::{AUTHORIZATION, CONTENT_TYPE},
};
use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid storage key `{0}`")]
    InvalidKey(String),
    #[error("invalid object store url `{0}`")]
    InvalidBaseUrl(String),
    #[error("io error writing {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("object store returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("object store request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Durable destination for normalized images. Implementations must accept
/// concurrent calls from every worker.
#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<String, StorageError>;
}

/// `{house_slug}/{logical_id}/{stem}.jpg`
pub fn storage_key(reference: &ImageReference) -> String {
    let stem = reqwest::Url::parse(&reference.primary_url)
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .map(|name| match name.rsplit_once('.') {
            Some((stem, _)) => stem.to_string(),
            None => name,
        })
        .map(|stem| sanitize(&stem))
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| sanitize(&reference.logical_id));
    format!(
        "{}/{}/{stem}.jpg",
        house_slug(&reference.house_name),
        reference.logical_id
    )
}

pub fn house_slug(house_name: &str) -> String {
    sanitize(&house_name.trim().to_lowercase().replace(' ', "_"))
}

fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' | ':' | '?' | '#' | '%' => '_',
            other => other,
        })
        .collect::<String>()
        .trim_matches('.')
        .to_string()
}

/// Builds the sink selected by configuration.
pub fn sink_from_config(config: &PipelineConfig) -> Result<Arc<dyn StorageSink>, ConfigError> {
    let sink: Arc<dyn StorageSink> = match &config.storage {
        StorageConfig::LocalDisk { root } => Arc::new(LocalDiskSink::new(root.clone())),
        StorageConfig::ObjectStore {
            base_url,
            public_base_url,
            token,
        } => Arc::new(
            ObjectStoreSink::new(
                build_service_client()?,
                base_url,
                public_base_url.as_deref(),
                token.clone(),
            )
            .map_err(|err| ConfigError::Storage(err.to_string()))?,
        ),
    };
    Ok(sink)
}

pub struct LocalDiskSink {
    root: PathBuf,
}

impl LocalDiskSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !safe {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl StorageSink for LocalDiskSink {
    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        _content_type: &str,
    ) -> Result<String, StorageError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_at(parent))?;
        }
        // write then rename so readers never see a partial file
        let tmp = path.with_extension(format!("jpg.{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &bytes).await.map_err(io_at(&tmp))?;
        if let Err(source) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StorageError::Io { path, source });
        }
        let absolute = tokio::fs::canonicalize(&path).await.unwrap_or(path);
        debug!(
            target = "valuer.storage",
            key,
            path = %absolute.display(),
            bytes = bytes.len(),
            "stored_local"
        );
        Ok(format!("file://{}", absolute.display()))
    }
}

fn io_at(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + use<> {
    let path = path.to_path_buf();
    move |source| StorageError::Io { path, source }
}

/// HTTP object store: `PUT {base}/{key}`; the public URI is returned.
///
/// Key segments are percent-encoded, so lot refs carrying `#`, `?` or `%`
/// address distinct objects.
pub struct ObjectStoreSink {
    client: Client,
    base_url: Url,
    public_base_url: Option<Url>,
    token: Option<String>,
}

impl ObjectStoreSink {
    pub fn new(
        client: Client,
        base_url: &str,
        public_base_url: Option<&str>,
        token: Option<String>,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            client,
            base_url: parse_base(base_url)?,
            public_base_url: public_base_url.map(parse_base).transpose()?,
            token,
        })
    }
}

fn parse_base(raw: &str) -> Result<Url, StorageError> {
    Url::parse(raw)
        .ok()
        .filter(|url| !url.cannot_be_a_base())
        .ok_or_else(|| StorageError::InvalidBaseUrl(raw.to_string()))
}

fn object_url(base: &Url, key: &str) -> Result<Url, StorageError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| StorageError::InvalidBaseUrl(base.to_string()))?
        .pop_if_empty()
        .extend(key.split('/'));
    Ok(url)
}

#[async_trait]
impl StorageSink for ObjectStoreSink {
    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<String, StorageError> {
        if key.is_empty() || key.split('/').any(|seg| seg.is_empty() || seg == "..") {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        let mut segments = key.splitn(3, '/');
        let house = segments.next().unwrap_or_default().to_string();
        let lot_ref = segments.next().unwrap_or_default().to_string();

        let url = object_url(&self.base_url, key)?;
        let mut request = self
            .client
            .put(url)
            .header(CONTENT_TYPE, content_type)
            .header("x-goog-meta-lot-ref", lot_ref)
            .header("x-goog-meta-house-name", house)
            .body(bytes);
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(
                target = "valuer.storage",
                key,
                status = status.as_u16(),
                "object_put_failed"
            );
            return Err(StorageError::Status { status, body });
        }
        let public = self.public_base_url.as_ref().unwrap_or(&self.base_url);
        Ok(object_url(public, key)?.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_bytes, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn reference() -> ImageReference {
        ImageReference::new(
            "12345",
            "https://image.invaluable.com/housePhotos/rago/76/7654376/H0001-L123.jpg",
            "Rago Arts",
        )
    }

    #[test]
    fn key_pairs_house_and_lot() {
        assert_eq!(storage_key(&reference()), "rago_arts/12345/H0001-L123.jpg");

        let bare = ImageReference::new("L-9", "https://image.example.com/", "A/B House");
        assert_eq!(storage_key(&bare), "a_b_house/L-9/L-9.jpg");
    }

    #[tokio::test]
    async fn local_disk_writes_atomically_and_returns_file_uri() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = LocalDiskSink::new(dir.path());
        let uri = sink
            .put("house/L-1/a.jpg", Bytes::from_static(b"jpeg"), "image/jpeg")
            .await
            .expect("put");
        assert!(uri.starts_with("file://"));
        assert!(uri.ends_with("house/L-1/a.jpg"));
        let written = std::fs::read(dir.path().join("house/L-1/a.jpg")).expect("read");
        assert_eq!(written, b"jpeg");
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("house/L-1"))
            .unwrap()
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[tokio::test]
    async fn local_disk_rejects_escaping_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = LocalDiskSink::new(dir.path());
        for key in ["../x.jpg", "/etc/x.jpg", ""] {
            let err = sink
                .put(key, Bytes::from_static(b"x"), "image/jpeg")
                .await
                .expect_err(key);
            assert!(matches!(err, StorageError::InvalidKey(_)));
        }
    }

    #[tokio::test]
    async fn object_store_puts_with_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/bucket/rago_arts/12345/H0001-L123.jpg"))
            .and(header("authorization", "Bearer secret"))
            .and(header("content-type", "image/jpeg"))
            .and(header("x-goog-meta-lot-ref", "12345"))
            .and(header("x-goog-meta-house-name", "rago_arts"))
            .and(body_bytes(b"jpeg".to_vec()))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sink = ObjectStoreSink::new(
            Client::new(),
            &format!("{}/bucket/", server.uri()),
            Some("https://cdn.example.com/bucket"),
            Some("secret".into()),
        )
        .expect("sink");
        let uri = sink
            .put(
                &storage_key(&reference()),
                Bytes::from_static(b"jpeg"),
                "image/jpeg",
            )
            .await
            .expect("put");
        assert_eq!(
            uri,
            "https://cdn.example.com/bucket/rago_arts/12345/H0001-L123.jpg"
        );
    }

    #[tokio::test]
    async fn object_store_error_status_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;
        let sink = ObjectStoreSink::new(Client::new(), &server.uri(), None, None).expect("sink");
        let err = sink
            .put("h/L-1/a.jpg", Bytes::from_static(b"x"), "image/jpeg")
            .await
            .expect_err("503");
        assert!(matches!(err, StorageError::Status { status, .. } if status.as_u16() == 503));
    }
    #[tokio::test]
    async fn lot_refs_with_url_metacharacters_get_distinct_objects() {
        let server = MockServer::start().await;
        for encoded in ["A%231", "A%232"] {
            Mock::given(method("PUT"))
                .and(path(format!("/bucket/house/{encoded}/a.jpg")))
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(&server)
                .await;
        }

        let sink = ObjectStoreSink::new(
            Client::new(),
            &format!("{}/bucket", server.uri()),
            None,
            None,
        )
        .expect("sink");
        let mut uris = Vec::new();
        for id in ["A#1", "A#2"] {
            let reference = ImageReference::new(id, "https://image.example.com/a.jpg", "House");
            assert!(reference.validate().is_ok());
            let key = storage_key(&reference);
            assert_eq!(key, format!("house/{id}/a.jpg"));
            let uri = sink
                .put(&key, Bytes::from_static(b"jpeg"), "image/jpeg")
                .await
                .expect("put");
            uris.push(uri);
        }
        assert!(uris[0].ends_with("/bucket/house/A%231/a.jpg"), "{}", uris[0]);
        assert!(uris[1].ends_with("/bucket/house/A%232/a.jpg"), "{}", uris[1]);
    }

    #[test]
    fn object_store_rejects_unusable_base() {
        assert!(matches!(
            ObjectStoreSink::new(Client::new(), "not a url", None, None),
            Err(StorageError::InvalidBaseUrl(_))
        ));
    }
}
