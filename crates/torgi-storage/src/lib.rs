//! HTTP fetch + href-keyed download cache for the torgi harvester.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "torgi-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Seam between the cache/pipeline and the network. Production uses
/// [`HttpFetcher`]; tests substitute counting or failing stubs.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn fetch(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DocumentFetcher for HttpFetcher {
    /// One attempt per call. The harvester never retries on its own; rerunning
    /// it is the retry.
    async fn fetch(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        let _guard = span.enter();

        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

/// Cache filename for an href: last non-empty path segment with any query or
/// fragment stripped. Hrefs without a usable segment (bare hosts) fall back
/// to the href's digest.
pub fn cache_basename(href: &str) -> String {
    let without_query = href.split(['?', '#']).next().unwrap_or(href);
    let path = match without_query.find("://") {
        Some(idx) => without_query[idx + 3..]
            .split_once('/')
            .map(|(_, rest)| rest)
            .unwrap_or(""),
        None => without_query,
    };
    match path.split('/').filter(|s| !s.is_empty()).last() {
        Some(name) => name.to_string(),
        None => format!("{}.json", sha256_hex(href.as_bytes())),
    }
}

/// Outcome of a cache lookup: where the file lives and whether the bytes came
/// from disk or from the network.
#[derive(Debug, Clone)]
pub struct CachedFile {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
    pub from_cache: bool,
    pub sha256: String,
}

/// Href-keyed download cache. Writes go through a temp file + atomic rename
/// so an overlapping run never observes a partial file.
#[derive(Debug, Clone)]
pub struct FileCache {
    root: PathBuf,
}

impl FileCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cached_path(&self, bucket: &str, href: &str) -> PathBuf {
        self.root.join(bucket).join(cache_basename(href))
    }

    /// Writes already-fetched bytes for `href` into the cache. An existing
    /// entry is left in place; the cache never rewrites a file.
    pub async fn put(&self, bucket: &str, href: &str, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.cached_path(bucket, href);
        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking cache path {}", path.display()))?
        {
            return Ok(path);
        }
        self.write_atomic(&path, bytes).await?;
        Ok(path)
    }

    /// Drops the cache entry for `href`, if any. Callers use this when a
    /// cached payload turns out to be an empty placeholder that upstream may
    /// still republish with content.
    pub async fn discard(&self, bucket: &str, href: &str) -> anyhow::Result<()> {
        let path = self.cached_path(bucket, href);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("removing cache entry {}", path.display()))
            }
        }
    }

    /// Returns the cached file for `href`, fetching it at most once on a
    /// miss. An `Err` is the caller's signal to skip the item and continue.
    pub async fn ensure(
        &self,
        fetcher: &dyn DocumentFetcher,
        run_id: Uuid,
        bucket: &str,
        href: &str,
    ) -> anyhow::Result<CachedFile> {
        let path = self.cached_path(bucket, href);

        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking cache path {}", path.display()))?
        {
            let bytes = fs::read(&path)
                .await
                .with_context(|| format!("reading cached file {}", path.display()))?;
            let sha256 = sha256_hex(&bytes);
            return Ok(CachedFile {
                path,
                bytes,
                from_cache: true,
                sha256,
            });
        }

        let response = fetcher
            .fetch(run_id, href)
            .await
            .with_context(|| format!("downloading {href}"))?;
        self.write_atomic(&path, &response.body).await?;
        let sha256 = sha256_hex(&response.body);
        Ok(CachedFile {
            path,
            bytes: response.body,
            from_cache: false,
            sha256,
        })
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        let parent = path.parent().context("cache path always has a parent")?;
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating cache directory {}", parent.display()))?;

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = parent.join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp cache file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp cache file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp cache file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                // Another run cached the same href first; its copy wins.
                let _ = fs::remove_file(&temp_path).await;
                Ok(())
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp cache file {} -> {}",
                        temp_path.display(),
                        path.display()
                    )
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct CountingFetcher {
        hits: AtomicUsize,
        body: Vec<u8>,
    }

    impl CountingFetcher {
        fn new(body: &[u8]) -> Self {
            Self {
                hits: AtomicUsize::new(0),
                body: body.to_vec(),
            }
        }
    }

    #[async_trait]
    impl DocumentFetcher for CountingFetcher {
        async fn fetch(&self, _run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(FetchedResponse {
                status: StatusCode::OK,
                final_url: url.to_string(),
                body: self.body.clone(),
            })
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl DocumentFetcher for FailingFetcher {
        async fn fetch(&self, _run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
            Err(FetchError::HttpStatus {
                status: 500,
                url: url.to_string(),
            })
        }
    }

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn basenames_come_from_the_last_path_segment() {
        assert_eq!(
            cache_basename("https://torgi.gov.ru/opendata/docs/plan-123.json?v=2"),
            "plan-123.json"
        );
        assert_eq!(
            cache_basename("https://torgi.gov.ru/opendata/docs/plan-123.json#frag"),
            "plan-123.json"
        );
        assert_eq!(cache_basename("https://torgi.gov.ru/opendata/docs/"), "docs");
        assert_eq!(cache_basename("files/doc1.json"), "doc1.json");
    }

    #[test]
    fn bare_hosts_fall_back_to_a_digest_name() {
        let name = cache_basename("https://torgi.gov.ru");
        assert!(name.ends_with(".json"));
        assert_eq!(name.len(), 64 + ".json".len());
        assert_eq!(name, cache_basename("https://torgi.gov.ru"));
    }

    #[tokio::test]
    async fn two_ensures_fetch_exactly_once() {
        let dir = tempdir().expect("tempdir");
        let cache = FileCache::new(dir.path());
        let fetcher = CountingFetcher::new(br#"{"data": []}"#);
        let run_id = Uuid::new_v4();
        let href = "https://torgi.gov.ru/opendata/docs/plan-1.json";

        let first = cache
            .ensure(&fetcher, run_id, "documents", href)
            .await
            .expect("first ensure");
        let second = cache
            .ensure(&fetcher, run_id, "documents", href)
            .await
            .expect("second ensure");

        assert_eq!(fetcher.hits.load(Ordering::SeqCst), 1);
        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(first.path, second.path);
        assert_eq!(first.bytes, second.bytes);
        assert_eq!(first.sha256, second.sha256);
        assert!(first.path.starts_with(dir.path().join("documents")));
        assert!(first.path.exists());
    }

    #[tokio::test]
    async fn put_keeps_the_first_write() {
        let dir = tempdir().expect("tempdir");
        let cache = FileCache::new(dir.path());
        let href = "https://torgi.gov.ru/opendata/7710568760-privatizationPlans/meta.json";

        let path = cache
            .put("7710568760-privatizationPlans", href, br#"{"data": [1]}"#)
            .await
            .expect("first put");
        let again = cache
            .put("7710568760-privatizationPlans", href, br#"{"data": [2]}"#)
            .await
            .expect("second put");

        assert_eq!(path, again);
        assert_eq!(path.file_name().and_then(|n| n.to_str()), Some("meta.json"));
        let kept = std::fs::read(&path).expect("read back");
        assert_eq!(kept, br#"{"data": [1]}"#);
    }

    #[tokio::test]
    async fn discard_drops_the_entry_and_tolerates_absence() {
        let dir = tempdir().expect("tempdir");
        let cache = FileCache::new(dir.path());
        let href = "https://torgi.gov.ru/opendata/plans/data-empty.json";

        let path = cache
            .put("plans", href, b"[]")
            .await
            .expect("seed the entry");
        assert!(path.exists());

        cache.discard("plans", href).await.expect("first discard");
        assert!(!path.exists());
        cache.discard("plans", href).await.expect("second discard");

        // The next ensure fetches again instead of resurrecting the old bytes.
        let fetcher = CountingFetcher::new(br#"[{"href": "https://x/doc"}]"#);
        let file = cache
            .ensure(&fetcher, Uuid::new_v4(), "plans", href)
            .await
            .expect("refetching ensure");
        assert!(!file.from_cache);
        assert_eq!(fetcher.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_fetches_leave_no_cache_entry() {
        let dir = tempdir().expect("tempdir");
        let cache = FileCache::new(dir.path());
        let href = "https://torgi.gov.ru/opendata/docs/plan-2.json";

        let err = cache
            .ensure(&FailingFetcher, Uuid::new_v4(), "documents", href)
            .await
            .expect_err("fetch should fail");
        assert!(err.to_string().contains("downloading"));
        assert!(!cache.cached_path("documents", href).exists());

        // A later run with a healthy fetcher still populates the entry.
        let fetcher = CountingFetcher::new(b"[]");
        let file = cache
            .ensure(&fetcher, Uuid::new_v4(), "documents", href)
            .await
            .expect("recovering ensure");
        assert!(!file.from_cache);
        assert_eq!(fetcher.hits.load(Ordering::SeqCst), 1);
    }
}
