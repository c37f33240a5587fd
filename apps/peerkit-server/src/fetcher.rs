//! One-time verification of announced resources.
//!
//! A resource is downloaded from its origin exactly once per process (unless
//! the download fails), split into fixed-size chunks and described by a
//! [`ChunkManifest`] whose chunk hashes peers use to verify what they receive
//! from each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::RwLock;
use peerkit_core::FetcherConfig;
use peerkit_protocol::{ChunkDescriptor, ChunkManifest};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::Url;

use crate::http_client;
use crate::singleflight::Singleflight;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum FetchError {
    #[error("host not allowed: {0}")]
    HostNotAllowed(String),
    #[error("fetch failed: {0}")]
    FetchFailed(String),
    #[error("unreadable resource: {0}")]
    UnreadableResource(String),
}

pub(crate) type FetchOutcome = Result<Arc<ChunkManifest>, FetchError>;

/// Source of verified manifests. The hub only sees this seam.
#[async_trait]
pub(crate) trait ResourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> FetchOutcome;
}

/// Allow-list of origin hosts.
#[derive(Debug, Clone, Default)]
pub(crate) struct HostPolicy {
    allowed: Vec<String>,
}

impl HostPolicy {
    pub(crate) fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: hosts
                .into_iter()
                .map(|h| h.as_ref().trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
        }
    }

    fn permits_host(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.allowed.iter().any(|pattern| match pattern.strip_prefix("*.") {
            Some(suffix) => host
                .strip_suffix(suffix)
                .is_some_and(|rest| rest.len() > 1 && rest.ends_with('.')),
            None => *pattern == host,
        })
    }

    /// Parse `raw` and admit it only if it is http(s) on an allowed host.
    pub(crate) fn check(&self, raw: &str) -> Result<Url, FetchError> {
        let url = Url::parse(raw).map_err(|_| FetchError::HostNotAllowed(raw.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::HostNotAllowed(raw.to_string()));
        }
        match url.host_str() {
            Some(host) if self.permits_host(host) => Ok(url),
            Some(host) => Err(FetchError::HostNotAllowed(host.to_string())),
            None => Err(FetchError::HostNotAllowed(raw.to_string())),
        }
    }
}

/// Chunk length for a resource of `total` bytes: a tenth of the resource,
/// clamped to `[min, max]`.
pub(crate) fn chunk_size(total: u64, min: u64, max: u64) -> u64 {
    (total / 10).clamp(min.max(1), max.max(min).max(1))
}

/// Incrementally hashes a byte stream into fixed-size chunks.
pub(crate) struct ChunkBuilder {
    chunk_size: u64,
    offset: u64,
    chunk_start: u64,
    hasher: Sha256,
    chunks: Vec<ChunkDescriptor>,
}

impl ChunkBuilder {
    pub(crate) fn new(chunk_size: u64) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            offset: 0,
            chunk_start: 0,
            hasher: Sha256::new(),
            chunks: Vec::new(),
        }
    }

    /// Bytes consumed so far.
    pub(crate) fn len(&self) -> u64 {
        self.offset
    }

    pub(crate) fn push(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let room = (self.chunk_start + self.chunk_size - self.offset) as usize;
            let take = room.min(bytes.len());
            self.hasher.update(&bytes[..take]);
            self.offset += take as u64;
            bytes = &bytes[take..];
            if self.offset - self.chunk_start == self.chunk_size {
                self.seal();
            }
        }
    }

    fn seal(&mut self) {
        let digest = std::mem::take(&mut self.hasher).finalize();
        self.chunks.push(ChunkDescriptor {
            start: self.chunk_start,
            end: self.offset,
            hash: hex::encode(digest),
        });
        self.chunk_start = self.offset;
    }

    pub(crate) fn finish(mut self) -> Vec<ChunkDescriptor> {
        if self.offset > self.chunk_start {
            self.seal();
        }
        self.chunks
    }
}

/// Downloads and chunks resources over HTTP, memoizing successes per URL.
pub(crate) struct ChunkFetcher {
    client: reqwest::Client,
    hosts: HostPolicy,
    min_chunk: u64,
    max_chunk: u64,
    max_resource: u64,
    memo: RwLock<HashMap<String, Arc<ChunkManifest>>>,
    flights: Singleflight<FetchOutcome>,
    downloads: AtomicU64,
}

impl ChunkFetcher {
    pub(crate) fn new(cfg: &FetcherConfig) -> reqwest::Result<Self> {
        Ok(Self::with_client(http_client::fetch_client(cfg)?, cfg))
    }

    pub(crate) fn with_client(client: reqwest::Client, cfg: &FetcherConfig) -> Self {
        Self {
            client,
            hosts: HostPolicy::new(&cfg.allowed_hosts),
            min_chunk: cfg.min_chunk_bytes,
            max_chunk: cfg.max_chunk_bytes,
            max_resource: cfg.max_resource_bytes,
            memo: RwLock::new(HashMap::new()),
            flights: Singleflight::default(),
            downloads: AtomicU64::new(0),
        }
    }

    #[cfg(test)]
    /// Number of network downloads started so far.
    pub(crate) fn downloads(&self) -> u64 {
        self.downloads.load(Ordering::Relaxed)
    }

    async fn download(&self, raw: &str, url: Url) -> FetchOutcome {
        self.downloads.fetch_add(1, Ordering::Relaxed);
        debug!(url = %raw, "downloading resource for verification");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::FetchFailed(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::FetchFailed(format!("origin answered {status}")));
        }
        let size = match response.content_length() {
            Some(len) if len > 0 => len,
            _ => {
                return Err(FetchError::UnreadableResource(
                    "missing or empty Content-Length".into(),
                ))
            }
        };
        if size > self.max_resource {
            return Err(FetchError::UnreadableResource(format!(
                "size {size} exceeds limit {}",
                self.max_resource
            )));
        }

        let mut builder = ChunkBuilder::new(chunk_size(size, self.min_chunk, self.max_chunk));
        let mut stream = response.bytes_stream();
        while let Some(next) = stream.next().await {
            let bytes = next.map_err(|err| FetchError::FetchFailed(err.to_string()))?;
            if builder.len() + bytes.len() as u64 > size {
                return Err(FetchError::UnreadableResource(
                    "body longer than Content-Length".into(),
                ));
            }
            builder.push(&bytes);
        }
        if builder.len() != size {
            return Err(FetchError::UnreadableResource(format!(
                "body ended after {} of {size} bytes",
                builder.len()
            )));
        }

        let manifest = ChunkManifest {
            url: raw.to_string(),
            size,
            chunks: builder.finish(),
        };
        info!(url = %raw, size, chunks = manifest.chunks.len(), "resource verified");
        Ok(Arc::new(manifest))
    }
}

#[async_trait]
impl ResourceFetcher for ChunkFetcher {
    async fn fetch(&self, raw: &str) -> FetchOutcome {
        if let Some(manifest) = self.memo.read().get(raw) {
            return Ok(Arc::clone(manifest));
        }
        let url = self.hosts.check(raw).inspect_err(|err| {
            warn!(url = %raw, %err, "refusing to fetch resource");
        })?;
        let landed = self
            .flights
            .run(raw, || async {
                let outcome = self.download(raw, url).await;
                if let Ok(manifest) = &outcome {
                    self.memo
                        .write()
                        .insert(raw.to_string(), Arc::clone(manifest));
                }
                outcome
            })
            .await;
        if !landed.leader {
            debug!(url = %raw, "joined in-flight resource fetch");
        }
        if let Err(err) = &landed.value {
            if landed.leader {
                warn!(url = %raw, %err, "resource verification failed");
            }
        }
        landed.value
    }
}
