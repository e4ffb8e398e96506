//! Byte sources for the fetch stage
//!
//! This module provides fetchers for:
//! - HTTP/HTTPS URLs ([`HttpFetcher`], reqwest)
//! - Local files ([`FileFetcher`], `file://` uris or plain paths)
//! - In-memory payloads ([`StaticFetcher`])
//!
//! [`CompositeFetcher`] routes a uri to the HTTP or file fetcher by scheme.

use crate::config::NetworkConfig;
use crate::error::{PipelineError, Result};
use crate::request::BytesRange;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::Client as HttpClient;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info};

const STAGE: &str = "NetworkFetcher";
const FILE_CHUNK_SIZE: usize = 16 * 1024;

/// Body of a fetch response, read chunk by chunk
#[async_trait]
pub trait ByteStream: Send {
    /// Next chunk, or `None` at the end of the body
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Response of a fetch
pub struct FetchResponse {
    pub body: Box<dyn ByteStream>,

    /// Body length, if announced
    pub content_length: Option<u64>,

    /// Set when the body covers only part of the content
    pub partial_range: Option<BytesRange>,
}

impl FetchResponse {
    pub fn new(body: Box<dyn ByteStream>, content_length: Option<u64>) -> Self {
        Self {
            body,
            content_length,
            partial_range: None,
        }
    }
}

/// Opaque transport returning a byte stream for a uri
///
/// Cancellation is done by dropping the in-flight future or the stream.
#[async_trait]
pub trait NetworkFetcher: Send + Sync {
    async fn fetch(&self, uri: &str, range: Option<BytesRange>) -> Result<FetchResponse>;
}

// ============================================================================
// HTTP
// ============================================================================

/// Fetcher for `http://` and `https://` uris
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: HttpClient,
}

struct HttpBody {
    response: reqwest::Response,
}

#[async_trait]
impl ByteStream for HttpBody {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        self.response
            .chunk()
            .await
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .map_err(|e| PipelineError::fetch(STAGE, e))
    }
}

impl HttpFetcher {
    pub fn new(config: &NetworkConfig) -> Result<Self> {
        let client = HttpClient::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NetworkFetcher for HttpFetcher {
    async fn fetch(&self, uri: &str, range: Option<BytesRange>) -> Result<FetchResponse> {
        debug!("Fetching {}", uri);
        let mut request = self.client.get(uri);
        if let Some(range) = range {
            request = request.header(RANGE, range.to_http_range_header());
        }

        let response = request
            .send()
            .await
            .map_err(|e| PipelineError::fetch(STAGE, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::fetch(
                STAGE,
                format!("unexpected HTTP status {status} for {uri}"),
            ));
        }

        let partial_range = if status == StatusCode::PARTIAL_CONTENT {
            response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|value| value.to_str().ok())
                .and_then(partial_range_from_header)
        } else {
            None
        };

        Ok(FetchResponse {
            content_length: response.content_length(),
            partial_range,
            body: Box::new(HttpBody { response }),
        })
    }
}

/// Range announced by a `Content-Range` header, unless it spans the whole
/// content
fn partial_range_from_header(header: &str) -> Option<BytesRange> {
    let range = BytesRange::from_content_range_header(header)?;
    let total = BytesRange::total_from_content_range_header(header);
    let is_full = range.from == 0 && matches!((range.to, total), (Some(to), Some(total)) if to + 1 >= total);
    (!is_full).then_some(range)
}

// ============================================================================
// Local files
// ============================================================================

/// Fetcher for local files
#[derive(Debug, Clone, Copy, Default)]
pub struct FileFetcher;

struct FileBody {
    file: tokio::fs::File,
    remaining: Option<u64>,
}

#[async_trait]
impl ByteStream for FileBody {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let limit = match self.remaining {
            Some(0) => return Ok(None),
            Some(remaining) => FILE_CHUNK_SIZE.min(remaining as usize),
            None => FILE_CHUNK_SIZE,
        };
        let mut buffer = vec![0u8; limit];
        let read = self
            .file
            .read(&mut buffer)
            .await
            .map_err(|e| PipelineError::fetch("FileFetcher", e))?;
        if read == 0 {
            return Ok(None);
        }
        buffer.truncate(read);
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= read as u64;
        }
        Ok(Some(buffer))
    }
}

impl FileFetcher {
    fn path_for(uri: &str) -> PathBuf {
        PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri))
    }
}

#[async_trait]
impl NetworkFetcher for FileFetcher {
    async fn fetch(&self, uri: &str, range: Option<BytesRange>) -> Result<FetchResponse> {
        let path = Self::path_for(uri);
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| PipelineError::fetch("FileFetcher", format!("{}: {e}", path.display())))?;
        let length = file
            .metadata()
            .await
            .map_err(|e| PipelineError::fetch("FileFetcher", e))?
            .len();

        let Some(range) = range else {
            return Ok(FetchResponse::new(
                Box::new(FileBody {
                    file,
                    remaining: None,
                }),
                Some(length),
            ));
        };

        let end = range.to.map_or(length, |to| (to + 1).min(length));
        let start = range.from.min(end);
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|e| PipelineError::fetch("FileFetcher", e))?;
        let mut response = FetchResponse::new(
            Box::new(FileBody {
                file,
                remaining: Some(end - start),
            }),
            Some(end - start),
        );
        if start > 0 || end < length {
            response.partial_range = Some(BytesRange::between(start, end.saturating_sub(1)));
        }
        Ok(response)
    }
}

// ============================================================================
// Routing
// ============================================================================

/// Routes `http(s)://` uris to HTTP and everything else to local files
pub struct CompositeFetcher {
    http: Arc<dyn NetworkFetcher>,
    file: Arc<dyn NetworkFetcher>,
}

impl CompositeFetcher {
    pub fn new(http: Arc<dyn NetworkFetcher>, file: Arc<dyn NetworkFetcher>) -> Self {
        Self { http, file }
    }

    /// HTTP fetcher built from `config` plus the local file fetcher
    pub fn from_config(config: &NetworkConfig) -> Result<Self> {
        info!("Creating HTTP fetcher (timeout {}s)", config.timeout_secs);
        Ok(Self::new(
            Arc::new(HttpFetcher::new(config)?),
            Arc::new(FileFetcher),
        ))
    }
}

#[async_trait]
impl NetworkFetcher for CompositeFetcher {
    async fn fetch(&self, uri: &str, range: Option<BytesRange>) -> Result<FetchResponse> {
        let lower = uri.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            self.http.fetch(uri, range).await
        } else {
            self.file.fetch(uri, range).await
        }
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Serves registered payloads from memory in fixed-size chunks
#[derive(Clone, Default)]
pub struct StaticFetcher {
    payloads: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    fetch_counts: Arc<Mutex<HashMap<String, usize>>>,
    chunk_size: Option<usize>,
    chunk_delay: Option<Duration>,
}

struct StaticBody {
    data: Vec<u8>,
    offset: usize,
    chunk_size: usize,
    delay: Option<Duration>,
}

#[async_trait]
impl ByteStream for StaticBody {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.offset >= self.data.len() {
            return Ok(None);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let end = (self.offset + self.chunk_size).min(self.data.len());
        let chunk = self.data[self.offset..end].to_vec();
        self.offset = end;
        Ok(Some(chunk))
    }
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payload(self, uri: impl Into<String>, data: Vec<u8>) -> Self {
        self.payloads.lock().insert(uri.into(), data);
        self
    }

    /// Split bodies into chunks of this size
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = Some(size.max(1));
        self
    }

    /// Sleep before delivering each chunk
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Number of fetches started for `uri`
    pub fn fetch_count(&self, uri: &str) -> usize {
        self.fetch_counts.lock().get(uri).copied().unwrap_or(0)
    }
}

#[async_trait]
impl NetworkFetcher for StaticFetcher {
    async fn fetch(&self, uri: &str, range: Option<BytesRange>) -> Result<FetchResponse> {
        *self.fetch_counts.lock().entry(uri.to_string()).or_default() += 1;
        let data = self
            .payloads
            .lock()
            .get(uri)
            .cloned()
            .ok_or_else(|| PipelineError::fetch("StaticFetcher", format!("no payload for {uri}")))?;

        let total = data.len() as u64;
        let (data, partial_range) = match range {
            Some(range) => {
                let end = range.to.map_or(total, |to| (to + 1).min(total));
                let start = range.from.min(end);
                let slice = data[start as usize..end as usize].to_vec();
                let partial = (start > 0 || end < total)
                    .then(|| BytesRange::between(start, end.saturating_sub(1)));
                (slice, partial)
            }
            None => (data, None),
        };

        let length = data.len() as u64;
        let chunk_size = self.chunk_size.unwrap_or(data.len().max(1));
        Ok(FetchResponse {
            body: Box::new(StaticBody {
                data,
                offset: 0,
                chunk_size,
                delay: self.chunk_delay,
            }),
            content_length: Some(length),
            partial_range,
        })
    }
}

/// Read a whole response body into memory
pub async fn read_to_end(response: FetchResponse) -> Result<Vec<u8>> {
    let mut body = response.body;
    let mut out = Vec::with_capacity(response.content_length.unwrap_or(0) as usize);
    while let Some(chunk) = body.next_chunk().await? {
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_range_from_header() {
        assert_eq!(
            partial_range_from_header("bytes 0-99/200"),
            Some(BytesRange::between(0, 99))
        );
        assert_eq!(partial_range_from_header("bytes 0-199/200"), None);
        assert_eq!(
            partial_range_from_header("bytes 100-199/200"),
            Some(BytesRange::between(100, 199))
        );
    }

    #[tokio::test]
    async fn test_static_fetcher_chunks_and_ranges() {
        let fetcher = StaticFetcher::new()
            .with_payload("mem://a", (0u8..10).collect())
            .with_chunk_size(4);

        let response = fetcher.fetch("mem://a", None).await.unwrap();
        assert_eq!(response.content_length, Some(10));
        assert_eq!(read_to_end(response).await.unwrap(), (0u8..10).collect::<Vec<_>>());

        let ranged = fetcher
            .fetch("mem://a", Some(BytesRange::between(2, 4)))
            .await
            .unwrap();
        assert_eq!(ranged.partial_range, Some(BytesRange::between(2, 4)));
        assert_eq!(read_to_end(ranged).await.unwrap(), vec![2, 3, 4]);

        assert_eq!(fetcher.fetch_count("mem://a"), 2);
        assert!(fetcher.fetch("mem://missing", None).await.is_err());
    }

    #[tokio::test]
    async fn test_file_fetcher_reads_ranges() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();
        let uri = format!("file://{}", file.path().display());

        let whole = FileFetcher.fetch(&uri, None).await.unwrap();
        assert!(whole.partial_range.is_none());
        assert_eq!(read_to_end(whole).await.unwrap(), b"0123456789");

        let tail = FileFetcher
            .fetch(&uri, Some(BytesRange::from_offset(7)))
            .await
            .unwrap();
        assert_eq!(tail.partial_range, Some(BytesRange::between(7, 9)));
        assert_eq!(read_to_end(tail).await.unwrap(), b"789");

        assert!(FileFetcher.fetch("/definitely/missing.png", None).await.is_err());
    }

    #[tokio::test]
    async fn test_composite_routes_local_paths_to_file_fetcher() {
        let http = Arc::new(StaticFetcher::new());
        let file = Arc::new(StaticFetcher::new().with_payload("/tmp/x.png", vec![1]));
        let composite = CompositeFetcher::new(http.clone(), file.clone());

        composite.fetch("/tmp/x.png", None).await.unwrap();
        assert!(composite.fetch("https://host/x.png", None).await.is_err());
        assert_eq!(file.fetch_count("/tmp/x.png"), 1);
        assert_eq!(http.fetch_count("https://host/x.png"), 1);
    }
}
