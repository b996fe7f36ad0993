use std::path::Path;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::time::{Duration, timeout};
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("malformed url: {0}")]
    MalformedUrl(String),

    /// Permanent upstream rejection (4xx-class).
    #[error("request failed with status {status}")]
    Http { status: u16 },

    /// Connection resets, timeouts, 5xx-class responses.
    #[error("transient network failure: {0}")]
    Transient(String),

    #[error("download failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("http client init failed: {0}")]
    Client(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DownloadError {
    fn is_transient(&self) -> bool {
        matches!(self, DownloadError::Transient(_))
    }
}

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    /// Bound on each individual attempt, not on the whole fetch.
    pub attempt_timeout: Duration,
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            attempt_timeout: Duration::from_secs(300),
            user_agent: format!("uplink/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Streams artifacts from a URL to local storage with retry/backoff.
pub struct DownloadEngine {
    client: reqwest::Client,
    config: DownloadConfig,
}

impl DownloadEngine {
    pub fn new(config: DownloadConfig) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| DownloadError::Client(e.to_string()))?;
        Ok(Self { client, config })
    }

    /// Fetch `url` into `dest`, truncating it first. Transient failures are
    /// retried with exponential backoff up to the attempt cap; permanent
    /// failures abort immediately. `progress` observes (downloaded, total).
    pub async fn fetch<F>(&self, url: &str, dest: &Path, progress: F) -> Result<(), DownloadError>
    where
        F: Fn(u64, Option<u64>) + Send + Sync,
    {
        if url.parse::<reqwest::Url>().is_err() {
            return Err(DownloadError::MalformedUrl(url.to_string()));
        }

        let mut last = String::new();
        for attempt in 1..=self.config.max_attempts.max(1) {
            let result = match timeout(
                self.config.attempt_timeout,
                self.attempt(url, dest, &progress),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(DownloadError::Transient(format!(
                    "attempt timed out after {:?}",
                    self.config.attempt_timeout
                ))),
            };

            match result {
                Ok(()) => {
                    debug!(url, attempt, "download complete");
                    return Ok(());
                }
                Err(err) if err.is_transient() => {
                    warn!(url, attempt, error = %err, "transient download failure");
                    last = err.to_string();
                }
                Err(err) => return Err(err),
            }

            if attempt < self.config.max_attempts {
                let backoff = self.config.initial_backoff * 2u32.saturating_pow(attempt - 1);
                tokio::time::sleep(backoff).await;
            }
        }

        Err(DownloadError::Exhausted {
            attempts: self.config.max_attempts.max(1),
            last,
        })
    }

    async fn attempt<F>(&self, url: &str, dest: &Path, progress: &F) -> Result<(), DownloadError>
    where
        F: Fn(u64, Option<u64>) + Send + Sync,
    {
        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DownloadError::Transient(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            if status.is_server_error() {
                return Err(DownloadError::Transient(format!(
                    "server returned {status}"
                )));
            }
            return Err(DownloadError::Http {
                status: status.as_u16(),
            });
        }

        // Truncate any partial write from an earlier attempt.
        let mut file = tokio::fs::File::create(dest).await?;
        let total = resp.content_length();
        let mut downloaded: u64 = 0;

        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| DownloadError::Transient(e.to_string()))?
        {
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            progress(downloaded, total);
        }
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    /// Minimal HTTP/1.1 server answering every request with `response`,
    /// counting connections.
    async fn serve(response: &'static [u8]) -> (String, Arc<AtomicU32>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let hits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&hits);

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(response).await;
                let _ = stream.shutdown().await;
            }
        });

        (format!("http://{addr}/artifact"), hits)
    }

    fn fast_engine(max_attempts: u32) -> DownloadEngine {
        DownloadEngine::new(DownloadConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            attempt_timeout: Duration::from_secs(5),
            ..DownloadConfig::default()
        })
        .expect("engine")
    }

    #[tokio::test]
    async fn transient_failures_retry_exactly_max_attempts() {
        let (url, hits) =
            serve(b"HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await;
        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("artifact");

        let err = fast_engine(3)
            .fetch(&url, &dest, |_, _| {})
            .await
            .expect_err("must exhaust");

        assert!(matches!(err, DownloadError::Exhausted { attempts: 3, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failure_does_not_retry() {
        let (url, hits) =
            serve(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n").await;
        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("artifact");

        let err = fast_engine(3)
            .fetch(&url, &dest, |_, _| {})
            .await
            .expect_err("must fail");

        assert!(matches!(err, DownloadError::Http { status: 404 }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn successful_fetch_streams_body_and_reports_progress() {
        let (url, hits) = serve(
            b"HTTP/1.1 200 OK\r\ncontent-length: 11\r\nconnection: close\r\n\r\nhello bytes",
        )
        .await;
        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("artifact");

        let seen = Arc::new(AtomicU32::new(0));
        let seen_in_cb = Arc::clone(&seen);
        fast_engine(3)
            .fetch(&url, &dest, move |downloaded, total| {
                seen_in_cb.store(downloaded as u32, Ordering::SeqCst);
                assert_eq!(total, Some(11));
            })
            .await
            .expect("fetch");

        assert_eq!(std::fs::read(&dest).expect("read dest"), b"hello bytes");
        assert_eq!(seen.load(Ordering::SeqCst), 11);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_url_fails_without_request() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("artifact");
        let err = fast_engine(3)
            .fetch("not a url", &dest, |_, _| {})
            .await
            .expect_err("must fail");
        assert!(matches!(err, DownloadError::MalformedUrl(_)));
    }

    #[tokio::test]
    async fn retry_truncates_partial_writes() {
        // First request: body shorter than the advertised length, so the
        // client sees a transient body error after a partial write. Second:
        // a clean small body. The dest must contain only the second body.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let mut first = true;
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                if first {
                    first = false;
                    let _ = stream
                        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\nconnection: close\r\n\r\npartial-junk")
                        .await;
                } else {
                    let _ = stream
                        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok")
                        .await;
                }
                let _ = stream.shutdown().await;
            }
        });

        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("artifact");
        fast_engine(3)
            .fetch(&format!("http://{addr}/artifact"), &dest, |_, _| {})
            .await
            .expect("second attempt succeeds");

        assert_eq!(std::fs::read(&dest).expect("read dest"), b"ok");
    }
}
