use anyhow::Context;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::model::{DownloadId, DownloadStatus, ErrorCode};
use crate::plugins::registry::{DownloadRequest, DownloadService, DriverContext, StatusSink};

const ENOSPC: i32 = 28;

#[derive(thiserror::Error, Debug)]
pub enum HttpDriverError {
    #[error("http request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("http status error: {0}")]
    Status(StatusCode),

    #[error("response carries no usable content-length")]
    MissingLength,

    #[error("body truncated: expected {expected} bytes, received {received}")]
    Truncated { expected: u64, received: u64 },

    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no data from server for {0:?}")]
    Stalled(Duration),

    #[error("download cancelled")]
    Cancelled,
}

impl HttpDriverError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Request(_)
            | Self::Status(_)
            | Self::MissingLength
            | Self::Truncated { .. }
            | Self::Stalled(_) => {
                ErrorCode::NetworkError
            }
            Self::Io { source, .. } if source.raw_os_error() == Some(ENOSPC) => ErrorCode::InsufficientStorage,
            Self::Io { .. } | Self::Cancelled => ErrorCode::InternalError,
        }
    }
}

/// Decides when a progress report is worth sending: never for a zero delta,
/// and never sooner than `interval` after the previous one.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last_at: Instant,
    last_reported: u64,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last_at: Instant::now(), last_reported: 0 }
    }

    pub fn ready(&mut self, downloaded: u64) -> bool {
        self.ready_at(downloaded, Instant::now())
    }

    fn ready_at(&mut self, downloaded: u64, now: Instant) -> bool {
        if downloaded <= self.last_reported || now.duration_since(self.last_at) < self.interval {
            return false;
        }
        self.mark(downloaded, now);
        true
    }

    /// Unconditional final report, unless nothing changed since the last one.
    pub fn finish(&mut self, downloaded: u64) -> bool {
        if downloaded == self.last_reported {
            return false;
        }
        self.mark(downloaded, Instant::now());
        true
    }

    fn mark(&mut self, downloaded: u64, now: Instant) {
        self.last_reported = downloaded;
        self.last_at = now;
    }
}

/// Streams artifact archives from the delivery server. One POST per download,
/// the device spec as JSON body.
pub struct HttpDownloadClient {
    client: reqwest::Client,
    ctx: DriverContext,
    in_flight: Arc<Mutex<HashMap<DownloadId, CancellationToken>>>,
}

impl HttpDownloadClient {
    pub fn new(ctx: DriverContext) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(Duration::from_secs(ctx.connect_timeout_secs))
            .default_headers(Self::build_headers(&ctx)?)
            .build()
            .context("build http client")?;
        Ok(Self { client, ctx, in_flight: Arc::new(Mutex::new(HashMap::new())) })
    }

    fn build_headers(ctx: &DriverContext) -> anyhow::Result<HeaderMap> {
        let mut h = HeaderMap::new();
        h.insert(USER_AGENT, HeaderValue::from_str(&ctx.user_agent)?);
        for (k, v) in &ctx.headers {
            let name = HeaderName::from_bytes(k.as_bytes())?;
            let value = HeaderValue::from_str(v)?;
            h.insert(name, value);
        }
        Ok(h)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    async fn transfer(
        client: &reqwest::Client,
        ctx: &DriverContext,
        request: &DownloadRequest,
        token: &CancellationToken,
        sink: &StatusSink<DownloadStatus>,
    ) -> Result<u64, HttpDriverError> {
        let _ = sink.send(DownloadStatus::Pending);

        let send = client
            .post(request.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(request.body.clone())
            .send();
        let idle = ctx.read_timeout();
        let resp = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(HttpDriverError::Cancelled),
            r = tokio::time::timeout(idle, send) => r.map_err(|_| HttpDriverError::Stalled(idle))??,
        };

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(id = request.id, url = %request.url, %status, body = %body, "download rejected by server");
            return Err(HttpDriverError::Status(status));
        }

        let total = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or(HttpDriverError::MissingLength)?;

        let io_err = |source: std::io::Error| HttpDriverError::Io { path: request.dest.clone(), source };
        let mut file = tokio::fs::File::create(&request.dest).await.map_err(io_err)?;
        let _ = sink.send(DownloadStatus::Running { downloaded: 0, total });

        let mut throttle = ProgressThrottle::new(ctx.progress_interval());
        let mut downloaded = 0u64;
        let mut stream = Box::pin(resp.bytes_stream());
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(HttpDriverError::Cancelled),
                n = tokio::time::timeout(idle, stream.next()) => n.map_err(|_| HttpDriverError::Stalled(idle))?,
            };
            let Some(chunk) = next else { break };
            let chunk: Bytes = chunk?;
            file.write_all(&chunk).await.map_err(io_err)?;
            downloaded += chunk.len() as u64;
            if throttle.ready(downloaded) {
                let _ = sink.send(DownloadStatus::Running { downloaded, total });
            }
        }
        file.flush().await.map_err(io_err)?;

        if downloaded != total {
            return Err(HttpDriverError::Truncated { expected: total, received: downloaded });
        }
        if throttle.finish(downloaded) {
            let _ = sink.send(DownloadStatus::Running { downloaded, total });
        }
        Ok(total)
    }
}

impl DownloadService for HttpDownloadClient {
    fn name(&self) -> &'static str {
        "http-download"
    }

    fn start(&self, request: DownloadRequest, sink: StatusSink<DownloadStatus>) -> bool {
        let token = CancellationToken::new();
        {
            let mut in_flight = self.in_flight.lock();
            if in_flight.contains_key(&request.id) {
                warn!(id = request.id, "download already in flight");
                return false;
            }
            in_flight.insert(request.id, token.clone());
        }
        let _ = sink.send(DownloadStatus::Enqueued { id: request.id });

        let client = self.client.clone();
        let ctx = self.ctx.clone();
        let in_flight = self.in_flight.clone();
        tokio::spawn(async move {
            let result = Self::transfer(&client, &ctx, &request, &token, &sink).await;

            // Decided under the map lock so `cancel` and completion agree.
            let status = {
                let mut m = in_flight.lock();
                m.remove(&request.id);
                match result {
                    _ if token.is_cancelled() => DownloadStatus::Canceled,
                    Ok(total) => DownloadStatus::Successful { path: request.dest.clone(), total },
                    Err(e) => DownloadStatus::Failed { code: e.error_code(), reason: e.to_string() },
                }
            };

            match &status {
                DownloadStatus::Successful { total, .. } => {
                    info!(id = request.id, bytes = total, path = %request.dest.display(), "download complete");
                }
                other => {
                    debug!(id = request.id, status = ?other, "download ended");
                    if let Err(e) = tokio::fs::remove_file(&request.dest).await {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            warn!(path = %request.dest.display(), error = %e, "partial download not removed");
                        }
                    }
                }
            }
            let _ = sink.send(status);
        });
        true
    }

    fn cancel(&self, id: DownloadId) -> bool {
        match self.in_flight.lock().get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn cancel_all(&self) {
        for token in self.in_flight.lock().values() {
            token.cancel();
        }
    }
}
