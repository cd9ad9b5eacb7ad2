//! Plain HTTP file download with streaming writes and resume.
//!
//! The body streams straight to disk in bounded chunks. When a partial file
//! exists the request carries `Range: bytes=<len>-`; a `206` appends, a `200`
//! means the server ignored the range and the file restarts from scratch.
//! A broken body re-enters the loop from the current file size, with
//! attempts without forward progress counted against the retry limit.

use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::DownloadError;
use crate::http::HttpClient;
use crate::retry::RetryPolicy;
use crate::writer::OutputWriter;

/// Largest single write issued to the file.
const MAX_WRITE_CHUNK: usize = 1024 * 1024;

pub type ByteProgress = Arc<dyn Fn(u64) + Send + Sync>;

enum StreamFault {
    /// Connection died mid-body; restart from the current file size.
    Transient(DownloadError),
    Fatal(DownloadError),
}

/// Download `url` to `out_path`, resuming a partial file when the server
/// honors range requests. Returns the final file size.
pub async fn download(
    client: &HttpClient,
    url: &Url,
    out_path: &Path,
    token: &CancellationToken,
    progress: Option<&ByteProgress>,
) -> Result<u64, DownloadError> {
    let policy = RetryPolicy::default();
    let mut stalled_rounds: u32 = 0;

    loop {
        let existing = tokio::fs::metadata(out_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        let response = client
            .get_response(url, (existing > 0).then_some(existing))
            .await?;

        match stream_to_file(response, out_path, existing, token, progress).await {
            Ok(total) => {
                info!(path = %out_path.display(), bytes = total, "download complete");
                return Ok(total);
            }
            Err(StreamFault::Fatal(error)) => return Err(error),
            Err(StreamFault::Transient(error)) => {
                let now = tokio::fs::metadata(out_path)
                    .await
                    .map(|m| m.len())
                    .unwrap_or(0);
                if now > existing {
                    stalled_rounds = 0;
                } else {
                    stalled_rounds += 1;
                    if stalled_rounds + 1 >= policy.max_attempts {
                        return Err(error);
                    }
                }
                let delay = policy.delay_for_retry(stalled_rounds);
                warn!(
                    error = %error,
                    resume_from = now,
                    delay_ms = delay.as_millis() as u64,
                    "body interrupted, resuming"
                );
                tokio::select! {
                    _ = token.cancelled() => return Err(DownloadError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Stream an already-open `200` response to `out_path` (truncating), falling
/// back to the resume loop if the body breaks. Lets auto-mode reuse its
/// content-type probe without a second request.
pub async fn download_from_response(
    client: &HttpClient,
    url: &Url,
    response: reqwest::Response,
    out_path: &Path,
    token: &CancellationToken,
    progress: Option<&ByteProgress>,
) -> Result<u64, DownloadError> {
    match stream_to_file(response, out_path, 0, token, progress).await {
        Ok(total) => {
            info!(path = %out_path.display(), bytes = total, "download complete");
            Ok(total)
        }
        Err(StreamFault::Fatal(error)) => Err(error),
        Err(StreamFault::Transient(error)) => {
            warn!(error = %error, "body interrupted, re-requesting");
            download(client, url, out_path, token, progress).await
        }
    }
}

async fn stream_to_file(
    response: reqwest::Response,
    out_path: &Path,
    existing: u64,
    token: &CancellationToken,
    progress: Option<&ByteProgress>,
) -> Result<u64, StreamFault> {
    let resumed = existing > 0 && response.status() == StatusCode::PARTIAL_CONTENT;
    let mut writer = if resumed {
        debug!(offset = existing, "server honored range, appending");
        OutputWriter::append(out_path).await.map_err(StreamFault::Fatal)?
    } else {
        if existing > 0 {
            debug!("server ignored range, restarting from scratch");
        }
        OutputWriter::create(out_path).await.map_err(StreamFault::Fatal)?
    };

    let mut stream = response.bytes_stream();
    loop {
        let chunk = tokio::select! {
            _ = token.cancelled() => {
                return Err(StreamFault::Fatal(DownloadError::Cancelled));
            }
            chunk = stream.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                for piece in bytes.chunks(MAX_WRITE_CHUNK) {
                    writer
                        .write_segment(piece)
                        .await
                        .map_err(StreamFault::Fatal)?;
                }
                if let Some(progress) = progress {
                    progress(writer.bytes_written());
                }
            }
            Some(Err(error)) => {
                // Flush what arrived so the next round resumes past it.
                let _ = writer.finish().await;
                return Err(StreamFault::Transient(error.into()));
            }
            None => break,
        }
    }

    writer.finish().await.map_err(StreamFault::Fatal)
}
