//! Thin retrying wrapper over a shared `reqwest` client.
//!
//! One instance (and so one connection pool) serves every fetch in a job:
//! playlists, keys, segments and plain files.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::RANGE;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use url::Url;

use crate::config::DownloadConfig;
use crate::error::DownloadError;
use crate::playlist::ByteRange;
use crate::retry::{
    RetryAction, RetryPolicy, retry_after_hint, retry_with_backoff, retryable_status,
    transient_transport_error,
};

/// A `Retry-After` hint is honored on 429 and 503 only; the other retryable
/// statuses keep the computed backoff schedule.
fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
        retry_after_hint(response.headers())
    } else {
        None
    }
}

pub struct HttpClient {
    client: reqwest::Client,
    config: Arc<DownloadConfig>,
    policy: RetryPolicy,
    token: CancellationToken,
}

impl HttpClient {
    pub fn new(config: Arc<DownloadConfig>, token: CancellationToken) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.request_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build()?;
        Ok(Self {
            client,
            config,
            policy: RetryPolicy::default(),
            token,
        })
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Fetch a UTF-8 text body (playlists).
    pub async fn get_text(&self, url: &Url) -> Result<String, DownloadError> {
        let bytes = self.get_bytes(url, None).await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| DownloadError::parse(format!("{url} is not valid UTF-8: {e}")))
    }

    /// Fetch a complete body into memory, optionally a sub-resource byte range.
    pub async fn get_bytes(
        &self,
        url: &Url,
        range: Option<&ByteRange>,
    ) -> Result<Bytes, DownloadError> {
        let range_header = range.map(|r| format!("bytes={}-{}", r.offset, r.offset + r.length - 1));

        retry_with_backoff(&self.policy, &self.token, |_attempt| {
            let range_header = range_header.clone();
            async move {
                let mut request = self
                    .client
                    .get(url.clone())
                    .headers(self.config.request_headers())
                    .timeout(self.config.request_timeout);
                if let Some(range) = range_header {
                    request = request.header(RANGE, range);
                }

                let response = tokio::select! {
                    _ = self.token.cancelled() => return RetryAction::Fail(DownloadError::Cancelled),
                    response = request.send() => response,
                };

                match response {
                    Ok(response) => {
                        let status = response.status();
                        if status.is_success() {
                            let body = tokio::select! {
                                _ = self.token.cancelled() => {
                                    return RetryAction::Fail(DownloadError::Cancelled);
                                }
                                body = response.bytes() => body,
                            };
                            match body {
                                Ok(bytes) => {
                                    trace!(url = %url, bytes = bytes.len(), "fetched");
                                    RetryAction::Success(bytes)
                                }
                                Err(e) if transient_transport_error(&e) => RetryAction::Retry {
                                    error: e.into(),
                                    after: None,
                                },
                                Err(e) => RetryAction::Fail(e.into()),
                            }
                        } else if retryable_status(status) {
                            RetryAction::Retry {
                                error: DownloadError::http_status(status, url.as_str()),
                                after: retry_after(&response),
                            }
                        } else {
                            RetryAction::Fail(DownloadError::http_status(status, url.as_str()))
                        }
                    }
                    Err(e) if transient_transport_error(&e) => RetryAction::Retry {
                        error: e.into(),
                        after: None,
                    },
                    Err(e) => RetryAction::Fail(e.into()),
                }
            }
        })
        .await
    }

    /// Open a streaming response. `resume_from` becomes a `Range: bytes=N-`
    /// header; the caller inspects the status to learn whether the server
    /// honored it. Only the request phase is retried here — body faults are
    /// the caller's to recover (it owns the file-offset state).
    pub async fn get_response(
        &self,
        url: &Url,
        resume_from: Option<u64>,
    ) -> Result<reqwest::Response, DownloadError> {
        retry_with_backoff(&self.policy, &self.token, |_attempt| async move {
            let mut request = self
                .client
                .get(url.clone())
                .headers(self.config.request_headers());
            if let Some(offset) = resume_from {
                request = request.header(RANGE, format!("bytes={offset}-"));
            }

            let response = tokio::select! {
                _ = self.token.cancelled() => return RetryAction::Fail(DownloadError::Cancelled),
                response = request.send() => response,
            };

            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        RetryAction::Success(response)
                    } else if retryable_status(status) {
                        RetryAction::Retry {
                            error: DownloadError::http_status(status, url.as_str()),
                            after: retry_after(&response),
                        }
                    } else {
                        RetryAction::Fail(DownloadError::http_status(status, url.as_str()))
                    }
                }
                Err(e) if transient_transport_error(&e) => RetryAction::Retry {
                    error: e.into(),
                    after: None,
                },
                Err(e) => RetryAction::Fail(e.into()),
            }
        })
        .await
    }
}
