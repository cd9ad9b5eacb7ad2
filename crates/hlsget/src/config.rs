use std::time::Duration;

use reqwest::header::{COOKIE, HeaderMap, HeaderValue, REFERER, USER_AGENT};
use tracing::warn;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Bounds on concurrent segment downloads.
pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 32;
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Variant preference used when a master playlist offers several renditions.
#[derive(Debug, Clone, Default)]
pub struct VariantPreference {
    /// Preferred `(width, height)`. Selection caps on height.
    pub resolution: Option<(u32, u32)>,
    /// Preferred peak bandwidth in bits per second.
    pub bandwidth: Option<u64>,
}

/// Configurable options shared by every download mode.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// User agent sent when the caller's header map does not carry one.
    pub user_agent: String,

    /// Referer sent when the caller's header map does not carry one.
    pub referer: Option<String>,

    /// Cookie string forwarded as a single `Cookie` header.
    pub cookies: Option<String>,

    /// Caller-supplied headers, forwarded verbatim.
    pub headers: HeaderMap,

    /// Time allowed to establish a connection.
    pub connect_timeout: Duration,

    /// Overall per-request timeout (covers the body read).
    pub request_timeout: Duration,

    /// Concurrent segment downloads. Read through [`DownloadConfig::concurrency`],
    /// which clamps to `[MIN_CONCURRENCY, MAX_CONCURRENCY]`.
    pub concurrency: usize,

    pub preference: VariantPreference,

    /// Payloads at or above this size are decrypted on the blocking pool.
    pub decrypt_offload_threshold: usize,

    /// Idle connections kept per host for segment fetch reuse.
    pub pool_max_idle_per_host: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            referer: None,
            cookies: None,
            headers: HeaderMap::new(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            concurrency: DEFAULT_CONCURRENCY,
            preference: VariantPreference::default(),
            decrypt_offload_threshold: 1024 * 1024,
            pool_max_idle_per_host: 10,
        }
    }
}

impl DownloadConfig {
    pub fn concurrency(&self) -> usize {
        self.concurrency.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY)
    }

    /// Header map for an outgoing request: the caller's headers verbatim, with
    /// `User-Agent`, `Referer` and `Cookie` filled in only where absent.
    pub fn request_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();

        if !headers.contains_key(USER_AGENT) {
            match HeaderValue::from_str(&self.user_agent) {
                Ok(value) => {
                    headers.insert(USER_AGENT, value);
                }
                Err(_) => warn!(user_agent = %self.user_agent, "invalid user agent, not sent"),
            }
        }

        if !headers.contains_key(REFERER)
            && let Some(referer) = &self.referer
        {
            match HeaderValue::from_str(referer) {
                Ok(value) => {
                    headers.insert(REFERER, value);
                }
                Err(_) => warn!(referer = %referer, "invalid referer, not sent"),
            }
        }

        if !headers.contains_key(COOKIE)
            && let Some(cookies) = &self.cookies
        {
            match HeaderValue::from_str(cookies) {
                Ok(value) => {
                    headers.insert(COOKIE, value);
                }
                Err(_) => warn!("invalid cookie string, not sent"),
            }
        }

        headers
    }
}
