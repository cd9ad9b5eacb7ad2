//! Single-flight cache for AES-128 key material.
//!
//! Keys are content-addressed by URI and fetched at most once per job on the
//! success path: the first caller for a URI installs a cell and runs the
//! fetch, concurrent callers await the same cell. A failed fetch leaves the
//! cell empty so a later segment can try again.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};
use tracing::debug;
use url::Url;

use crate::error::DownloadError;
use crate::http::HttpClient;

pub struct KeyCache {
    client: Arc<HttpClient>,
    entries: Mutex<HashMap<Url, Arc<OnceCell<[u8; 16]>>>>,
}

impl KeyCache {
    pub fn new(client: Arc<HttpClient>) -> Self {
        Self {
            client,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key_uri: &Url) -> Result<[u8; 16], DownloadError> {
        let cell = {
            let mut entries = self.entries.lock().await;
            entries
                .entry(key_uri.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let key = cell
            .get_or_try_init(|| async {
                let body = self.client.get_bytes(key_uri, None).await?;
                let key: [u8; 16] = body.as_ref().try_into().map_err(|_| DownloadError::Key {
                    reason: format!(
                        "key {} has {} bytes, expected 16",
                        key_uri,
                        body.len()
                    ),
                })?;
                debug!(uri = %key_uri, "fetched decryption key");
                Ok::<_, DownloadError>(key)
            })
            .await?;

        Ok(*key)
    }
}
