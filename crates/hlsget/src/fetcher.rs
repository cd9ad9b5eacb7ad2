//! Per-segment fetch and decrypt.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::trace;

use crate::crypto;
use crate::error::DownloadError;
use crate::http::HttpClient;
use crate::keys::KeyCache;
use crate::playlist::{Encryption, Segment};

/// Seam between the scheduler and the network, mockable in tests.
#[async_trait]
pub trait SegmentSource: Send + Sync {
    /// Download one segment and return its plaintext bytes.
    async fn fetch(&self, segment: &Segment) -> Result<Bytes, DownloadError>;
}

pub struct SegmentFetcher {
    client: Arc<HttpClient>,
    keys: Arc<KeyCache>,
    decrypt_offload_threshold: usize,
}

impl SegmentFetcher {
    pub fn new(
        client: Arc<HttpClient>,
        keys: Arc<KeyCache>,
        decrypt_offload_threshold: usize,
    ) -> Self {
        Self {
            client,
            keys,
            decrypt_offload_threshold,
        }
    }
}

#[async_trait]
impl SegmentSource for SegmentFetcher {
    async fn fetch(&self, segment: &Segment) -> Result<Bytes, DownloadError> {
        let raw = self
            .client
            .get_bytes(&segment.uri, segment.byte_range.as_ref())
            .await?;

        match &segment.encryption {
            Encryption::None => Ok(raw),
            Encryption::Aes128 { key_uri, iv } => {
                let key = self.keys.get(key_uri).await?;
                let iv = iv.unwrap_or_else(|| crypto::derive_iv(segment.absolute_index));
                let plaintext =
                    crypto::decrypt(raw, key, iv, self.decrypt_offload_threshold).await?;
                trace!(
                    index = segment.index,
                    bytes = plaintext.len(),
                    "decrypted segment"
                );
                Ok(plaintext)
            }
        }
    }
}
