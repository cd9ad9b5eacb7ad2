//! Bounded-concurrency segment scheduler.
//!
//! A worker set of at most N in-flight fetches feeds a reorder buffer keyed
//! by segment index; a single cursor drains the buffer so bytes hit the file
//! strictly in index order no matter the completion order. New fetches stop
//! while the buffer holds N undrained payloads, which bounds memory at
//! N in-flight plus N-1 parked buffers even when one slow segment stalls the
//! cursor.
//!
//! The first fetch error fails the whole job: in-flight futures are dropped
//! (every await point in them is a cancellation point) and the error is
//! returned. External cancellation works the same way and yields
//! `Cancelled`. The partial output file is left on disk for the caller.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{MAX_CONCURRENCY, MIN_CONCURRENCY};
use crate::error::DownloadError;
use crate::fetcher::SegmentSource;
use crate::playlist::Segment;
use crate::writer::OutputWriter;

/// Snapshot handed to the progress callback after each committed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub completed_segments: usize,
    pub total_segments: usize,
    pub bytes_written: u64,
}

pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

pub struct DownloadScheduler {
    source: Arc<dyn SegmentSource>,
    concurrency: usize,
    token: CancellationToken,
    progress: Option<ProgressCallback>,
}

impl DownloadScheduler {
    pub fn new(
        source: Arc<dyn SegmentSource>,
        concurrency: usize,
        token: CancellationToken,
    ) -> Self {
        Self {
            source,
            concurrency: concurrency.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY),
            token,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Download every segment and write them to `writer` in index order.
    pub async fn run(
        &self,
        segments: Vec<Segment>,
        writer: &mut OutputWriter,
    ) -> Result<(), DownloadError> {
        let total = segments.len();
        if total == 0 {
            return Ok(());
        }
        let segments: Arc<[Segment]> = segments.into();

        let mut in_flight = FuturesUnordered::new();
        let mut reorder: BTreeMap<usize, Bytes> = BTreeMap::new();
        let mut next_start = 0usize;
        let mut next_write = 0usize;

        debug!(total, concurrency = self.concurrency, "starting download");

        loop {
            while next_start < total
                && in_flight.len() < self.concurrency
                && reorder.len() < self.concurrency
            {
                let index = next_start;
                next_start += 1;
                let source = Arc::clone(&self.source);
                let segments = Arc::clone(&segments);
                in_flight.push(async move {
                    let result = source.fetch(&segments[index]).await;
                    (index, result)
                });
            }

            if in_flight.is_empty() {
                // Nothing running means nothing buffered either: started
                // segments are all written, so next_start == next_write.
                break;
            }

            tokio::select! {
                biased;

                _ = self.token.cancelled() => {
                    // Dropping the set drops every in-flight future at its
                    // current await point.
                    drop(in_flight);
                    debug!(written = next_write, total, "download cancelled");
                    return Err(DownloadError::Cancelled);
                }

                Some((index, result)) = in_flight.next() => {
                    match result {
                        Ok(bytes) => {
                            reorder.insert(index, bytes);
                            while let Some(bytes) = reorder.remove(&next_write) {
                                writer.write_segment(&bytes).await?;
                                next_write += 1;
                                if let Some(progress) = &self.progress {
                                    progress(Progress {
                                        completed_segments: next_write,
                                        total_segments: total,
                                        bytes_written: writer.bytes_written(),
                                    });
                                }
                            }
                        }
                        Err(error) => {
                            warn!(index, error = %error, "segment failed, aborting job");
                            drop(in_flight);
                            return Err(error);
                        }
                    }
                }
            }
        }

        debug_assert!(reorder.is_empty());
        debug_assert_eq!(next_write, total);
        Ok(())
    }
}
