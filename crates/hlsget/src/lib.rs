//! HLS and plain HTTP media downloader engine.
//!
//! The HLS pipeline parses master and media playlists, picks a variant by
//! caller preference, fetches segments concurrently with bounded
//! parallelism, decrypts AES-128 segments with job-lifetime cached keys, and
//! concatenates the plaintext into a single transport stream, optionally
//! remuxed to MP4 by an external muxer. A simpler streaming path with resume
//! handles directly-addressed files.
//!
//! [`job::run`] is the front door; the components underneath are public for
//! callers that want to assemble their own pipeline.

pub mod config;
pub mod crypto;
pub mod error;
pub mod fetcher;
pub mod http;
pub mod http_file;
pub mod job;
pub mod keys;
pub mod playlist;
pub mod remux;
pub mod retry;
pub mod scheduler;
pub mod variant;
pub mod writer;

pub use config::{DownloadConfig, VariantPreference};
pub use error::DownloadError;
pub use job::{JobOptions, Mode, run};
pub use scheduler::{Progress, ProgressCallback};
