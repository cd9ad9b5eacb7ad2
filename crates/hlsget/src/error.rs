use std::process::ExitStatus;

use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("invalid arguments: {reason}")]
    Usage { reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request for {url} failed with HTTP {status}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("malformed playlist: {reason}")]
    Parse { reason: String },

    #[error("master playlist has no variants")]
    NoVariant,

    #[error("unsupported encryption method `{method}`")]
    UnsupportedEncryption { method: String },

    #[error("key fetch failed: {reason}")]
    Key { reason: String },

    #[error("decryption failed: {reason}")]
    Decrypt { reason: String },

    #[error("I/O error: {source}")]
    Write {
        #[from]
        source: std::io::Error,
    },

    #[error("muxer `{program}` not found")]
    RemuxUnavailable { program: String },

    #[error("muxer exited with {status}: {stderr_tail}")]
    RemuxFailed {
        status: ExitStatus,
        stderr_tail: String,
    },

    #[error("download cancelled")]
    Cancelled,
}

impl DownloadError {
    pub fn usage(reason: impl Into<String>) -> Self {
        Self::Usage {
            reason: reason.into(),
        }
    }

    pub fn http_status(status: StatusCode, url: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
        }
    }

    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
        }
    }

    pub fn key(reason: impl Into<String>) -> Self {
        Self::Key {
            reason: reason.into(),
        }
    }

    pub fn decrypt(reason: impl Into<String>) -> Self {
        Self::Decrypt {
            reason: reason.into(),
        }
    }

    /// Process exit code reported by the CLI for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage { .. } => 2,
            Self::Network { .. } | Self::HttpStatus { .. } => 3,
            Self::Parse { .. } | Self::NoVariant | Self::UnsupportedEncryption { .. } => 4,
            Self::Key { .. } | Self::Decrypt { .. } => 5,
            Self::RemuxUnavailable { .. } | Self::RemuxFailed { .. } => 6,
            Self::Cancelled => 130,
            Self::Write { .. } => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_cli_contract() {
        assert_eq!(DownloadError::usage("bad --res").exit_code(), 2);
        assert_eq!(
            DownloadError::http_status(StatusCode::NOT_FOUND, "http://a/b").exit_code(),
            3
        );
        assert_eq!(DownloadError::parse("no #EXTM3U").exit_code(), 4);
        assert_eq!(DownloadError::NoVariant.exit_code(), 4);
        assert_eq!(
            DownloadError::UnsupportedEncryption {
                method: "SAMPLE-AES".to_string()
            }
            .exit_code(),
            4
        );
        assert_eq!(DownloadError::key("short key").exit_code(), 5);
        assert_eq!(DownloadError::decrypt("bad pad").exit_code(), 5);
        assert_eq!(
            DownloadError::RemuxUnavailable {
                program: "ffmpeg".to_string()
            }
            .exit_code(),
            6
        );
        assert_eq!(DownloadError::Cancelled.exit_code(), 130);
    }
}
