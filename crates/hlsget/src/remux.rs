//! External muxer invocation: copy the TS streams into an MP4 container.
//!
//! The muxer is a pure subprocess contract. Nothing is linked in-process;
//! the program comes from `FFMPEG_PATH` or the search path.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::DownloadError;

pub const FFMPEG_PATH_ENV: &str = "FFMPEG_PATH";

/// Longest stderr suffix kept for error reporting.
const STDERR_TAIL_LIMIT: usize = 4096;

pub struct RemuxInvoker {
    program: PathBuf,
}

impl RemuxInvoker {
    /// Program from `FFMPEG_PATH` when set, otherwise `ffmpeg` on the PATH.
    pub fn from_env() -> Self {
        let program = std::env::var_os(FFMPEG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("ffmpeg"));
        Self { program }
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn build_args(input: &Path, output: &Path) -> Vec<OsString> {
        vec![
            OsString::from("-hide_banner"),
            OsString::from("-y"),
            OsString::from("-loglevel"),
            OsString::from("error"),
            OsString::from("-i"),
            input.as_os_str().to_owned(),
            OsString::from("-c"),
            OsString::from("copy"),
            output.as_os_str().to_owned(),
        ]
    }

    /// Remux `input` into `output` without re-encoding.
    pub async fn remux_to_mp4(
        &self,
        input: &Path,
        output: &Path,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let args = Self::build_args(input, output);
        debug!(program = %self.program.display(), ?args, "invoking muxer");

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        no_window(&mut command);

        let child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DownloadError::RemuxUnavailable {
                    program: self.program.display().to_string(),
                }
            } else {
                DownloadError::from(e)
            }
        })?;

        let result = child.wait_with_output().await?;
        if !result.status.success() {
            let stderr = result.stderr;
            let tail_start = stderr.len().saturating_sub(STDERR_TAIL_LIMIT);
            let stderr_tail = String::from_utf8_lossy(&stderr[tail_start..])
                .trim()
                .to_string();
            return Err(DownloadError::RemuxFailed {
                status: result.status,
                stderr_tail,
            });
        }

        info!(output = %output.display(), "remux complete");
        Ok(())
    }
}

fn no_window(command: &mut Command) {
    #[cfg(windows)]
    {
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        command.creation_flags(CREATE_NO_WINDOW);
    }
    #[cfg(not(windows))]
    {
        let _ = command;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_request_a_stream_copy() {
        let args = RemuxInvoker::build_args(Path::new("/tmp/in.ts"), Path::new("/tmp/out.mp4"));
        let args: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(
            args,
            vec![
                "-hide_banner",
                "-y",
                "-loglevel",
                "error",
                "-i",
                "/tmp/in.ts",
                "-c",
                "copy",
                "/tmp/out.mp4",
            ]
        );
    }

    #[tokio::test]
    async fn missing_program_reports_unavailable() {
        let invoker = RemuxInvoker::with_program("/nonexistent/path/to/ffmpeg");
        let token = CancellationToken::new();
        let error = invoker
            .remux_to_mp4(Path::new("in.ts"), Path::new("out.mp4"), &token)
            .await
            .unwrap_err();
        assert!(matches!(error, DownloadError::RemuxUnavailable { .. }));
    }

    #[tokio::test]
    async fn cancelled_token_skips_the_spawn() {
        let invoker = RemuxInvoker::with_program("/nonexistent/path/to/ffmpeg");
        let token = CancellationToken::new();
        token.cancel();
        let error = invoker
            .remux_to_mp4(Path::new("in.ts"), Path::new("out.mp4"), &token)
            .await
            .unwrap_err();
        assert!(matches!(error, DownloadError::Cancelled));
    }
}
