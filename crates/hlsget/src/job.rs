//! Top-level download job: routes a URL to the HLS pipeline or the plain
//! HTTP path and wires the components together.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::header::{CONTENT_TYPE, HeaderMap};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::DownloadConfig;
use crate::error::DownloadError;
use crate::fetcher::SegmentFetcher;
use crate::http::HttpClient;
use crate::http_file::{self, ByteProgress};
use crate::keys::KeyCache;
use crate::playlist::{self, MediaPlaylist, Playlist};
use crate::remux::RemuxInvoker;
use crate::scheduler::{DownloadScheduler, Progress, ProgressCallback};
use crate::variant::select_variant;
use crate::writer::OutputWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Decide by URL suffix, then by the first response's content type.
    #[default]
    Auto,
    Http,
    Hls,
}

#[derive(Debug)]
pub struct JobOptions {
    pub url: url::Url,
    /// Output path. The HLS pipeline derives `<stem>.ts` / `<stem>.mp4`
    /// from it; the plain HTTP path uses it verbatim.
    pub output: PathBuf,
    pub mode: Mode,
    /// Remux the assembled TS into an MP4 when a muxer is available.
    pub remux: bool,
    pub config: DownloadConfig,
}

/// Run a download job to completion. Returns the path of the final artifact.
pub async fn run(
    options: JobOptions,
    token: CancellationToken,
    progress: Option<ProgressCallback>,
) -> Result<PathBuf, DownloadError> {
    let config = Arc::new(options.config);
    let client = Arc::new(HttpClient::new(Arc::clone(&config), token.clone())?);

    let byte_progress: Option<ByteProgress> = progress.clone().map(|callback| {
        Arc::new(move |bytes_written: u64| {
            callback(Progress {
                completed_segments: 0,
                total_segments: 0,
                bytes_written,
            })
        }) as ByteProgress
    });

    match options.mode {
        Mode::Hls => {
            run_hls(
                &client,
                &config,
                &options.url,
                &options.output,
                options.remux,
                &token,
                progress,
            )
            .await
        }
        Mode::Http => {
            http_file::download(
                &client,
                &options.url,
                &options.output,
                &token,
                byte_progress.as_ref(),
            )
            .await?;
            Ok(options.output)
        }
        Mode::Auto => {
            if has_m3u8_suffix(&options.url) {
                return run_hls(
                    &client,
                    &config,
                    &options.url,
                    &options.output,
                    options.remux,
                    &token,
                    progress,
                )
                .await;
            }

            let partial_exists = tokio::fs::metadata(&options.output)
                .await
                .map(|m| m.len() > 0)
                .unwrap_or(false);
            if partial_exists {
                // Resume wants its own ranged request; skip the probe.
                http_file::download(
                    &client,
                    &options.url,
                    &options.output,
                    &token,
                    byte_progress.as_ref(),
                )
                .await?;
                return Ok(options.output);
            }

            // Probe with a plain GET and reuse the response either way.
            let response = client.get_response(&options.url, None).await?;
            if is_hls_content_type(response.headers()) {
                let text = response.text().await.map_err(DownloadError::from)?;
                run_hls_from_text(
                    &client,
                    &config,
                    text,
                    &options.url,
                    &options.output,
                    options.remux,
                    &token,
                    progress,
                )
                .await
            } else {
                http_file::download_from_response(
                    &client,
                    &options.url,
                    response,
                    &options.output,
                    &token,
                    byte_progress.as_ref(),
                )
                .await?;
                Ok(options.output)
            }
        }
    }
}

fn has_m3u8_suffix(url: &url::Url) -> bool {
    url.path().to_ascii_lowercase().ends_with(".m3u8")
}

fn is_hls_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("mpegurl"))
}

#[allow(clippy::too_many_arguments)]
async fn run_hls(
    client: &Arc<HttpClient>,
    config: &Arc<DownloadConfig>,
    url: &url::Url,
    output: &Path,
    remux: bool,
    token: &CancellationToken,
    progress: Option<ProgressCallback>,
) -> Result<PathBuf, DownloadError> {
    let text = client.get_text(url).await?;
    run_hls_from_text(client, config, text, url, output, remux, token, progress).await
}

#[allow(clippy::too_many_arguments)]
async fn run_hls_from_text(
    client: &Arc<HttpClient>,
    config: &Arc<DownloadConfig>,
    text: String,
    url: &url::Url,
    output: &Path,
    remux: bool,
    token: &CancellationToken,
    progress: Option<ProgressCallback>,
) -> Result<PathBuf, DownloadError> {
    let media = resolve_media_playlist(client, config, &text, url).await?;
    if media.segments.is_empty() {
        return Err(DownloadError::parse("media playlist has no segments"));
    }
    if !media.end_list {
        warn!("playlist has no #EXT-X-ENDLIST, downloading the current snapshot");
    }

    let total_segments = media.segments.len();
    let ts_path = output.with_extension("ts");

    let keys = Arc::new(KeyCache::new(Arc::clone(client)));
    let fetcher = Arc::new(SegmentFetcher::new(
        Arc::clone(client),
        keys,
        config.decrypt_offload_threshold,
    ));

    let mut writer = OutputWriter::create(&ts_path).await?;
    let mut scheduler = DownloadScheduler::new(fetcher, config.concurrency(), token.clone());
    if let Some(progress) = progress {
        scheduler = scheduler.with_progress(progress);
    }
    scheduler.run(media.segments, &mut writer).await?;
    let bytes = writer.finish().await?;
    info!(
        path = %ts_path.display(),
        segments = total_segments,
        bytes,
        "transport stream assembled"
    );

    if !remux {
        return Ok(ts_path);
    }

    let mp4_path = output.with_extension("mp4");
    match RemuxInvoker::from_env()
        .remux_to_mp4(&ts_path, &mp4_path, token)
        .await
    {
        Ok(()) => {
            let _ = tokio::fs::remove_file(&ts_path).await;
            Ok(mp4_path)
        }
        Err(DownloadError::RemuxUnavailable { program }) => {
            warn!(program = %program, "muxer unavailable, keeping the TS");
            Ok(ts_path)
        }
        Err(error) => Err(error),
    }
}

/// Fetch-and-parse down to a media playlist, hopping through a master at
/// most once.
async fn resolve_media_playlist(
    client: &Arc<HttpClient>,
    config: &Arc<DownloadConfig>,
    text: &str,
    url: &url::Url,
) -> Result<MediaPlaylist, DownloadError> {
    match playlist::parse(text, url)? {
        Playlist::Media(media) => Ok(media),
        Playlist::Master(master) => {
            let variant = select_variant(&master, &config.preference)?;
            info!(
                bandwidth = variant.bandwidth,
                resolution = ?variant.resolution,
                uri = %variant.uri,
                "selected variant"
            );
            let variant_text = client.get_text(&variant.uri).await?;
            match playlist::parse(&variant_text, &variant.uri)? {
                Playlist::Media(media) => Ok(media),
                Playlist::Master(_) => Err(DownloadError::parse(
                    "variant URI resolved to another master playlist",
                )),
            }
        }
    }
}
