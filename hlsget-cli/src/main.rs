use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use hlsget::config::{DEFAULT_CONCURRENCY, DownloadConfig, VariantPreference};
use hlsget::error::DownloadError;
use hlsget::job::{self, JobOptions, Mode};
use hlsget::scheduler::{Progress, ProgressCallback};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
enum ModeArg {
    #[default]
    Auto,
    Http,
    Hls,
}

impl From<ModeArg> for Mode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Auto => Mode::Auto,
            ModeArg::Http => Mode::Http,
            ModeArg::Hls => Mode::Hls,
        }
    }
}

/// Download HLS streams and plain HTTP media files.
#[derive(Debug, Parser)]
#[command(name = "hlsget", version, about)]
struct Args {
    /// Playlist or file URL.
    url: String,

    /// Output file path. Defaults to the URL basename in the downloads
    /// directory.
    #[arg(long, value_name = "PATH")]
    out: Option<PathBuf>,

    /// How to treat the URL.
    #[arg(long, value_enum, default_value = "auto")]
    mode: ModeArg,

    /// Preferred resolution, e.g. 1280x720. Picks the tallest variant not
    /// exceeding this height.
    #[arg(long, value_name = "WxH")]
    res: Option<String>,

    /// Preferred peak bandwidth in bits per second.
    #[arg(long, value_name = "BPS")]
    bw: Option<u64>,

    /// Concurrent segment downloads.
    #[arg(long, value_name = "N", default_value_t = DEFAULT_CONCURRENCY)]
    conc: usize,

    /// User-Agent override.
    #[arg(long, value_name = "STRING")]
    ua: Option<String>,

    /// Referer header.
    #[arg(long = "ref", value_name = "STRING")]
    referer: Option<String>,

    /// Cookie header string.
    #[arg(long, value_name = "STRING")]
    cookies: Option<String>,

    /// Keep the TS; skip the MP4 remux.
    #[arg(long)]
    no_remux: bool,

    /// Verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Errors only.
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

fn parse_resolution(value: &str) -> Result<(u32, u32), DownloadError> {
    let parse = || -> Option<(u32, u32)> {
        let (w, h) = value.split_once(['x', 'X'])?;
        Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
    };
    parse().ok_or_else(|| DownloadError::usage(format!("--res expects WxH, got `{value}`")))
}

/// Default output: the URL basename, placed in the downloads directory.
fn default_output(url: &url::Url) -> PathBuf {
    let basename = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .unwrap_or("download");
    let dir = dirs::download_dir().unwrap_or_else(|| PathBuf::from("."));
    dir.join(basename)
}

fn build_options(args: &Args) -> Result<JobOptions, DownloadError> {
    let url = url::Url::parse(&args.url)
        .map_err(|e| DownloadError::usage(format!("invalid URL `{}`: {e}", args.url)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(DownloadError::usage(format!(
            "unsupported URL scheme `{}`",
            url.scheme()
        )));
    }

    let resolution = args.res.as_deref().map(parse_resolution).transpose()?;

    let mut config = DownloadConfig {
        concurrency: args.conc,
        preference: VariantPreference {
            resolution,
            bandwidth: args.bw,
        },
        referer: args.referer.clone(),
        cookies: args.cookies.clone(),
        ..Default::default()
    };
    if let Some(ua) = &args.ua {
        config.user_agent = ua.clone();
    }

    let output = args.out.clone().unwrap_or_else(|| default_output(&url));

    Ok(JobOptions {
        url,
        output,
        mode: args.mode.into(),
        remux: !args.no_remux,
        config,
    })
}

async fn run(args: Args) -> i32 {
    let options = match build_options(&args) {
        Ok(options) => options,
        Err(error) => {
            error!("{error}");
            return error.exit_code();
        }
    };

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, shutting down");
            cancel.cancel();
        }
    });

    let progress: ProgressCallback = Arc::new(|p: Progress| {
        if p.total_segments > 0 {
            info!(
                segments = format!("{}/{}", p.completed_segments, p.total_segments),
                bytes = p.bytes_written,
                "progress"
            );
        }
    });

    match job::run(options, token, Some(progress)).await {
        Ok(path) => {
            info!(path = %path.display(), "saved");
            0
        }
        Err(error) => {
            error!("{error}");
            error.exit_code()
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);
    process::exit(run(args).await);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_argument_parses() {
        assert_eq!(parse_resolution("1280x720").unwrap(), (1280, 720));
        assert_eq!(parse_resolution("1920X1080").unwrap(), (1920, 1080));
        assert!(parse_resolution("720p").is_err());
        assert!(parse_resolution("x720").is_err());
    }

    #[test]
    fn default_output_uses_url_basename() {
        let url = url::Url::parse("https://cdn.example.com/shows/ep1.m3u8?tk=1").unwrap();
        let path = default_output(&url);
        assert_eq!(path.file_name().unwrap(), "ep1.m3u8");

        let bare = url::Url::parse("https://cdn.example.com/").unwrap();
        assert_eq!(default_output(&bare).file_name().unwrap(), "download");
    }

    #[test]
    fn non_http_schemes_are_usage_errors() {
        let args = Args::parse_from(["hlsget", "ftp://example.com/file.ts"]);
        let error = build_options(&args).unwrap_err();
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn cli_flags_reach_the_config() {
        let args = Args::parse_from([
            "hlsget",
            "https://cdn.example.com/a.m3u8",
            "--res",
            "1280x720",
            "--bw",
            "2000000",
            "--conc",
            "8",
            "--ua",
            "agent/1.0",
            "--ref",
            "https://example.com",
            "--cookies",
            "k=v",
            "--no-remux",
        ]);
        let options = build_options(&args).unwrap();
        assert_eq!(options.config.preference.resolution, Some((1280, 720)));
        assert_eq!(options.config.preference.bandwidth, Some(2_000_000));
        assert_eq!(options.config.concurrency, 8);
        assert_eq!(options.config.user_agent, "agent/1.0");
        assert_eq!(options.config.referer.as_deref(), Some("https://example.com"));
        assert_eq!(options.config.cookies.as_deref(), Some("k=v"));
        assert!(!options.remux);
        assert_eq!(options.mode, Mode::Auto);
    }
}
