use std::path::PathBuf;

use anyhow::Context;
use chrono::{FixedOffset, Utc};
use clap::{Args, Parser};
use rewind::{
    config::DecryptToolKind,
    keys::KeyPair,
    timeline::{parse_clock_duration, parse_local_datetime, QualityRule, TimeWindow, TrackSelector},
    RewindConfig, RewindRequest,
};

#[derive(Parser, Clone, Debug)]
#[clap(name = "rewind", version, about = "Record a past window of a live DASH channel")]
pub struct RewindArgs {
    /// Channel id in the provider's catalog, e.g. 536
    #[clap(short, long)]
    pub channel: String,

    /// Window start, `YYYY-MM-DD HH:MM:SS` in the --utc-offset timezone
    #[clap(short, long)]
    pub start: String,

    #[clap(flatten)]
    pub window: WindowOptions,

    /// UTC offset of --start and --end
    #[clap(long, default_value = "+01:00", allow_hyphen_values = true)]
    pub utc_offset: FixedOffset,

    /// Provider access token
    #[clap(long, env = "REWIND_TOKEN", default_value = "", hide_env_values = true)]
    pub token: String,

    /// TOML configuration file, command line flags take precedence
    #[clap(long, env = "REWIND_CONFIG")]
    pub config: Option<PathBuf>,

    /// Debug output
    #[clap(short, long, alias = "debug")]
    pub verbose: bool,

    #[clap(flatten)]
    pub tracks: TrackOptions,

    #[clap(flatten)]
    pub keys: KeyOptions,

    #[clap(flatten)]
    pub http: HttpOptions,

    #[clap(flatten)]
    pub download: DownloadOptions,

    #[clap(flatten)]
    pub output: OutputOptions,
}

#[derive(Args, Clone, Debug)]
#[group(required = true, multiple = false)]
pub struct WindowOptions {
    /// Window duration, `HH:MM:SS`
    #[clap(short, long)]
    pub duration: Option<String>,

    /// Window end, `YYYY-MM-DD HH:MM:SS`
    #[clap(short, long)]
    pub end: Option<String>,
}

#[derive(Args, Clone, Debug)]
pub struct TrackOptions {
    /// Video rule, `filter+best` or `filter+worst`. Repeat to add fallbacks.
    #[clap(long = "video", default_value = "best")]
    pub video: Vec<QualityRule>,

    /// Audio rule, e.g. `fra+best`
    #[clap(long = "audio", default_value = "best")]
    pub audio: Vec<QualityRule>,

    /// Additional audio renditions, fetched when available
    #[clap(long = "extra-audio")]
    pub extra_audio: Vec<QualityRule>,
}

#[derive(Args, Clone, Debug)]
pub struct KeyOptions {
    /// Content key as `KID:KEY`, skips key resolution. May be repeated.
    #[clap(short, long = "key")]
    pub keys: Vec<KeyPair>,

    /// Key cache endpoint
    #[clap(long, env = "REWIND_KEY_CACHE_URL")]
    pub key_cache_url: Option<String>,

    /// Key cache API key
    #[clap(long, env = "REWIND_KEY_CACHE_API_KEY", hide_env_values = true)]
    pub key_cache_api_key: Option<String>,

    /// Candidate keys for brute force, one `KEY` or `KID:KEY` per line
    #[clap(long)]
    pub candidates: Option<PathBuf>,

    /// Candidates tested per batch
    #[clap(long)]
    pub brute_force_batch_size: Option<usize>,

    /// Parallel probe decryptions
    #[clap(long)]
    pub probe_workers: Option<usize>,
}

#[derive(Args, Clone, Debug)]
pub struct HttpOptions {
    /// Additional HTTP headers, `Name: value`
    #[clap(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// HTTP timeout, in seconds
    #[clap(short, long)]
    pub timeout: Option<u64>,
}

#[derive(Args, Clone, Debug)]
pub struct DownloadOptions {
    /// Segment requests in flight at the same time
    #[clap(long, alias = "threads")]
    pub concurrency: Option<usize>,

    /// Segment retry limit
    #[clap(long)]
    pub segment_retries: Option<u32>,

    /// Segment cache directory
    #[clap(long, env = "TEMP_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Keep downloaded fragments after the run
    #[clap(long)]
    pub keep_segments: bool,

    /// Locate the segment grid with probe requests instead of trusting the index
    #[clap(long)]
    pub probe_anchor: bool,
}

#[derive(Args, Clone, Debug)]
pub struct OutputOptions {
    /// Only write a manifest of the window, pointing at the provider
    #[clap(long)]
    pub manifest_only: bool,

    /// Manifest path
    #[clap(short, long)]
    pub manifest: Option<PathBuf>,

    /// Muxed output file. Tracks are left separate when not set.
    #[clap(short, long)]
    pub output: Option<PathBuf>,

    /// Directory of the per-track files
    #[clap(long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Decrypt tool
    #[clap(long, value_parser = parse_tool)]
    pub decrypt_tool: Option<DecryptToolKind>,

    /// Path of the decrypt tool, looked up in PATH otherwise
    #[clap(long)]
    pub decrypt_tool_path: Option<PathBuf>,

    /// Path of ffmpeg, looked up in PATH otherwise
    #[clap(long)]
    pub ffmpeg: Option<PathBuf>,
}

fn parse_tool(tool: &str) -> Result<DecryptToolKind, String> {
    match tool {
        "mp4ff-decrypt" => Ok(DecryptToolKind::Mp4ffDecrypt),
        "mp4decrypt" => Ok(DecryptToolKind::Mp4decrypt),
        _ => Err(format!("unknown decrypt tool {tool}, expected mp4ff-decrypt or mp4decrypt")),
    }
}

impl RewindArgs {
    /// Configuration file, overridden by the flags that were set.
    pub fn config(&self) -> anyhow::Result<RewindConfig> {
        let mut config: RewindConfig = match &self.config {
            Some(path) => {
                let data = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                toml::from_str(&data)?
            }
            None => RewindConfig::default(),
        };

        for header in &self.http.headers {
            let (key, value) = header
                .split_once(':')
                .with_context(|| format!("Invalid header: {header}"))?;
            config
                .http
                .headers
                .insert(key.trim().to_string(), value.trim().to_string());
        }
        if let Some(timeout) = self.http.timeout {
            config.http.timeout_secs = timeout;
        }

        let download = &self.download;
        if let Some(concurrency) = download.concurrency {
            config.fetch.batch_size = concurrency;
        }
        if let Some(retries) = download.segment_retries {
            config.fetch.retries = retries;
        }
        if let Some(cache_dir) = &download.cache_dir {
            config.fetch.cache_dir = Some(cache_dir.clone());
        }
        config.fetch.keep_segments |= download.keep_segments;
        config.timeline.probe_anchor |= download.probe_anchor;

        let keys = &self.keys;
        if let Some(url) = &keys.key_cache_url {
            config.keys.cache_url = Some(url.clone());
        }
        if let Some(api_key) = &keys.key_cache_api_key {
            config.keys.cache_api_key = Some(api_key.clone());
        }
        if let Some(candidates) = &keys.candidates {
            config.keys.candidates_file = Some(candidates.clone());
        }
        if let Some(batch_size) = keys.brute_force_batch_size {
            config.keys.brute_force_batch_size = batch_size;
        }
        if let Some(workers) = keys.probe_workers {
            config.keys.probe_workers = workers;
        }

        let output = &self.output;
        if let Some(tool) = output.decrypt_tool {
            config.decrypt.tool = tool;
        }
        if let Some(path) = &output.decrypt_tool_path {
            config.decrypt.tool_path = Some(path.clone());
        }
        if let Some(path) = &output.ffmpeg {
            config.decrypt.ffmpeg_path = Some(path.clone());
        }

        Ok(config)
    }

    pub fn window(&self) -> anyhow::Result<TimeWindow> {
        let start = parse_local_datetime(&self.start, self.utc_offset)?;
        let window = match (&self.window.duration, &self.window.end) {
            (Some(duration), _) => TimeWindow::from_duration(start, parse_clock_duration(duration)?)?,
            (None, Some(end)) => TimeWindow::new(start, parse_local_datetime(end, self.utc_offset)?)?,
            (None, None) => anyhow::bail!("either --duration or --end is required"),
        };
        if window.start() > Utc::now() {
            anyhow::bail!("window {window} starts in the future");
        }
        Ok(window)
    }

    pub fn request(&self) -> anyhow::Result<RewindRequest> {
        let mut request = RewindRequest::new(&self.channel, self.window()?);
        request.selector = TrackSelector {
            video: self.tracks.video.clone(),
            audio: self.tracks.audio.clone(),
            extra_audio: self.tracks.extra_audio.clone(),
        };
        request.manual_keys = self.keys.keys.clone();
        request.manifest_only = self.output.manifest_only;
        request.manifest_path = self.output.manifest.clone();
        request.output_dir = self.output.output_dir.clone();
        request.output = self.output.output.clone();
        Ok(request)
    }
}
