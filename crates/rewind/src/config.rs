use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RewindConfig {
    pub http: HttpConfig,
    pub provider: ProviderConfig,
    pub timeline: TimelineConfig,
    pub fetch: FetchConfig,
    pub keys: KeyConfig,
    pub decrypt: DecryptConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// HTTP timeout, in seconds
    pub timeout_secs: u64,
    /// Overrides the randomly picked browser user agent
    pub user_agent: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Origin".to_string(), "https://tv.free.fr".to_string());
        headers.insert("Referer".to_string(), "https://tv.free.fr/".to_string());

        Self {
            timeout_secs: 10,
            user_agent: None,
            headers,
        }
    }
}

/// Endpoints of the streaming provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Prefix of the live manifest, followed by `/{dash_id}/{manifest_format}/live.mpd`
    pub index_url: String,
    pub manifest_format: u32,
    pub service_plan_url: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            index_url: "https://api-proxad.dc2.oqee.net/playlist/v1/live".to_string(),
            manifest_format: 1,
            service_plan_url: "https://api.oqee.net/api/v6/service_plan".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelineConfig {
    /// Retention assumed when the index does not advertise a time-shift buffer depth
    pub max_retention_hours: Option<u64>,
    /// Locate the real segment grid with probe requests instead of trusting the index anchor
    pub probe_anchor: bool,
    pub anchor_batch_size: usize,
    pub anchor_concurrency: usize,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            max_retention_hours: None,
            probe_anchor: false,
            anchor_batch_size: 20_000,
            anchor_concurrency: 256,
        }
    }
}

impl TimelineConfig {
    pub fn max_retention(&self) -> Option<chrono::TimeDelta> {
        self.max_retention_hours
            .and_then(|hours| chrono::TimeDelta::try_hours(hours as i64))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Number of segment requests in flight at the same time
    pub batch_size: usize,
    /// Segment retry limit
    pub retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Failed segments accepted in an optional rendition before the run aborts
    pub optional_failure_tolerance: usize,
    /// Segment store root. Defaults to a directory under the system temp dir.
    pub cache_dir: Option<PathBuf>,
    /// Keep downloaded fragments after a successful run
    pub keep_segments: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            retries: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            optional_failure_tolerance: 0,
            cache_dir: None,
            keep_segments: false,
        }
    }
}

impl FetchConfig {
    /// Delay before the `attempt`-th retry, doubling from the base up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(
            self.backoff_base_ms
                .saturating_mul(factor)
                .min(self.backoff_max_ms),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    /// Cached-key lookup service
    pub cache_url: Option<String>,
    pub cache_api_key: Option<String>,
    pub cache_service: String,
    /// Candidate keys for brute force, one `KEY` or `KID:KEY` per line
    pub candidates_file: Option<PathBuf>,
    pub brute_force_batch_size: usize,
    /// Number of probe decryptions running in parallel
    pub probe_workers: usize,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            cache_url: None,
            cache_api_key: None,
            cache_service: "oqee".to_string(),
            candidates_file: None,
            brute_force_batch_size: 10_000,
            probe_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecryptToolKind {
    #[default]
    Mp4ffDecrypt,
    Mp4decrypt,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DecryptConfig {
    pub tool: DecryptToolKind,
    /// Explicit path of the decrypt tool, looked up in `PATH` otherwise
    pub tool_path: Option<PathBuf>,
    pub ffmpeg_path: Option<PathBuf>,
}
