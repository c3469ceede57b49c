use std::path::PathBuf;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use thiserror::Error;

use crate::{keys::KeyId, timeline::SegmentDescriptor, timeline::TrackType};

#[derive(Error, Debug)]
pub enum RewindError {
    #[error("HTTP error: {0}")]
    HttpError(StatusCode),

    #[error("Session rejected by provider ({0}), please refresh the access token")]
    AuthExpired(StatusCode),

    #[error("Channel {0} not found")]
    ChannelNotFound(String),

    #[error("Invalid time window: {0}")]
    InvalidWindow(String),

    #[error("Window {start} - {end} is outside the time-shift range of the channel")]
    WindowUnavailable {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("Malformed time-shift index: {0}")]
    MalformedIndex(String),

    #[error("Gap in segment sequence of {rendition}: expected #{expected}, found #{found}")]
    TimelineGap {
        rendition: String,
        expected: u64,
        found: u64,
    },

    #[error("No {0} rendition matches the selector")]
    NoRenditionSelected(TrackType),

    #[error("Invalid track selector: {0}")]
    InvalidSelector(String),

    #[error("Invalid key pair: {0}")]
    InvalidKeyPair(String),

    #[error("Invalid hex key: {0}")]
    InvalidHexKey(String),

    #[error("No content key found for {kid} after testing {tested} candidate(s)")]
    KeyResolutionExhausted { kid: KeyId, tested: usize },

    #[error("Missing content keys for: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "))]
    MissingKeys(Vec<KeyId>),

    #[error("mp4decrypt error: {0}")]
    Mp4DecryptError(String),

    #[error("Failed to download {} segment(s)", .failed.len())]
    SegmentFetch { failed: Vec<SegmentDescriptor> },

    #[error("Decrypt tool failed on {rendition} (exit code {code:?}): {stderr}")]
    DecryptTool {
        rendition: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Expected output {0} is missing or empty")]
    MissingOutput(PathBuf),

    #[error("ffmpeg exited with code {0:?}")]
    MuxFailed(Option<i32>),

    #[error("Manifest generation error: {0}")]
    ManifestError(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    #[error(transparent)]
    HexDecodeError(#[from] hex::FromHexError),

    #[error(transparent)]
    RequestError(#[from] reqwest::Error),

    #[error(transparent)]
    MpdParseError(#[from] dash_mpd::DashMpdError),

    #[error(transparent)]
    MissingExecutable(#[from] which::Error),

    #[error(transparent)]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    JoinError(#[from] tokio::task::JoinError),
}

impl RewindError {
    /// Whether a failed request may succeed when issued again.
    pub fn is_retryable(&self) -> bool {
        match self {
            RewindError::HttpError(status) => {
                status.is_server_error()
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::REQUEST_TIMEOUT
            }
            RewindError::RequestError(e) => {
                e.is_timeout() || e.is_connect() || e.is_body() || e.is_request()
            }
            RewindError::IOError(_) => true,
            _ => false,
        }
    }
}

pub type RewindResult<T> = Result<T, RewindError>;
