mod anchor;
mod index;
mod resolver;
mod selector;
mod window;

pub use anchor::AnchorProbe;
pub use index::{ChannelIndex, IndexRendition, MpdTimeShiftIndex, Retention, TimeShiftIndex};
pub use resolver::TimelineResolver;
pub use selector::{Preference, QualityRule, TrackSelector};
pub use window::{parse_clock_duration, parse_local_datetime, TimeWindow};

use std::{collections::BTreeSet, fmt, sync::Arc};

use chrono::{DateTime, Utc};
use url::Url;

use crate::{
    error::{RewindError, RewindResult},
    keys::KeyId,
    session::ChannelInfo,
    util::{
        template::Template,
        url::merge_baseurls,
        ByteRange,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrackType {
    Video,
    Audio,
}

impl fmt::Display for TrackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackType::Video => f.write_str("video"),
            TrackType::Audio => f.write_str("audio"),
        }
    }
}

/// One encoded variant of a channel's video or audio.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendition {
    pub id: String,
    pub track_type: TrackType,
    /// `1920x1080` for video, `fra_main` for audio
    pub quality_label: String,
    pub bitrate: u64,
    pub codec: Option<String>,
    pub mime_type: String,
    pub language: Option<String>,
    pub role: Option<String>,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub encrypted: bool,
    /// Absent for clear renditions, or when only the init segment carries it
    pub key_id: Option<KeyId>,

    pub timescale: u64,
    /// Duration of every segment, in timescale ticks
    pub segment_duration: u64,
    /// Start tick of a segment known to exist; the grid is `anchor + k * segment_duration`
    pub anchor: u64,
    /// `$Number$` of the anchor segment
    pub anchor_number: u64,
    /// Epoch tick minus the `$Time$` value of the same segment
    pub time_offset: i128,
    pub base_url: Url,
    pub media: String,
    pub initialization: Option<String>,

    /// A failure in a required rendition aborts the whole run
    pub required: bool,
}

impl Rendition {
    fn template(&self) -> Template {
        Template::new()
            .with(Template::REPRESENTATION_ID, &self.id)
            .with(Template::BANDWIDTH, self.bitrate)
    }

    /// URL of the segment starting at `tick` (epoch based) with the given `$Number$`.
    pub fn segment_url(&self, tick: u64, number: i128) -> RewindResult<Url> {
        let template = self
            .template()
            .with(Template::TIME, tick as i128 - self.time_offset)
            .with(Template::NUMBER, number);
        merge_baseurls(&self.base_url, &template.resolve(&self.media))
    }

    pub fn init_url(&self) -> RewindResult<Option<Url>> {
        self.initialization
            .as_deref()
            .map(|init| merge_baseurls(&self.base_url, &self.template().resolve(init)))
            .transpose()
    }

    pub fn ticks_to_seconds(&self, ticks: u64) -> f64 {
        ticks as f64 / self.timescale as f64
    }
}

/// One addressable media fragment of a resolved window.
#[derive(Debug, Clone)]
pub struct SegmentDescriptor {
    pub rendition: Arc<Rendition>,
    /// Position inside the window, starting from 0 with no gaps
    pub sequence: u64,
    pub url: Url,
    pub byte_range: Option<ByteRange>,
    /// Start of the fragment, in rendition timescale ticks since the Unix epoch
    pub presentation_time: u64,
    pub duration: u64,
}

impl SegmentDescriptor {
    pub fn presentation_datetime(&self) -> Option<DateTime<Utc>> {
        let timescale = self.rendition.timescale as i128;
        let millis = self.presentation_time as i128 * 1000 / timescale;
        DateTime::from_timestamp_millis(i64::try_from(millis).ok()?)
    }

    pub fn end_time(&self) -> u64 {
        self.presentation_time + self.duration
    }
}

impl PartialEq for SegmentDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.rendition.id == other.rendition.id
            && self.sequence == other.sequence
            && self.presentation_time == other.presentation_time
    }
}

/// Init segment location and ordered fragments of one selected rendition.
#[derive(Debug, Clone)]
pub struct ResolvedTrack {
    pub rendition: Arc<Rendition>,
    pub init_url: Option<Url>,
    pub segments: Vec<SegmentDescriptor>,
}

impl ResolvedTrack {
    pub fn duration_ticks(&self) -> u64 {
        self.segments.iter().map(|s| s.duration).sum()
    }

    /// Checks that sequences are dense and fragments abut each other.
    pub fn ensure_contiguous(&self) -> RewindResult<()> {
        if let Some(first) = self.segments.first() {
            if first.sequence != 0 {
                return Err(RewindError::TimelineGap {
                    rendition: self.rendition.id.clone(),
                    expected: 0,
                    found: first.sequence,
                });
            }
        }

        for pair in self.segments.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if next.sequence != prev.sequence + 1 || next.presentation_time != prev.end_time() {
                return Err(RewindError::TimelineGap {
                    rendition: self.rendition.id.clone(),
                    expected: prev.sequence + 1,
                    found: next.sequence,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolveWarning {
    #[error("Requested window {requested} was clipped to {available}")]
    PartialWindow {
        requested: TimeWindow,
        available: TimeWindow,
    },

    #[error("Rendition {id} omitted: {reason}")]
    RenditionOmitted { id: String, reason: String },

    #[error("No {track_type} rendition matches {skipped}, using {used}")]
    SelectorFallback {
        track_type: TrackType,
        skipped: String,
        used: String,
    },
}

#[derive(Debug, Clone)]
pub struct ResolvedTimeline {
    pub channel: ChannelInfo,
    pub requested: TimeWindow,
    /// Requested window intersected with the retention range
    pub window: TimeWindow,
    pub tracks: Vec<ResolvedTrack>,
    pub warnings: Vec<ResolveWarning>,
}

impl ResolvedTimeline {
    pub fn key_ids(&self) -> BTreeSet<KeyId> {
        self.tracks
            .iter()
            .filter_map(|t| t.rendition.key_id)
            .collect()
    }

    pub fn track(&self, track_type: TrackType) -> impl Iterator<Item = &ResolvedTrack> {
        self.tracks
            .iter()
            .filter(move |t| t.rendition.track_type == track_type)
    }

    pub fn segment_count(&self) -> usize {
        self.tracks.iter().map(|t| t.segments.len()).sum()
    }
}
