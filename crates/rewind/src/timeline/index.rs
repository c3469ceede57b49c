use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dash_mpd::{AdaptationSet, Representation, SegmentTemplate, MPD};
use reqwest::{header::ACCEPT, StatusCode};
use url::Url;

use super::{window::to_ticks, Rendition, TrackType};
use crate::{
    config::ProviderConfig,
    error::{RewindError, RewindResult},
    keys::KeyId,
    session::{ChannelInfo, Session},
    util::{url::merge_baseurls, HttpClient},
};

/// Source of the time-shift index of a channel.
#[async_trait]
pub trait TimeShiftIndex: Send + Sync {
    async fn fetch(&self, session: &Session, channel: &ChannelInfo) -> RewindResult<ChannelIndex>;
}

/// One `S` element of a segment timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineEntry {
    pub t: Option<u64>,
    pub d: u64,
    pub r: i64,
}

/// Rendition as described by the provider, before validation.
#[derive(Debug, Clone, Default)]
pub struct IndexRendition {
    pub id: Option<String>,
    pub content_type: Option<String>,
    pub mime_type: Option<String>,
    pub bandwidth: Option<u64>,
    pub codecs: Option<String>,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub lang: Option<String>,
    pub role: Option<String>,
    pub protected: bool,
    pub default_kid: Option<String>,

    pub timescale: Option<u64>,
    pub start_number: Option<u64>,
    pub presentation_time_offset: Option<u64>,
    pub media: Option<String>,
    pub initialization: Option<String>,
    pub timeline: Vec<TimelineEntry>,
    /// `availabilityStartTime + Period@start`
    pub period_start: Option<DateTime<Utc>>,
    pub base_url: Option<Url>,
}

pub(crate) enum Validated {
    Accepted(Rendition),
    Omitted { id: String, reason: String },
}

impl IndexRendition {
    fn track_type(&self) -> Option<TrackType> {
        let kind = self.content_type.as_deref().or(self.mime_type.as_deref())?;
        if kind.starts_with("video") {
            Some(TrackType::Video)
        } else if kind.starts_with("audio") {
            Some(TrackType::Audio)
        } else {
            None
        }
    }

    /// Turns the record into a [`Rendition`].
    ///
    /// Renditions lacking descriptive metadata are omitted, missing addressing data
    /// makes the whole index malformed.
    pub(crate) fn validate(self) -> RewindResult<Validated> {
        let omitted = |id: &Option<String>, reason: &str| {
            Ok(Validated::Omitted {
                id: id.clone().unwrap_or_else(|| "<unnamed>".to_string()),
                reason: reason.to_string(),
            })
        };

        let Some(track_type) = self.track_type() else {
            return omitted(&self.id, "not a video or audio rendition");
        };
        let Some(id) = self.id.clone() else {
            return omitted(&self.id, "missing id");
        };
        let Some(bitrate) = self.bandwidth else {
            return omitted(&self.id, "missing bandwidth");
        };
        let quality_label = match track_type {
            TrackType::Video => match (self.width, self.height) {
                (Some(width), Some(height)) => format!("{width}x{height}"),
                _ => return omitted(&self.id, "missing resolution"),
            },
            TrackType::Audio => match &self.lang {
                Some(lang) => format!("{lang}_{}", self.role.as_deref().unwrap_or("main")),
                None => return omitted(&self.id, "missing language"),
            },
        };

        let malformed = |reason: &str| RewindError::MalformedIndex(format!("{id}: {reason}"));
        let timescale = self
            .timescale
            .filter(|t| *t > 0)
            .ok_or_else(|| malformed("missing timescale"))?;
        let media = self.media.ok_or_else(|| malformed("missing media template"))?;
        let base_url = self.base_url.ok_or_else(|| malformed("missing base url"))?;
        let (last_time, segment_duration, last_number) =
            last_segment(&self.timeline, self.start_number.unwrap_or(1))
                .ok_or_else(|| malformed("missing segment timeline"))?;
        if segment_duration == 0 {
            return Err(malformed("zero segment duration"));
        }

        let key_id = self
            .default_kid
            .as_deref()
            .map(|kid| kid.parse::<KeyId>())
            .transpose()
            .map_err(|_| malformed("invalid default_KID"))?;

        let period_ticks = self
            .period_start
            .map(|start| to_ticks(start, timescale))
            .unwrap_or_default();
        let time_offset = period_ticks - self.presentation_time_offset.unwrap_or(0) as i128;
        let anchor = u64::try_from(last_time as i128 + time_offset)
            .map_err(|_| malformed("segment timeline starts before the epoch"))?;

        Ok(Validated::Accepted(Rendition {
            id,
            track_type,
            quality_label,
            bitrate,
            codec: self.codecs,
            mime_type: self.mime_type.unwrap_or_else(|| match track_type {
                TrackType::Video => "video/mp4".to_string(),
                TrackType::Audio => "audio/mp4".to_string(),
            }),
            language: self.lang,
            role: self.role,
            width: self.width,
            height: self.height,
            encrypted: self.protected || key_id.is_some(),
            key_id,
            timescale,
            segment_duration,
            anchor,
            anchor_number: last_number,
            time_offset,
            base_url,
            media,
            initialization: self.initialization,
            required: false,
        }))
    }
}

/// `(start, duration, number)` of the last segment listed in a timeline.
fn last_segment(timeline: &[TimelineEntry], start_number: u64) -> Option<(u64, u64, u64)> {
    let mut time = 0u64;
    let mut number = start_number;
    let mut last = None;

    for entry in timeline {
        if let Some(t) = entry.t {
            time = t;
        }
        // a negative repeat count runs until the next entry, which a live edge does not have
        let repeat = entry.r.max(0) as u64;
        let start = time.checked_add(entry.d.checked_mul(repeat)?)?;
        number += repeat;
        last = Some((start, entry.d, number));

        time = start.checked_add(entry.d)?;
        number += 1;
    }
    last
}

/// Retention range advertised by the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub start: Option<DateTime<Utc>>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelIndex {
    pub renditions: Vec<IndexRendition>,
    pub publish_time: Option<DateTime<Utc>>,
    pub time_shift_buffer_depth: Option<TimeDelta>,
}

impl ChannelIndex {
    /// The declared buffer depth wins over the configured maximum, the live edge bounds both.
    pub fn retention(&self, now: DateTime<Utc>, max_retention: Option<TimeDelta>) -> Retention {
        let end = self.publish_time.unwrap_or(now);
        let start = match (self.time_shift_buffer_depth, max_retention) {
            (Some(depth), _) => end.checked_sub_signed(depth),
            (None, Some(max)) => now.checked_sub_signed(max),
            (None, None) => None,
        };
        Retention { start, end }
    }

    pub fn from_mpd(mpd: &MPD, manifest_url: &Url) -> RewindResult<Self> {
        let mut base_url = manifest_url.clone();
        if let Some(mpd_base_url) = mpd.base_url.first() {
            base_url = merge_baseurls(&base_url, &mpd_base_url.base)?;
        }

        let mut renditions = Vec::new();
        for period in &mpd.periods {
            let period_base = match period.BaseURL.first() {
                Some(b) => merge_baseurls(&base_url, &b.base)?,
                None => base_url.clone(),
            };
            let period_start = mpd.availabilityStartTime.and_then(|ast| {
                let offset = TimeDelta::from_std(period.start.unwrap_or_default()).ok()?;
                ast.checked_add_signed(offset)
            });

            for adaptation in &period.adaptations {
                let adaptation_base = match adaptation.BaseURL.first() {
                    Some(b) => merge_baseurls(&period_base, &b.base)?,
                    None => period_base.clone(),
                };

                for representation in &adaptation.representations {
                    let representation_base = match representation.BaseURL.first() {
                        Some(b) => merge_baseurls(&adaptation_base, &b.base)?,
                        None => adaptation_base.clone(),
                    };
                    renditions.push(index_rendition(
                        adaptation,
                        representation,
                        period_start,
                        representation_base,
                    ));
                }
            }
        }

        Ok(Self {
            renditions,
            publish_time: mpd.publishTime,
            time_shift_buffer_depth: mpd
                .timeShiftBufferDepth
                .and_then(|depth| TimeDelta::from_std(depth).ok()),
        })
    }
}

fn index_rendition(
    adaptation: &AdaptationSet,
    representation: &Representation,
    period_start: Option<DateTime<Utc>>,
    base_url: Url,
) -> IndexRendition {
    let template: Option<&SegmentTemplate> = representation
        .SegmentTemplate
        .as_ref()
        .or(adaptation.SegmentTemplate.as_ref());

    let protections = adaptation
        .ContentProtection
        .iter()
        .chain(representation.ContentProtection.iter());
    let mut protected = false;
    let mut default_kid = None;
    for protection in protections {
        protected = true;
        if default_kid.is_none() {
            default_kid = protection.default_KID.clone();
        }
    }

    IndexRendition {
        id: representation.id.clone(),
        content_type: representation
            .contentType
            .clone()
            .or_else(|| adaptation.contentType.clone()),
        mime_type: representation
            .mimeType
            .clone()
            .or_else(|| adaptation.mimeType.clone()),
        bandwidth: representation.bandwidth,
        codecs: representation
            .codecs
            .clone()
            .or_else(|| adaptation.codecs.clone()),
        width: representation.width,
        height: representation.height,
        lang: representation.lang.clone().or_else(|| adaptation.lang.clone()),
        role: adaptation.Role.first().and_then(|role| role.value.clone()),
        protected,
        default_kid,
        timescale: template.and_then(|t| t.timescale),
        start_number: template.and_then(|t| t.startNumber),
        presentation_time_offset: template.and_then(|t| t.presentationTimeOffset),
        media: template.and_then(|t| t.media.clone()),
        initialization: template.and_then(|t| t.initialization.clone()),
        timeline: template
            .and_then(|t| t.SegmentTimeline.as_ref())
            .map(|timeline| {
                timeline
                    .segments
                    .iter()
                    .map(|s| TimelineEntry {
                        t: s.t,
                        d: s.d,
                        r: s.r.unwrap_or(0),
                    })
                    .collect()
            })
            .unwrap_or_default(),
        period_start,
        base_url: Some(base_url),
    }
}

/// Reads the live DASH manifest of a channel as its time-shift index.
pub struct MpdTimeShiftIndex {
    client: HttpClient,
    index_url: String,
    manifest_format: u32,
}

impl MpdTimeShiftIndex {
    pub fn new(client: HttpClient, config: &ProviderConfig) -> Self {
        Self {
            client,
            index_url: config.index_url.trim_end_matches('/').to_string(),
            manifest_format: config.manifest_format,
        }
    }

    pub fn manifest_url(&self, channel: &ChannelInfo) -> RewindResult<Url> {
        let dash_id = channel
            .dash_id
            .as_deref()
            .ok_or_else(|| RewindError::ChannelNotFound(format!("{} (no DASH stream)", channel.id)))?;
        Ok(Url::parse(&format!(
            "{}/{dash_id}/{}/live.mpd",
            self.index_url, self.manifest_format
        ))?)
    }
}

#[async_trait]
impl TimeShiftIndex for MpdTimeShiftIndex {
    async fn fetch(&self, session: &Session, channel: &ChannelInfo) -> RewindResult<ChannelIndex> {
        let url = self.manifest_url(channel)?;
        tracing::debug!("Fetching time-shift index of {} from {url}", channel.name);

        let mut request = self.client.get(url.clone()).header(ACCEPT, "*/*");
        if let Some(token) = session.access_token() {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;

        match response.status() {
            status if status.is_success() => {}
            status @ (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => {
                return Err(RewindError::AuthExpired(status))
            }
            StatusCode::NOT_FOUND => return Err(RewindError::ChannelNotFound(channel.id.clone())),
            status => return Err(RewindError::HttpError(status)),
        }

        let text = response.text().await?;
        let mpd = dash_mpd::parse(&text)
            .map_err(|e| RewindError::MalformedIndex(format!("unreadable manifest: {e}")))?;
        ChannelIndex::from_mpd(&mpd, &url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MPD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" xmlns:cenc="urn:mpeg:cenc:2013" type="dynamic"
     availabilityStartTime="1970-01-01T00:00:00Z" publishTime="2025-12-19T12:00:00Z"
     timeShiftBufferDepth="PT720H" minBufferTime="PT2S">
  <BaseURL>https://media.example.com/media/</BaseURL>
  <Period id="1" start="PT0S">
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <ContentProtection schemeIdUri="urn:mpeg:dash:mp4protection:2011" value="cenc"
                         cenc:default_KID="0123abcd-0000-0000-0000-000000000001"/>
      <SegmentTemplate timescale="90000" media="$RepresentationID$_$Time$" initialization="$RepresentationID$_init">
        <SegmentTimeline>
          <S t="158952780000000" d="288000" r="2"/>
          <S d="288000"/>
        </SegmentTimeline>
      </SegmentTemplate>
      <Representation id="video_1080" bandwidth="4800000" width="1920" height="1080" codecs="avc1.640028"/>
    </AdaptationSet>
    <AdaptationSet contentType="audio" mimeType="audio/mp4" lang="fra">
      <Role schemeIdUri="urn:mpeg:dash:role:2011" value="main"/>
      <SegmentTemplate timescale="48000" media="$RepresentationID$_$Time$">
        <SegmentTimeline><S t="84774816000000" d="153600"/></SegmentTimeline>
      </SegmentTemplate>
      <Representation id="audio_fra" bandwidth="128000" codecs="mp4a.40.2"/>
    </AdaptationSet>
    <AdaptationSet contentType="audio" mimeType="audio/mp4">
      <SegmentTemplate timescale="48000" media="$RepresentationID$_$Time$">
        <SegmentTimeline><S t="0" d="153600"/></SegmentTimeline>
      </SegmentTemplate>
      <Representation id="audio_unknown" bandwidth="96000"/>
    </AdaptationSet>
  </Period>
</MPD>"#;

    fn index() -> ChannelIndex {
        let mpd = dash_mpd::parse(MPD).unwrap();
        let url = Url::parse("https://api.example.com/playlist/201/1/live.mpd").unwrap();
        ChannelIndex::from_mpd(&mpd, &url).unwrap()
    }

    #[test]
    fn test_index_from_mpd() {
        let index = index();
        assert_eq!(index.renditions.len(), 3);
        assert_eq!(
            index.publish_time.unwrap().to_rfc3339(),
            "2025-12-19T12:00:00+00:00"
        );
        assert_eq!(index.time_shift_buffer_depth, Some(TimeDelta::hours(720)));

        let video = &index.renditions[0];
        assert!(video.protected);
        assert_eq!(video.timescale, Some(90_000));
        assert_eq!(video.timeline.len(), 2);
    }

    #[test]
    fn test_validate_renditions() {
        let mut renditions = index().renditions.into_iter().map(|r| r.validate().unwrap());

        let Some(Validated::Accepted(video)) = renditions.next() else {
            panic!("video rendition rejected");
        };
        assert_eq!(video.quality_label, "1920x1080");
        assert_eq!(video.anchor, 158_952_780_000_000 + 3 * 288_000);
        assert_eq!(video.anchor_number, 4);
        assert_eq!(video.segment_duration, 288_000);
        assert_eq!(
            video.key_id.unwrap().to_string(),
            "0123abcd000000000000000000000001"
        );
        assert_eq!(
            video.segment_url(video.anchor, 4).unwrap().as_str(),
            "https://media.example.com/media/video_1080_158952780864000"
        );
        assert_eq!(
            video.init_url().unwrap().unwrap().as_str(),
            "https://media.example.com/media/video_1080_init"
        );

        let Some(Validated::Accepted(audio)) = renditions.next() else {
            panic!("audio rendition rejected");
        };
        assert_eq!(audio.quality_label, "fra_main");
        assert!(!audio.encrypted);

        assert!(matches!(
            renditions.next(),
            Some(Validated::Omitted { id, .. }) if id == "audio_unknown"
        ));
    }

    #[test]
    fn test_missing_timeline_is_malformed() {
        let rendition = IndexRendition {
            id: Some("v".to_string()),
            content_type: Some("video".to_string()),
            bandwidth: Some(1),
            width: Some(1280),
            height: Some(720),
            timescale: Some(90_000),
            media: Some("$Time$".to_string()),
            base_url: Some(Url::parse("https://media.example.com/").unwrap()),
            ..Default::default()
        };
        assert!(matches!(
            rendition.validate(),
            Err(RewindError::MalformedIndex(_))
        ));
    }

    #[test]
    fn test_retention() {
        let index = index();
        let now = Utc::now();
        let retention = index.retention(now, Some(TimeDelta::hours(1)));
        assert_eq!(retention.end, index.publish_time.unwrap());
        assert_eq!(
            retention.start,
            Some(index.publish_time.unwrap() - TimeDelta::hours(720))
        );

        let undeclared = ChannelIndex::default();
        assert_eq!(undeclared.retention(now, None), Retention { start: None, end: now });
        assert_eq!(
            undeclared.retention(now, Some(TimeDelta::hours(1))).start,
            Some(now - TimeDelta::hours(1))
        );
    }
}
