use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use chrono::{FixedOffset, TimeDelta};
use rewind::{
    config::RewindConfig,
    decrypt::{DecryptJob, DecryptTool},
    keys::KeyId,
    timeline::{
        parse_local_datetime, MpdTimeShiftIndex, QualityRule, ResolvedTimeline, TimeWindow,
        TimelineResolver, TrackSelector,
    },
    util::HttpClient,
    ChannelCatalog, ChannelInfo, RewindResult, Session,
};
use tokio_util::sync::CancellationToken;
use wiremock::{
    matchers::{method, path, path_regex},
    Mock, MockServer, ResponseTemplate,
};

/// 2025-12-19T12:00:00+01:00
pub const START: u64 = 1_766_142_000;
pub const VIDEO_KID: &str = "0123abcd000000000000000000000001";
pub const AUDIO_KID: &str = "0123abcd000000000000000000000002";

pub fn kid(hex: &str) -> KeyId {
    hex.parse().unwrap()
}

pub struct MpdOptions {
    /// Write `cenc:default_KID` on the content protection elements
    pub default_kid: bool,
}

impl Default for MpdOptions {
    fn default() -> Self {
        Self { default_kid: true }
    }
}

/// Live manifest of a channel whose live edge is one hour after [`START`].
pub fn mpd(server_uri: &str, options: &MpdOptions) -> String {
    let protection = |kid: &str| {
        let default_kid = if options.default_kid {
            format!(r#" cenc:default_KID="{}""#, self::kid(kid).to_uuid_string())
        } else {
            String::new()
        };
        format!(
            r#"<ContentProtection schemeIdUri="urn:mpeg:dash:mp4protection:2011" value="cenc"{default_kid}/>"#
        )
    };
    let live_edge = START + 3600;

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" xmlns:cenc="urn:mpeg:cenc:2013" type="dynamic"
     availabilityStartTime="1970-01-01T00:00:00Z" publishTime="2025-12-19T12:00:00Z"
     timeShiftBufferDepth="PT168H" minBufferTime="PT2S">
  <BaseURL>{server_uri}/media/</BaseURL>
  <Period id="1" start="PT0S">
    <AdaptationSet contentType="video" mimeType="video/mp4">
      {video_protection}
      <SegmentTemplate timescale="90000" media="$RepresentationID$/$Time$.m4s" initialization="$RepresentationID$/init.mp4">
        <SegmentTimeline><S t="{video_t}" d="288000"/></SegmentTimeline>
      </SegmentTemplate>
      <Representation id="video_1080" bandwidth="4800000" width="1920" height="1080" codecs="avc1.640028"/>
      <Representation id="video_720" bandwidth="2400000" width="1280" height="720" codecs="avc1.64001f"/>
    </AdaptationSet>
    <AdaptationSet contentType="audio" mimeType="audio/mp4" lang="fra">
      <Role schemeIdUri="urn:mpeg:dash:role:2011" value="main"/>
      {audio_protection}
      <SegmentTemplate timescale="48000" media="$RepresentationID$/$Time$.m4s" initialization="$RepresentationID$/init.mp4">
        <SegmentTimeline><S t="{audio_t}" d="153600"/></SegmentTimeline>
      </SegmentTemplate>
      <Representation id="audio_fra" bandwidth="128000" codecs="mp4a.40.2"/>
    </AdaptationSet>
  </Period>
</MPD>"#,
        video_protection = protection(VIDEO_KID),
        audio_protection = protection(AUDIO_KID),
        video_t = live_edge * 90_000,
        audio_t = live_edge * 48_000,
    )
}

pub fn mp4_box(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut data = (payload.len() as u32 + 8).to_be_bytes().to_vec();
    data.extend_from_slice(kind);
    data.extend_from_slice(payload);
    data
}

/// Init segment carrying a `tenc` box with the given key id.
pub fn init_segment(kid: &KeyId) -> Vec<u8> {
    let mut tenc = vec![0, 0, 0, 0, 0, 0, 1, 8];
    tenc.extend_from_slice(kid.as_bytes());
    [
        mp4_box(b"ftyp", b"isom"),
        mp4_box(b"moov", &mp4_box(b"tenc", &tenc)),
    ]
    .concat()
}

/// Serves the manifest, init segments and every media segment of channel 536.
pub async fn provider(options: &MpdOptions) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/live/201/1/live.mpd"))
        .respond_with(ResponseTemplate::new(200).set_body_string(mpd(&server.uri(), options)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/media/video_[0-9]+/init\.mp4$"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(init_segment(&kid(VIDEO_KID))))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/media/audio_fra/init\.mp4$"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(init_segment(&kid(AUDIO_KID))))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/media/.+/[0-9]+\.m4s$"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fragment".to_vec()))
        .mount(&server)
        .await;
    server
}

pub fn config(server: &MockServer, cache_dir: &Path) -> RewindConfig {
    let mut config = RewindConfig::default();
    config.provider.index_url = format!("{}/live", server.uri());
    config.fetch.cache_dir = Some(cache_dir.to_path_buf());
    config.fetch.batch_size = 8;
    config.fetch.retries = 2;
    config.fetch.backoff_base_ms = 1;
    config.fetch.backoff_max_ms = 5;
    config
}

pub fn session() -> Session {
    Session::new(
        "token",
        ChannelCatalog::new([ChannelInfo {
            id: "536".to_string(),
            name: "France 2".to_string(),
            dash_id: Some("201".to_string()),
            freebox_id: Some("2".to_string()),
        }]),
    )
}

/// Window starting at `2025-12-19 12:00:00` Paris time.
pub fn window(seconds: i64) -> TimeWindow {
    let start =
        parse_local_datetime("2025-12-19 12:00:00", FixedOffset::east_opt(3600).unwrap()).unwrap();
    TimeWindow::from_duration(start, TimeDelta::seconds(seconds)).unwrap()
}

pub fn selector(video: &str, audio: &str) -> TrackSelector {
    TrackSelector {
        video: vec![video.parse::<QualityRule>().unwrap()],
        audio: vec![audio.parse::<QualityRule>().unwrap()],
        extra_audio: Vec::new(),
    }
}

pub async fn resolve(
    server: &MockServer,
    seconds: i64,
    selector: &TrackSelector,
) -> RewindResult<ResolvedTimeline> {
    let config = config(server, Path::new("unused"));
    let client = HttpClient::default();
    let index = MpdTimeShiftIndex::new(client.clone(), &config.provider);
    TimelineResolver::new(Arc::new(index), client, &config.timeline)
        .resolve(
            &session(),
            "536",
            window(seconds),
            selector,
            &CancellationToken::new(),
        )
        .await
}

/// Writes init and input into the output, as if decrypting were a copy.
#[derive(Clone, Default)]
pub struct FakeDecryptTool {
    pub calls: Arc<AtomicUsize>,
}

impl FakeDecryptTool {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl DecryptTool for FakeDecryptTool {
    fn decrypt(&self, job: &DecryptJob) -> RewindResult<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let mut data = match &job.init {
            Some(init) => std::fs::read(init)?,
            None => Vec::new(),
        };
        data.extend(std::fs::read(&job.input)?);
        std::fs::write(&job.output, data)?;
        Ok(())
    }
}
