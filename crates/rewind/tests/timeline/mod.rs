use std::sync::Arc;

use rewind::{
    timeline::{MpdTimeShiftIndex, TrackType},
    util::HttpClient,
    RewindError,
};
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use crate::{
    common::{self, MpdOptions, AUDIO_KID, START, VIDEO_KID},
    AssertWrapper,
};

#[tokio::test]
async fn test_resolve_from_mpd() -> anyhow::Result<()> {
    let server = common::provider(&MpdOptions::default()).await;
    let timeline = common::resolve(&server, 300, &common::selector("best", "best"))
        .await
        .assert_success();

    assert!(timeline.warnings.is_empty());
    assert_eq!(timeline.tracks.len(), 2);

    let video = timeline.track(TrackType::Video).next().assert_success();
    assert_eq!(video.rendition.id, "video_1080");
    assert_eq!(video.rendition.key_id, Some(common::kid(VIDEO_KID)));
    // 300s over 3.2s segments, the grid being aligned on the window start
    assert_eq!(video.segments.len(), 94);
    let first = &video.segments[0];
    assert_eq!(first.sequence, 0);
    assert!(first.presentation_time <= START * 90_000);
    assert!(first.end_time() > START * 90_000);
    assert_eq!(
        first.url.as_str(),
        format!(
            "{}/media/video_1080/{}.m4s",
            server.uri(),
            first.presentation_time
        )
    );

    let audio = timeline.track(TrackType::Audio).next().assert_success();
    assert_eq!(audio.rendition.id, "audio_fra");
    assert_eq!(audio.rendition.key_id, Some(common::kid(AUDIO_KID)));
    let last = audio.segments.last().assert_success();
    assert!(last.end_time() >= (START + 300) * 48_000);
    assert!(last.presentation_time < (START + 300) * 48_000);

    assert_eq!(timeline.key_ids().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_worst_video_rule() -> anyhow::Result<()> {
    let server = common::provider(&MpdOptions::default()).await;
    let timeline = common::resolve(&server, 60, &common::selector("worst", "fra+best"))
        .await
        .assert_success();

    let video = timeline.track(TrackType::Video).next().assert_success();
    assert_eq!(video.rendition.id, "video_720");
    Ok(())
}

#[tokio::test]
async fn test_key_id_from_init_segment() -> anyhow::Result<()> {
    let server = common::provider(&MpdOptions { default_kid: false }).await;
    let timeline = common::resolve(&server, 30, &common::selector("best", "best"))
        .await
        .assert_success();

    let video = timeline.track(TrackType::Video).next().assert_success();
    assert!(video.rendition.encrypted);
    assert_eq!(video.rendition.key_id, Some(common::kid(VIDEO_KID)));
    let audio = timeline.track(TrackType::Audio).next().assert_success();
    assert_eq!(audio.rendition.key_id, Some(common::kid(AUDIO_KID)));
    Ok(())
}

#[tokio::test]
async fn test_rejected_session() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/live/201/1/live.mpd"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let result = common::resolve(&server, 300, &common::selector("best", "best")).await;
    assert!(matches!(result, Err(RewindError::AuthExpired(_))));
    Ok(())
}

#[tokio::test]
async fn test_unknown_channel() -> anyhow::Result<()> {
    let server = common::provider(&MpdOptions::default()).await;
    let config = common::config(&server, std::path::Path::new("unused"));
    let client = HttpClient::default();
    let resolver = rewind::timeline::TimelineResolver::new(
        Arc::new(MpdTimeShiftIndex::new(client.clone(), &config.provider)),
        client,
        &config.timeline,
    );

    let result = resolver
        .resolve(
            &common::session(),
            "999",
            common::window(300),
            &common::selector("best", "best"),
            &Default::default(),
        )
        .await;
    assert!(matches!(result, Err(RewindError::ChannelNotFound(_))));
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
    Ok(())
}
