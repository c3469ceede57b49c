use rewind::{
    fetch::{SegmentFetcher, SegmentStore},
    timeline::TrackType,
    util::HttpClient,
    RewindError,
};
use tokio_util::sync::CancellationToken;
use wiremock::{
    matchers::{method, path_regex},
    Mock, ResponseTemplate,
};

use crate::{
    common::{self, MpdOptions},
    AssertWrapper,
};

async fn request_count(server: &wiremock::MockServer) -> usize {
    server.received_requests().await.unwrap_or_default().len()
}

#[tokio::test]
async fn test_fetch_and_resume() -> anyhow::Result<()> {
    let server = common::provider(&MpdOptions::default()).await;
    let timeline = common::resolve(&server, 30, &common::selector("best", "best"))
        .await
        .assert_success();
    let dir = tempfile::tempdir()?;
    let config = common::config(&server, dir.path());
    let fetcher = SegmentFetcher::new(HttpClient::default(), &config.fetch);
    let store = SegmentStore::new(dir.path().join("run"));

    let report = fetcher
        .fetch(&timeline, &store, &CancellationToken::new())
        .await
        .assert_success();
    assert_eq!(report.downloaded, timeline.segment_count());
    assert_eq!(report.skipped, 0);
    assert_eq!(report.failed, 0);
    assert_eq!(report.tracks.len(), 2);

    for track in &report.tracks {
        let resolved = timeline
            .tracks
            .iter()
            .find(|t| t.rendition.id == track.rendition.id)
            .assert_success();
        assert_eq!(track.segments.len(), resolved.segments.len());
        assert!(track.init.as_ref().assert_success().is_file());
        for (index, result) in track.segments.iter().enumerate() {
            assert!(result.is_ok());
            assert_eq!(result.segment.sequence, index as u64);
            assert_eq!(std::fs::read(&result.path)?, b"fragment");
        }
    }

    // everything is on disk already, the second run makes no request
    let before = request_count(&server).await;
    let report = fetcher
        .fetch(&timeline, &store, &CancellationToken::new())
        .await
        .assert_success();
    assert_eq!(request_count(&server).await, before);
    assert_eq!(report.downloaded, 0);
    assert_eq!(report.skipped, timeline.segment_count());
    Ok(())
}

#[tokio::test]
async fn test_retry_transient_errors() -> anyhow::Result<()> {
    let server = common::provider(&MpdOptions::default()).await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/media/audio_fra/[0-9]+\.m4s$"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;

    let timeline = common::resolve(&server, 10, &common::selector("best", "best"))
        .await
        .assert_success();
    let dir = tempfile::tempdir()?;
    let config = common::config(&server, dir.path());
    let report = SegmentFetcher::new(HttpClient::default(), &config.fetch)
        .fetch(
            &timeline,
            &SegmentStore::new(dir.path()),
            &CancellationToken::new(),
        )
        .await
        .assert_success();

    assert_eq!(report.failed, 0);
    assert!(report.results().all(|r| r.is_ok()));
    Ok(())
}

#[tokio::test]
async fn test_required_failure_aborts() -> anyhow::Result<()> {
    let server = common::provider(&MpdOptions::default()).await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/media/video_1080/[0-9]+\.m4s$"))
        .respond_with(ResponseTemplate::new(404))
        .with_priority(1)
        .mount(&server)
        .await;

    let timeline = common::resolve(&server, 10, &common::selector("best", "best"))
        .await
        .assert_success();
    let video = timeline.track(TrackType::Video).next().assert_success();
    let dir = tempfile::tempdir()?;
    let config = common::config(&server, dir.path());
    let store = SegmentStore::new(dir.path());

    let result = SegmentFetcher::new(HttpClient::default(), &config.fetch)
        .fetch(&timeline, &store, &CancellationToken::new())
        .await;
    let Err(RewindError::SegmentFetch { failed }) = result else {
        panic!("expected a segment fetch error, got {result:?}");
    };
    assert!(!failed.is_empty());
    assert!(failed.iter().all(|s| s.rendition.id == "video_1080"));
    for segment in &video.segments {
        assert!(!store.segment_path(segment).exists());
    }
    Ok(())
}

#[tokio::test]
async fn test_cancelled_fetch() -> anyhow::Result<()> {
    let server = common::provider(&MpdOptions::default()).await;
    let timeline = common::resolve(&server, 30, &common::selector("best", "best"))
        .await
        .assert_success();
    let dir = tempfile::tempdir()?;
    let config = common::config(&server, dir.path());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = SegmentFetcher::new(HttpClient::default(), &config.fetch)
        .fetch(&timeline, &SegmentStore::new(dir.path()), &cancel)
        .await;
    assert!(matches!(result, Err(RewindError::Cancelled)));
    Ok(())
}
