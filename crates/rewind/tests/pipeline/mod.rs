use rewind::{keys::KeyPair, Rewind, RewindError, RewindRequest};
use tokio_util::sync::CancellationToken;
use wiremock::MockServer;

use crate::{
    common::{self, FakeDecryptTool, MpdOptions, AUDIO_KID, VIDEO_KID},
    AssertWrapper,
};

async fn media_requests(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path().starts_with("/media/"))
        .count()
}

fn manual_keys() -> Vec<KeyPair> {
    vec![
        format!("{VIDEO_KID}:{}", "11".repeat(16)).parse().unwrap(),
        format!("{AUDIO_KID}:{}", "22".repeat(16)).parse().unwrap(),
    ]
}

#[tokio::test]
async fn test_rewind_with_manual_keys() -> anyhow::Result<()> {
    let server = common::provider(&MpdOptions::default()).await;
    let dir = tempfile::tempdir()?;
    let tool = FakeDecryptTool::default();
    let rewind = Rewind::builder(common::config(&server, &dir.path().join("cache")))
        .decrypt_tool(tool.clone())
        .build()?;

    let mut request = RewindRequest::new("536", common::window(30));
    request.selector = common::selector("best", "best");
    request.manual_keys = manual_keys();
    request.output_dir = dir.path().join("out");

    let outcome = rewind
        .run(&common::session(), &request, &CancellationToken::new())
        .await
        .assert_success();

    let keys = outcome.keys.as_ref().assert_success();
    assert_eq!(keys.len(), 2);

    let report = outcome.fetch.as_ref().assert_success();
    let segments = outcome.timeline.segment_count();
    assert_eq!(report.results().count(), segments);
    assert!(report.results().all(|r| r.is_ok()));

    assert_eq!(tool.calls(), 2);
    assert_eq!(outcome.tracks.len(), 2);
    for track in &outcome.tracks {
        let data = std::fs::read(&track.path)?;
        let resolved = outcome
            .timeline
            .tracks
            .iter()
            .find(|t| t.rendition.id == track.rendition.id)
            .assert_success();
        let init = common::init_segment(&track.rendition.key_id.assert_success());
        assert!(data.starts_with(&init));
        assert_eq!(
            data.len(),
            init.len() + resolved.segments.len() * b"fragment".len()
        );
    }

    // fragments are not kept without a manifest
    let cache = dir.path().join("cache");
    let leftovers = std::fs::read_dir(&cache)
        .map(|entries| entries.count())
        .unwrap_or_default();
    assert_eq!(leftovers, 0);
    Ok(())
}

#[tokio::test]
async fn test_missing_manual_key() -> anyhow::Result<()> {
    let server = common::provider(&MpdOptions::default()).await;
    let dir = tempfile::tempdir()?;
    let tool = FakeDecryptTool::default();
    let rewind = Rewind::builder(common::config(&server, dir.path()))
        .decrypt_tool(tool.clone())
        .build()?;

    let mut request = RewindRequest::new("536", common::window(30));
    request.manual_keys = manual_keys()[..1].to_vec();
    request.output_dir = dir.path().join("out");

    let result = rewind
        .run(&common::session(), &request, &CancellationToken::new())
        .await;
    let Err(RewindError::MissingKeys(missing)) = result else {
        panic!("expected missing keys, got {result:?}");
    };
    assert_eq!(missing, vec![common::kid(AUDIO_KID)]);
    assert_eq!(media_requests(&server).await, 0);
    assert_eq!(tool.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_exhausted_keys_download_nothing() -> anyhow::Result<()> {
    let server = common::provider(&MpdOptions::default()).await;
    let dir = tempfile::tempdir()?;
    let tool = FakeDecryptTool::default();
    let rewind = Rewind::builder(common::config(&server, &dir.path().join("cache")))
        .decrypt_tool(tool.clone())
        .build()?;

    let mut request = RewindRequest::new("536", common::window(30));
    request.output_dir = dir.path().join("out");

    let result = rewind
        .run(&common::session(), &request, &CancellationToken::new())
        .await;
    assert!(matches!(
        result,
        Err(RewindError::KeyResolutionExhausted { tested: 0, .. })
    ));
    assert_eq!(media_requests(&server).await, 0);
    assert_eq!(tool.calls(), 0);
    assert!(!dir.path().join("cache").exists());
    assert!(!dir.path().join("out").exists());
    Ok(())
}

#[tokio::test]
async fn test_manifest_only() -> anyhow::Result<()> {
    let server = common::provider(&MpdOptions::default()).await;
    let dir = tempfile::tempdir()?;
    let rewind = Rewind::builder(common::config(&server, &dir.path().join("cache"))).build()?;

    let manifest = dir.path().join("window.mpd");
    let mut request = RewindRequest::new("536", common::window(300));
    request.manifest_only = true;
    request.manifest_path = Some(manifest.clone());

    let outcome = rewind
        .run(&common::session(), &request, &CancellationToken::new())
        .await
        .assert_success();
    assert_eq!(outcome.manifest.as_ref(), Some(&manifest));
    assert!(outcome.fetch.is_none());
    assert!(outcome.keys.is_none());

    let content = std::fs::read_to_string(&manifest)?;
    assert!(content.contains(&format!("{}/media/video_1080/", server.uri())));
    assert_eq!(media_requests(&server).await, 0);
    assert!(!dir.path().join("cache").exists());
    Ok(())
}
