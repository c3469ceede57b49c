use regex::Regex;
use rewind::{
    fetch::{SegmentFetcher, SegmentStore},
    manifest::{ManifestBuilder, ManifestLocation},
    util::HttpClient,
};
use tokio_util::sync::CancellationToken;

use crate::{
    common::{self, MpdOptions, VIDEO_KID},
    AssertWrapper,
};

/// `(timescale, summed S durations)` of every representation of a manifest.
fn representation_durations(manifest: &str) -> Vec<(u64, u64)> {
    let timescale = Regex::new(r#"<SegmentList timescale="(\d+)""#).unwrap();
    let s = Regex::new(r#"<S (?:t="\d+" )?d="(\d+)"(?: r="(\d+)")?/>"#).unwrap();

    manifest
        .split("<Representation ")
        .skip(1)
        .map(|representation| {
            let timescale = timescale.captures(representation).unwrap()[1]
                .parse::<u64>()
                .unwrap();
            let total = s
                .captures_iter(representation)
                .map(|c| {
                    let d: u64 = c[1].parse().unwrap();
                    let r: u64 = c.get(2).map_or(0, |r| r.as_str().parse().unwrap());
                    d * (r + 1)
                })
                .sum();
            (timescale, total)
        })
        .collect()
}

#[tokio::test]
async fn test_remote_manifest_covers_window() -> anyhow::Result<()> {
    let server = common::provider(&MpdOptions::default()).await;
    let timeline = common::resolve(&server, 300, &common::selector("best", "best"))
        .await
        .assert_success();

    let manifest = ManifestBuilder::new(&timeline).build()?;
    assert!(manifest.contains(r#"type="static""#));
    assert!(manifest.contains(&format!(
        r#"cenc:default_KID="{}""#,
        common::kid(VIDEO_KID).to_uuid_string()
    )));
    assert!(manifest.contains(&format!(
        r#"<Initialization sourceURL="{}/media/video_1080/init.mp4"/>"#,
        server.uri()
    )));

    let durations = representation_durations(&manifest);
    assert_eq!(durations.len(), 2);
    for (timescale, total) in durations {
        // the window is covered, with less than one extra segment of 3.2s
        let seconds = total as f64 / timescale as f64;
        assert!(seconds >= 300.0, "{seconds}");
        assert!(seconds < 303.2, "{seconds}");
    }
    Ok(())
}

#[tokio::test]
async fn test_local_manifest_references_files() -> anyhow::Result<()> {
    let server = common::provider(&MpdOptions::default()).await;
    let timeline = common::resolve(&server, 10, &common::selector("best", "best"))
        .await
        .assert_success();
    let dir = tempfile::tempdir()?;
    let config = common::config(&server, dir.path());
    let store = SegmentStore::new(dir.path().join("run"));
    let report = SegmentFetcher::new(HttpClient::default(), &config.fetch)
        .fetch(&timeline, &store, &CancellationToken::new())
        .await
        .assert_success();

    let manifest = ManifestBuilder::new(&timeline)
        .location(ManifestLocation::Local {
            report: &report,
            relative_to: dir.path(),
        })
        .build()?;

    assert!(manifest.contains(r#"<Initialization sourceURL="run/segments_video_1080/init.mp4"/>"#));
    assert!(manifest.contains(r#"<SegmentURL media="run/segments_video_1080/000000.m4s"/>"#));
    assert!(manifest.contains(r#"<SegmentURL media="run/segments_audio_fra/000003.m4s"/>"#));
    assert!(!manifest.contains(&server.uri()));
    Ok(())
}
