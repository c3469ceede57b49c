use std::{collections::HashMap, path::Path, sync::Arc};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{FetchReport, FetchResult, FetchStatus, SegmentStore, TrackFetch};
use crate::{
    config::FetchConfig,
    error::{RewindError, RewindResult},
    timeline::{ResolvedTimeline, SegmentDescriptor},
    util::{ByteRange, HttpClient, VecMix},
};

/// Downloads the segments of a resolved timeline into a [`SegmentStore`].
///
/// Segments are requested in fixed-size batches, interleaved across tracks. A batch
/// finishes when every member succeeded or ran out of retries.
pub struct SegmentFetcher {
    client: HttpClient,
    config: Arc<FetchConfig>,
}

impl SegmentFetcher {
    pub fn new(client: HttpClient, config: &FetchConfig) -> Self {
        Self {
            client,
            config: Arc::new(config.clone()),
        }
    }

    pub async fn fetch(
        &self,
        timeline: &ResolvedTimeline,
        store: &SegmentStore,
        cancel: &CancellationToken,
    ) -> RewindResult<FetchReport> {
        let batch_size = self.config.batch_size.max(1);
        let mut report = FetchReport::default();

        let mut inits = HashMap::new();
        let mut jobs = Vec::with_capacity(timeline.tracks.len());
        for track in &timeline.tracks {
            let init = match &track.init_url {
                Some(url) => {
                    let path = store.init_path(&track.rendition);
                    let result = tokio::select! {
                        result = self.fetch_init(url, store, &path) => result,
                        _ = cancel.cancelled() => return cancelled(store).await,
                    };
                    match result {
                        Ok(()) => Some(path),
                        Err(e) if !track.rendition.required => {
                            tracing::warn!(
                                "Init segment of optional rendition {} failed, dropping it. {e}",
                                track.rendition.id
                            );
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
                None => None,
            };
            inits.insert(track.rendition.id.clone(), init);
            jobs.push(track.segments.clone());
        }

        let jobs = jobs.mix();
        let total = jobs.len();
        tracing::info!("Start downloading {total} segment(s) in batches of {batch_size}.");

        let mut results: HashMap<String, Vec<FetchResult>> = HashMap::new();
        let mut failed: Vec<SegmentDescriptor> = Vec::new();
        let mut done = 0;

        for batch in jobs.chunks(batch_size) {
            if cancel.is_cancelled() {
                return cancelled(store).await;
            }

            let mut tasks = JoinSet::new();
            for segment in batch {
                tasks.spawn(fetch_segment(
                    self.client.clone(),
                    self.config.clone(),
                    store.clone(),
                    segment.clone(),
                ));
            }

            loop {
                let joined = tokio::select! {
                    joined = tasks.join_next() => joined,
                    _ = cancel.cancelled() => {
                        tasks.abort_all();
                        while tasks.join_next().await.is_some() {}
                        return cancelled(store).await;
                    }
                };
                let Some(joined) = joined else {
                    break;
                };
                let result = joined?;

                done += 1;
                let filename = segment_name(&result.segment);
                match &result.status {
                    FetchStatus::Ok if result.skipped => {
                        report.skipped += 1;
                        tracing::debug!("File {} already exists, ignoring.", result.path.display());
                    }
                    FetchStatus::Ok => {
                        report.downloaded += 1;
                        let percentage = done as f32 / total as f32 * 100.;
                        tracing::info!(
                            "Processing {filename} finished. ({done} / {total} or {percentage:.2}%)"
                        );
                    }
                    FetchStatus::Failed(_) => {
                        report.failed += 1;
                        failed.push(result.segment.clone());
                    }
                }
                results
                    .entry(result.segment.rendition.id.clone())
                    .or_default()
                    .push(result);
            }

            if self.should_abort(&failed) {
                tracing::error!("Failed to download {} segments:", failed.len());
                for segment in &failed {
                    tracing::error!("  - {} ({})", segment_name(segment), segment.url);
                }
                return Err(RewindError::SegmentFetch { failed });
            }
        }

        for track in &timeline.tracks {
            let Some(init) = inits.remove(&track.rendition.id) else {
                continue;
            };
            let mut segments = results.remove(&track.rendition.id).unwrap_or_default();
            segments.sort_by_key(|r| r.segment.sequence);
            report.tracks.push(TrackFetch {
                rendition: track.rendition.clone(),
                init,
                segments,
            });
        }

        if report.failed > 0 {
            tracing::warn!(
                "{} segment(s) of optional renditions could not be downloaded",
                report.failed
            );
        }
        tracing::info!(
            "Downloaded {} segment(s), {} already present.",
            report.downloaded,
            report.skipped
        );
        Ok(report)
    }

    async fn fetch_init(&self, url: &Url, store: &SegmentStore, path: &Path) -> RewindResult<()> {
        if store.existing(path, None).await.is_some() {
            tracing::debug!("File {} already exists, ignoring.", path.display());
            return Ok(());
        }
        download(&self.client, &self.config, store, url, None, path).await?;
        Ok(())
    }

    /// Any failure of a required rendition aborts, optional ones have a tolerance.
    fn should_abort(&self, failed: &[SegmentDescriptor]) -> bool {
        let mut optional: HashMap<&str, usize> = HashMap::new();
        for segment in failed {
            if segment.rendition.required {
                return true;
            }
            *optional.entry(segment.rendition.id.as_str()).or_default() += 1;
        }
        optional
            .values()
            .any(|count| *count > self.config.optional_failure_tolerance)
    }
}

async fn cancelled<T>(store: &SegmentStore) -> RewindResult<T> {
    tracing::info!("Download cancelled, completed segments are kept for the next run.");
    if let Err(e) = store.discard_partials().await {
        tracing::warn!("Failed to remove partial files: {e}");
    }
    Err(RewindError::Cancelled)
}

fn segment_name(segment: &SegmentDescriptor) -> String {
    format!("{}/{:06}", segment.rendition.id, segment.sequence)
}

async fn fetch_segment(
    client: HttpClient,
    config: Arc<FetchConfig>,
    store: SegmentStore,
    segment: SegmentDescriptor,
) -> FetchResult {
    let path = store.segment_path(&segment);
    let expected = segment.byte_range.and_then(|range| range.length);
    if let Some(size) = store.existing(&path, expected).await {
        return FetchResult {
            segment,
            path,
            size,
            status: FetchStatus::Ok,
            skipped: true,
        };
    }

    let result = download(
        &client,
        &config,
        &store,
        &segment.url,
        segment.byte_range,
        &path,
    )
    .await;
    let (size, status) = match result {
        Ok(size) => (size, FetchStatus::Ok),
        Err(e) => (0, FetchStatus::Failed(e.to_string())),
    };
    FetchResult {
        segment,
        path,
        size,
        status,
        skipped: false,
    }
}

/// Downloads `url` into `path`, retrying transient failures with exponential backoff.
async fn download(
    client: &HttpClient,
    config: &FetchConfig,
    store: &SegmentStore,
    url: &Url,
    range: Option<ByteRange>,
    path: &Path,
) -> RewindResult<u64> {
    let filename = display_name(path);
    let mut attempt = 0;
    loop {
        let result = match client.get_bytes(url.clone(), range).await {
            Ok(data) => store.write(path, &data).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(size) => return Ok(size),
            Err(e) if e.is_retryable() && attempt < config.retries => {
                attempt += 1;
                tracing::warn!("Processing {filename} failed, retry later. {e}");
                tokio::time::sleep(config.backoff(attempt)).await;
            }
            Err(e) => {
                tracing::error!("Processing {filename} failed, max retries exceed, drop. {e}");
                return Err(e);
            }
        }
    }
}

fn display_name(path: &Path) -> String {
    let name = |p: Option<&Path>| {
        p.and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    format!("{}/{}", name(path.parent()), name(Some(path)))
}
