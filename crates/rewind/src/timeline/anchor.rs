use reqwest::header::RANGE;
use tokio_util::sync::CancellationToken;

use super::Rendition;
use crate::{
    config::TimelineConfig,
    error::RewindResult,
    search::BatchSearch,
    util::{ByteRange, HttpClient},
};

/// Finds the real segment grid of a rendition near a given tick.
///
/// The index only lists the segments around the live edge, and the grid of older
/// content may be shifted. Every offset in `[0, segment_duration)` after `near` is
/// requested until the server answers for one of them.
pub struct AnchorProbe {
    client: HttpClient,
    search: BatchSearch,
}

impl AnchorProbe {
    pub fn new(client: HttpClient, config: &TimelineConfig) -> Self {
        Self {
            client,
            search: BatchSearch::new(config.anchor_batch_size, config.anchor_concurrency),
        }
    }

    pub async fn locate(
        &self,
        rendition: &Rendition,
        near: u64,
        cancel: &CancellationToken,
    ) -> RewindResult<Option<u64>> {
        tracing::info!(
            "Probing segment grid of {} near tick {near}, this may take a while.",
            rendition.id
        );

        let outcome = self
            .search
            .run(
                &format!("anchor {}", rendition.id),
                0..rendition.segment_duration,
                cancel,
                |offset| self.exists(rendition, near + offset),
            )
            .await?;

        let found = outcome.found.map(|(_, offset)| near + offset);
        match found {
            Some(tick) => tracing::info!("Segment grid of {} found at tick {tick}", rendition.id),
            None => tracing::warn!(
                "No segment of {} found after {} requests",
                rendition.id,
                outcome.tested
            ),
        }
        Ok(found)
    }

    async fn exists(&self, rendition: &Rendition, tick: u64) -> bool {
        let Ok(url) = rendition.segment_url(tick, rendition.anchor_number as i128) else {
            return false;
        };

        let response = self
            .client
            .get(url)
            .header(RANGE, ByteRange::new(0, Some(1)).to_http_range())
            .send()
            .await;
        matches!(response, Ok(response) if response.status().is_success())
    }
}
