use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{
    index::Validated, AnchorProbe, Rendition, ResolveWarning, ResolvedTimeline, ResolvedTrack,
    SegmentDescriptor, TimeShiftIndex, TimeWindow, TrackSelector,
};
use crate::{
    bmff,
    config::TimelineConfig,
    error::{RewindError, RewindResult},
    keys::KeyId,
    session::Session,
    util::HttpClient,
};

/// Turns a `(channel, window, selector)` request into ordered segment lists.
pub struct TimelineResolver {
    index: Arc<dyn TimeShiftIndex>,
    client: HttpClient,
    anchor: Option<AnchorProbe>,
    max_retention: Option<TimeDelta>,
}

impl TimelineResolver {
    pub fn new(index: Arc<dyn TimeShiftIndex>, client: HttpClient, config: &TimelineConfig) -> Self {
        Self {
            index,
            anchor: config
                .probe_anchor
                .then(|| AnchorProbe::new(client.clone(), config)),
            client,
            max_retention: config.max_retention(),
        }
    }

    pub async fn resolve(
        &self,
        session: &Session,
        channel_id: &str,
        window: TimeWindow,
        selector: &TrackSelector,
        cancel: &CancellationToken,
    ) -> RewindResult<ResolvedTimeline> {
        let channel = session.channel(channel_id)?.clone();
        let index = self.index.fetch(session, &channel).await?;
        let mut warnings = Vec::new();

        let retention = index.retention(Utc::now(), self.max_retention);
        let clipped = TimeWindow::new(
            retention.start.map_or(window.start(), |s| s.max(window.start())),
            retention.end.min(window.end()),
        )
        .map_err(|_| RewindError::WindowUnavailable {
            start: window.start(),
            end: window.end(),
        })?;
        if clipped != window {
            warnings.push(ResolveWarning::PartialWindow {
                requested: window,
                available: clipped,
            });
        }

        let mut renditions = Vec::with_capacity(index.renditions.len());
        for record in index.renditions {
            match record.validate()? {
                Validated::Accepted(rendition) => renditions.push(rendition),
                Validated::Omitted { id, reason } => {
                    warnings.push(ResolveWarning::RenditionOmitted { id, reason })
                }
            }
        }

        let selected = selector.select(&renditions, &mut warnings)?;
        let mut tracks = Vec::with_capacity(selected.len());
        for rendition in selected {
            if cancel.is_cancelled() {
                return Err(RewindError::Cancelled);
            }
            tracks.push(self.resolve_track(rendition, &clipped, cancel).await?);
        }

        for warning in &warnings {
            tracing::warn!("{warning}");
        }
        tracing::info!(
            "Resolved {} segments in {} tracks for {} ({clipped})",
            tracks.iter().map(|t| t.segments.len()).sum::<usize>(),
            tracks.len(),
            channel.name,
        );

        Ok(ResolvedTimeline {
            channel,
            requested: window,
            window: clipped,
            tracks,
            warnings,
        })
    }

    async fn resolve_track(
        &self,
        mut rendition: Rendition,
        window: &TimeWindow,
        cancel: &CancellationToken,
    ) -> RewindResult<ResolvedTrack> {
        let d = rendition.segment_duration as i128;
        let start = window.start_ticks(rendition.timescale);
        let end = window.end_ticks(rendition.timescale);

        if let Some(probe) = &self.anchor {
            let near = u64::try_from(start - d).unwrap_or(0);
            if let Some(tick) = probe.locate(&rendition, near, cancel).await? {
                let shift = (tick as i128 - rendition.anchor as i128).div_euclid(d);
                rendition.anchor = tick;
                rendition.anchor_number =
                    u64::try_from(rendition.anchor_number as i128 + shift).unwrap_or(0);
            }
        }

        // first and last segments overlapping [start, end)
        let anchor = rendition.anchor as i128;
        let first = (start - anchor).div_euclid(d);
        let last = (end - anchor - 1).div_euclid(d);
        let grid = (first..=last)
            .map(|k| {
                let tick = u64::try_from(anchor + k * d).map_err(|_| {
                    RewindError::MalformedIndex(format!(
                        "{}: window starts before the epoch",
                        rendition.id
                    ))
                })?;
                Ok((tick, rendition.anchor_number as i128 + k))
            })
            .collect::<RewindResult<Vec<_>>>()?;

        let init_url = rendition.init_url()?;
        if rendition.encrypted && rendition.key_id.is_none() {
            let kid = self
                .discover_key_id(&rendition, init_url.as_ref(), &grid)
                .await?;
            rendition.key_id = Some(kid);
        }

        let rendition = Arc::new(rendition);
        let segments = grid
            .into_iter()
            .enumerate()
            .map(|(sequence, (tick, number))| {
                Ok(SegmentDescriptor {
                    rendition: rendition.clone(),
                    sequence: sequence as u64,
                    url: rendition.segment_url(tick, number)?,
                    byte_range: None,
                    presentation_time: tick,
                    duration: rendition.segment_duration,
                })
            })
            .collect::<RewindResult<Vec<_>>>()?;

        tracing::debug!(
            "{} ({}): {} segments from tick {}",
            rendition.id,
            rendition.quality_label,
            segments.len(),
            segments.first().map(|s| s.presentation_time).unwrap_or_default()
        );

        let track = ResolvedTrack {
            rendition,
            init_url,
            segments,
        };
        track.ensure_contiguous()?;
        Ok(track)
    }

    /// Reads the key id from the init segment, or from the first fragment's sample groups.
    async fn discover_key_id(
        &self,
        rendition: &Rendition,
        init_url: Option<&Url>,
        grid: &[(u64, i128)],
    ) -> RewindResult<KeyId> {
        if let Some(init_url) = init_url {
            let init = self.client.get_bytes(init_url.clone(), None).await?;
            if let Some(kid) = bmff::tenc_key_id(&init) {
                tracing::debug!("{}: key id {kid} read from init segment", rendition.id);
                return Ok(kid);
            }
        }

        if let Some((tick, number)) = grid.first() {
            let url = rendition.segment_url(*tick, *number)?;
            let segment = self.client.get_bytes(url, None).await?;
            if let Some(kid) = bmff::seig_key_id(&segment) {
                tracing::debug!("{}: key id {kid} read from media segment", rendition.id);
                return Ok(kid);
            }
        }

        Err(RewindError::MalformedIndex(format!(
            "{}: encrypted rendition without key id",
            rendition.id
        )))
    }
}
