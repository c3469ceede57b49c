mod fetcher;
mod store;

pub use fetcher::SegmentFetcher;
pub use store::SegmentStore;

use std::{path::PathBuf, sync::Arc};

use crate::timeline::{Rendition, SegmentDescriptor};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStatus {
    Ok,
    Failed(String),
}

/// Terminal state of one segment download.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub segment: SegmentDescriptor,
    pub path: PathBuf,
    pub size: u64,
    pub status: FetchStatus,
    /// The file was already complete and no request was made
    pub skipped: bool,
}

impl FetchResult {
    pub fn is_ok(&self) -> bool {
        self.status == FetchStatus::Ok
    }
}

/// Downloaded files of one rendition, in sequence order.
#[derive(Debug, Clone)]
pub struct TrackFetch {
    pub rendition: Arc<Rendition>,
    pub init: Option<PathBuf>,
    pub segments: Vec<FetchResult>,
}

impl TrackFetch {
    /// Paths of the fragments that were fetched, in playback order.
    pub fn fragment_paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.segments.iter().filter(|r| r.is_ok()).map(|r| &r.path)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchReport {
    pub tracks: Vec<TrackFetch>,
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl FetchReport {
    pub fn track(&self, rendition_id: &str) -> Option<&TrackFetch> {
        self.tracks.iter().find(|t| t.rendition.id == rendition_id)
    }

    pub fn results(&self) -> impl Iterator<Item = &FetchResult> {
        self.tracks.iter().flat_map(|t| t.segments.iter())
    }
}
