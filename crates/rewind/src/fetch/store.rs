use std::path::{Path, PathBuf};

use crate::{
    error::RewindResult,
    timeline::{Rendition, SegmentDescriptor},
};

const PART_EXTENSION: &str = "part";

/// Cache directory of one run.
///
/// Fragments live at `segments_{rendition}/{sequence:06}.m4s` so that a lexical sort
/// of a track directory is its playback order.
#[derive(Debug, Clone)]
pub struct SegmentStore {
    root: PathBuf,
}

impl SegmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn track_dir(&self, rendition: &Rendition) -> PathBuf {
        let id = rendition.id.replace(['/', '\\'], "__");
        self.root.join(format!("segments_{id}"))
    }

    pub fn init_path(&self, rendition: &Rendition) -> PathBuf {
        self.track_dir(rendition).join("init.mp4")
    }

    pub fn segment_path(&self, segment: &SegmentDescriptor) -> PathBuf {
        self.track_dir(&segment.rendition)
            .join(format!("{:06}.m4s", segment.sequence))
    }

    /// Size of a completed file at `path`.
    ///
    /// A file counts as complete when it has the expected size, or is not empty when no
    /// size is known.
    pub async fn existing(&self, path: &Path, expected: Option<u64>) -> Option<u64> {
        let metadata = tokio::fs::metadata(path).await.ok()?;
        let len = metadata.len();
        let complete = metadata.is_file()
            && match expected {
                Some(expected) => len == expected,
                None => len > 0,
            };
        complete.then_some(len)
    }

    /// Writes `data` next to `path` first, then renames it into place.
    pub async fn write(&self, path: &Path, data: &[u8]) -> RewindResult<u64> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let part = part_path(path);
        tokio::fs::write(&part, data).await?;
        tokio::fs::rename(&part, path).await?;
        Ok(data.len() as u64)
    }

    /// Removes unfinished downloads left behind by aborted requests.
    pub async fn discard_partials(&self) -> RewindResult<usize> {
        let mut removed = 0;
        let Ok(mut tracks) = tokio::fs::read_dir(&self.root).await else {
            return Ok(0);
        };
        while let Some(track) = tracks.next_entry().await? {
            if !track.file_type().await?.is_dir() {
                continue;
            }
            let mut files = tokio::fs::read_dir(track.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                if path.extension().is_some_and(|ext| ext == PART_EXTENSION) {
                    tokio::fs::remove_file(&path).await?;
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            tracing::debug!("Removed {removed} partial file(s) from {}", self.root.display());
        }
        Ok(removed)
    }

    pub async fn clear(&self) -> RewindResult<()> {
        if tokio::fs::try_exists(&self.root).await? {
            tokio::fs::remove_dir_all(&self.root).await?;
        }
        Ok(())
    }
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(PART_EXTENSION);
    path.with_file_name(name)
}
