use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::{
    decrypt::DecryptedTrack,
    error::{RewindError, RewindResult},
    timeline::TrackType,
};

/// Muxes decrypted tracks into one file with `ffmpeg -c copy`.
///
/// Audio tracks are shifted by the distance between their first fragment and the
/// first video fragment, since both grids rarely start at the same instant.
pub struct FfmpegMuxer {
    program: PathBuf,
}

impl FfmpegMuxer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn locate(path: Option<&Path>) -> RewindResult<Self> {
        Ok(Self::new(match path {
            Some(path) => path.to_path_buf(),
            None => which::which("ffmpeg")?,
        }))
    }

    pub fn command(&self, tracks: &[DecryptedTrack], output: &Path) -> Command {
        let mut ordered: Vec<&DecryptedTrack> = tracks.iter().collect();
        ordered.sort_by_key(|t| t.rendition.track_type);
        let reference = ordered.first().map(|t| t.first_pts).unwrap_or_default();

        let mut command = Command::new(&self.program);
        command.args(["-y", "-hide_banner", "-loglevel", "error"]);
        for track in &ordered {
            let offset = track.first_pts - reference;
            if track.rendition.track_type == TrackType::Audio && offset.abs() > f64::EPSILON {
                command.arg("-itsoffset").arg(format!("{offset:.3}"));
            }
            command.arg("-i").arg(&track.path);
        }
        for index in 0..ordered.len() {
            command.arg("-map").arg(index.to_string());
        }
        command.args(["-c", "copy"]).arg(output);
        command
    }

    pub async fn mux(&self, tracks: &[DecryptedTrack], output: &Path) -> RewindResult<()> {
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        tracing::info!("Muxing {} track(s) into {}", tracks.len(), output.display());
        let status = self.command(tracks, output).status().await?;
        if !status.success() {
            return Err(RewindError::MuxFailed(status.code()));
        }
        Ok(())
    }
}
