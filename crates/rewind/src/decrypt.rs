use std::{
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::Arc,
};

use tokio::{fs::File, io::AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{DecryptConfig, DecryptToolKind},
    error::{RewindError, RewindResult},
    fetch::{FetchReport, TrackFetch},
    keys::{ContentKey, KeyId, ResolvedKeySet},
    timeline::Rendition,
};

/// Input and output of one external decryption.
#[derive(Debug, Clone)]
pub struct DecryptJob {
    pub rendition: String,
    pub init: Option<PathBuf>,
    /// Concatenated media fragments, without the init segment
    pub input: PathBuf,
    pub output: PathBuf,
    pub kid: KeyId,
    pub key: ContentKey,
}

/// External decryption of one concatenated track.
pub trait DecryptTool: Send + Sync {
    fn decrypt(&self, job: &DecryptJob) -> RewindResult<()>;
}

fn run(rendition: &str, mut command: Command) -> RewindResult<()> {
    tracing::debug!("Running {:?}", command.get_program());
    let output = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()?;
    if !output.status.success() {
        return Err(RewindError::DecryptTool {
            rendition: rendition.to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// `mp4ff-decrypt -init <init> -key <KEY> <input> <output>`
pub struct Mp4ffDecrypt {
    program: PathBuf,
}

impl Mp4ffDecrypt {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn locate(path: Option<&Path>) -> RewindResult<Self> {
        Ok(Self::new(match path {
            Some(path) => path.to_path_buf(),
            None => which::which("mp4ff-decrypt")?,
        }))
    }

    pub fn command(&self, job: &DecryptJob) -> Command {
        let mut command = Command::new(&self.program);
        if let Some(init) = &job.init {
            command.arg("-init").arg(init);
        }
        command
            .arg("-key")
            .arg(job.key.to_hex())
            .arg(&job.input)
            .arg(&job.output);
        command
    }
}

impl DecryptTool for Mp4ffDecrypt {
    fn decrypt(&self, job: &DecryptJob) -> RewindResult<()> {
        run(&job.rendition, self.command(job))
    }
}

/// Bento4 `mp4decrypt --key <KID>:<KEY> <input> <output>`.
///
/// Bento4 has no separate init argument, so the init segment is prepended to the input.
pub struct Bento4Decrypt {
    program: PathBuf,
}

impl Bento4Decrypt {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn locate(path: Option<&Path>) -> RewindResult<Self> {
        Ok(Self::new(match path {
            Some(path) => path.to_path_buf(),
            None => which::which("mp4decrypt")?,
        }))
    }

    pub fn command(&self, job: &DecryptJob, input: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("--key")
            .arg(format!("{}:{}", job.kid, job.key.to_hex()))
            .arg(input)
            .arg(&job.output);
        command
    }
}

impl DecryptTool for Bento4Decrypt {
    fn decrypt(&self, job: &DecryptJob) -> RewindResult<()> {
        let Some(init) = &job.init else {
            return run(&job.rendition, self.command(job, &job.input));
        };

        let input = job.input.with_extension("full.mp4");
        {
            let mut full = std::fs::File::create(&input)?;
            std::io::copy(&mut std::fs::File::open(init)?, &mut full)?;
            std::io::copy(&mut std::fs::File::open(&job.input)?, &mut full)?;
        }
        let result = run(&job.rendition, self.command(job, &input));
        _ = std::fs::remove_file(&input);
        result
    }
}

/// A playable track file produced from one rendition.
#[derive(Debug, Clone)]
pub struct DecryptedTrack {
    pub rendition: Arc<Rendition>,
    pub path: PathBuf,
    /// Presentation time of the first fragment, in seconds since the Unix epoch
    pub first_pts: f64,
}

/// Turns fetched tracks into playable files, decrypting the encrypted ones.
pub struct DecryptOrchestrator {
    tool: Arc<dyn DecryptTool>,
}

impl DecryptOrchestrator {
    pub fn new(tool: impl DecryptTool + 'static) -> Self {
        Self {
            tool: Arc::new(tool),
        }
    }

    pub fn from_config(config: &DecryptConfig) -> RewindResult<Self> {
        let path = config.tool_path.as_deref();
        Ok(match config.tool {
            DecryptToolKind::Mp4ffDecrypt => Self::new(Mp4ffDecrypt::locate(path)?),
            DecryptToolKind::Mp4decrypt => Self::new(Bento4Decrypt::locate(path)?),
        })
    }

    /// Writes one `{prefix}_{rendition}.mp4` per fetched track into `output_dir`.
    ///
    /// Failed tool runs are not retried.
    pub async fn decrypt(
        &self,
        report: &FetchReport,
        keys: &ResolvedKeySet,
        output_dir: &Path,
        prefix: &str,
        cancel: &CancellationToken,
    ) -> RewindResult<Vec<DecryptedTrack>> {
        tokio::fs::create_dir_all(output_dir).await?;

        let mut tracks = Vec::with_capacity(report.tracks.len());
        for track in &report.tracks {
            if cancel.is_cancelled() {
                return Err(RewindError::Cancelled);
            }

            let rendition = &track.rendition;
            let Some(first) = track.segments.iter().find(|r| r.is_ok()) else {
                tracing::warn!("No fragment of {} was downloaded, skipping.", rendition.id);
                continue;
            };
            let first_pts = rendition.ticks_to_seconds(first.segment.presentation_time);
            let output = output_dir.join(format!("{prefix}_{}.mp4", file_safe(&rendition.id)));

            match rendition.key_id {
                Some(kid) => {
                    let key = *keys
                        .get(&kid)
                        .ok_or_else(|| RewindError::MissingKeys(vec![kid]))?;
                    self.decrypt_track(track, kid, key, &output).await?;
                }
                None => {
                    tracing::info!("{} is not encrypted, concatenating.", rendition.id);
                    concat(track.init.as_deref(), track.fragment_paths(), &output).await?;
                }
            }

            tracks.push(DecryptedTrack {
                rendition: rendition.clone(),
                path: output,
                first_pts,
            });
        }
        Ok(tracks)
    }

    async fn decrypt_track(
        &self,
        track: &TrackFetch,
        kid: KeyId,
        key: ContentKey,
        output: &Path,
    ) -> RewindResult<()> {
        let rendition = &track.rendition;
        let input = output.with_extension("merged.m4s");
        concat(None, track.fragment_paths(), &input).await?;

        tracing::info!("Decrypting {} ({kid})...", rendition.id);
        let job = DecryptJob {
            rendition: rendition.id.clone(),
            init: track.init.clone(),
            input: input.clone(),
            output: output.to_path_buf(),
            kid,
            key,
        };
        let tool = self.tool.clone();
        let result = tokio::task::spawn_blocking(move || tool.decrypt(&job)).await;
        _ = tokio::fs::remove_file(&input).await;
        result??;

        let size = tokio::fs::metadata(output)
            .await
            .map(|m| m.len())
            .unwrap_or_default();
        if size == 0 {
            return Err(RewindError::MissingOutput(output.to_path_buf()));
        }
        tracing::info!("Decrypted {} into {}", rendition.id, output.display());
        Ok(())
    }
}

fn file_safe(id: &str) -> String {
    id.replace(['/', '\\', ':'], "_")
}

/// Concatenates `init` and `fragments` into `output`, in order.
async fn concat<'a>(
    init: Option<&'a Path>,
    fragments: impl Iterator<Item = &'a PathBuf>,
    output: &Path,
) -> RewindResult<()> {
    let mut writer = File::create(output).await?;
    for path in init.into_iter().chain(fragments.map(PathBuf::as_path)) {
        let mut reader = File::open(path).await?;
        tokio::io::copy(&mut reader, &mut writer).await?;
    }
    writer.flush().await?;
    Ok(())
}
