use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio_util::sync::CancellationToken;

use crate::{
    config::RewindConfig,
    decrypt::{DecryptOrchestrator, DecryptTool, DecryptedTrack},
    error::{RewindError, RewindResult},
    fetch::{FetchReport, SegmentFetcher, SegmentStore},
    keys::{KeyPair, KeyResolver, ResolvedKeySet, TimelineProbe},
    manifest::{ManifestBuilder, ManifestLocation},
    mux::FfmpegMuxer,
    session::Session,
    timeline::{
        MpdTimeShiftIndex, ResolvedTimeline, TimeShiftIndex, TimeWindow, TimelineResolver,
        TrackSelector,
    },
    util::HttpClient,
};

/// What to rewind, and where to put it.
#[derive(Debug, Clone)]
pub struct RewindRequest {
    pub channel_id: String,
    pub window: TimeWindow,
    pub selector: TrackSelector,
    /// Used verbatim, no key lookup happens when set
    pub manual_keys: Vec<KeyPair>,
    /// Only write a manifest pointing at the provider, download nothing
    pub manifest_only: bool,
    pub manifest_path: Option<PathBuf>,
    /// Directory of the per-track output files
    pub output_dir: PathBuf,
    /// Muxed output file, tracks are left separate when unset
    pub output: Option<PathBuf>,
}

impl RewindRequest {
    pub fn new(channel_id: impl Into<String>, window: TimeWindow) -> Self {
        Self {
            channel_id: channel_id.into(),
            window,
            selector: TrackSelector::default(),
            manual_keys: Vec::new(),
            manifest_only: false,
            manifest_path: None,
            output_dir: PathBuf::from("."),
            output: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RewindOutcome {
    pub timeline: Arc<ResolvedTimeline>,
    pub keys: Option<Arc<ResolvedKeySet>>,
    pub fetch: Option<FetchReport>,
    pub tracks: Vec<DecryptedTrack>,
    pub manifest: Option<PathBuf>,
    pub output: Option<PathBuf>,
}

/// `{channel}_{start}_{end}` of the requested window, used for cache and output names.
fn run_name(timeline: &ResolvedTimeline) -> String {
    const FORMAT: &str = "%Y%m%dT%H%M%SZ";
    format!(
        "{}_{}_{}",
        timeline.channel.id,
        timeline.requested.start().format(FORMAT),
        timeline.requested.end().format(FORMAT)
    )
}

/// The whole acquisition: resolve, find keys, fetch, decrypt and mux.
pub struct Rewind {
    config: RewindConfig,
    client: HttpClient,
    resolver: TimelineResolver,
    keys: KeyResolver,
    fetcher: SegmentFetcher,
    decryptor: Option<DecryptOrchestrator>,
    muxer: Option<FfmpegMuxer>,
}

impl Rewind {
    pub fn builder(config: RewindConfig) -> RewindBuilder {
        RewindBuilder::new(config)
    }

    pub fn config(&self) -> &RewindConfig {
        &self.config
    }

    fn cache_root(&self) -> PathBuf {
        self.config
            .fetch
            .cache_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("rewind"))
    }

    pub async fn run(
        &self,
        session: &Session,
        request: &RewindRequest,
        cancel: &CancellationToken,
    ) -> RewindResult<RewindOutcome> {
        let timeline = self
            .resolver
            .resolve(
                session,
                &request.channel_id,
                request.window,
                &request.selector,
                cancel,
            )
            .await?;
        let timeline = Arc::new(timeline);
        let name = run_name(&timeline);
        let mut outcome = RewindOutcome {
            timeline: timeline.clone(),
            keys: None,
            fetch: None,
            tracks: Vec::new(),
            manifest: None,
            output: None,
        };

        if request.manifest_only {
            let path = request
                .manifest_path
                .clone()
                .unwrap_or_else(|| request.output_dir.join(format!("{name}.mpd")));
            ManifestBuilder::new(&timeline).write(&path).await?;
            outcome.manifest = Some(path);
            return Ok(outcome);
        }

        let probe = TimelineProbe::new(self.client.clone(), &timeline);
        let keys = self
            .keys
            .resolve(&timeline, &request.manual_keys, &probe, cancel)
            .await?;
        let missing = keys.missing(&timeline.key_ids());
        if !missing.is_empty() {
            return Err(RewindError::MissingKeys(missing));
        }
        let keys = Arc::new(keys);
        outcome.keys = Some(keys.clone());

        // locate external tools before spending time on the download
        let default_decryptor;
        let decryptor = match &self.decryptor {
            Some(decryptor) => decryptor,
            None => {
                default_decryptor = DecryptOrchestrator::from_config(&self.config.decrypt)?;
                &default_decryptor
            }
        };
        let default_muxer;
        let muxer = match (&request.output, &self.muxer) {
            (None, _) => None,
            (Some(_), Some(muxer)) => Some(muxer),
            (Some(_), None) => {
                default_muxer = FfmpegMuxer::locate(self.config.decrypt.ffmpeg_path.as_deref())?;
                Some(&default_muxer)
            }
        };

        let store = SegmentStore::new(self.cache_root().join(&name));
        tracing::info!("Using cache directory {}", store.root().display());
        let report = self.fetcher.fetch(&timeline, &store, cancel).await?;

        if let Some(path) = &request.manifest_path {
            let relative_to = path.parent().unwrap_or(Path::new(""));
            ManifestBuilder::new(&timeline)
                .location(ManifestLocation::Local {
                    report: &report,
                    relative_to,
                })
                .write(path)
                .await?;
            outcome.manifest = Some(path.clone());
        }

        let tracks = decryptor
            .decrypt(&report, &keys, &request.output_dir, &name, cancel)
            .await?;

        if let (Some(output), Some(muxer)) = (&request.output, muxer) {
            muxer.mux(&tracks, output).await?;
            if !self.config.fetch.keep_segments {
                for track in &tracks {
                    _ = tokio::fs::remove_file(&track.path).await;
                }
            }
            outcome.output = Some(output.clone());
        }

        if self.config.fetch.keep_segments || outcome.manifest.is_some() {
            tracing::info!("Segments kept in {}", store.root().display());
        } else {
            store.clear().await?;
        }

        outcome.tracks = tracks;
        outcome.fetch = Some(report);
        Ok(outcome)
    }
}

pub struct RewindBuilder {
    config: RewindConfig,
    client: Option<HttpClient>,
    index: Option<Arc<dyn TimeShiftIndex>>,
    keys: Option<KeyResolver>,
    decryptor: Option<DecryptOrchestrator>,
    muxer: Option<FfmpegMuxer>,
}

impl RewindBuilder {
    pub fn new(config: RewindConfig) -> Self {
        Self {
            config,
            client: None,
            index: None,
            keys: None,
            decryptor: None,
            muxer: None,
        }
    }

    pub fn client(mut self, client: HttpClient) -> Self {
        self.client = Some(client);
        self
    }

    pub fn index(mut self, index: impl TimeShiftIndex + 'static) -> Self {
        self.index = Some(Arc::new(index));
        self
    }

    pub fn key_resolver(mut self, keys: KeyResolver) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn decrypt_tool(mut self, tool: impl DecryptTool + 'static) -> Self {
        self.decryptor = Some(DecryptOrchestrator::new(tool));
        self
    }

    pub fn muxer(mut self, muxer: FfmpegMuxer) -> Self {
        self.muxer = Some(muxer);
        self
    }

    pub fn build(self) -> RewindResult<Rewind> {
        let client = match self.client {
            Some(client) => client,
            None => HttpClient::from_config(&self.config.http)?,
        };
        let index = self.index.unwrap_or_else(|| {
            Arc::new(MpdTimeShiftIndex::new(client.clone(), &self.config.provider))
        });
        let keys = match self.keys {
            Some(keys) => keys,
            None => KeyResolver::from_config(client.clone(), &self.config.keys)?,
        };

        Ok(Rewind {
            resolver: TimelineResolver::new(index, client.clone(), &self.config.timeline),
            fetcher: SegmentFetcher::new(client.clone(), &self.config.fetch),
            keys,
            decryptor: self.decryptor,
            muxer: self.muxer,
            client,
            config: self.config,
        })
    }
}
