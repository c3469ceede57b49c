use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio_util::sync::CancellationToken;

use super::{
    CandidateSource, ContentKey, FileCandidates, HttpKeyCache, KeyCache, KeyId, KeyPair,
    KeySource, Mp4DecryptProbe, ProbeDecryptor, ProbeSource, ProbeValidator, ResolvedKeySet,
    StructuralValidator,
};
use crate::{
    config::KeyConfig,
    error::{RewindError, RewindResult},
    search::BatchSearch,
    timeline::ResolvedTimeline,
    util::HttpClient,
};

/// Resolves the content key of every encrypted rendition of a timeline.
///
/// Manual keys win over everything else. Otherwise each key id is looked up in the
/// key cache, and brute forced from the candidate source when the cache misses.
pub struct KeyResolver {
    cache: Option<Arc<dyn KeyCache>>,
    candidates: Option<Arc<dyn CandidateSource>>,
    decryptor: Arc<dyn ProbeDecryptor>,
    validator: Arc<dyn ProbeValidator>,
    search: BatchSearch,

    /// Keys found by brute force during this run
    found: Mutex<HashMap<KeyId, ContentKey>>,
}

impl KeyResolver {
    pub fn new(config: &KeyConfig) -> Self {
        Self {
            cache: None,
            candidates: None,
            decryptor: Arc::new(Mp4DecryptProbe),
            validator: Arc::new(StructuralValidator),
            search: BatchSearch::new(config.brute_force_batch_size, config.probe_workers),
            found: Mutex::new(HashMap::new()),
        }
    }

    /// Resolver with the HTTP key cache and candidate file from `config`, when set.
    pub fn from_config(client: HttpClient, config: &KeyConfig) -> RewindResult<Self> {
        let mut resolver = Self::new(config);
        if let Some(cache) = HttpKeyCache::from_config(client, config)? {
            resolver = resolver.with_cache(cache);
        }
        if let Some(path) = &config.candidates_file {
            resolver = resolver.with_candidates(FileCandidates::new(path));
        }
        Ok(resolver)
    }

    pub fn with_cache(mut self, cache: impl KeyCache + 'static) -> Self {
        self.cache = Some(Arc::new(cache));
        self
    }

    pub fn with_candidates(mut self, candidates: impl CandidateSource + 'static) -> Self {
        self.candidates = Some(Arc::new(candidates));
        self
    }

    pub fn with_decryptor(mut self, decryptor: impl ProbeDecryptor + 'static) -> Self {
        self.decryptor = Arc::new(decryptor);
        self
    }

    pub fn with_validator(mut self, validator: impl ProbeValidator + 'static) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    pub async fn resolve(
        &self,
        timeline: &ResolvedTimeline,
        manual: &[KeyPair],
        probe: &dyn ProbeSource,
        cancel: &CancellationToken,
    ) -> RewindResult<ResolvedKeySet> {
        if !manual.is_empty() {
            tracing::info!("Using {} manual key(s)", manual.len());
            return Ok(ResolvedKeySet::from_pairs(manual));
        }

        let mut keys = ResolvedKeySet::default();
        for kid in timeline.key_ids() {
            if let Some(key) = self.found_key(&kid) {
                keys.insert(kid, key, KeySource::BruteForce);
                continue;
            }

            if let Some(key) = self.lookup(&timeline.channel.id, &kid).await {
                tracing::info!("Key for {kid} found in key cache");
                keys.insert(kid, key, KeySource::Cache);
                continue;
            }

            let key = self.brute_force(&kid, probe, cancel).await?;
            keys.insert(kid, key, KeySource::BruteForce);
        }
        Ok(keys)
    }

    fn found_key(&self, kid: &KeyId) -> Option<ContentKey> {
        self.found.lock().ok()?.get(kid).copied()
    }

    /// Every cache failure counts as a miss.
    async fn lookup(&self, channel_id: &str, kid: &KeyId) -> Option<ContentKey> {
        let cache = self.cache.as_ref()?;
        match cache.lookup(channel_id, kid).await {
            Ok(Some(key)) => Some(key),
            Ok(None) => {
                tracing::debug!("Key cache has no entry for {kid}");
                None
            }
            Err(e) => {
                tracing::warn!("Key cache lookup for {kid} failed: {e}");
                None
            }
        }
    }

    async fn brute_force(
        &self,
        kid: &KeyId,
        probe: &dyn ProbeSource,
        cancel: &CancellationToken,
    ) -> RewindResult<ContentKey> {
        let exhausted = |tested| RewindError::KeyResolutionExhausted { kid: *kid, tested };

        let Some(source) = &self.candidates else {
            return Err(exhausted(0));
        };
        let mut candidates = source.candidates(kid).peekable();
        if candidates.peek().is_none() {
            return Err(exhausted(0));
        }

        tracing::info!("Searching key for {kid}, this may take a while.");
        let probe = probe.probe(kid).await?;
        let outcome = self
            .search
            .run(&format!("key {kid}"), candidates, cancel, |key| {
                let probe = probe.clone();
                let decryptor = self.decryptor.clone();
                let validator = self.validator.clone();
                let kid = *kid;
                async move {
                    tokio::task::spawn_blocking(move || {
                        decryptor
                            .decrypt(&probe, &kid, &key)
                            .is_ok_and(|data| validator.validate(&data))
                    })
                    .await
                    .unwrap_or(false)
                }
            })
            .await?;

        let Some((position, key)) = outcome.found else {
            return Err(exhausted(outcome.tested));
        };
        tracing::info!(
            "Key for {kid} found at candidate #{position} ({} tested)",
            outcome.tested
        );
        if let Ok(mut found) = self.found.lock() {
            found.insert(*kid, key);
        }
        Ok(key)
    }
}
