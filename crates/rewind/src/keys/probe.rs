use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;

use super::{ContentKey, KeyId};
use crate::{
    bmff,
    error::{RewindError, RewindResult},
    timeline::{ResolvedTimeline, TrackType},
    util::HttpClient,
};

/// Decrypts a probe in memory with a candidate key.
pub trait ProbeDecryptor: Send + Sync {
    fn decrypt(&self, probe: &[u8], kid: &KeyId, key: &ContentKey) -> RewindResult<Vec<u8>>;
}

/// Decides whether a decrypted probe is plausible clear media.
pub trait ProbeValidator: Send + Sync {
    fn validate(&self, decrypted: &[u8]) -> bool;
}

/// Provides the probe (init segment followed by one media segment) for a key id.
#[async_trait]
pub trait ProbeSource: Send + Sync {
    async fn probe(&self, kid: &KeyId) -> RewindResult<Bytes>;
}

/// Bento4 based decryption through the `mp4decrypt` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct Mp4DecryptProbe;

impl ProbeDecryptor for Mp4DecryptProbe {
    fn decrypt(&self, probe: &[u8], kid: &KeyId, key: &ContentKey) -> RewindResult<Vec<u8>> {
        let mut keys = HashMap::with_capacity(1);
        keys.insert(kid.to_string(), key.to_hex());
        mp4decrypt::mp4decrypt(probe, &keys, None)
            .map_err(|e| RewindError::Mp4DecryptError(e.to_string()))
    }
}

/// Accepts a probe when its fragments are well formed and every sample looks like
/// clear AAC, AVC or HEVC data.
///
/// AAC samples are fully encrypted, so a wrong key is rejected with near certainty.
/// Video NAL headers stay in the clear with subsample encryption, and wrong keys are
/// only caught through start code emulations in the slice data.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuralValidator;

impl ProbeValidator for StructuralValidator {
    fn validate(&self, decrypted: &[u8]) -> bool {
        let Some(codec) = bmff::sample_entry(decrypted) else {
            tracing::debug!("probe has no sample entry");
            return false;
        };
        let samples = match bmff::fragment_samples(decrypted) {
            Ok(samples) if !samples.is_empty() => samples,
            Ok(_) => return false,
            Err(e) => {
                tracing::debug!("invalid probe layout: {e}");
                return false;
            }
        };

        match &codec {
            b"mp4a" => samples.iter().all(|s| is_raw_aac(s)),
            b"avc1" | b"avc3" => samples.iter().all(|s| is_nal_sequence(s, NalFormat::Avc)),
            b"hvc1" | b"hev1" => samples.iter().all(|s| is_nal_sequence(s, NalFormat::Hevc)),
            other => {
                tracing::debug!("unsupported codec {}", String::from_utf8_lossy(other));
                false
            }
        }
    }
}

/// A raw AAC frame starts with a single or a channel pair element.
fn is_raw_aac(sample: &[u8]) -> bool {
    matches!(sample.first(), Some(b) if b >> 5 <= 1)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum NalFormat {
    Avc,
    Hevc,
}

fn is_nal_sequence(sample: &[u8], format: NalFormat) -> bool {
    let mut rest = sample;
    if rest.is_empty() {
        return false;
    }

    while !rest.is_empty() {
        let Some((length, tail)) = rest.split_first_chunk::<4>() else {
            return false;
        };
        let length = u32::from_be_bytes(*length) as usize;
        if length == 0 || length > tail.len() {
            return false;
        }
        let (nal, tail) = tail.split_at(length);
        if !is_valid_nal(nal, format) {
            return false;
        }
        rest = tail;
    }
    true
}

fn is_valid_nal(nal: &[u8], format: NalFormat) -> bool {
    let header_len = match format {
        NalFormat::Avc => 1,
        NalFormat::Hevc => 2,
    };
    if nal.len() < header_len || nal[0] & 0x80 != 0 {
        return false;
    }

    let header_ok = match format {
        NalFormat::Avc => matches!(nal[0] & 0x1f, 1..=23),
        NalFormat::Hevc => (nal[0] >> 1) & 0x3f <= 40 && nal[1] & 0x07 != 0,
    };

    header_ok
        && !nal[header_len..]
            .windows(3)
            .any(|w| w[0] == 0 && w[1] == 0 && w[2] <= 2)
}

/// Fetches probes from the renditions of a resolved timeline, audio first.
pub struct TimelineProbe<'a> {
    client: HttpClient,
    timeline: &'a ResolvedTimeline,
}

impl<'a> TimelineProbe<'a> {
    pub fn new(client: HttpClient, timeline: &'a ResolvedTimeline) -> Self {
        Self { client, timeline }
    }
}

#[async_trait]
impl ProbeSource for TimelineProbe<'_> {
    async fn probe(&self, kid: &KeyId) -> RewindResult<Bytes> {
        let track = self
            .timeline
            .tracks
            .iter()
            .filter(|t| t.rendition.key_id.as_ref() == Some(kid) && !t.segments.is_empty())
            .min_by_key(|t| t.rendition.track_type != TrackType::Audio)
            .ok_or_else(|| RewindError::MissingKeys(vec![*kid]))?;
        let segment = &track.segments[0];
        tracing::debug!("Using {} as probe for {kid}", segment.url);

        let mut data = Vec::new();
        if let Some(init) = &track.init_url {
            data.extend_from_slice(&self.client.get_bytes(init.clone(), None).await?);
        }
        data.extend_from_slice(
            &self
                .client
                .get_bytes(segment.url.clone(), segment.byte_range)
                .await?,
        );
        Ok(Bytes::from(data))
    }
}
