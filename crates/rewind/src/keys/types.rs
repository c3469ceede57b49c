use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};

use crate::error::{RewindError, RewindResult};

fn parse_hex16(s: &str) -> RewindResult<[u8; 16]> {
    let cleaned: String = s.trim().chars().filter(|c| *c != '-').collect();
    let cleaned = cleaned.strip_prefix("0x").unwrap_or(&cleaned);
    if cleaned.len() != 32 {
        return Err(RewindError::InvalidHexKey(s.to_string()));
    }

    let mut bytes = [0u8; 16];
    hex::decode_to_slice(cleaned, &mut bytes)?;
    Ok(bytes)
}

/// 128-bit identifier of a content key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyId([u8; 16]);

impl KeyId {
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// `8-4-4-4-12` form used by `cenc:default_KID`.
    pub fn to_uuid_string(&self) -> String {
        let hex = hex::encode(self.0);
        format!(
            "{}-{}-{}-{}-{}",
            &hex[0..8],
            &hex[8..12],
            &hex[12..16],
            &hex[16..20],
            &hex[20..32]
        )
    }
}

impl FromStr for KeyId {
    type Err = RewindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex16(s).map(Self)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({self})")
    }
}

/// 128-bit content key. The value is never printed in logs, only its length.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentKey([u8; 16]);

impl ContentKey {
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for ContentKey {
    type Err = RewindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex16(s).map(Self)
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ContentKey(..)")
    }
}

/// A `KID:KEY` pair supplied by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPair {
    pub kid: KeyId,
    pub key: ContentKey,
}

impl FromStr for KeyPair {
    type Err = RewindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kid, key) = s
            .split_once(':')
            .ok_or_else(|| RewindError::InvalidKeyPair(s.to_string()))?;
        Ok(Self {
            kid: kid
                .parse()
                .map_err(|_| RewindError::InvalidKeyPair(s.to_string()))?,
            key: key
                .parse()
                .map_err(|_| RewindError::InvalidKeyPair(s.to_string()))?,
        })
    }
}

/// Where a content key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Manual,
    Cache,
    BruteForce,
}

/// Mapping from key id to content key for every encrypted rendition of a run.
#[derive(Debug, Clone, Default)]
pub struct ResolvedKeySet {
    keys: BTreeMap<KeyId, (ContentKey, KeySource)>,
}

impl ResolvedKeySet {
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = &'a KeyPair>) -> Self {
        let mut set = Self::default();
        for pair in pairs {
            set.insert(pair.kid, pair.key, KeySource::Manual);
        }
        set
    }

    pub fn insert(&mut self, kid: KeyId, key: ContentKey, source: KeySource) {
        self.keys.insert(kid, (key, source));
    }

    pub fn get(&self, kid: &KeyId) -> Option<&ContentKey> {
        self.keys.get(kid).map(|(key, _)| key)
    }

    pub fn source(&self, kid: &KeyId) -> Option<KeySource> {
        self.keys.get(kid).map(|(_, source)| *source)
    }

    pub fn contains(&self, kid: &KeyId) -> bool {
        self.keys.contains_key(kid)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Key ids from `required` that have no key in this set, in ascending order.
    pub fn missing<'a>(&self, required: impl IntoIterator<Item = &'a KeyId>) -> Vec<KeyId> {
        required
            .into_iter()
            .filter(|kid| !self.contains(kid))
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&KeyId, &ContentKey)> {
        self.keys.iter().map(|(kid, (key, _))| (kid, key))
    }
}
