use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::PathBuf,
};

use super::{ContentKey, KeyId, KeyPair};

/// Stream of candidate keys for one key id.
pub trait CandidateSource: Send + Sync {
    fn candidates<'a>(&'a self, kid: &KeyId) -> Box<dyn Iterator<Item = ContentKey> + Send + 'a>;
}

/// Fixed list of candidates, tested in order.
#[derive(Debug, Clone, Default)]
pub struct ListCandidates(Vec<ContentKey>);

impl ListCandidates {
    pub fn new(candidates: Vec<ContentKey>) -> Self {
        Self(candidates)
    }
}

impl CandidateSource for ListCandidates {
    fn candidates<'a>(&'a self, _kid: &KeyId) -> Box<dyn Iterator<Item = ContentKey> + Send + 'a> {
        Box::new(self.0.iter().copied())
    }
}

/// Newline separated candidates, either `KEY` or `KID:KEY`.
///
/// `KID:KEY` lines only apply to their key id. The file is streamed, so it may be
/// larger than memory.
pub struct FileCandidates {
    path: PathBuf,
}

impl FileCandidates {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

fn parse_line(line: &str, kid: &KeyId) -> Option<ContentKey> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    if line.contains(':') {
        let pair: KeyPair = line.parse().ok()?;
        return (pair.kid == *kid).then_some(pair.key);
    }
    line.parse().ok()
}

impl CandidateSource for FileCandidates {
    fn candidates<'a>(&'a self, kid: &KeyId) -> Box<dyn Iterator<Item = ContentKey> + Send + 'a> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) => {
                tracing::error!("Can not open candidate file {}: {e}", self.path.display());
                return Box::new(std::iter::empty());
            }
        };

        let kid = *kid;
        let lines = BufReader::new(file).lines().map_while(|line| match line {
            Ok(line) => Some(line),
            Err(e) => {
                tracing::warn!("Stopped reading candidate file: {e}");
                None
            }
        });
        Box::new(lines.filter_map(move |line| parse_line(&line, &kid)))
    }
}
