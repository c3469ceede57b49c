use std::fmt;

/// `length` bytes of a resource starting at `offset`, or everything after `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: Option<u64>,
}

impl ByteRange {
    pub fn new(offset: u64, length: Option<u64>) -> Self {
        Self { offset, length }
    }

    /// Inclusive position of the last byte, `None` for open ranges.
    pub fn last(&self) -> Option<u64> {
        self.length
            .filter(|length| *length > 0)
            .map(|length| self.offset + length - 1)
    }

    pub fn to_http_range(&self) -> String {
        format!("bytes={self}")
    }
}

/// `first-last` as in HTTP ranges and DASH `mediaRange`.
impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.last() {
            Some(last) => write!(f, "{}-{last}", self.offset),
            None => write!(f, "{}-", self.offset),
        }
    }
}
