mod cache;
mod candidates;
mod probe;
mod resolver;
mod types;

pub use cache::{HttpKeyCache, KeyCache};
pub use candidates::{CandidateSource, FileCandidates, ListCandidates};
pub use probe::{
    Mp4DecryptProbe, ProbeDecryptor, ProbeSource, ProbeValidator, StructuralValidator,
    TimelineProbe,
};
pub use resolver::KeyResolver;
pub use types::{ContentKey, KeyId, KeyPair, KeySource, ResolvedKeySet};
