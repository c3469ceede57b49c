pub mod bmff;
pub mod catalog;
pub mod config;
pub mod decrypt;
pub mod error;
pub mod fetch;
pub mod keys;
pub mod manifest;
pub mod mux;
pub mod pipeline;
pub mod search;
pub mod session;
pub mod timeline;
pub mod util;

pub use config::RewindConfig;
pub use error::{RewindError, RewindResult};
pub use pipeline::{Rewind, RewindBuilder, RewindOutcome, RewindRequest};
pub use session::{Authenticator, ChannelCatalog, ChannelInfo, Credentials, Session, StaticToken};
