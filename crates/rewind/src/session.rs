use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::{RewindError, RewindResult};

/// A channel of the provider's catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: String,
    pub name: String,
    /// Identifier of the channel's DASH stream, absent for channels without one
    pub dash_id: Option<String>,
    pub freebox_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelCatalog {
    channels: BTreeMap<String, ChannelInfo>,
}

impl ChannelCatalog {
    pub fn new(channels: impl IntoIterator<Item = ChannelInfo>) -> Self {
        Self {
            channels: channels.into_iter().map(|c| (c.id.clone(), c)).collect(),
        }
    }

    pub fn get(&self, channel_id: &str) -> RewindResult<&ChannelInfo> {
        self.channels
            .get(channel_id)
            .ok_or_else(|| RewindError::ChannelNotFound(channel_id.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelInfo> {
        self.channels.values()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// An authenticated session. Immutable for the duration of a run.
#[derive(Debug, Clone)]
pub struct Session {
    access_token: String,
    catalog: ChannelCatalog,
}

impl Session {
    pub fn new(access_token: impl Into<String>, catalog: ChannelCatalog) -> Self {
        Self {
            access_token: access_token.into(),
            catalog,
        }
    }

    pub fn access_token(&self) -> Option<&str> {
        Some(self.access_token.as_str()).filter(|t| !t.is_empty())
    }

    pub fn catalog(&self) -> &ChannelCatalog {
        &self.catalog
    }

    pub fn channel(&self, channel_id: &str) -> RewindResult<&ChannelInfo> {
        self.catalog.get(channel_id)
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Produces a [`Session`]. The login handshake of a provider lives behind this trait.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credentials: Option<&Credentials>) -> RewindResult<Session>;
}

/// Uses an access token obtained elsewhere, e.g. copied from a browser session.
pub struct StaticToken {
    token: String,
    catalog: ChannelCatalog,
}

impl StaticToken {
    pub fn new(token: impl Into<String>, catalog: ChannelCatalog) -> Self {
        Self {
            token: token.into(),
            catalog,
        }
    }
}

#[async_trait]
impl Authenticator for StaticToken {
    async fn authenticate(&self, credentials: Option<&Credentials>) -> RewindResult<Session> {
        if credentials.is_some() {
            tracing::warn!("Credentials are ignored when a static access token is used.");
        }
        Ok(Session::new(self.token.clone(), self.catalog.clone()))
    }
}
