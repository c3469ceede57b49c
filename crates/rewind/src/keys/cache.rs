use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{ContentKey, KeyId};
use crate::{
    config::KeyConfig,
    error::{RewindError, RewindResult},
    util::HttpClient,
};

/// Remote store of keys that were already found.
#[async_trait]
pub trait KeyCache: Send + Sync {
    /// `Ok(None)` when the key is unknown.
    async fn lookup(&self, channel_id: &str, kid: &KeyId) -> RewindResult<Option<ContentKey>>;
}

#[derive(Serialize)]
struct KeyRequest<'a> {
    service: &'a str,
    kid: String,
    channel: &'a str,
}

#[derive(Deserialize)]
struct KeyResponse {
    key: Option<String>,
}

pub struct HttpKeyCache {
    client: HttpClient,
    endpoint: Url,
    api_key: Option<String>,
    service: String,
}

impl HttpKeyCache {
    pub fn new(client: HttpClient, endpoint: Url, api_key: Option<String>, service: String) -> Self {
        Self {
            client,
            endpoint,
            api_key,
            service,
        }
    }

    /// `None` when no endpoint is configured.
    pub fn from_config(client: HttpClient, config: &KeyConfig) -> RewindResult<Option<Self>> {
        let Some(endpoint) = &config.cache_url else {
            return Ok(None);
        };
        Ok(Some(Self::new(
            client,
            Url::parse(endpoint)?,
            config.cache_api_key.clone(),
            config.cache_service.clone(),
        )))
    }
}

#[async_trait]
impl KeyCache for HttpKeyCache {
    async fn lookup(&self, channel_id: &str, kid: &KeyId) -> RewindResult<Option<ContentKey>> {
        let mut request = self.client.post(self.endpoint.clone()).json(&KeyRequest {
            service: &self.service,
            kid: kid.to_string(),
            channel: channel_id,
        });
        if let Some(api_key) = &self.api_key {
            request = request.header("Api-Key", api_key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(RewindError::HttpError(response.status()));
        }

        let body: KeyResponse = serde_json::from_str(&response.text().await?)?;
        body.key
            .filter(|key| !key.is_empty())
            .map(|key| key.parse())
            .transpose()
    }
}
