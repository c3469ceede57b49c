use std::{ops::Deref, str::FromStr, time::Duration};

use bytes::Bytes;
use fake_user_agent::get_chrome_rua;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, RANGE},
    Client, ClientBuilder, IntoUrl,
};

use super::ByteRange;
use crate::{
    config::HttpConfig,
    error::{RewindError, RewindResult},
};

#[derive(Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new(builder: ClientBuilder) -> RewindResult<Self> {
        Ok(Self {
            client: builder.build()?,
        })
    }

    pub fn from_config(config: &HttpConfig) -> RewindResult<Self> {
        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            headers.insert(
                HeaderName::from_str(key).map_err(|_| RewindError::InvalidHeader(key.clone()))?,
                HeaderValue::from_str(value)
                    .map_err(|_| RewindError::InvalidHeader(value.clone()))?,
            );
        }

        let user_agent = config.user_agent.as_deref().unwrap_or(get_chrome_rua());
        Self::new(
            Client::builder()
                .default_headers(headers)
                .user_agent(user_agent)
                .timeout(Duration::from_secs(config.timeout_secs)),
        )
    }

    /// Downloads a whole resource, or a part of it, into memory.
    pub async fn get_bytes(&self, url: impl IntoUrl, range: Option<ByteRange>) -> RewindResult<Bytes> {
        let mut request = self.client.get(url);
        if let Some(range) = range {
            request = request.header(RANGE, range.to_http_range());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            tracing::debug!("{} responded with {status}", response.url());
            return Err(RewindError::HttpError(status));
        }
        Ok(response.bytes().await?)
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        let client = Client::builder()
            .user_agent(get_chrome_rua())
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Deref for HttpClient {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}
