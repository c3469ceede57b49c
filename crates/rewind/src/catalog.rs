use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::{
    error::{RewindError, RewindResult},
    session::{ChannelCatalog, ChannelInfo},
    util::HttpClient,
};

#[derive(Debug, Deserialize)]
struct ServicePlanResponse {
    #[serde(default)]
    success: bool,
    result: Option<ServicePlan>,
}

#[derive(Debug, Deserialize)]
struct ServicePlan {
    #[serde(default)]
    channels: HashMap<String, ServicePlanChannel>,
}

#[derive(Debug, Deserialize)]
struct ServicePlanChannel {
    name: Option<String>,
    freebox_id: Option<Value>,
    #[serde(default)]
    streams: ServicePlanStreams,
}

#[derive(Debug, Default, Deserialize)]
struct ServicePlanStreams {
    dash: Option<Value>,
}

/// Ids are numbers in some responses and strings in others.
fn value_to_string(value: Option<Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn parse_service_plan(body: &str) -> RewindResult<ChannelCatalog> {
    let response: ServicePlanResponse = serde_json::from_str(body)?;
    let plan = match response.result {
        Some(plan) if response.success => plan,
        _ => {
            return Err(RewindError::MalformedIndex(
                "unexpected service plan response".to_string(),
            ))
        }
    };

    let channels = plan.channels.into_iter().map(|(id, channel)| ChannelInfo {
        name: channel.name.unwrap_or_else(|| "Unknown name".to_string()),
        dash_id: value_to_string(channel.streams.dash),
        freebox_id: value_to_string(channel.freebox_id),
        id,
    });
    Ok(ChannelCatalog::new(channels))
}

/// Loads the channel catalog from the provider's public service plan.
pub async fn fetch_service_plan(client: &HttpClient, url: &str) -> RewindResult<ChannelCatalog> {
    tracing::info!("Loading channel list from {url}");

    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(RewindError::HttpError(response.status()));
    }

    let catalog = parse_service_plan(&response.text().await?)?;
    tracing::debug!("{} channels in service plan", catalog.len());
    Ok(catalog)
}
