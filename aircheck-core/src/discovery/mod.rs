//! Broadcast discovery against the upstream channel-view API.

use std::collections::HashMap;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::Value;
use tracing::debug;

use crate::config::DiscoveryConfig;
use crate::error::Result;

pub mod media;
pub mod resolve;

pub use media::{extract_media, ChannelMedia};
pub use resolve::{
    find_live_broadcast, resolve_stage_name, resolve_stream_url, LiveBroadcast, STAGE_FALLBACK,
};

// RFC 3986 unreserved characters stay literal in the slug path segment.
const SLUG_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Client for the channel-view endpoint.
///
/// The payload shape is not under our control, so responses stay untyped
/// [`Value`]s and all interpretation happens in [`resolve`] and [`media`].
#[derive(Debug, Clone)]
pub struct DiscoveryClient {
    http: reqwest::Client,
    api_base_url: String,
    aliases: HashMap<String, String>,
}

impl DiscoveryClient {
    pub fn new(config: &DiscoveryConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            http,
            api_base_url: config.api_base_url.clone(),
            aliases: config
                .aliases
                .iter()
                .map(|(name, slug)| (name.trim().to_lowercase(), slug.clone()))
                .collect(),
        })
    }

    /// Canonical API slug for a channel name: trimmed, lowercased and run
    /// through the alias table (display names map to real slugs).
    #[must_use]
    pub fn normalize_slug(&self, channel: &str) -> String {
        let slug = channel.trim().to_lowercase();
        match self.aliases.get(&slug) {
            Some(mapped) => mapped.clone(),
            None => slug,
        }
    }

    /// Fetch the raw channel-view payload for a channel.
    pub async fn channel_view(&self, channel: &str) -> Result<Value> {
        let slug = self.normalize_slug(channel);
        let url = format!(
            "{}{}",
            self.api_base_url,
            utf8_percent_encode(&slug, SLUG_ESCAPE)
        );
        debug!(channel = %slug, %url, "fetching channel view");

        let response = self.http.get(&url).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }

    /// Fetch and reduce to the live broadcast, if any.
    pub async fn live_broadcast(&self, channel: &str) -> Result<Option<LiveBroadcast>> {
        let data = self.channel_view(channel).await?;
        Ok(find_live_broadcast(&data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_with_aliases(aliases: &[(&str, &str)]) -> DiscoveryClient {
        let config = DiscoveryConfig {
            aliases: aliases
                .iter()
                .map(|(name, slug)| (name.to_string(), slug.to_string()))
                .collect(),
            ..DiscoveryConfig::default()
        };
        DiscoveryClient::new(&config).unwrap()
    }

    #[test]
    fn test_normalize_slug() {
        let client = client_with_aliases(&[("Dhikr Majlis Live", "sufiuk")]);

        assert_eq!(client.normalize_slug("  MyChannel "), "mychannel");
        assert_eq!(client.normalize_slug("dhikr majlis live"), "sufiuk");
        assert_eq!(client.normalize_slug("DHIKR MAJLIS LIVE"), "sufiuk");
        assert_eq!(client.normalize_slug("unmapped"), "unmapped");
    }
}
