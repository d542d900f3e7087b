//! Discovery client tests against a mocked channel-view endpoint.
//!
//! Run with: cargo test --test discovery_api

use std::collections::HashMap;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use aircheck_core::config::DiscoveryConfig;
use aircheck_core::discovery::DiscoveryClient;
use aircheck_core::Error;

fn client_for(server: &MockServer, aliases: &[(&str, &str)]) -> DiscoveryClient {
    let config = DiscoveryConfig {
        api_base_url: format!("{}/channel_view/", server.uri()),
        aliases: aliases
            .iter()
            .map(|(name, slug)| ((*name).to_string(), (*slug).to_string()))
            .collect::<HashMap<_, _>>(),
        ..DiscoveryConfig::default()
    };
    DiscoveryClient::new(&config).unwrap()
}

#[tokio::test]
async fn test_live_broadcast_resolves_aliases_and_stream_candidates() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/channel_view/sufiuk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "is_live": true,
            "broadcasts": [{
                "is_live": true,
                "channel": "Dhikr Majlis",
                "title": "Thursday Majlis",
                "streams": { "mp3": { "url": "http://cdn.example/majlis.mp3" } },
            }],
        })))
        .mount(&server)
        .await;

    let client = client_for(&server, &[("dhikr majlis live", "sufiuk")]);

    // The display name goes through trim + lowercase + alias before the
    // request is made.
    let live = client
        .live_broadcast("  Dhikr Majlis LIVE ")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(live.stage, "Dhikr Majlis");
    assert_eq!(live.title, "Thursday Majlis");
    assert_eq!(live.stream_url, "http://cdn.example/majlis.mp3");
}

#[tokio::test]
async fn test_offline_channel_yields_no_broadcast() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/channel_view/quiet"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "is_live": false,
            "data": { "attributes": { "username": "QuietStudio" } },
        })))
        .mount(&server)
        .await;

    let client = client_for(&server, &[]);
    let live = client.live_broadcast("quiet").await.unwrap();
    assert!(live.is_none());
}

#[tokio::test]
async fn test_http_failure_is_an_error_not_a_silent_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/channel_view/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = client_for(&server, &[]);
    let err = client.live_broadcast("missing").await.unwrap_err();
    assert!(matches!(err, Error::Http(_)));
}
