//! Interpretation of channel-view payloads.
//!
//! The upstream API has shipped several payload shapes over the years: a
//! flat `{is_live, broadcasts:[..]}` object, JSON:API documents with
//! `relationships` + `included`, and a few in-between hybrids. Rather than
//! guessing one schema, each known shape gets a small extractor and they
//! are tried in a fixed priority order; the first one that yields a
//! broadcast with a usable stream URL wins.

use serde_json::Value;

/// Stage used when the payload names nothing at all.
pub const STAGE_FALLBACK: &str = "mixlr-channel";

/// A broadcast currently on air, reduced to what capture needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveBroadcast {
    /// Unique capture key; recording sessions are keyed by this.
    pub stage: String,
    pub stream_url: String,
    pub title: String,
}

/// Walk nested object keys, `None` as soon as one is missing.
pub(crate) fn value_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |acc, key| acc.get(key))
}

fn present(value: &Value) -> bool {
    !value.is_null()
}

fn non_empty_str(value: &Value) -> Option<&str> {
    value.as_str().filter(|s| !s.is_empty())
}

fn js_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn truthy(value: Option<&Value>) -> bool {
    value.is_some_and(js_truthy)
}

/// Pick the first non-empty stream URL a broadcast object offers.
///
/// Progressive MP3 URLs are preferred over HLS because the capture tool
/// records them without a remux step. `streams.mp3` may be an object with
/// a `url` or the URL itself, depending on payload vintage.
pub fn resolve_stream_url(broadcast: &Value) -> Option<String> {
    let null = Value::Null;
    let attr = broadcast.get("attributes").unwrap_or(&null);
    let streams = broadcast
        .get("streams")
        .filter(|v| present(v))
        .or_else(|| attr.get("streams").filter(|v| present(v)))
        .or_else(|| attr.get("stream").filter(|v| present(v)))
        .unwrap_or(&null);

    let candidates = [
        attr.get("progressive_stream_url"),
        broadcast.get("progressive_stream_url"),
        value_at(streams, &["mp3", "url"]),
        streams.get("mp3"),
        streams.get("http_mp3_stream"),
        streams.get("http_stream"),
        value_at(streams, &["hls", "mp3", "url"]),
        value_at(streams, &["hls", "url"]),
    ];

    let resolved = candidates
        .into_iter()
        .flatten()
        .find_map(non_empty_str)
        .map(str::to_owned);
    resolved
}

/// Best-effort stage name, preferring broadcast-level fields over
/// channel-level ones.
pub fn resolve_stage_name(data: &Value, broadcast: Option<&Value>) -> Option<String> {
    let null = Value::Null;
    let broadcast = broadcast.unwrap_or(&null);
    let chain = [
        broadcast.get("channel"),
        broadcast.get("stage"),
        value_at(broadcast, &["attributes", "stage"]),
        value_at(broadcast, &["attributes", "username"]),
        value_at(data, &["data", "attributes", "username"]),
        data.get("username"),
        data.get("slug"),
        value_at(data, &["data", "attributes", "name"]),
    ];

    let resolved = chain
        .into_iter()
        .flatten()
        .find_map(non_empty_str)
        .map(str::to_owned);
    resolved
}

/// Reduce one broadcast object to a [`LiveBroadcast`].
///
/// Only an explicit `live: false` rejects; an absent flag is treated as
/// live because several shapes omit it on current broadcasts. A broadcast
/// without any stream URL is useless and is skipped so the next shape can
/// be tried.
fn from_broadcast(data: &Value, broadcast: &Value) -> Option<LiveBroadcast> {
    if broadcast.is_null() {
        return None;
    }

    let live_flag = broadcast
        .get("live")
        .filter(|v| present(v))
        .or_else(|| broadcast.get("is_live").filter(|v| present(v)))
        .or_else(|| value_at(broadcast, &["attributes", "live"]));
    if live_flag.and_then(Value::as_bool) == Some(false) {
        return None;
    }

    let stream_url = resolve_stream_url(broadcast)?;
    let stage =
        resolve_stage_name(data, Some(broadcast)).unwrap_or_else(|| STAGE_FALLBACK.to_string());
    let title = broadcast
        .get("title")
        .and_then(non_empty_str)
        .or_else(|| value_at(broadcast, &["attributes", "title"]).and_then(non_empty_str))
        .map(str::to_owned)
        .unwrap_or_else(|| stage.clone());

    Some(LiveBroadcast {
        stage,
        stream_url,
        title,
    })
}

fn is_broadcast(item: &Value) -> bool {
    item.get("type").and_then(Value::as_str) == Some("broadcast")
}

fn find_included_broadcast<'a>(included: &'a [Value], rel_id: Option<&Value>) -> Option<&'a Value> {
    included
        .iter()
        .find(|item| is_broadcast(item) && rel_id.is_some() && item.get("id") == rel_id)
        .or_else(|| included.iter().find(|item| is_broadcast(item)))
}

/// Newer flat shape: `{is_live, broadcasts: [...]}`.
fn flat_broadcast_list(data: &Value) -> Option<&Value> {
    if !truthy(data.get("is_live")) && !truthy(data.get("live")) {
        return None;
    }
    let broadcasts = data.get("broadcasts")?.as_array()?;
    broadcasts
        .iter()
        .find(|b| {
            b.get("is_live")
                .filter(|v| present(v))
                .or_else(|| b.get("live").filter(|v| present(v)))
                .map_or(true, js_truthy)
        })
        .or_else(|| broadcasts.first())
}

/// Current broadcast already expanded on the payload root.
fn expanded_current_broadcast(data: &Value) -> Option<&Value> {
    data.get("current_broadcast").filter(|v| present(v))
}

/// JSON:API shape: `relationships.current_broadcast` resolved against
/// `included`.
fn jsonapi_current_broadcast(data: &Value) -> Option<&Value> {
    let rel = value_at(data, &["data", "relationships", "current_broadcast", "data"])
        .filter(|v| present(v))?;
    let rel_id = rel.get("id").filter(|v| present(v));
    let included = data.get("included")?.as_array()?;
    find_included_broadcast(included, rel_id)
}

/// Occasionally tucked under `data.attributes.current_broadcast`.
fn attributes_current_broadcast(data: &Value) -> Option<&Value> {
    value_at(data, &["data", "attributes", "current_broadcast"]).filter(|v| present(v))
}

/// `relationships.public_current_broadcasts` carries an array of refs.
fn public_current_broadcasts(data: &Value) -> Option<&Value> {
    let rel = value_at(
        data,
        &["data", "relationships", "public_current_broadcasts", "data"],
    )
    .filter(|v| present(v))?;
    let rel_id = rel
        .get(0)
        .and_then(|first| first.get("id"))
        .filter(|v| present(v));
    let included = data.get("included")?.as_array()?;
    find_included_broadcast(included, rel_id)
}

/// Last resort: any included broadcast at all.
fn any_included_broadcast(data: &Value) -> Option<&Value> {
    let included = data.get("included")?.as_array()?;
    included.iter().find(|item| is_broadcast(item))
}

const SHAPE_RESOLVERS: &[fn(&Value) -> Option<&Value>] = &[
    flat_broadcast_list,
    expanded_current_broadcast,
    jsonapi_current_broadcast,
    attributes_current_broadcast,
    public_current_broadcasts,
    any_included_broadcast,
];

/// Find the broadcast currently on air in a channel-view payload, trying
/// each known payload shape in priority order.
pub fn find_live_broadcast(data: &Value) -> Option<LiveBroadcast> {
    if data.is_null() {
        return None;
    }
    SHAPE_RESOLVERS
        .iter()
        .find_map(|extract| extract(data).and_then(|broadcast| from_broadcast(data, broadcast)))
}
