//! Channel artwork and theming extracted from channel-view payloads.

use serde::Serialize;
use serde_json::Value;

use super::resolve::value_at;

/// Presentation assets for a channel. Every field is optional; payloads
/// from older channels carry none of them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelMedia {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo_blur: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artwork: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artwork_blur: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub theme_color: Option<String>,
}

impl ChannelMedia {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.logo.is_none()
            && self.logo_blur.is_none()
            && self.artwork.is_none()
            && self.artwork_blur.is_none()
            && self.theme_color.is_none()
    }
}

fn non_empty(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

/// Media entries are either the URL itself, `{image: <url>}`, or an object
/// of sized variants.
fn pick_image(entry: Option<&Value>) -> Option<String> {
    let entry = entry.filter(|value| !value.is_null())?;
    if entry.is_string() {
        return non_empty(Some(entry));
    }
    let image = entry
        .get("image")
        .filter(|value| !value.is_null())
        .unwrap_or(entry);
    if image.is_string() {
        return non_empty(Some(image));
    }
    ["medium", "small", "large", "url"]
        .into_iter()
        .find_map(|size| non_empty(image.get(size)))
}

fn pick_blur(entry: Option<&Value>) -> Option<String> {
    let entry = entry.filter(|value| !value.is_null())?;
    let blur = entry
        .get("image_blur")
        .filter(|value| !value.is_null())
        .or_else(|| entry.get("blur").filter(|value| !value.is_null()))?;
    if blur.is_string() {
        return non_empty(Some(blur));
    }
    ["medium", "small", "large", "url"]
        .into_iter()
        .find_map(|size| non_empty(blur.get(size)))
}

/// Pull whatever artwork a channel-view payload offers.
pub fn extract_media(data: &Value) -> ChannelMedia {
    let null = Value::Null;
    let attr = value_at(data, &["data", "attributes"])
        .filter(|value| value.is_object())
        .or_else(|| data.get("attributes").filter(|value| value.is_object()))
        .unwrap_or(&null);
    let media = attr
        .get("media")
        .filter(|value| value.is_object())
        .or_else(|| data.get("media").filter(|value| value.is_object()))
        .unwrap_or(&null);

    let logo = pick_image(media.get("logo"))
        .or_else(|| non_empty(attr.get("profile_image_url")))
        .or_else(|| non_empty(attr.get("logo_url")));
    let logo_blur = pick_blur(media.get("logo"));
    let artwork = pick_image(media.get("artwork")).or_else(|| non_empty(attr.get("artwork_url")));
    let artwork_blur = pick_blur(media.get("artwork"));
    let theme_color =
        non_empty(attr.get("theme_color")).or_else(|| non_empty(attr.get("themeColor")));

    ChannelMedia {
        logo,
        logo_blur,
        artwork,
        artwork_blur,
        theme_color,
    }
}
