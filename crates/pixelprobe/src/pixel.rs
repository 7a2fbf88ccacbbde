//! AppLovin/Axon pixel payload decoding.
//!
//! Two body layouts are in the wild:
//!
//! - **v1** (`/pixel`, `/shopify/pixel`): `{"name": ..., "applovin": {"art", "eventId"}}`,
//!   where older snippets put the same object under `"axon"`.
//! - **v2** (`/v2/pixel`, `/shopify/v2/pixel`):
//!   `{"event": {"name": ...}, "applovin": {"art", "eventId"}}`.
//!
//! Decoding is best-effort; anything unexpected yields `None`.

use crate::types::{PixelEvent, PixelVersion};
use serde_json::Value;

/// Whether a request host+path points at the AppLovin pixel collector.
pub fn is_pixel_endpoint(host: &str, path: &str) -> bool {
    host.eq_ignore_ascii_case("b.applovin.com") && path.to_ascii_lowercase().contains("pixel")
}

/// Decode a pixel POST body. `path` selects the layout.
pub fn parse_pixel_payload(path: &str, body: &str) -> Option<PixelEvent> {
    let json: Value = serde_json::from_str(body).ok()?;
    if !json.is_object() {
        return None;
    }

    if path.to_ascii_lowercase().contains("/v2/pixel") {
        let data = &json["applovin"];
        Some(PixelEvent {
            name: string_at(&json["event"]["name"]).unwrap_or_default(),
            version: PixelVersion::V2,
            art: string_at(&data["art"]),
            event_id: string_at(&data["eventId"]),
        })
    } else {
        let data = match &json["applovin"] {
            Value::Object(map) if !map.is_empty() => &json["applovin"],
            _ => &json["axon"],
        };
        Some(PixelEvent {
            name: string_at(&json["name"]).unwrap_or_default(),
            version: PixelVersion::V1,
            art: string_at(&data["art"]),
            event_id: string_at(&data["eventId"]),
        })
    }
}

fn string_at(value: &Value) -> Option<String> {
    value
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
