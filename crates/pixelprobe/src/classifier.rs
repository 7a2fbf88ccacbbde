//! Request classification.
//!
//! Every captured request gets exactly one [`RequestClass`]: the first
//! analytics signature (registry order) with a matching request matcher, or
//! `unclassified`. Platform indicators are collected independently and
//! additively, so a request can both classify as `custom_pixel` and count
//! as AppLovin tracker evidence.
//!
//! Failed requests are kept only when they were bound for a tracker and the
//! error is not a routine abort.

use crate::pixel::{is_pixel_endpoint, parse_pixel_payload};
use crate::signatures::{Registry, Target, Text};
use crate::types::{FailedRequest, IndicatorHit, ObservedRequest, RawRequest, RequestClass};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Network errors that say nothing about the tracker itself.
const IGNORED_ERRORS: [&str; 4] = [
    "ERR_ABORTED",
    "NS_BINDING_ABORTED",
    "net::ERR_BLOCKED_BY_CLIENT",
    "NS_ERROR_NET_INTERRUPT",
];

/// Lowercased host and the path of a request URL, tolerating garbage.
fn host_and_path(url: &str) -> (String, String) {
    match Url::parse(url) {
        Ok(parsed) => (
            parsed.host_str().unwrap_or_default().to_ascii_lowercase(),
            parsed.path().to_string(),
        ),
        Err(_) => {
            let bare = url.split(['?', '#']).next().unwrap_or_default();
            let bare = bare.split_once("://").map_or(bare, |(_, rest)| rest);
            match bare.find('/') {
                Some(i) => (bare[..i].to_ascii_lowercase(), bare[i..].to_string()),
                None => (bare.to_ascii_lowercase(), String::new()),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestClassifier {
    registry: Arc<Registry>,
}

impl RequestClassifier {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Classify one raw request. Total: never fails, whatever the URL.
    pub fn classify(&self, raw: &RawRequest, elapsed: Duration) -> ObservedRequest {
        let (host, path) = host_and_path(&raw.url);
        let location = format!("{host}{path}");
        let text = Text::new(&location);

        let classification = self
            .registry
            .analytics_signatures()
            .iter()
            .find(|sig| sig.request_matchers().any(|m| m.matches_request(&text, &raw.method)))
            .map_or(RequestClass::Unclassified, |sig| RequestClass::Analytics(sig.kind));

        let mut platform_hits = Vec::new();
        for sig in self.registry.platform_signatures() {
            for m in &sig.indicators {
                let hit = match m.target {
                    Target::Request => m.matches_request(&text, &raw.method),
                    Target::Header => m.matches_headers(&raw.headers),
                    _ => false,
                };
                if hit {
                    platform_hits.push(IndicatorHit {
                        platform_id: sig.platform_id.clone(),
                        label: m.label.clone(),
                    });
                }
            }
        }

        let pixel = match &raw.body {
            Some(body) if raw.method.eq_ignore_ascii_case("POST") && is_pixel_endpoint(&host, &path) => {
                parse_pixel_payload(&path, body)
            }
            _ => None,
        };

        ObservedRequest {
            url: raw.url.clone(),
            method: raw.method.clone(),
            elapsed,
            classification,
            platform_hits,
            pixel,
        }
    }

    /// Whether a failed request belongs in the site's result.
    pub fn is_relevant_failure(&self, failed: &FailedRequest) -> bool {
        if IGNORED_ERRORS.iter().any(|e| failed.error.contains(e)) {
            return false;
        }
        let (host, path) = host_and_path(&failed.url);
        self.registry
            .is_tracker_request(&Text::new(&format!("{host}{path}")), &failed.method)
    }
}
