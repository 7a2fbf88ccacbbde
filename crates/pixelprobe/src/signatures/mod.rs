//! Signature registry: platform fingerprints, analytics signatures, and
//! tracking-parameter specs.
//!
//! Signatures are data, not code. The built-in set is a JSON document
//! embedded at compile time; a user document with the same schema can
//! replace it. Document order is priority order: the first satisfied
//! storefront signature names the platform, the first matching analytics
//! signature classifies a request.
//!
//! A compiled [`Registry`] is immutable and shared across site tasks
//! behind an `Arc`.

use crate::error::{ProbeError, Result};
use crate::types::{AnalyticsKind, IndicatorHit};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::OnceLock;

/// Raw JSON content of the built-in signatures, embedded at compile time.
const BUILTIN_JSON: &str = include_str!("builtin.json");

// ── Document schema ──────────────────────────────────────────────────────────

/// What a matcher is tested against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// Host and path of the site URL.
    SiteUrl,
    /// Raw page source.
    Markup,
    /// `src` attributes of `<script>` tags.
    ScriptSrc,
    /// `name` and `content` attributes of `<meta>` tags.
    Meta,
    /// Host and path of an observed outgoing request.
    Request,
    /// `name: value` lines of an observed request's headers.
    Header,
}

impl Target {
    pub fn is_markup(&self) -> bool {
        matches!(self, Self::Markup | Self::ScriptSrc | Self::Meta)
    }
}

/// Whether a platform signature can name the platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureRole {
    #[default]
    Storefront,
    /// Third-party tracking vendor; reported as evidence only.
    Tracker,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatcherDef {
    pub label: String,
    pub on: Target,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contains: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformDef {
    pub id: String,
    #[serde(default)]
    pub role: SignatureRole,
    #[serde(default = "default_min_indicators")]
    pub min_indicators: usize,
    pub indicators: Vec<MatcherDef>,
}

fn default_min_indicators() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyticsDef {
    pub kind: AnalyticsKind,
    pub matchers: Vec<MatcherDef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingParameterDef {
    pub key: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

/// A complete signature document, as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureDocument {
    pub platforms: Vec<PlatformDef>,
    pub analytics: Vec<AnalyticsDef>,
    pub tracking_parameters: Vec<TrackingParameterDef>,
}

// ── Compiled form ────────────────────────────────────────────────────────────

/// A compiled pattern. Literals match ASCII case-insensitively.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Lowercased needle.
    Contains(String),
    Regex(Regex),
}

impl Pattern {
    pub fn is_match(&self, text: &Text<'_>) -> bool {
        match self {
            Self::Contains(needle) => text.lower.contains(needle.as_str()),
            Self::Regex(re) => re.is_match(text.raw),
        }
    }
}

/// A haystack with its lowercased form computed once.
#[derive(Debug, Clone)]
pub struct Text<'a> {
    raw: &'a str,
    lower: String,
}

impl<'a> Text<'a> {
    pub fn new(raw: &'a str) -> Self {
        Self {
            raw,
            lower: raw.to_ascii_lowercase(),
        }
    }
}

/// A single labelled test against one kind of evidence.
#[derive(Debug, Clone)]
pub struct Matcher {
    pub label: String,
    pub target: Target,
    pub pattern: Pattern,
    /// Restricts request matchers to one HTTP method.
    pub method: Option<String>,
}

impl Matcher {
    pub fn is_match(&self, text: &Text<'_>) -> bool {
        self.pattern.is_match(text)
    }

    /// Test an observed request's host+path, honouring the method filter.
    pub fn matches_request(&self, location: &Text<'_>, method: &str) -> bool {
        if self.target != Target::Request {
            return false;
        }
        if let Some(required) = &self.method {
            if !required.eq_ignore_ascii_case(method) {
                return false;
            }
        }
        self.pattern.is_match(location)
    }

    /// Test an observed request's headers, one `name: value` line at a time.
    pub fn matches_headers(&self, headers: &BTreeMap<String, String>) -> bool {
        if self.target != Target::Header {
            return false;
        }
        let mut line = String::new();
        headers.iter().any(|(name, value)| {
            line.clear();
            let _ = write!(line, "{name}: {value}");
            self.pattern.is_match(&Text::new(&line))
        })
    }
}

#[derive(Debug, Clone)]
pub struct PlatformSignature {
    pub platform_id: String,
    pub role: SignatureRole,
    /// Distinct indicators required before the signature is satisfied.
    pub min_indicators: usize,
    pub indicators: Vec<Matcher>,
}

#[derive(Debug, Clone)]
pub struct AnalyticsSignature {
    pub kind: AnalyticsKind,
    pub matchers: Vec<Matcher>,
}

impl AnalyticsSignature {
    pub fn request_matchers(&self) -> impl Iterator<Item = &Matcher> {
        self.matchers.iter().filter(|m| m.target == Target::Request)
    }

    pub fn markup_matchers(&self) -> impl Iterator<Item = &Matcher> {
        self.matchers.iter().filter(|m| m.target.is_markup())
    }
}

#[derive(Debug, Clone)]
pub struct TrackingParameterSpec {
    pub key: String,
    pub required: bool,
    pub pattern: Option<Regex>,
}

impl TrackingParameterSpec {
    pub fn accepts(&self, value: &str) -> bool {
        !value.is_empty() && self.pattern.as_ref().map_or(true, |re| re.is_match(value))
    }
}

/// The compiled, read-only signature set.
#[derive(Debug, Clone)]
pub struct Registry {
    document: SignatureDocument,
    platforms: Vec<PlatformSignature>,
    analytics: Vec<AnalyticsSignature>,
    tracking: Vec<TrackingParameterSpec>,
}

impl Registry {
    /// The embedded signature set, compiled once per process.
    pub fn builtin() -> &'static Registry {
        static BUILTIN: OnceLock<Registry> = OnceLock::new();
        BUILTIN.get_or_init(|| {
            Registry::from_json(BUILTIN_JSON).expect("embedded signatures are valid")
        })
    }

    /// Parse and compile a signature document.
    pub fn from_json(json: &str) -> Result<Self> {
        let document: SignatureDocument = serde_json::from_str(json)
            .map_err(|e| ProbeError::Configuration(format!("invalid signature document: {e}")))?;
        Self::compile(document)
    }

    pub fn compile(document: SignatureDocument) -> Result<Self> {
        let mut platforms = Vec::with_capacity(document.platforms.len());
        for def in &document.platforms {
            if def.min_indicators == 0 || def.min_indicators > def.indicators.len() {
                return Err(ProbeError::Configuration(format!(
                    "platform {:?}: min_indicators must be between 1 and {}",
                    def.id,
                    def.indicators.len()
                )));
            }
            platforms.push(PlatformSignature {
                platform_id: def.id.clone(),
                role: def.role,
                min_indicators: def.min_indicators,
                indicators: def
                    .indicators
                    .iter()
                    .map(compile_matcher)
                    .collect::<Result<_>>()?,
            });
        }

        let mut analytics = Vec::with_capacity(document.analytics.len());
        for def in &document.analytics {
            analytics.push(AnalyticsSignature {
                kind: def.kind,
                matchers: def
                    .matchers
                    .iter()
                    .map(compile_matcher)
                    .collect::<Result<_>>()?,
            });
        }

        let mut tracking = Vec::with_capacity(document.tracking_parameters.len());
        for def in &document.tracking_parameters {
            let pattern = match &def.pattern {
                Some(p) => Some(compile_regex(&def.key, p)?),
                None => None,
            };
            tracking.push(TrackingParameterSpec {
                key: def.key.clone(),
                required: def.required,
                pattern,
            });
        }

        Ok(Self {
            document,
            platforms,
            analytics,
            tracking,
        })
    }

    /// Append request patterns to the `custom_pixel` signature, creating it
    /// (lowest priority) when the document has none.
    pub fn with_custom_pixels(self, patterns: &[String]) -> Result<Self> {
        if patterns.is_empty() {
            return Ok(self);
        }
        let mut document = self.document;
        let index = match document
            .analytics
            .iter()
            .position(|a| a.kind == AnalyticsKind::CustomPixel)
        {
            Some(i) => i,
            None => {
                document.analytics.push(AnalyticsDef {
                    kind: AnalyticsKind::CustomPixel,
                    matchers: Vec::new(),
                });
                document.analytics.len() - 1
            }
        };
        for (i, pattern) in patterns.iter().enumerate() {
            document.analytics[index].matchers.push(MatcherDef {
                label: format!("configured-{}", i + 1),
                on: Target::Request,
                contains: None,
                regex: Some(pattern.clone()),
                method: None,
            });
        }
        Self::compile(document)
    }

    /// Platform signatures in priority order.
    pub fn platform_signatures(&self) -> &[PlatformSignature] {
        &self.platforms
    }

    /// Analytics signatures in classification priority order.
    pub fn analytics_signatures(&self) -> &[AnalyticsSignature] {
        &self.analytics
    }

    pub fn tracking_parameter_specs(&self) -> &[TrackingParameterSpec] {
        &self.tracking
    }

    pub fn document(&self) -> &SignatureDocument {
        &self.document
    }

    /// Whether a request host+path would count as tracker evidence.
    pub fn is_tracker_request(&self, location: &Text<'_>, method: &str) -> bool {
        self.platforms
            .iter()
            .filter(|sig| sig.role == SignatureRole::Tracker)
            .flat_map(|sig| &sig.indicators)
            .any(|m| m.matches_request(location, method))
    }
}

fn compile_matcher(def: &MatcherDef) -> Result<Matcher> {
    let pattern = match (&def.contains, &def.regex) {
        (Some(needle), None) if !needle.is_empty() => Pattern::Contains(needle.to_ascii_lowercase()),
        (None, Some(re)) => Pattern::Regex(compile_regex(&def.label, re)?),
        _ => {
            return Err(ProbeError::Configuration(format!(
                "matcher {:?} needs exactly one non-empty `contains` or `regex`",
                def.label
            )))
        }
    };
    if def.method.is_some() && def.on != Target::Request {
        return Err(ProbeError::Configuration(format!(
            "matcher {:?}: `method` only applies to request matchers",
            def.label
        )));
    }
    Ok(Matcher {
        label: def.label.clone(),
        target: def.on,
        pattern,
        method: def.method.clone(),
    })
}

fn compile_regex(owner: &str, pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| ProbeError::Configuration(format!("{owner:?}: invalid regex: {e}")))
}

// ── Platform evidence ────────────────────────────────────────────────────────

/// Matched indicator labels, grouped by platform signature.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformEvidence {
    hits: BTreeMap<String, BTreeSet<String>>,
}

impl PlatformEvidence {
    pub fn record(&mut self, platform_id: &str, label: &str) {
        self.hits
            .entry(platform_id.to_string())
            .or_default()
            .insert(label.to_string());
    }

    pub fn record_hit(&mut self, hit: &IndicatorHit) {
        self.record(&hit.platform_id, &hit.label);
    }

    pub fn merge(&mut self, other: &PlatformEvidence) {
        for (id, labels) in &other.hits {
            self.hits.entry(id.clone()).or_default().extend(labels.iter().cloned());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn labels(&self, platform_id: &str) -> Option<&BTreeSet<String>> {
        self.hits.get(platform_id)
    }

    /// The first storefront signature, in registry order, whose matched
    /// indicators reach its threshold.
    pub fn leading<'r>(&self, registry: &'r Registry) -> Option<&'r str> {
        registry
            .platform_signatures()
            .iter()
            .filter(|sig| sig.role == SignatureRole::Storefront)
            .find(|sig| {
                self.hits
                    .get(&sig.platform_id)
                    .is_some_and(|labels| labels.len() >= sig.min_indicators)
            })
            .map(|sig| sig.platform_id.as_str())
    }

    /// Every matched indicator as `platform_id:label`, sorted.
    pub fn indicators(&self) -> Vec<String> {
        self.hits
            .iter()
            .flat_map(|(id, labels)| labels.iter().map(move |l| format!("{id}:{l}")))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_compiles_in_priority_order() {
        let registry = Registry::builtin();
        let ids: Vec<&str> = registry
            .platform_signatures()
            .iter()
            .map(|s| s.platform_id.as_str())
            .collect();
        assert_eq!(&ids[..2], &["headless_shopify", "shopify"]);
        let kinds: Vec<AnalyticsKind> =
            registry.analytics_signatures().iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![
                AnalyticsKind::Ga4,
                AnalyticsKind::UniversalAnalytics,
                AnalyticsKind::Gtm,
                AnalyticsKind::CustomPixel
            ]
        );
        let keys: Vec<&str> = registry
            .tracking_parameter_specs()
            .iter()
            .map(|t| t.key.as_str())
            .collect();
        assert!(keys.contains(&"alart") && keys.contains(&"aleid"));
    }

    #[test]
    fn test_invalid_regex_is_configuration_error() {
        let json = r#"{"platforms": [], "analytics": [
            {"kind": "gtm", "matchers": [{"label": "bad", "on": "request", "regex": "("}]}
        ], "tracking_parameters": []}"#;
        let err = Registry::from_json(json).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("invalid regex"));
    }

    #[test]
    fn test_matcher_needs_exactly_one_pattern() {
        let json = r#"{"platforms": [{"id": "x", "indicators": [
            {"label": "both", "on": "markup", "contains": "a", "regex": "b"}
        ]}], "analytics": [], "tracking_parameters": []}"#;
        assert!(matches!(
            Registry::from_json(json),
            Err(ProbeError::Configuration(_))
        ));
    }

    #[test]
    fn test_min_indicators_out_of_range() {
        let json = r#"{"platforms": [{"id": "x", "min_indicators": 3, "indicators": [
            {"label": "one", "on": "markup", "contains": "a"}
        ]}], "analytics": [], "tracking_parameters": []}"#;
        assert!(Registry::from_json(json).is_err());
    }

    #[test]
    fn test_literal_match_is_case_insensitive() {
        let m = compile_matcher(&MatcherDef {
            label: "gtm".into(),
            on: Target::Markup,
            contains: Some("GTM.Start".into()),
            regex: None,
            method: None,
        })
        .unwrap();
        assert!(m.is_match(&Text::new("dataLayer.push({'gtm.start': 1})")));
        assert!(!m.is_match(&Text::new("gtm-start")));
    }

    #[test]
    fn test_request_method_filter() {
        let m = compile_matcher(&MatcherDef {
            label: "pixel".into(),
            on: Target::Request,
            contains: Some("b.applovin.com/v2/pixel".into()),
            regex: None,
            method: Some("POST".into()),
        })
        .unwrap();
        let loc = Text::new("b.applovin.com/v2/pixel");
        assert!(m.matches_request(&loc, "post"));
        assert!(!m.matches_request(&loc, "GET"));
    }

    #[test]
    fn test_header_matcher_checks_each_line() {
        let m = compile_matcher(&MatcherDef {
            label: "token".into(),
            on: Target::Header,
            contains: Some("X-Shopify-Storefront-Access-Token".into()),
            regex: None,
            method: None,
        })
        .unwrap();
        let mut headers = BTreeMap::new();
        headers.insert("accept".to_string(), "application/json".to_string());
        assert!(!m.matches_headers(&headers));
        headers.insert("x-shopify-storefront-access-token".to_string(), "abc".to_string());
        assert!(m.matches_headers(&headers));
        assert!(!m.matches_request(&Text::new("shop.test/api"), "POST"));
    }

    #[test]
    fn test_tracker_requests() {
        let registry = Registry::builtin();
        assert!(registry.is_tracker_request(&Text::new("c.albss.com/p/l/loader.js"), "GET"));
        assert!(registry.is_tracker_request(&Text::new("b.applovin.com/v2/pixel"), "POST"));
        assert!(!registry.is_tracker_request(&Text::new("cdn.shopify.com/s/x.js"), "GET"));
    }

    #[test]
    fn test_custom_pixels_are_appended() {
        let registry = Registry::builtin()
            .clone()
            .with_custom_pixels(&["(?i)px\\.example\\.net/collect".to_string()])
            .unwrap();
        let custom = registry
            .analytics_signatures()
            .iter()
            .find(|a| a.kind == AnalyticsKind::CustomPixel)
            .unwrap();
        assert!(custom
            .request_matchers()
            .any(|m| m.label == "configured-1" && m.is_match(&Text::new("px.example.net/collect"))));
        assert!(Registry::builtin()
            .clone()
            .with_custom_pixels(&["(".to_string()])
            .is_err());
    }

    #[test]
    fn test_leading_follows_registry_order_and_threshold() {
        let registry = Registry::builtin();
        let mut evidence = PlatformEvidence::default();
        evidence.record("applovin", "applovin-request");
        assert_eq!(evidence.leading(registry), None, "trackers never name the platform");

        evidence.record("shopify", "shopify-shop-global");
        evidence.record("headless_shopify", "hydrogen");
        assert_eq!(evidence.leading(registry), Some("shopify"));

        evidence.record("headless_shopify", "buy-sdk");
        assert_eq!(evidence.leading(registry), Some("headless_shopify"));
        assert_eq!(
            evidence.indicators(),
            vec![
                "applovin:applovin-request",
                "headless_shopify:buy-sdk",
                "headless_shopify:hydrogen",
                "shopify:shopify-shop-global"
            ]
        );
    }

    #[test]
    fn test_document_round_trips_through_serde() {
        let doc = Registry::builtin().document();
        let json = serde_json::to_string(doc).unwrap();
        let again = Registry::from_json(&json).unwrap();
        assert_eq!(again.document(), doc);
    }
}
