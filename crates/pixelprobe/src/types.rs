//! Core data types: site records, observed requests, and per-site verdicts.
//!
//! The serialized form of [`RunResult`] is the contract with report
//! renderers: an object keyed by site name, in configuration order.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Platform type reported when no storefront signature is satisfied.
pub const UNKNOWN_PLATFORM: &str = "unknown";

/// A storefront to inspect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteSpec {
    pub name: String,
    pub url: String,
}

impl SiteSpec {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

/// Analytics integration generations the engine can recognise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyticsKind {
    Gtm,
    Ga4,
    UniversalAnalytics,
    CustomPixel,
}

impl AnalyticsKind {
    pub const ALL: [AnalyticsKind; 4] = [
        AnalyticsKind::Gtm,
        AnalyticsKind::Ga4,
        AnalyticsKind::UniversalAnalytics,
        AnalyticsKind::CustomPixel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gtm => "gtm",
            Self::Ga4 => "ga4",
            Self::UniversalAnalytics => "universal_analytics",
            Self::CustomPixel => "custom_pixel",
        }
    }
}

impl fmt::Display for AnalyticsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification assigned to one observed request.
///
/// Serialized as a bare string: an analytics kind name or `"unclassified"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    Analytics(AnalyticsKind),
    Unclassified,
}

impl RequestClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analytics(kind) => kind.as_str(),
            Self::Unclassified => "unclassified",
        }
    }

    pub fn kind(&self) -> Option<AnalyticsKind> {
        match self {
            Self::Analytics(kind) => Some(*kind),
            Self::Unclassified => None,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        if s == "unclassified" {
            return Some(Self::Unclassified);
        }
        AnalyticsKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .map(Self::Analytics)
    }
}

impl Serialize for RequestClass {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RequestClass {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown request type: {s}")))
    }
}

/// A raw outgoing request as reported by a browser session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRequest {
    pub url: String,
    pub method: String,
    /// Request headers keyed by lowercased name.
    pub headers: BTreeMap<String, String>,
    /// POST body, when the session could retrieve one.
    pub body: Option<String>,
}

impl RawRequest {
    pub fn new(url: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: method.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// A request the browser reported as failed, with the network error text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRequest {
    pub url: String,
    pub method: String,
    pub error: String,
}

impl FailedRequest {
    pub fn new(url: impl Into<String>, method: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: method.into(),
            error: error.into(),
        }
    }
}

/// One platform indicator satisfied by a piece of evidence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndicatorHit {
    pub platform_id: String,
    pub label: String,
}

impl fmt::Display for IndicatorHit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.platform_id, self.label)
    }
}

/// Pixel payload layout generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelVersion {
    V1,
    V2,
}

/// A decoded AppLovin/Axon pixel payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelEvent {
    pub name: String,
    pub version: PixelVersion,
    pub art: Option<String>,
    pub event_id: Option<String>,
}

/// One request captured during live observation.
///
/// Only `url` and the classification (as `type`) are part of the
/// serialized form; the rest is in-process evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedRequest {
    pub url: String,
    #[serde(skip)]
    pub method: String,
    /// Time since observation start.
    #[serde(skip)]
    pub elapsed: Duration,
    #[serde(rename = "type")]
    pub classification: RequestClass,
    #[serde(skip)]
    pub platform_hits: Vec<IndicatorHit>,
    #[serde(skip)]
    pub pixel: Option<PixelEvent>,
}

/// Platform half of a site verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformVerdict {
    #[serde(rename = "type")]
    pub platform_type: String,
    /// Every matched indicator as `platform_id:label`, sorted.
    pub indicators: Vec<String>,
}

impl PlatformVerdict {
    pub fn unknown() -> Self {
        Self {
            platform_type: UNKNOWN_PLATFORM.to_string(),
            indicators: Vec::new(),
        }
    }

    pub fn is_known(&self) -> bool {
        self.platform_type != UNKNOWN_PLATFORM
    }
}

/// One boolean per [`AnalyticsKind`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyticsFlags {
    pub gtm: bool,
    pub ga4: bool,
    pub universal_analytics: bool,
    pub custom_pixel: bool,
}

impl AnalyticsFlags {
    pub fn get(&self, kind: AnalyticsKind) -> bool {
        match kind {
            AnalyticsKind::Gtm => self.gtm,
            AnalyticsKind::Ga4 => self.ga4,
            AnalyticsKind::UniversalAnalytics => self.universal_analytics,
            AnalyticsKind::CustomPixel => self.custom_pixel,
        }
    }

    pub fn set(&mut self, kind: AnalyticsKind) {
        match kind {
            AnalyticsKind::Gtm => self.gtm = true,
            AnalyticsKind::Ga4 => self.ga4 = true,
            AnalyticsKind::UniversalAnalytics => self.universal_analytics = true,
            AnalyticsKind::CustomPixel => self.custom_pixel = true,
        }
    }

    pub fn any(&self) -> bool {
        AnalyticsKind::ALL.into_iter().any(|k| self.get(k))
    }
}

/// The verdict for one site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteResult {
    /// Site name; the key of this result in [`RunResult`].
    #[serde(skip)]
    pub name: String,
    pub url: String,
    pub platform: PlatformVerdict,
    pub analytics: AnalyticsFlags,
    /// Validated tracking parameter values; absent keys are omitted.
    pub tracking: BTreeMap<String, String>,
    pub requests: Vec<ObservedRequest>,
    /// Decoded pixel events in arrival order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<PixelEvent>,
    /// Whether each URL tracking value was echoed by a pixel event.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub propagation: BTreeMap<String, bool>,
    /// Failed requests to tracker domains.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_requests: Vec<FailedRequest>,
    pub error: Option<String>,
}

impl SiteResult {
    /// A result carrying no evidence at all, only an error.
    pub fn failed(site: &SiteSpec, error: impl Into<String>) -> Self {
        Self {
            name: site.name.clone(),
            url: site.url.clone(),
            platform: PlatformVerdict::unknown(),
            analytics: AnalyticsFlags::default(),
            tracking: BTreeMap::new(),
            requests: Vec::new(),
            events: Vec::new(),
            propagation: BTreeMap::new(),
            failed_requests: Vec::new(),
            error: Some(error.into()),
        }
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }

    pub fn site(&self) -> SiteSpec {
        SiteSpec::new(&self.name, &self.url)
    }
}

/// Results for a whole run, keyed by site name in configuration order.
///
/// Inserting a name that already exists replaces the value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunResult {
    entries: Vec<SiteResult>,
}

impl RunResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, result: SiteResult) {
        match self.entries.iter_mut().find(|e| e.name == result.name) {
            Some(slot) => *slot = result,
            None => self.entries.push(result),
        }
    }

    pub fn get(&self, name: &str) -> Option<&SiteResult> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SiteResult> {
        self.entries.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    /// Number of sites whose result carries an error.
    pub fn error_count(&self) -> usize {
        self.entries.iter().filter(|e| e.error.is_some()).count()
    }
}

impl FromIterator<SiteResult> for RunResult {
    fn from_iter<I: IntoIterator<Item = SiteResult>>(iter: I) -> Self {
        let mut run = RunResult::new();
        for result in iter {
            run.insert(result);
        }
        run
    }
}

impl<'a> IntoIterator for &'a RunResult {
    type Item = &'a SiteResult;
    type IntoIter = std::slice::Iter<'a, SiteResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl Serialize for RunResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for entry in &self.entries {
            map.serialize_entry(&entry.name, entry)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for RunResult {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RunVisitor;

        impl<'de> Visitor<'de> for RunVisitor {
            type Value = RunResult;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object keyed by site name")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<RunResult, A::Error> {
                let mut run = RunResult::new();
                while let Some((name, mut result)) = access.next_entry::<String, SiteResult>()? {
                    result.name = name;
                    run.insert(result);
                }
                Ok(run)
            }
        }

        deserializer.deserialize_map(RunVisitor)
    }
}
