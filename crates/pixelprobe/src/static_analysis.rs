//! Static analysis: evidence derivable without executing the page.
//!
//! Inspects the site URL (tracking parameters, host fingerprints) and, when
//! available, the page source fetched by a plain HTTP GET. Markup is parsed
//! once with `scraper` to pull out `<script src>` and `<meta>` attributes;
//! everything else is substring or regex matching on the raw text.
//!
//! [`analyze_static`] is synchronous and pure. `scraper` types are `!Send`,
//! so async callers run it under `tokio::task::spawn_blocking`.

use crate::error::{ProbeError, Result};
use crate::signatures::{Matcher, PlatformEvidence, Registry, Target, Text};
use crate::types::{AnalyticsKind, SiteSpec};
use scraper::{Html, Selector};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;
use url::Url;

/// Everything the static pass learned about one site.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticEvidence {
    pub platform: PlatformEvidence,
    pub analytics: BTreeSet<AnalyticsKind>,
    /// Validated tracking values, keyed by parameter.
    pub tracking: BTreeMap<String, String>,
    /// Required parameters absent from the URL (or failing their pattern).
    pub missing_required: Vec<String>,
}

/// Parse a site URL, accepting only absolute http(s) URLs with a host.
pub fn parse_site_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).map_err(|e| ProbeError::malformed_url(raw, e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ProbeError::malformed_url(
            raw,
            format!("unsupported scheme {:?}", url.scheme()),
        ));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ProbeError::malformed_url(raw, "missing host"));
    }
    Ok(url)
}

/// Run the static pass over a site URL and optional page markup.
pub fn analyze_static(
    registry: &Registry,
    site: &SiteSpec,
    markup: Option<&str>,
) -> Result<StaticEvidence> {
    let url = parse_site_url(&site.url)?;
    let mut evidence = StaticEvidence::default();

    extract_tracking(registry, &url, &mut evidence);

    let location = format!("{}{}", url.host_str().unwrap_or_default(), url.path());
    let location = Text::new(&location);
    for sig in registry.platform_signatures() {
        for m in sig.indicators.iter().filter(|m| m.target == Target::SiteUrl) {
            if m.is_match(&location) {
                evidence.platform.record(&sig.platform_id, &m.label);
            }
        }
    }

    if let Some(markup) = markup {
        scan_markup(registry, markup, &mut evidence);
    }

    debug!(
        site = %site.name,
        platform_hits = evidence.platform.indicators().len(),
        analytics = evidence.analytics.len(),
        tracking = evidence.tracking.len(),
        "static analysis complete"
    );
    Ok(evidence)
}

fn extract_tracking(registry: &Registry, url: &Url, evidence: &mut StaticEvidence) {
    // First occurrence of a repeated key wins.
    let mut pairs: BTreeMap<String, String> = BTreeMap::new();
    for (k, v) in url.query_pairs() {
        pairs.entry(k.into_owned()).or_insert_with(|| v.into_owned());
    }

    for spec in registry.tracking_parameter_specs() {
        match pairs.get(&spec.key) {
            Some(value) if spec.accepts(value) => {
                evidence.tracking.insert(spec.key.clone(), value.clone());
            }
            Some(value) => {
                debug!(key = %spec.key, value = %value, "tracking value rejected by pattern");
                if spec.required {
                    evidence.missing_required.push(spec.key.clone());
                }
            }
            None if spec.required => evidence.missing_required.push(spec.key.clone()),
            None => {}
        }
    }
}

/// Attribute values pulled out of parsed markup.
struct MarkupView {
    script_srcs: Vec<String>,
    metas: Vec<String>,
}

impl MarkupView {
    fn parse(markup: &str) -> Self {
        let document = Html::parse_document(markup);
        let script_sel = Selector::parse("script[src]").expect("script selector is valid");
        let meta_sel = Selector::parse("meta").expect("meta selector is valid");

        let script_srcs = document
            .select(&script_sel)
            .filter_map(|el| el.value().attr("src"))
            .map(str::to_string)
            .collect();

        let metas = document
            .select(&meta_sel)
            .map(|el| {
                let name = el
                    .value()
                    .attr("name")
                    .or_else(|| el.value().attr("property"))
                    .unwrap_or("");
                let content = el.value().attr("content").unwrap_or("");
                format!("{name} {content}")
            })
            .filter(|s| !s.trim().is_empty())
            .collect();

        Self { script_srcs, metas }
    }
}

fn scan_markup(registry: &Registry, markup: &str, evidence: &mut StaticEvidence) {
    let body = Text::new(markup);
    let view = MarkupView::parse(markup);
    let scripts: Vec<Text<'_>> = view.script_srcs.iter().map(|s| Text::new(s)).collect();
    let metas: Vec<Text<'_>> = view.metas.iter().map(|s| Text::new(s)).collect();

    let hit = |m: &Matcher| -> bool {
        match m.target {
            Target::Markup => m.is_match(&body),
            Target::ScriptSrc => scripts.iter().any(|t| m.is_match(t)),
            Target::Meta => metas.iter().any(|t| m.is_match(t)),
            Target::SiteUrl | Target::Request | Target::Header => false,
        }
    };

    for sig in registry.platform_signatures() {
        for m in &sig.indicators {
            if hit(m) {
                evidence.platform.record(&sig.platform_id, &m.label);
            }
        }
    }

    for sig in registry.analytics_signatures() {
        if sig.markup_matchers().any(|m| hit(m)) {
            evidence.analytics.insert(sig.kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze(url: &str, markup: Option<&str>) -> Result<StaticEvidence> {
        analyze_static(Registry::builtin(), &SiteSpec::new("shop", url), markup)
    }

    #[test]
    fn test_tracking_values_extracted_verbatim() {
        let evidence = analyze("https://example.com?alart=test123&aleid=test456", None).unwrap();
        assert_eq!(evidence.tracking.get("alart").map(String::as_str), Some("test123"));
        assert_eq!(evidence.tracking.get("aleid").map(String::as_str), Some("test456"));
        assert!(evidence.missing_required.is_empty());
    }

    #[test]
    fn test_missing_required_is_absent_not_error() {
        let evidence = analyze("https://example.com/?utm_source=applovin", None).unwrap();
        assert!(!evidence.tracking.contains_key("alart"));
        assert_eq!(evidence.missing_required, vec!["alart", "aleid"]);
        assert_eq!(
            evidence.tracking.get("utm_source").map(String::as_str),
            Some("applovin")
        );
    }

    #[test]
    fn test_pattern_rejects_invalid_value() {
        let evidence = analyze("https://example.com/?alart=bad%20value&aleid=", None).unwrap();
        assert!(evidence.tracking.is_empty());
        assert_eq!(evidence.missing_required, vec!["alart", "aleid"]);
    }

    #[test]
    fn test_first_repeated_key_wins() {
        let evidence = analyze("https://example.com/?alart=one&alart=two", None).unwrap();
        assert_eq!(evidence.tracking["alart"], "one");
    }

    #[test]
    fn test_malformed_urls() {
        for bad in ["example.com?alart=x", "not a url", "ftp://example.com/", "file:///tmp/x"] {
            assert!(
                matches!(analyze(bad, None), Err(ProbeError::MalformedUrl { .. })),
                "{bad} should be malformed"
            );
        }
    }

    #[test]
    fn test_site_url_fingerprint_without_markup() {
        let evidence = analyze("https://cool-store.myshopify.com/products/x", None).unwrap();
        assert_eq!(evidence.platform.leading(Registry::builtin()), Some("shopify"));
    }

    #[test]
    fn test_markup_analytics_detection() {
        let markup = r#"<html><head>
            <script>(function(w,d,s,l,i){w[l].push({'gtm.start': new Date().getTime()});})</script>
            <script async src="https://www.googletagmanager.com/gtag/js?id=G-ABC123"></script>
        </head><body></body></html>"#;
        let evidence = analyze("https://example.com/", Some(markup)).unwrap();
        assert!(evidence.analytics.contains(&AnalyticsKind::Gtm));
        assert!(evidence.analytics.contains(&AnalyticsKind::Ga4));
        assert!(!evidence.analytics.contains(&AnalyticsKind::UniversalAnalytics));
    }

    #[test]
    fn test_headless_shopify_needs_two_indicators() {
        let one = r#"<script src="/assets/shopify-buy.umd.min.js"></script>"#;
        let evidence = analyze("https://example.com/", Some(one)).unwrap();
        assert_eq!(evidence.platform.leading(Registry::builtin()), None);

        let two = r#"<head><meta name="shopify-storefront-api-token" content="abc">
            <script src="/assets/shopify-buy.umd.min.js"></script></head>"#;
        let evidence = analyze("https://example.com/", Some(two)).unwrap();
        assert_eq!(
            evidence.platform.leading(Registry::builtin()),
            Some("headless_shopify")
        );
    }

    #[test]
    fn test_markup_without_signatures_is_empty() {
        let evidence = analyze("https://example.com/", Some("<html><body>hi</body></html>")).unwrap();
        assert!(evidence.platform.is_empty());
        assert!(evidence.analytics.is_empty());
    }

    #[test]
    fn test_pure_function() {
        let markup = r#"<script>var Shopify = {}; Shopify.shop = "x";</script>"#;
        let a = analyze("https://example.com/?alart=a1", Some(markup)).unwrap();
        let b = analyze("https://example.com/?alart=a1", Some(markup)).unwrap();
        assert_eq!(a, b);
    }
}
