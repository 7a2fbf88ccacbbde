//! Evidence fusion: combine static and request evidence into a verdict.

use crate::signatures::{PlatformEvidence, Registry};
use crate::static_analysis::StaticEvidence;
use crate::types::{
    AnalyticsFlags, ObservedRequest, PixelEvent, PlatformVerdict, SiteResult, SiteSpec,
    UNKNOWN_PLATFORM,
};
use std::collections::BTreeMap;

/// URL tracking parameters that pixel events are expected to echo.
const PROPAGATED: [&str; 2] = ["alart", "aleid"];

fn echoed_value<'e>(key: &str, event: &'e PixelEvent) -> Option<&'e str> {
    match key {
        "alart" => event.art.as_deref(),
        "aleid" => event.event_id.as_deref(),
        _ => None,
    }
}

/// Fuse one site's evidence. Pure and deterministic; `error` is left unset.
pub fn fuse(
    registry: &Registry,
    site: &SiteSpec,
    static_evidence: &StaticEvidence,
    requests: Vec<ObservedRequest>,
) -> SiteResult {
    let mut platform = static_evidence.platform.clone();
    let mut request_platform = PlatformEvidence::default();
    for hit in requests.iter().flat_map(|r| &r.platform_hits) {
        request_platform.record_hit(hit);
    }
    platform.merge(&request_platform);

    let verdict = PlatformVerdict {
        platform_type: platform
            .leading(registry)
            .unwrap_or(UNKNOWN_PLATFORM)
            .to_string(),
        indicators: platform.indicators(),
    };

    let mut analytics = AnalyticsFlags::default();
    for kind in &static_evidence.analytics {
        analytics.set(*kind);
    }
    for kind in requests.iter().filter_map(|r| r.classification.kind()) {
        analytics.set(kind);
    }

    let events: Vec<PixelEvent> = requests.iter().filter_map(|r| r.pixel.clone()).collect();

    let mut propagation = BTreeMap::new();
    if !events.is_empty() {
        for key in PROPAGATED {
            if let Some(expected) = static_evidence.tracking.get(key) {
                let echoed = events
                    .iter()
                    .any(|e| echoed_value(key, e) == Some(expected.as_str()));
                propagation.insert(key.to_string(), echoed);
            }
        }
    }

    SiteResult {
        name: site.name.clone(),
        url: site.url.clone(),
        platform: verdict,
        analytics,
        tracking: static_evidence.tracking.clone(),
        requests,
        events,
        propagation,
        failed_requests: Vec::new(),
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::RequestClassifier;
    use crate::static_analysis::analyze_static;
    use crate::types::{AnalyticsKind, RawRequest};
    use std::sync::Arc;
    use std::time::Duration;

    fn registry() -> &'static Registry {
        Registry::builtin()
    }

    fn observe(raws: &[RawRequest]) -> Vec<ObservedRequest> {
        let classifier = RequestClassifier::new(Arc::new(registry().clone()));
        raws.iter()
            .map(|r| classifier.classify(r, Duration::ZERO))
            .collect()
    }

    fn static_for(site: &SiteSpec, markup: Option<&str>) -> StaticEvidence {
        analyze_static(registry(), site, markup).unwrap()
    }

    #[test]
    fn test_request_only_gtm_sets_flag() {
        let site = SiteSpec::new("s", "https://example.com/");
        let evidence = static_for(&site, None);
        let requests = observe(&[RawRequest::new(
            "https://www.googletagmanager.com/gtm.js?id=GTM-X",
            "GET",
        )]);
        let result = fuse(registry(), &site, &evidence, requests);
        assert!(result.analytics.gtm);
        assert!(!result.analytics.ga4);
        assert_eq!(result.platform.platform_type, "unknown");
    }

    #[test]
    fn test_no_evidence_means_all_false() {
        let site = SiteSpec::new("s", "https://example.com/");
        let result = fuse(registry(), &site, &static_for(&site, None), Vec::new());
        assert!(!result.analytics.any());
        assert!(result.platform.indicators.is_empty());
        assert!(result.events.is_empty() && result.propagation.is_empty());
    }

    #[test]
    fn test_analytics_is_or_across_sources() {
        let site = SiteSpec::new("s", "https://example.com/");
        let evidence = static_for(&site, Some("<script>UA-123456-1</script>"));
        let requests = observe(&[RawRequest::new(
            "https://region1.google-analytics.com/g/collect",
            "POST",
        )]);
        let result = fuse(registry(), &site, &evidence, requests);
        assert!(result.analytics.get(AnalyticsKind::UniversalAnalytics));
        assert!(result.analytics.get(AnalyticsKind::Ga4));
    }

    #[test]
    fn test_indicators_from_both_sources_satisfy_threshold() {
        let site = SiteSpec::new("s", "https://shop.example.com/");
        let evidence = static_for(
            &site,
            Some(r#"<meta name="shopify-storefront-api-token" content="t">"#),
        );
        assert_eq!(evidence.platform.leading(registry()), None);

        let requests = observe(&[RawRequest::new(
            "https://shop.myshopify.com/api/2024-01/graphql.json",
            "POST",
        )]);
        let result = fuse(registry(), &site, &evidence, requests);
        assert_eq!(result.platform.platform_type, "headless_shopify");
        assert_eq!(
            result.platform.indicators,
            vec![
                "headless_shopify:storefront-api-call",
                "headless_shopify:storefront-token-meta"
            ]
        );
    }

    #[test]
    fn test_storefront_api_call_with_token_header_is_headless() {
        let site = SiteSpec::new("s", "https://brand.example.com/");
        let requests = observe(&[RawRequest::new(
            "https://brand.myshopify.com/api/2023-01/graphql.json",
            "POST",
        )
        .with_header("X-Shopify-Storefront-Access-Token", "tok")]);
        let result = fuse(registry(), &site, &static_for(&site, None), requests);
        assert_eq!(result.platform.platform_type, "headless_shopify");
    }

    #[test]
    fn test_higher_priority_platform_wins() {
        let site = SiteSpec::new("s", "https://example.com/");
        let evidence = static_for(&site, Some("<div data-mage-init='{}'></div>"));
        let requests = observe(&[RawRequest::new("https://cdn.shopify.com/s/x.js", "GET")]);
        let result = fuse(registry(), &site, &evidence, requests);
        assert_eq!(result.platform.platform_type, "shopify");
        assert!(result
            .platform
            .indicators
            .contains(&"magento:mage-init".to_string()));
    }

    #[test]
    fn test_propagation_from_pixel_events() {
        let site = SiteSpec::new("s", "https://example.com/?alart=abc&aleid=def");
        let evidence = static_for(&site, None);
        let requests = observe(&[RawRequest::new("https://b.applovin.com/v2/pixel", "POST")
            .with_body(r#"{"event":{"name":"page_view"},"applovin":{"art":"abc","eventId":"zzz"}}"#)]);
        let result = fuse(registry(), &site, &evidence, requests);
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.propagation.get("alart"), Some(&true));
        assert_eq!(result.propagation.get("aleid"), Some(&false));
        assert!(result.analytics.custom_pixel);
        assert_eq!(result.platform.platform_type, "unknown", "trackers never name the platform");
    }

    #[test]
    fn test_fusion_is_deterministic() {
        let site = SiteSpec::new("s", "https://a.myshopify.com/?alart=x1");
        let evidence = static_for(&site, Some("<script>gtm.start</script>"));
        let raws = [
            RawRequest::new("https://monorail-edge.shopifysvc.com/v1/produce", "POST"),
            RawRequest::new("https://www.googletagmanager.com/gtm.js", "GET"),
        ];
        let a = serde_json::to_vec(&fuse(registry(), &site, &evidence, observe(&raws))).unwrap();
        let b = serde_json::to_vec(&fuse(registry(), &site, &evidence, observe(&raws))).unwrap();
        assert_eq!(a, b);
    }
}
