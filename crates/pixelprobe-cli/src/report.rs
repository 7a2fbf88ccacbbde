//! Human-readable renderings of a run result.

use pixelprobe::{AnalyticsKind, RunResult, SiteResult};

fn mark(value: bool) -> &'static str {
    if value {
        "✅"
    } else {
        "❌"
    }
}

fn has_event(result: &SiteResult, name: &str) -> bool {
    result
        .events
        .iter()
        .any(|e| e.name.eq_ignore_ascii_case(name))
}

fn propagated(result: &SiteResult, key: &str) -> bool {
    result.propagation.get(key).copied().unwrap_or(false)
}

fn request_count(result: &SiteResult, domain: &str) -> usize {
    result
        .requests
        .iter()
        .filter(|r| r.url.to_ascii_lowercase().contains(domain))
        .count()
}

fn has_axon(result: &SiteResult) -> bool {
    !result.events.is_empty()
        || result
            .platform
            .indicators
            .iter()
            .any(|i| i.starts_with("axon:") || i == "applovin:pixel-endpoint")
}

/// Compact per-site summary for the terminal.
pub fn render_table(run: &RunResult) -> String {
    let width = run
        .iter()
        .map(|r| r.name.chars().count())
        .max()
        .unwrap_or(0)
        .max(4);

    let mut out = format!(
        "{:<width$}  {:<17}  {:^4}  {:^4}  {:^4}  {:^6}  {:>4}  {}\n",
        "Site", "Platform", "GTM", "GA4", "UA", "Pixel", "Reqs", "Error"
    );
    for result in run {
        let flags = &result.analytics;
        out.push_str(&format!(
            "{:<width$}  {:<17}  {:^4}  {:^4}  {:^4}  {:^6}  {:>4}  {}\n",
            result.name,
            result.platform.platform_type,
            mark(flags.get(AnalyticsKind::Gtm)),
            mark(flags.get(AnalyticsKind::Ga4)),
            mark(flags.get(AnalyticsKind::UniversalAnalytics)),
            mark(flags.get(AnalyticsKind::CustomPixel)),
            result.requests.len(),
            result.error.as_deref().unwrap_or("-"),
        ));
    }
    out
}

/// Markdown matrix of platform, analytics, pixel events, parameter
/// propagation and tracker request counts.
pub fn render_matrix(run: &RunResult, generated_at: &str) -> String {
    let headers = [
        "Site",
        "Platform",
        "Shopify",
        "Headless",
        "Axon",
        "GTM",
        "GA",
        "GA4",
        "Custom Pixel",
        "Land",
        "Page View",
        "Page Viewed",
        "ALEID",
        "ALART",
        "Axon Reqs",
        "ALBSS Reqs",
        "AppLovin Reqs",
        "Error",
    ];

    let mut lines = vec![
        "# Site Analysis Matrix".to_string(),
        String::new(),
        format!("Generated {generated_at}"),
        String::new(),
        format!("| {} |", headers.join(" | ")),
        format!("|{}|", vec!["---"; headers.len()].join("|")),
    ];

    for result in run {
        let flags = &result.analytics;
        let row = [
            result.name.replace('|', "\\|"),
            result.platform.platform_type.clone(),
            mark(result.platform.platform_type == "shopify").to_string(),
            mark(result.platform.platform_type == "headless_shopify").to_string(),
            mark(has_axon(result)).to_string(),
            mark(flags.gtm).to_string(),
            mark(flags.universal_analytics).to_string(),
            mark(flags.ga4).to_string(),
            mark(flags.custom_pixel).to_string(),
            mark(has_event(result, "land")).to_string(),
            mark(has_event(result, "page_view")).to_string(),
            mark(has_event(result, "page_viewed")).to_string(),
            mark(propagated(result, "aleid")).to_string(),
            mark(propagated(result, "alart")).to_string(),
            request_count(result, "axon.ai").to_string(),
            request_count(result, "albss.com").to_string(),
            request_count(result, "applovin.com").to_string(),
            result
                .error
                .as_deref()
                .map_or_else(|| "-".to_string(), |e| e.replace('|', "\\|")),
        ];
        lines.push(format!("| {} |", row.join(" | ")));
    }

    lines.extend(
        [
            "",
            "## Summary",
            "",
            "- ✅ = Feature detected",
            "- ❌ = Feature not detected",
            "- Numbers indicate request count",
            "",
            "## Notes",
            "",
            "- Shopify / Headless: detected storefront platform",
            "- Axon: AppLovin/Axon pixel traffic or script detected",
            "- GA: Universal Analytics",
            "- Land / Page View / Page Viewed: decoded pixel events",
            "- ALEID / ALART: URL value echoed by a pixel event",
        ]
        .map(str::to_string),
    );
    lines.push(String::new());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixelprobe::{
        ObservedRequest, PixelEvent, PixelVersion, RequestClass, SiteSpec,
    };
    use std::time::Duration;

    fn sample() -> RunResult {
        let mut shop = SiteResult::failed(&SiteSpec::new("shop", "https://shop.test/"), "")
            .with_error(None);
        shop.platform.platform_type = "shopify".into();
        shop.analytics.gtm = true;
        shop.requests.push(ObservedRequest {
            url: "https://b.applovin.com/v2/pixel".into(),
            method: "POST".into(),
            elapsed: Duration::ZERO,
            classification: RequestClass::Analytics(AnalyticsKind::CustomPixel),
            platform_hits: Vec::new(),
            pixel: None,
        });
        shop.events.push(PixelEvent {
            name: "page_view".into(),
            version: PixelVersion::V2,
            art: Some("abc".into()),
            event_id: None,
        });
        shop.propagation.insert("alart".into(), true);

        let broken = SiteResult::failed(&SiteSpec::new("broken", "nope"), "malformed URL");
        [shop, broken].into_iter().collect()
    }

    #[test]
    fn test_table_lists_every_site() {
        let table = render_table(&sample());
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("shop"));
        assert!(lines[1].contains("shopify"));
        assert!(lines[2].contains("malformed URL"));
    }

    #[test]
    fn test_matrix_rows() {
        let matrix = render_matrix(&sample(), "2026-01-01T00:00:00Z");
        assert!(matrix.starts_with("# Site Analysis Matrix"));
        let shop_row = matrix
            .lines()
            .find(|l| l.starts_with("| shop |"))
            .unwrap();
        let cells: Vec<&str> = shop_row.trim_matches('|').split(" | ").map(str::trim).collect();
        assert_eq!(cells[1], "shopify");
        assert_eq!(cells[2], "✅");
        assert_eq!(cells[3], "❌");
        assert_eq!(cells[4], "✅");
        assert_eq!(cells[10], "✅", "page view");
        assert_eq!(cells[12], "❌", "aleid");
        assert_eq!(cells[13], "✅", "alart");
        assert_eq!(cells[16], "1", "applovin requests");
        assert_eq!(cells[17], "-");
    }
}
