//! Run coordination: one isolated unit of work per site, bounded
//! parallelism, results in configuration order.
//!
//! Each site runs in its own `tokio` task so a panic is contained to that
//! site's result. Live observation gets a task of its own as well, so a
//! panicking browser session still leaves the static evidence in place.
//! Tasks are driven through `buffered(concurrency)`, which caps simultaneous
//! browser sessions and yields results in input order.

use crate::browser::SessionProvider;
use crate::classifier::RequestClassifier;
use crate::error::{ProbeError, Result};
use crate::events::{emit, ProbeEvent, ProbeEventSender};
use crate::fetch::MarkupSource;
use crate::fusion::fuse;
use crate::observer::{LiveObserver, Observation, ObserveSettings};
use crate::signatures::Registry;
use crate::static_analysis::{analyze_static, parse_site_url};
use crate::types::{RunResult, SiteResult, SiteSpec};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Query appended by `seed_tracking_params` when a URL carries neither key.
const SEED_PARAMS: [(&str, &str); 2] = [
    ("alart", "test_identifier1234"),
    ("aleid", "test_identifier5678"),
];

/// Options for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    /// Skip live observation entirely.
    pub static_only: bool,
    /// Navigate and wait, but record no requests.
    pub no_intercept: bool,
    /// Settle wait after the load event, in seconds.
    pub wait_seconds: f64,
    /// Hard per-site observation bound, in seconds.
    pub timeout_seconds: f64,
    /// Maximum sites analysed at once.
    pub concurrency: usize,
    /// GET each page's markup for static analysis.
    pub fetch_markup: bool,
    /// Append test `alart`/`aleid` values to URLs that carry neither.
    pub seed_tracking_params: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            static_only: false,
            no_intercept: false,
            wait_seconds: 5.0,
            timeout_seconds: 30.0,
            concurrency: 2,
            fetch_markup: true,
            seed_tracking_params: false,
        }
    }
}

impl RunOptions {
    pub fn validate(&self) -> Result<()> {
        if Duration::try_from_secs_f64(self.wait_seconds).is_err() {
            return Err(ProbeError::Configuration(format!(
                "wait time must be a non-negative number of seconds, got {}",
                self.wait_seconds
            )));
        }
        if Duration::try_from_secs_f64(self.timeout_seconds).is_err()
            || self.timeout_seconds <= self.wait_seconds
        {
            return Err(ProbeError::Configuration(format!(
                "timeout ({}s) must be greater than the wait time ({}s)",
                self.timeout_seconds, self.wait_seconds
            )));
        }
        if self.concurrency == 0 {
            return Err(ProbeError::Configuration(
                "concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }

    fn observe_settings(&self) -> ObserveSettings {
        ObserveSettings {
            wait: Duration::from_secs_f64(self.wait_seconds),
            timeout: Duration::from_secs_f64(self.timeout_seconds),
            intercept: !self.no_intercept,
        }
    }
}

/// Reject a site list that cannot start a run.
pub fn validate_sites(sites: &[SiteSpec]) -> Result<()> {
    if sites.is_empty() {
        return Err(ProbeError::Configuration("site list is empty".into()));
    }
    for (i, site) in sites.iter().enumerate() {
        if site.name.trim().is_empty() {
            return Err(ProbeError::Configuration(format!(
                "site #{} is missing a name",
                i + 1
            )));
        }
        if site.url.trim().is_empty() {
            return Err(ProbeError::Configuration(format!(
                "site {:?} is missing a url",
                site.name
            )));
        }
    }
    Ok(())
}

/// Append the seed tracking values unless the URL already has one of them.
/// Unparsable URLs are returned untouched so they fail later as malformed.
pub fn seed_tracking_params(url: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(url) else {
        return url.to_string();
    };
    if parsed
        .query_pairs()
        .any(|(k, _)| SEED_PARAMS.iter().any(|(key, _)| k == *key))
    {
        return url.to_string();
    }
    {
        let mut query = parsed.query_pairs_mut();
        for (key, value) in SEED_PARAMS {
            query.append_pair(key, value);
        }
    }
    parsed.to_string()
}

pub struct Coordinator {
    registry: Arc<Registry>,
    markup: Arc<dyn MarkupSource>,
    provider: Arc<dyn SessionProvider>,
    events: Option<ProbeEventSender>,
}

impl Coordinator {
    pub fn new(
        registry: Arc<Registry>,
        markup: Arc<dyn MarkupSource>,
        provider: Arc<dyn SessionProvider>,
    ) -> Self {
        Self {
            registry,
            markup,
            provider,
            events: None,
        }
    }

    /// Broadcast progress events on `tx`.
    pub fn with_events(mut self, tx: ProbeEventSender) -> Self {
        self.events = Some(tx);
        self
    }

    /// Analyse every site. Only configuration problems fail the run; every
    /// per-site failure is recorded in that site's result.
    pub async fn run(&self, sites: &[SiteSpec], options: &RunOptions) -> Result<RunResult> {
        options.validate()?;
        validate_sites(sites)?;

        let started = Instant::now();
        info!(sites = sites.len(), concurrency = options.concurrency, "starting run");
        emit(&self.events, ProbeEvent::RunStarted { sites: sites.len() });

        let worker = Arc::new(SiteWorker {
            registry: Arc::clone(&self.registry),
            markup: Arc::clone(&self.markup),
            observer: LiveObserver::new(
                Arc::clone(&self.provider),
                RequestClassifier::new(Arc::clone(&self.registry)),
            ),
            options: options.clone(),
        });

        let results: Vec<SiteResult> = stream::iter(sites.iter().cloned())
            .map(|site| {
                let worker = Arc::clone(&worker);
                let events = self.events.clone();
                async move {
                    let site_started = Instant::now();
                    emit(
                        &events,
                        ProbeEvent::SiteStarted {
                            site: site.name.clone(),
                            url: site.url.clone(),
                        },
                    );

                    let result = match tokio::spawn(Arc::clone(&worker).analyze(site.clone())).await {
                        Ok(result) => result,
                        Err(e) => {
                            warn!(site = %site.name, error = %e, "site task aborted");
                            SiteResult::failed(&site, format!("analysis task failed: {e}"))
                        }
                    };

                    emit(
                        &events,
                        ProbeEvent::SiteFinished {
                            site: result.name.clone(),
                            platform: result.platform.platform_type.clone(),
                            requests: result.requests.len(),
                            error: result.error.clone(),
                            elapsed_ms: site_started.elapsed().as_millis() as u64,
                        },
                    );
                    result
                }
            })
            .buffered(options.concurrency)
            .collect()
            .await;

        let run: RunResult = results.into_iter().collect();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            sites = run.len(),
            failed = run.error_count(),
            elapsed_ms,
            "run complete"
        );
        emit(
            &self.events,
            ProbeEvent::RunFinished {
                sites: run.len(),
                failed: run.error_count(),
                elapsed_ms,
            },
        );
        Ok(run)
    }
}

/// Shared, read-only state for per-site tasks.
struct SiteWorker {
    registry: Arc<Registry>,
    markup: Arc<dyn MarkupSource>,
    observer: LiveObserver,
    options: RunOptions,
}

impl SiteWorker {
    async fn analyze(self: Arc<Self>, site: SiteSpec) -> SiteResult {
        let site = if self.options.seed_tracking_params {
            SiteSpec::new(site.name, seed_tracking_params(&site.url))
        } else {
            site
        };

        if let Err(e) = parse_site_url(&site.url) {
            warn!(site = %site.name, error = %e, "skipping site");
            return SiteResult::failed(&site, e.to_string());
        }

        let mut problems: Vec<String> = Vec::new();

        let markup = if self.options.fetch_markup {
            match self.markup.fetch(&site.url).await {
                Ok(markup) => Some(markup),
                Err(e) => {
                    warn!(site = %site.name, error = %e, "markup unavailable");
                    problems.push(format!("{e}; static analysis used the URL only"));
                    None
                }
            }
        } else {
            None
        };

        let registry = Arc::clone(&self.registry);
        let static_site = site.clone();
        let evidence = match tokio::task::spawn_blocking(move || {
            analyze_static(&registry, &static_site, markup.as_deref())
        })
        .await
        {
            Ok(Ok(evidence)) => evidence,
            Ok(Err(e)) => return SiteResult::failed(&site, e.to_string()),
            Err(e) => return SiteResult::failed(&site, format!("static analysis failed: {e}")),
        };

        let observation = if self.options.static_only {
            Observation::default()
        } else {
            let worker = Arc::clone(&self);
            let observed_site = site.clone();
            let observe = tokio::spawn(async move {
                worker
                    .observer
                    .observe(&observed_site, worker.options.observe_settings())
                    .await
            });
            match observe.await {
                Ok(Ok(observation)) => observation,
                Ok(Err(failure)) => {
                    warn!(site = %site.name, error = %failure.error, "live observation failed");
                    problems.push(failure.error.to_string());
                    failure.partial
                }
                Err(e) => {
                    warn!(site = %site.name, error = %e, "live observation aborted");
                    problems.push(format!("live observation failed: {e}"));
                    Observation::default()
                }
            }
        };

        let error = (!problems.is_empty()).then(|| problems.join("; "));
        let mut result = fuse(&self.registry, &site, &evidence, observation.requests);
        result.failed_requests = observation.failed;
        result.with_error(error)
    }
}
