//! Live observation: load a site in a browser session and classify every
//! outgoing request until the page settles or the hard deadline passes.
//!
//! The hard deadline starts before the session is opened, so a browser that
//! never hands out a page still fails the site on time.

use crate::browser::{BrowserSession, NetworkEvent, RequestInbox, SessionProvider};
use crate::classifier::RequestClassifier;
use crate::error::ProbeError;
use crate::types::{FailedRequest, ObservedRequest, SiteSpec};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, timeout, timeout_at, Instant};
use tracing::{debug, warn};

/// Upper bound on closing a session once observation is over.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Stand-in deadline for timeouts too large to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Timing and capture settings for one observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObserveSettings {
    /// Settle wait after the load event.
    pub wait: Duration,
    /// Hard upper bound from the start of the observation.
    pub timeout: Duration,
    /// When false, navigate and wait but never open the request inbox.
    pub intercept: bool,
}

/// Everything captured from one page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    /// Classified requests in arrival order.
    pub requests: Vec<ObservedRequest>,
    /// Failed tracker requests in arrival order.
    pub failed: Vec<FailedRequest>,
}

/// A failed observation, with whatever was captured before it failed.
#[derive(Debug, Clone, PartialEq)]
pub struct ObserveFailure {
    pub error: ProbeError,
    pub partial: Observation,
}

impl ObserveFailure {
    fn new(error: ProbeError) -> Self {
        Self {
            error,
            partial: Observation::default(),
        }
    }
}

/// `start + by`, or a far-future instant when that overflows.
fn deadline(start: Instant, by: Duration) -> Instant {
    start
        .checked_add(by)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

pub struct LiveObserver {
    provider: Arc<dyn SessionProvider>,
    classifier: RequestClassifier,
}

impl LiveObserver {
    pub fn new(provider: Arc<dyn SessionProvider>, classifier: RequestClassifier) -> Self {
        Self {
            provider,
            classifier,
        }
    }

    /// Observe one site. The session is closed on every path out.
    pub async fn observe(
        &self,
        site: &SiteSpec,
        settings: ObserveSettings,
    ) -> Result<Observation, ObserveFailure> {
        let start = Instant::now();
        let hard_deadline = deadline(start, settings.timeout);
        let timed_out =
            || ObserveFailure::new(ProbeError::navigation_timeout(settings.timeout.as_secs_f64()));

        let mut session = match timeout_at(hard_deadline, self.provider.open_session()).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                return Err(ObserveFailure::new(ProbeError::Navigation(format!(
                    "could not open browser session: {e:#}"
                ))))
            }
            Err(_) => return Err(timed_out()),
        };

        let outcome = self
            .drive(session.as_mut(), site, settings, start, hard_deadline)
            .await;

        match timeout(CLOSE_TIMEOUT, session.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(site = %site.name, error = %e, "failed to close browser session"),
            Err(_) => warn!(site = %site.name, "browser session did not close in time"),
        }
        outcome
    }

    async fn drive(
        &self,
        session: &mut dyn BrowserSession,
        site: &SiteSpec,
        settings: ObserveSettings,
        start: Instant,
        hard_deadline: Instant,
    ) -> Result<Observation, ObserveFailure> {
        let timed_out =
            || ProbeError::navigation_timeout(settings.timeout.as_secs_f64());

        let mut inbox = if settings.intercept {
            match timeout_at(hard_deadline, session.requests()).await {
                Ok(Ok(rx)) => Some(rx),
                Ok(Err(e)) => {
                    return Err(ObserveFailure::new(ProbeError::Navigation(format!(
                        "could not capture requests: {e:#}"
                    ))))
                }
                Err(_) => return Err(ObserveFailure::new(timed_out())),
            }
        } else {
            None
        };

        let mut settle_deadline: Option<Instant> = None;
        let mut observed = Observation::default();

        let navigation = session.navigate(&site.url);
        tokio::pin!(navigation);

        loop {
            tokio::select! {
                biased;

                _ = sleep_until(settle_deadline.unwrap_or(hard_deadline)) => {
                    if settle_deadline.is_none() {
                        self.drain(&mut inbox, start, &mut observed);
                        return Err(ObserveFailure {
                            error: timed_out(),
                            partial: observed,
                        });
                    }
                    break;
                }

                loaded = &mut navigation, if settle_deadline.is_none() => {
                    if let Err(e) = loaded {
                        self.drain(&mut inbox, start, &mut observed);
                        return Err(ObserveFailure {
                            error: ProbeError::Navigation(format!("{e:#}")),
                            partial: observed,
                        });
                    }
                    debug!(site = %site.name, elapsed_ms = start.elapsed().as_millis() as u64, "page loaded");
                    settle_deadline = Some(deadline(Instant::now(), settings.wait).min(hard_deadline));
                }

                event = recv_next(&mut inbox) => {
                    self.record(event, start, &mut observed);
                }
            }
        }

        self.drain(&mut inbox, start, &mut observed);
        debug!(
            site = %site.name,
            requests = observed.requests.len(),
            failed = observed.failed.len(),
            "observation complete"
        );
        Ok(observed)
    }

    fn record(&self, event: NetworkEvent, start: Instant, observed: &mut Observation) {
        match event {
            NetworkEvent::Request(raw) => observed
                .requests
                .push(self.classifier.classify(&raw, start.elapsed())),
            NetworkEvent::Failed(failed) => {
                if self.classifier.is_relevant_failure(&failed) {
                    debug!(url = %failed.url, error = %failed.error, "tracker request failed");
                    observed.failed.push(failed);
                }
            }
        }
    }

    /// Record anything already queued when the observation ends.
    fn drain(&self, inbox: &mut Option<RequestInbox>, start: Instant, observed: &mut Observation) {
        if let Some(rx) = inbox {
            while let Ok(event) = rx.try_recv() {
                self.record(event, start, observed);
            }
        }
    }
}

async fn recv_next(inbox: &mut Option<RequestInbox>) -> NetworkEvent {
    match inbox {
        Some(rx) => match rx.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}
