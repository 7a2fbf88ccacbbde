//! Browser session abstraction for live observation.
//!
//! Defines the `SessionProvider` and `BrowserSession` traits that abstract
//! over the browser engine (currently Chromium via chromiumoxide). Captured
//! requests and request failures are delivered as messages on an `mpsc`
//! inbox rather than through callbacks, so arrival order is the channel order.

pub mod chromium;

use crate::types::{FailedRequest, RawRequest};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// One network notification from a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// An outgoing request.
    Request(RawRequest),
    /// A request that failed at the network level.
    Failed(FailedRequest),
}

/// Inbox of network events captured by one session.
pub type RequestInbox = mpsc::UnboundedReceiver<NetworkEvent>;

/// A browser engine that hands out one session (tab) per site.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Open a fresh, isolated session.
    async fn open_session(&self) -> Result<Box<dyn BrowserSession>>;
    /// Number of sessions opened and not yet closed.
    fn active_sessions(&self) -> usize;
}

/// One browser tab. Must be closed with [`BrowserSession::close`].
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Start capturing outgoing requests. Call before `navigate` to see
    /// requests from navigation start.
    async fn requests(&mut self) -> Result<RequestInbox>;
    /// Navigate and resolve once the page's load event fires.
    async fn navigate(&mut self, url: &str) -> Result<()>;
    /// Close the session.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// A provider used when Chromium is unavailable.
///
/// Static analysis works without a browser; every live observation through
/// this provider fails and is recorded as a per-site navigation error.
pub struct NoopProvider;

#[async_trait]
impl SessionProvider for NoopProvider {
    async fn open_session(&self) -> Result<Box<dyn BrowserSession>> {
        anyhow::bail!("browser not available (static analysis only)")
    }

    fn active_sessions(&self) -> usize {
        0
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted in-process provider for observer and coordinator tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// What a scripted page does when navigated to.
    #[derive(Debug, Clone, Default)]
    pub struct Script {
        /// Load event delay; `None` means the page never finishes loading.
        pub load_after: Option<Duration>,
        /// Fail navigation with this message once `load_after` elapses.
        pub fail_navigation: Option<String>,
        /// Events emitted at the given offsets from navigation start.
        pub requests: Vec<(Duration, NetworkEvent)>,
        pub panic_on_navigate: bool,
    }

    impl Script {
        pub fn loads_after(ms: u64) -> Self {
            Self {
                load_after: Some(Duration::from_millis(ms)),
                ..Self::default()
            }
        }

        pub fn request_at(mut self, ms: u64, request: RawRequest) -> Self {
            self.requests
                .push((Duration::from_millis(ms), NetworkEvent::Request(request)));
            self
        }

        pub fn failure_at(mut self, ms: u64, failed: FailedRequest) -> Self {
            self.requests
                .push((Duration::from_millis(ms), NetworkEvent::Failed(failed)));
            self
        }
    }

    #[derive(Debug, Default)]
    pub struct Counters {
        pub opened: AtomicUsize,
        pub closed: AtomicUsize,
        pub subscribed: AtomicUsize,
    }

    #[derive(Default)]
    struct Shared {
        scripts: Mutex<HashMap<String, Script>>,
        counters: Counters,
        hang_on_open: AtomicBool,
        hang_on_close: AtomicBool,
    }

    /// Serves scripts by URL prefix; unknown URLs load after 10 ms with no
    /// traffic. Clones share scripts and counters.
    #[derive(Clone, Default)]
    pub struct ScriptedProvider {
        shared: Arc<Shared>,
    }

    impl ScriptedProvider {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_script(self, url_prefix: &str, script: Script) -> Self {
            self.shared
                .scripts
                .lock()
                .unwrap()
                .insert(url_prefix.to_string(), script);
            self
        }

        /// `open_session` never resolves.
        pub fn hanging_open(self) -> Self {
            self.shared.hang_on_open.store(true, Ordering::SeqCst);
            self
        }

        /// `close` never resolves.
        pub fn hanging_close(self) -> Self {
            self.shared.hang_on_close.store(true, Ordering::SeqCst);
            self
        }

        fn script_for(&self, url: &str) -> Script {
            self.shared
                .scripts
                .lock()
                .unwrap()
                .iter()
                .find(|(prefix, _)| url.starts_with(prefix.as_str()))
                .map(|(_, s)| s.clone())
                .unwrap_or_else(|| Script::loads_after(10))
        }

        pub fn opened(&self) -> usize {
            self.shared.counters.opened.load(Ordering::SeqCst)
        }

        pub fn closed(&self) -> usize {
            self.shared.counters.closed.load(Ordering::SeqCst)
        }

        pub fn subscribed(&self) -> usize {
            self.shared.counters.subscribed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SessionProvider for ScriptedProvider {
        async fn open_session(&self) -> Result<Box<dyn BrowserSession>> {
            if self.shared.hang_on_open.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.shared.counters.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedSession {
                provider: self.clone(),
                tx: None,
                emitter: None,
            }))
        }

        fn active_sessions(&self) -> usize {
            self.opened() - self.closed()
        }
    }

    struct ScriptedSession {
        provider: ScriptedProvider,
        tx: Option<mpsc::UnboundedSender<NetworkEvent>>,
        emitter: Option<tokio::task::JoinHandle<()>>,
    }

    #[async_trait]
    impl BrowserSession for ScriptedSession {
        async fn requests(&mut self) -> Result<RequestInbox> {
            self.provider.shared.counters.subscribed.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::unbounded_channel();
            self.tx = Some(tx);
            Ok(rx)
        }

        async fn navigate(&mut self, url: &str) -> Result<()> {
            let script = self.provider.script_for(url);
            if script.panic_on_navigate {
                panic!("scripted navigation panic for {url}");
            }

            if let Some(tx) = self.tx.clone() {
                let requests = script.requests.clone();
                self.emitter = Some(tokio::spawn(async move {
                    let start = tokio::time::Instant::now();
                    for (offset, request) in requests {
                        tokio::time::sleep_until(start + offset).await;
                        if tx.send(request).is_err() {
                            return;
                        }
                    }
                }));
            }

            match script.load_after {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending::<()>().await,
            }
            match script.fail_navigation {
                Some(message) => anyhow::bail!(message),
                None => Ok(()),
            }
        }

        async fn close(self: Box<Self>) -> Result<()> {
            if let Some(emitter) = &self.emitter {
                emitter.abort();
            }
            self.provider.shared.counters.closed.fetch_add(1, Ordering::SeqCst);
            if self.provider.shared.hang_on_close.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            Ok(())
        }
    }
}
