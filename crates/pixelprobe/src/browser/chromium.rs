//! Chromium session provider using chromiumoxide.

use super::{BrowserSession, NetworkEvent, RequestInbox, SessionProvider};
use crate::types::{FailedRequest, RawRequest};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    EventLoadingFailed, EventRequestWillBeSent, GetRequestPostDataParams,
};
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Find the Chromium binary path.
pub fn find_chromium() -> Option<PathBuf> {
    // 1. PIXELPROBE_CHROMIUM_PATH env
    if let Ok(p) = std::env::var("PIXELPROBE_CHROMIUM_PATH") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    // 2. ~/.pixelprobe/chromium/
    if let Some(home) = dirs::home_dir() {
        let root = home.join(".pixelprobe/chromium");
        let candidates = if cfg!(target_os = "macos") {
            vec![
                root.join("chrome-mac-arm64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing"),
                root.join("chrome-mac-x64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing"),
                root.join("chrome"),
            ]
        } else {
            vec![root.join("chrome-linux64/chrome"), root.join("chrome")]
        };
        if let Some(found) = candidates.into_iter().find(|c| c.exists()) {
            return Some(found);
        }
    }

    // 3. System PATH
    for name in ["google-chrome", "chromium", "chromium-browser"] {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
    }

    // 4. Common macOS location
    if cfg!(target_os = "macos") {
        let common = PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome");
        if common.exists() {
            return Some(common);
        }
    }

    None
}

/// One shared headless Chromium; each session is a new page.
pub struct ChromiumProvider {
    browser: Browser,
    handler: JoinHandle<()>,
    active_count: Arc<AtomicUsize>,
}

impl ChromiumProvider {
    /// Launch a headless Chromium instance.
    pub async fn launch() -> Result<Self> {
        let chrome_path = find_chromium()
            .context("Chromium not found; set PIXELPROBE_CHROMIUM_PATH or install Chrome")?;
        debug!(path = %chrome_path.display(), "launching chromium");

        let config = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-background-networking")
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("failed to launch Chromium")?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "chromium handler event error");
                }
            }
        });

        Ok(Self {
            browser,
            handler,
            active_count: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Close the browser process.
    pub async fn shutdown(mut self) -> Result<()> {
        self.browser.close().await.context("failed to close Chromium")?;
        let _ = self.browser.wait().await;
        self.handler.abort();
        Ok(())
    }
}

#[async_trait]
impl SessionProvider for ChromiumProvider {
    async fn open_session(&self) -> Result<Box<dyn BrowserSession>> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .context("failed to create new page")?;

        self.active_count.fetch_add(1, Ordering::Relaxed);

        Ok(Box::new(ChromiumSession {
            page,
            forwarder: None,
            closed: false,
            active_count: Arc::clone(&self.active_count),
        }))
    }

    fn active_sessions(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }
}

/// A single Chromium page.
pub struct ChromiumSession {
    page: Page,
    forwarder: Option<JoinHandle<()>>,
    closed: bool,
    active_count: Arc<AtomicUsize>,
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn requests(&mut self) -> Result<RequestInbox> {
        let sent = self
            .page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .context("failed to subscribe to network events")?;
        let failed = self
            .page
            .event_listener::<EventLoadingFailed>()
            .await
            .context("failed to subscribe to network failures")?;

        let mut events = futures::stream::select(sent.map(Cdp::Sent), failed.map(Cdp::Failed));
        let (tx, rx) = mpsc::unbounded_channel();
        let page = self.page.clone();
        self.forwarder = Some(tokio::spawn(async move {
            // Failure events carry only the request id.
            let mut in_flight: HashMap<String, (String, String)> = HashMap::new();
            while let Some(event) = events.next().await {
                let message = match event {
                    Cdp::Sent(event) => {
                        let request = &event.request;
                        in_flight.insert(
                            event.request_id.inner().clone(),
                            (request.url.clone(), request.method.clone()),
                        );
                        let mut raw = RawRequest::new(request.url.clone(), request.method.clone());
                        raw.headers = header_map(&request.headers);
                        if request.has_post_data == Some(true) {
                            match page
                                .execute(GetRequestPostDataParams::new(event.request_id.clone()))
                                .await
                            {
                                Ok(resp) => raw.body = Some(resp.result.post_data.clone()),
                                Err(e) => debug!(url = %raw.url, error = %e, "post data unavailable"),
                            }
                        }
                        NetworkEvent::Request(raw)
                    }
                    Cdp::Failed(event) => {
                        let Some((url, method)) = in_flight.remove(event.request_id.inner()) else {
                            continue;
                        };
                        NetworkEvent::Failed(FailedRequest::new(url, method, event.error_text.clone()))
                    }
                };
                if tx.send(message).is_err() {
                    break;
                }
            }
        }));
        Ok(rx)
    }

    async fn navigate(&mut self, url: &str) -> Result<()> {
        // goto resolves once the navigation has committed and loaded.
        self.page
            .goto(url)
            .await
            .with_context(|| format!("failed to load {url}"))?;
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        self.closed = true;
        self.active_count.fetch_sub(1, Ordering::Relaxed);
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.page.clone().close().await.context("failed to close page")?;
        Ok(())
    }
}

enum Cdp {
    Sent(Arc<EventRequestWillBeSent>),
    Failed(Arc<EventLoadingFailed>),
}

/// Flatten CDP request headers into lowercased name/value pairs.
fn header_map<T: serde::Serialize>(headers: &T) -> BTreeMap<String, String> {
    let Ok(serde_json::Value::Object(map)) = serde_json::to_value(headers) else {
        return BTreeMap::new();
    };
    map.into_iter()
        .map(|(name, value)| {
            let value = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (name.to_ascii_lowercase(), value)
        })
        .collect()
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Dropped without close(), e.g. a cancelled task.
        self.active_count.fetch_sub(1, Ordering::Relaxed);
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let page = self.page.clone();
            handle.spawn(async move {
                if let Err(e) = page.close().await {
                    warn!(error = %e, "failed to close leaked page");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_chromium_honours_env() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("chrome");
        std::fs::write(&fake, b"").unwrap();
        std::env::set_var("PIXELPROBE_CHROMIUM_PATH", &fake);
        assert_eq!(find_chromium(), Some(fake));
        std::env::remove_var("PIXELPROBE_CHROMIUM_PATH");
    }

    #[test]
    fn test_header_map_lowercases_names() {
        let headers = serde_json::json!({
            "X-Shopify-Storefront-Access-Token": "tok",
            "Content-Length": 12
        });
        let map = header_map(&headers);
        assert_eq!(map["x-shopify-storefront-access-token"], "tok");
        assert_eq!(map["content-length"], "12");
        assert!(header_map(&"not an object").is_empty());
    }

    #[tokio::test]
    #[ignore] // Requires Chromium to be installed
    async fn test_chromium_captures_requests() {
        let provider = ChromiumProvider::launch()
            .await
            .expect("failed to launch chromium");
        let mut session = provider
            .open_session()
            .await
            .expect("failed to open session");
        let mut inbox = session.requests().await.expect("failed to subscribe");

        session
            .navigate("data:text/html,<img src='https://example.com/pixel.gif'>")
            .await
            .expect("navigation failed");

        let first = tokio::time::timeout(std::time::Duration::from_secs(5), inbox.recv())
            .await
            .expect("no request captured")
            .expect("inbox closed");
        match first {
            NetworkEvent::Request(raw) => {
                assert!(raw.url.starts_with("data:") || raw.url.contains("example.com"))
            }
            NetworkEvent::Failed(failed) => assert!(failed.url.contains("example.com")),
        }

        session.close().await.expect("close failed");
        assert_eq!(provider.active_sessions(), 0);
        provider.shutdown().await.expect("shutdown failed");
    }
}
