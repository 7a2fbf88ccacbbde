//! Progress events and broadcast channel for run telemetry.
//!
//! The coordinator emits `ProbeEvent`s as sites start and finish. They flow
//! through a `tokio::sync::broadcast` channel to any subscriber (the CLI
//! progress bar, a JSON log). When no subscriber exists, events are dropped.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProbeEvent {
    /// A run passed validation and is about to dispatch sites.
    RunStarted { sites: usize },
    SiteStarted { site: String, url: String },
    /// One site's result is final.
    SiteFinished {
        site: String,
        platform: String,
        requests: usize,
        error: Option<String>,
        elapsed_ms: u64,
    },
    RunFinished {
        sites: usize,
        failed: usize,
        elapsed_ms: u64,
    },
}

/// Sender handle for emitting progress events.
pub type ProbeEventSender = tokio::sync::broadcast::Sender<ProbeEvent>;

/// Receiver handle for consuming progress events.
pub type ProbeEventReceiver = tokio::sync::broadcast::Receiver<ProbeEvent>;

/// Create a new event channel with a bounded buffer.
pub fn channel() -> (ProbeEventSender, ProbeEventReceiver) {
    tokio::sync::broadcast::channel(256)
}

/// Emit an event, ignoring send errors (which occur when nobody listens).
pub fn emit(tx: &Option<ProbeEventSender>, event: ProbeEvent) {
    if let Some(sender) = tx {
        let _ = sender.send(event);
    }
}
