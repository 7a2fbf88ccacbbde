//! PixelProbe: detection engine for storefront tracking.
//!
//! Given a list of sites, decides which e-commerce platform each runs on,
//! which analytics integrations it carries, and whether the tracking
//! parameters in its URL reach the pixel events it sends.

pub mod browser;
pub mod classifier;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod fetch;
pub mod fusion;
pub mod observer;
pub mod pixel;
pub mod signatures;
pub mod static_analysis;
pub mod types;

pub use browser::chromium::{find_chromium, ChromiumProvider};
pub use browser::{BrowserSession, NetworkEvent, NoopProvider, SessionProvider};
pub use classifier::RequestClassifier;
pub use coordinator::{Coordinator, RunOptions};
pub use error::{ProbeError, Result};
pub use events::{ProbeEvent, ProbeEventReceiver, ProbeEventSender};
pub use fetch::{HttpClient, MarkupSource};
pub use fusion::fuse;
pub use observer::{LiveObserver, Observation, ObserveSettings};
pub use signatures::Registry;
pub use static_analysis::{analyze_static, StaticEvidence};
pub use types::*;
