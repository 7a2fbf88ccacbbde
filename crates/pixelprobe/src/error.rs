//! Error taxonomy for the detection engine.
//!
//! Everything except [`ProbeError::Configuration`] is a per-site problem:
//! the run coordinator records it in that site's result and moves on.

/// All errors the engine can report.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("malformed URL {url:?}: {reason}")]
    MalformedUrl { url: String, reason: String },

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("markup fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ProbeError {
    pub fn malformed_url(url: &str, reason: impl Into<String>) -> Self {
        Self::MalformedUrl {
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    pub fn fetch(url: &str, reason: impl Into<String>) -> Self {
        Self::Fetch {
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    /// Navigation that did not reach load-complete before the hard deadline.
    pub fn navigation_timeout(timeout_secs: f64) -> Self {
        Self::Navigation(format!("navigation timed out after {timeout_secs:.1}s"))
    }

    /// Whether this error aborts the whole run instead of a single site.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, ProbeError>;
