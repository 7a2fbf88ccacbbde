//! PixelProbe command line: configuration loading, reports, progress.

pub mod config;
pub mod progress;
pub mod report;
