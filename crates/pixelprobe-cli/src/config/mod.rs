//! Configuration loading and resolution.

use pixelprobe::{ProbeError, Registry, SiteSpec};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable consulted when no sites file is given.
pub const SITES_FILE_ENV: &str = "PIXELPROBE_SITES_FILE";

/// Resolve the sites file path: explicit flag, then env, then `sites.json`.
pub fn resolve_sites_path(explicit: Option<&str>) -> PathBuf {
    if let Some(path) = explicit {
        return PathBuf::from(path);
    }

    if let Ok(env_path) = std::env::var(SITES_FILE_ENV) {
        if !env_path.trim().is_empty() {
            return PathBuf::from(env_path);
        }
    }

    PathBuf::from("sites.json")
}

#[derive(Deserialize)]
struct SitesFile {
    sites: Option<Vec<SiteRecord>>,
}

#[derive(Deserialize)]
struct SiteRecord {
    name: Option<String>,
    url: Option<String>,
}

/// Read and validate a sites file.
pub fn load_sites(path: &Path) -> Result<Vec<SiteSpec>, ProbeError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ProbeError::Configuration(format!("cannot read sites file {}: {e}", path.display()))
    })?;
    parse_sites(&content)
}

/// Parse `{"sites": [{"name": ..., "url": ...}]}`.
pub fn parse_sites(content: &str) -> Result<Vec<SiteSpec>, ProbeError> {
    let file: SitesFile = serde_json::from_str(content)
        .map_err(|e| ProbeError::Configuration(format!("invalid sites file: {e}")))?;

    let records = file
        .sites
        .ok_or_else(|| ProbeError::Configuration("sites file has no \"sites\" list".into()))?;
    if records.is_empty() {
        return Err(ProbeError::Configuration("site list is empty".into()));
    }

    records
        .into_iter()
        .enumerate()
        .map(|(i, record)| {
            let name = record
                .name
                .filter(|n| !n.trim().is_empty())
                .ok_or_else(|| {
                    ProbeError::Configuration(format!("site #{} is missing a name", i + 1))
                })?;
            let url = record
                .url
                .filter(|u| !u.trim().is_empty())
                .ok_or_else(|| {
                    ProbeError::Configuration(format!("site {name:?} is missing a url"))
                })?;
            Ok(SiteSpec::new(name, url))
        })
        .collect()
}

/// Load the signature registry: a user document if given, else the
/// built-in set, plus any extra custom-pixel patterns.
pub fn load_registry(
    signatures: Option<&Path>,
    custom_pixels: &[String],
) -> Result<Registry, ProbeError> {
    let registry = match signatures {
        Some(path) => {
            let json = std::fs::read_to_string(path).map_err(|e| {
                ProbeError::Configuration(format!(
                    "cannot read signatures file {}: {e}",
                    path.display()
                ))
            })?;
            Registry::from_json(&json)?
        }
        None => Registry::builtin().clone(),
    };
    registry.with_custom_pixels(custom_pixels)
}
