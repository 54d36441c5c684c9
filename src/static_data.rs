//! Static-data bootstrap: an optional, load-once-at-boot override of the
//! daemon's identity and scene entry point.
//!
//! Grounded on `BSwitcher.hpp`'s `static_data` struct ({name, author,
//! version, entry}) and its `BSwitcher(static_data)` constructor, which puts
//! the instance into a permanent `staticMode`; SPEC_FULL.md §3/§9 extend this
//! with the `enabled` gate and the file-backed source (`static_data.json`),
//! read exactly once — edits made after boot are ignored for the process's
//! lifetime, by construction (nothing re-reads the file).

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaticData {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, rename = "entryPath")]
    pub entry_path: String,
    #[serde(default)]
    pub enabled: bool,
}

impl StaticData {
    /// Complete means every field a static-mode boot actually needs is
    /// present; an `enabled:true` record missing `entry_path` is treated as
    /// incomplete and ignored (logged), not as a fatal error.
    pub fn is_complete(&self) -> bool {
        self.enabled && !self.name.is_empty() && !self.entry_path.is_empty()
    }

    /// Reads and parses `static_data.json`. Absence or a parse failure is
    /// not an error: the daemon simply runs without a static-data override.
    pub fn load(path: &Path) -> Option<Self> {
        let text = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str::<Self>(&text) {
            Ok(data) => Some(data),
            Err(err) => {
                log::warn!("failed to parse {}: {err}", path.display());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_without_entry_path() {
        let data = StaticData { enabled: true, name: "x".into(), ..Default::default() };
        assert!(!data.is_complete());
    }

    #[test]
    fn complete_requires_enabled() {
        let data = StaticData {
            enabled: false,
            name: "x".into(),
            entry_path: "/data/powercfg.sh".into(),
            ..Default::default()
        };
        assert!(!data.is_complete());
    }

    #[test]
    fn complete_when_all_present() {
        let data = StaticData {
            enabled: true,
            name: "x".into(),
            author: "y".into(),
            version: "1.0".into(),
            entry_path: "/data/powercfg.sh".into(),
        };
        assert!(data.is_complete());
    }

    #[test]
    fn load_missing_file_is_none() {
        assert!(StaticData::load(Path::new("/nonexistent/static_data.json")).is_none());
    }
}
