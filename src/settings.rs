//! User preference persistence
//!
//! The only persisted preference is the manual latency offset. It is stored
//! in dconf under `/com/layerdeck/recorder/` by default, or in a small JSON
//! file when dconf is not wanted (tests, headless machines).

use log::error;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};

const DCONF_PATH: &str = "/com/layerdeck/recorder/";

/// Keys for dconf settings
mod keys {
    pub const MANUAL_LATENCY_OFFSET: &str = "manual-latency-offset";
}

/// Store for user-adjustable preferences
pub trait Preferences: Send {
    /// Persisted manual latency offset in ms, if one was ever saved
    fn manual_offset_ms(&self) -> Option<i64>;

    fn set_manual_offset_ms(&mut self, offset_ms: i64) -> EngineResult<()>;
}

/// Preferences stored in dconf
#[derive(Debug, Default)]
pub struct DconfPreferences;

impl DconfPreferences {
    pub fn new() -> Self {
        Self
    }
}

impl Preferences for DconfPreferences {
    fn manual_offset_ms(&self) -> Option<i64> {
        let key = format!("{}{}", DCONF_PATH, keys::MANUAL_LATENCY_OFFSET);
        dconf_rs::get_string(&key)
            .ok()
            .and_then(|value| value.trim().trim_matches('\'').parse().ok())
    }

    fn set_manual_offset_ms(&mut self, offset_ms: i64) -> EngineResult<()> {
        let key = format!("{}{}", DCONF_PATH, keys::MANUAL_LATENCY_OFFSET);
        dconf_rs::set_string(&key, &offset_ms.to_string()).map_err(|e| {
            error!("Failed to save latency offset to dconf: {}", e);
            EngineError::Preferences(e.to_string())
        })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PreferencesFile {
    #[serde(default)]
    manual_latency_offset_ms: Option<i64>,
}

/// Preferences stored as pretty JSON in a single file
#[derive(Debug)]
pub struct JsonPreferences {
    path: PathBuf,
    values: PreferencesFile,
}

impl JsonPreferences {
    /// Open the store at `path`. A missing file starts empty.
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref().to_path_buf();
        let values = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            serde_json::from_str(&contents)
                .map_err(|e| EngineError::Preferences(format!("{}: {}", path.display(), e)))?
        } else {
            PreferencesFile::default()
        };
        Ok(Self { path, values })
    }

    /// Default location under the user's config dir
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("layerdeck")
            .join("preferences.json")
    }

    fn save(&self) -> EngineResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(&self.values)?)?;
        Ok(())
    }
}

impl Preferences for JsonPreferences {
    fn manual_offset_ms(&self) -> Option<i64> {
        self.values.manual_latency_offset_ms
    }

    fn set_manual_offset_ms(&mut self, offset_ms: i64) -> EngineResult<()> {
        self.values.manual_latency_offset_ms = Some(offset_ms);
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_preferences_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("prefs.json");

        let mut prefs = JsonPreferences::open(&path).unwrap();
        assert_eq!(prefs.manual_offset_ms(), None);
        prefs.set_manual_offset_ms(-120).unwrap();

        let reopened = JsonPreferences::open(&path).unwrap();
        assert_eq!(reopened.manual_offset_ms(), Some(-120));
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            JsonPreferences::open(&path),
            Err(EngineError::Preferences(_))
        ));
    }
}
