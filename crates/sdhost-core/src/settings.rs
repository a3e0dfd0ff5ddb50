//! User settings store.
//!
//! Generation preferences (per mode) and UI preferences are opaque JSON
//! sub-documents owned by the Web UI; the server persists them atomically
//! and never interprets the inner shape. User preferences apply on top of
//! architecture defaults, so reset simply wipes the overrides.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationPreferences {
    pub txt2img: Value,
    pub img2img: Value,
    pub txt2vid: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiPreferences {
    pub desktop_notifications: bool,
    pub theme: String,
    pub theme_custom: Value,
}

impl Default for UiPreferences {
    fn default() -> Self {
        Self {
            desktop_notifications: true,
            theme: "default".into(),
            theme_custom: Value::Null,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub generation: GenerationPreferences,
    pub ui: UiPreferences,
}

#[derive(Debug)]
pub struct SettingsStore {
    file: PathBuf,
    settings: Mutex<Settings>,
}

impl SettingsStore {
    /// Load `user_settings.json` from `dir`, falling back to defaults when
    /// absent or unreadable.
    pub fn new(dir: &Path) -> Self {
        let file = dir.join("user_settings.json");
        let settings = match std::fs::read_to_string(&file) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "user settings unreadable; starting fresh");
                    Settings::default()
                }
            },
            Err(_) => Settings::default(),
        };
        Self {
            file,
            settings: Mutex::new(settings),
        }
    }

    pub fn settings(&self) -> Settings {
        self.settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_settings(&self, settings: Settings) {
        let mut guard = self.settings.lock().unwrap_or_else(|e| e.into_inner());
        *guard = settings;
        self.persist(&guard);
    }

    /// Preferences for one generation mode (`txt2img | img2img | txt2vid`).
    pub fn generation_preferences(&self, mode: &str) -> Option<Value> {
        let guard = self.settings.lock().unwrap_or_else(|e| e.into_inner());
        match mode {
            "txt2img" => Some(guard.generation.txt2img.clone()),
            "img2img" => Some(guard.generation.img2img.clone()),
            "txt2vid" => Some(guard.generation.txt2vid.clone()),
            _ => None,
        }
    }

    /// Returns false for an unknown mode.
    pub fn set_generation_preferences(&self, mode: &str, preferences: Value) -> bool {
        let mut guard = self.settings.lock().unwrap_or_else(|e| e.into_inner());
        match mode {
            "txt2img" => guard.generation.txt2img = preferences,
            "img2img" => guard.generation.img2img = preferences,
            "txt2vid" => guard.generation.txt2vid = preferences,
            _ => return false,
        }
        self.persist(&guard);
        true
    }

    pub fn all_generation_preferences(&self) -> Value {
        let guard = self.settings.lock().unwrap_or_else(|e| e.into_inner());
        json!({
            "txt2img": guard.generation.txt2img,
            "img2img": guard.generation.img2img,
            "txt2vid": guard.generation.txt2vid,
        })
    }

    pub fn ui_preferences(&self) -> UiPreferences {
        self.settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .ui
            .clone()
    }

    pub fn set_ui_preferences(&self, preferences: UiPreferences) {
        let mut guard = self.settings.lock().unwrap_or_else(|e| e.into_inner());
        guard.ui = preferences;
        self.persist(&guard);
    }

    /// Drop every user override; architecture defaults take effect again.
    pub fn reset(&self) {
        let mut guard = self.settings.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Settings::default();
        self.persist(&guard);
        info!("user settings reset");
    }

    fn persist(&self, settings: &Settings) {
        let text = match serde_json::to_string_pretty(settings) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "cannot serialize settings");
                return;
            }
        };
        let tmp = self.file.with_extension("json.tmp");
        let result = std::fs::write(&tmp, text).and_then(|_| std::fs::rename(&tmp, &self.file));
        if let Err(e) = result {
            warn!(file = %self.file.display(), error = %e, "failed to persist settings");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path());
        store.set_generation_preferences("txt2img", json!({"steps": 30}));

        let reloaded = SettingsStore::new(dir.path());
        assert_eq!(
            reloaded.generation_preferences("txt2img").unwrap()["steps"],
            30
        );
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path());
        assert!(!store.set_generation_preferences("vid2vid", json!({})));
        assert!(store.generation_preferences("vid2vid").is_none());
    }

    #[test]
    fn reset_wipes_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path());
        store.set_ui_preferences(UiPreferences {
            theme: "dark".into(),
            ..UiPreferences::default()
        });
        store.reset();
        assert_eq!(store.ui_preferences().theme, "default");
        assert_eq!(SettingsStore::new(dir.path()).ui_preferences().theme, "default");
    }
}
