use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const SETTINGS_FILE: &str = "vaani/settings.json";

/// Languages the backend can answer and speak in.
pub const SUPPORTED_LANGUAGES: [&str; 3] = ["en", "hi", "mr"];

pub fn language_display_name(code: &str) -> &'static str {
    match code {
        "en" => "English",
        "hi" => "Hindi",
        "mr" => "Marathi",
        "auto" => "Auto-Detected",
        _ => "Unknown",
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppSettings {
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_voice_lang_pref")]
    pub voice_lang_pref: String,
    #[serde(default = "default_enhanced_mode")]
    pub enhanced_mode: bool,
    #[serde(default = "default_auto_play_responses")]
    pub auto_play_responses: bool,
    #[serde(default)]
    pub selected_microphone: Option<String>,
    #[serde(default = "default_silence_stop_secs")]
    pub silence_stop_secs: f32,
    #[serde(default = "default_silence_threshold")]
    pub silence_threshold: f32,
    #[serde(default = "default_streaming_ceiling_secs")]
    pub streaming_ceiling_secs: u64,
    #[serde(default)]
    pub streaming_mode: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            request_timeout_secs: default_request_timeout_secs(),
            voice_lang_pref: default_voice_lang_pref(),
            enhanced_mode: default_enhanced_mode(),
            auto_play_responses: default_auto_play_responses(),
            selected_microphone: None,
            silence_stop_secs: default_silence_stop_secs(),
            silence_threshold: default_silence_threshold(),
            streaming_ceiling_secs: default_streaming_ceiling_secs(),
            streaming_mode: false,
        }
    }
}

fn default_backend_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_voice_lang_pref() -> String {
    "auto".to_string()
}

fn default_enhanced_mode() -> bool {
    true
}

fn default_auto_play_responses() -> bool {
    true
}

fn default_silence_stop_secs() -> f32 {
    2.0
}

fn default_silence_threshold() -> f32 {
    0.01
}

fn default_streaming_ceiling_secs() -> u64 {
    20
}

impl AppSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn streaming_ceiling(&self) -> Duration {
        Duration::from_secs(self.streaming_ceiling_secs)
    }

    /// A voice preference outside the supported set falls back to auto.
    pub fn normalize(&mut self) {
        let pref = self.voice_lang_pref.as_str();
        if pref != "auto" && !SUPPORTED_LANGUAGES.contains(&pref) {
            log::warn!("Unsupported voice_lang_pref '{pref}', falling back to auto");
            self.voice_lang_pref = "auto".to_string();
        }
        if self.silence_stop_secs <= 0.0 {
            self.silence_stop_secs = default_silence_stop_secs();
        }
    }

    fn settings_path() -> Option<PathBuf> {
        dirs::data_dir().map(|p| p.join(SETTINGS_FILE))
    }

    pub fn load_from(path: &std::path::Path) -> Option<Self> {
        let data = std::fs::read_to_string(path).ok()?;
        let mut settings: AppSettings = serde_json::from_str(&data).ok()?;
        settings.normalize();
        Some(settings)
    }

    /// Load persisted settings, falling back to defaults. The backend URL can
    /// always be overridden with the VAANI_BACKEND_URL environment variable.
    pub fn load_or_default() -> Self {
        let mut settings = Self::settings_path()
            .and_then(|p| Self::load_from(&p))
            .unwrap_or_default();

        if let Ok(url) = std::env::var("VAANI_BACKEND_URL") {
            if !url.trim().is_empty() {
                settings.backend_url = url.trim().trim_end_matches('/').to_string();
            }
        }
        settings.normalize();
        settings
    }

    pub fn save_to(&self, path: &std::path::Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)
    }

    pub fn save(&self) -> std::io::Result<()> {
        let path = Self::settings_path().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no data directory")
        })?;
        self.save_to(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = AppSettings::default();
        assert_eq!(settings.request_timeout_secs, 120);
        assert_eq!(settings.voice_lang_pref, "auto");
        assert!(settings.enhanced_mode);
        assert!(!settings.streaming_mode);
        assert_eq!(settings.streaming_ceiling_secs, 20);
    }

    #[test]
    fn test_normalize_rejects_unknown_language() {
        let mut settings = AppSettings {
            voice_lang_pref: "fr".to_string(),
            ..Default::default()
        };
        settings.normalize();
        assert_eq!(settings.voice_lang_pref, "auto");

        let mut settings = AppSettings {
            voice_lang_pref: "mr".to_string(),
            ..Default::default()
        };
        settings.normalize();
        assert_eq!(settings.voice_lang_pref, "mr");
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let settings = AppSettings {
            backend_url: "http://10.0.0.5:9000".to_string(),
            streaming_mode: true,
            ..Default::default()
        };
        settings.save_to(&path).unwrap();

        let loaded = AppSettings::load_from(&path).unwrap();
        assert_eq!(loaded.backend_url, "http://10.0.0.5:9000");
        assert!(loaded.streaming_mode);
    }

    #[test]
    fn test_partial_file_gets_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"backend_url": "http://backend:8000"}"#).unwrap();

        let loaded = AppSettings::load_from(&path).unwrap();
        assert_eq!(loaded.backend_url, "http://backend:8000");
        assert_eq!(loaded.request_timeout_secs, 120);
    }
}
