//! Settings file
//!
//! Loads and saves `config.toml` from the platform config directory and
//! turns it into a `WrapConfig`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crashwrap_core::{WrapConfig, DEFAULT_PATIENCE, DEFAULT_SIGNATURES};

/// Settings errors
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse settings file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config directory not found")]
    NoConfigDir,
}

/// Main settings struct
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    /// Crash detection settings
    pub capture: CaptureSettings,
    /// Crash report storage
    pub reports: ReportSettings,
}

/// Crash detection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Line prefixes that start a crash capture
    pub signatures: Vec<String>,
    /// Keep captured output off the terminal
    pub hide: bool,
    /// Milliseconds a partial match may wait for more bytes (0 = until EOF)
    pub patience_ms: u64,
    /// Milliseconds of silence that end a capture (0 = until EOF)
    pub quiet_period_ms: u64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            signatures: DEFAULT_SIGNATURES.iter().map(|s| s.to_string()).collect(),
            hide: false,
            patience_ms: DEFAULT_PATIENCE.as_millis() as u64,
            quiet_period_ms: 0,
        }
    }
}

impl CaptureSettings {
    pub fn patience(&self) -> Option<Duration> {
        millis_or_none(self.patience_ms)
    }

    pub fn quiet_period(&self) -> Option<Duration> {
        millis_or_none(self.quiet_period_ms)
    }
}

fn millis_or_none(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Crash report storage settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportSettings {
    /// Report directory (None = platform data directory)
    pub directory: Option<PathBuf>,
    /// Number of reports to keep (0 = keep everything)
    pub keep: usize,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            directory: None,
            keep: 20,
        }
    }
}

impl Settings {
    /// Apply the capture settings to `config`
    pub fn apply(&self, config: WrapConfig) -> WrapConfig {
        config
            .signatures(&self.capture.signatures)
            .hide_capture(self.capture.hide)
            .patience(self.capture.patience())
            .quiet_period(self.capture.quiet_period())
    }
}

/// Get the config directory path
pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "crashwrap", "crashwrap").map(|p| p.config_dir().to_path_buf())
}

/// Get the settings file path
pub fn settings_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("config.toml"))
}

/// Load settings from the default location
pub fn load_settings() -> Result<Settings, SettingsError> {
    let path = settings_path().ok_or(SettingsError::NoConfigDir)?;
    load_settings_from(&path)
}

/// Load settings from `path`; a missing file gives the defaults
pub fn load_settings_from(path: &Path) -> Result<Settings, SettingsError> {
    if !path.exists() {
        log::debug!("No settings at {}, using defaults", path.display());
        return Ok(Settings::default());
    }

    let content = std::fs::read_to_string(path)?;
    let settings: Settings = toml::from_str(&content)?;
    Ok(settings)
}

/// Save settings to `path`
pub fn save_settings_to(settings: &Settings, path: &Path) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = toml::to_string_pretty(settings)?;
    std::fs::write(path, &content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        let _ = std::fs::set_permissions(path, perms);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.capture.signatures.len(), DEFAULT_SIGNATURES.len());
        assert!(!settings.capture.hide);
        assert_eq!(settings.capture.patience(), Some(DEFAULT_PATIENCE));
        assert_eq!(settings.capture.quiet_period(), None);
        assert_eq!(settings.reports.keep, 20);
        assert!(settings.reports.directory.is_none());
    }

    #[test]
    fn test_settings_serialize() {
        let serialized = toml::to_string_pretty(&Settings::default()).unwrap();
        assert!(serialized.contains("[capture]"));
        assert!(serialized.contains("[reports]"));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let settings: Settings = toml::from_str("[capture]\nhide = true\n").unwrap();
        assert!(settings.capture.hide);
        assert_eq!(settings.capture.patience_ms, 300);
        assert_eq!(settings.reports, ReportSettings::default());
    }

    #[test]
    fn test_zero_means_no_timer() {
        let settings: Settings =
            toml::from_str("[capture]\npatience_ms = 0\nquiet_period_ms = 250\n").unwrap();
        assert_eq!(settings.capture.patience(), None);
        assert_eq!(
            settings.capture.quiet_period(),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut settings = Settings::default();
        settings.capture.signatures = vec!["BOOM".into()];
        settings.capture.quiet_period_ms = 50;
        settings.reports.directory = Some(dir.path().join("reports"));
        settings.reports.keep = 3;

        save_settings_to(&settings, &path).unwrap();
        assert_eq!(load_settings_from(&path).unwrap(), settings);
    }

    #[test]
    fn test_bad_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[capture\n").unwrap();
        assert!(matches!(
            load_settings_from(&path),
            Err(SettingsError::Parse(_))
        ));
    }

    #[test]
    fn test_apply() {
        let mut settings = Settings::default();
        settings.capture.signatures = vec!["BOOM".into(), "CRASH".into()];
        settings.capture.hide = true;
        settings.capture.patience_ms = 0;
        settings.capture.quiet_period_ms = 100;

        let config = settings.apply(WrapConfig::new(|_| {}));
        assert!(config.is_hiding_capture());
        assert_eq!(
            config.signature_set(),
            &[b"BOOM".to_vec(), b"CRASH".to_vec()]
        );
        assert_eq!(config.timing().patience, None);
        assert_eq!(
            config.timing().quiet_period,
            Some(Duration::from_millis(100))
        );
    }
}
