use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use folio_remote::{DEFAULT_REQUEST_TIMEOUT_MS, ServiceConfig};

pub const DEFAULT_ENDPOINT: &str = "https://api.folio.app/v1";
pub const SETTINGS_DIRECTORY_NAME: &str = "folio";
pub const SETTINGS_FILE_NAME: &str = "settings.json";

/// Conversation-service settings that persist across app restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSettings {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_token: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_token: String::new(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl RemoteSettings {
    pub fn is_valid(&self) -> bool {
        !self.endpoint.trim().is_empty()
    }

    /// Creates a service config from these settings, or `None` when no
    /// endpoint is configured.
    pub fn to_service_config(&self) -> Option<ServiceConfig> {
        if self.endpoint.trim().is_empty() {
            return None;
        }

        let token = if self.api_token.trim().is_empty() {
            None
        } else {
            Some(self.api_token.clone())
        };

        Some(
            ServiceConfig::new(&self.endpoint, token)
                .with_request_timeout_ms(self.request_timeout_ms),
        )
    }

    pub fn normalized(mut self) -> Self {
        self.endpoint = if self.endpoint.trim().is_empty() {
            default_endpoint()
        } else {
            self.endpoint.trim().to_string()
        };
        self.api_token = self.api_token.trim().to_string();
        if self.request_timeout_ms == 0 {
            self.request_timeout_ms = default_request_timeout_ms();
        }

        self
    }
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file to {path:?}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to move settings file from {from:?} to {to:?}"))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

/// Settings persistence with lock-free reads.
pub struct SettingsStore {
    settings: Arc<ArcSwap<RemoteSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".folio"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn settings(&self) -> Arc<RemoteSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: RemoteSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &PathBuf) -> RemoteSettings {
        if !path.exists() {
            tracing::info!("settings file not found at {:?}, using defaults", path);
            return RemoteSettings::default();
        }

        let figment =
            Figment::from(Serialized::defaults(RemoteSettings::default())).merge(Json::file(path));

        match figment.extract::<RemoteSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                RemoteSettings::default()
            }
        }
    }

    fn persist(&self, settings: &RemoteSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_restores_defaults_for_blank_fields() {
        let settings = RemoteSettings {
            endpoint: "   ".to_string(),
            api_token: " tok ".to_string(),
            request_timeout_ms: 0,
        }
        .normalized();

        assert_eq!(settings.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(settings.api_token, "tok");
        assert_eq!(settings.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS);
    }

    #[test]
    fn service_config_requires_an_endpoint() {
        let mut settings = RemoteSettings::default();
        settings.endpoint = String::new();
        assert!(settings.to_service_config().is_none());

        settings.endpoint = "https://folio.example/api/".to_string();
        settings.api_token = "secret".to_string();
        let config = settings.to_service_config().expect("config");
        assert_eq!(config.endpoint, "https://folio.example/api");
        assert_eq!(config.api_token.as_deref(), Some("secret"));
    }

    #[test]
    fn update_persists_and_reloads() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join(SETTINGS_FILE_NAME);

        let store = SettingsStore::new(path.clone());
        let mut settings = RemoteSettings::default();
        settings.endpoint = "https://folio.example/api".to_string();
        settings.api_token = "secret".to_string();
        store.update(settings.clone()).expect("persist settings");

        let reloaded = SettingsStore::new(path);
        assert_eq!(*reloaded.settings(), settings.normalized());
        assert!(!dir.path().join("settings.json.tmp").exists());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = SettingsStore::new(dir.path().join("absent.json"));
        assert_eq!(*store.settings(), RemoteSettings::default());
    }
}
