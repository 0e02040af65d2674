use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use trellis_llm::{AdapterConfig, MOCK_ADAPTER_ID};

use crate::stream::ResponseMode;

pub const DEFAULT_ADAPTER_ID: &str = MOCK_ADAPTER_ID;
pub const SETTINGS_DIRECTORY_NAME: &str = "trellis";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const SETTINGS_ENV_PREFIX: &str = "TRELLIS_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub adapter_id: String,
    pub api_key: String,
    pub endpoint: String,
    pub model: String,
    pub response_mode: ResponseMode,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    /// Sqlite file for chat persistence. `None` keeps chats in memory only.
    pub database_path: Option<PathBuf>,
    pub preamble: Option<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            adapter_id: DEFAULT_ADAPTER_ID.to_string(),
            api_key: String::new(),
            endpoint: String::new(),
            model: String::new(),
            response_mode: ResponseMode::Stream,
            temperature: None,
            max_tokens: None,
            database_path: None,
            preamble: None,
        }
    }
}

impl AppSettings {
    pub fn normalized(mut self) -> Self {
        self.adapter_id = if self.adapter_id.trim().is_empty() {
            DEFAULT_ADAPTER_ID.to_string()
        } else {
            self.adapter_id.trim().to_lowercase()
        };
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = self.endpoint.trim().to_string();
        self.model = self.model.trim().to_string();
        self.preamble = self
            .preamble
            .map(|preamble| preamble.trim().to_string())
            .filter(|preamble| !preamble.is_empty());
        self.database_path = self
            .database_path
            .filter(|path| !path.as_os_str().is_empty());
        self
    }

    pub fn uses_mock(&self) -> bool {
        self.adapter_id == MOCK_ADAPTER_ID
    }

    /// Whether the configured backend can be built. Only the mock runs without a key.
    pub fn is_valid(&self) -> bool {
        self.uses_mock() || !self.api_key.is_empty()
    }

    pub fn to_adapter_config(&self) -> AdapterConfig {
        let mut config = AdapterConfig::new(
            &self.adapter_id,
            &self.api_key,
            &self.endpoint,
            &self.model,
        );
        if let Some(preamble) = &self.preamble {
            config = config.with_preamble(preamble.clone());
        }
        if let Some(temperature) = self.temperature {
            config = config.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.max_tokens {
            config = config.with_max_tokens(max_tokens);
        }
        config
    }
}

/// Layered settings: defaults, then the JSON file, then `TRELLIS_*` environment overrides.
pub struct SettingsStore {
    settings: Arc<ArcSwap<AppSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".trellis"))
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

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<AppSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: AppSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> AppSettings {
        if !path.exists() {
            tracing::info!(path = ?path, "settings file not found, using defaults");
        }

        let figment = Figment::from(Serialized::defaults(AppSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(SETTINGS_ENV_PREFIX));

        match figment.extract::<AppSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = ?path,
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                AppSettings::default()
            }
        }
    }

    fn persist(&self, settings: &AppSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent()
            && !parent.as_os_str().is_empty()
        {
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

        tracing::info!(path = ?self.config_path, "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_mock_defaults() {
        let directory = tempfile::tempdir().expect("temp dir");
        let store = SettingsStore::new(directory.path().join("settings.json"));
        let settings = store.settings();

        assert!(settings.uses_mock());
        assert!(settings.is_valid());
        assert_eq!(settings.response_mode, ResponseMode::Stream);
    }

    #[test]
    fn update_persists_and_reloads_normalized() {
        let directory = tempfile::tempdir().expect("temp dir");
        let path = directory.path().join("nested").join("settings.json");
        let store = SettingsStore::new(path.clone());

        store
            .update(AppSettings {
                adapter_id: "  OpenAI ".to_string(),
                api_key: " sk-test ".to_string(),
                model: "gpt-4o".to_string(),
                response_mode: ResponseMode::Fetch,
                preamble: Some("   ".to_string()),
                ..AppSettings::default()
            })
            .expect("persist settings");

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());

        let reloaded = SettingsStore::new(path).settings();
        assert_eq!(reloaded.adapter_id, "openai");
        assert_eq!(reloaded.api_key, "sk-test");
        assert_eq!(reloaded.response_mode, ResponseMode::Fetch);
        assert_eq!(reloaded.preamble, None);
        assert!(reloaded.is_valid());
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let directory = tempfile::tempdir().expect("temp dir");
        let path = directory.path().join("settings.json");
        std::fs::write(&path, "{ not json").expect("write file");

        let settings = SettingsStore::new(path).settings();
        assert_eq!(*settings, AppSettings::default());
    }

    #[test]
    fn adapter_config_carries_generation_knobs() {
        let settings = AppSettings {
            adapter_id: "openai".to_string(),
            api_key: "sk".to_string(),
            temperature: Some(0.2),
            max_tokens: Some(256),
            preamble: Some("Be brief.".to_string()),
            ..AppSettings::default()
        };
        let config = settings.to_adapter_config();

        assert_eq!(config.adapter_id, "openai");
        assert_eq!(config.temperature, Some(0.2));
        assert_eq!(config.max_tokens, Some(256));
        assert_eq!(config.preamble.as_deref(), Some("Be brief."));
    }

    #[test]
    fn remote_adapter_without_key_is_invalid() {
        let settings = AppSettings {
            adapter_id: "openai".to_string(),
            ..AppSettings::default()
        }
        .normalized();
        assert!(!settings.is_valid());
    }
}
