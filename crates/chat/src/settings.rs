use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use lull_channel::HttpConfig;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::afterthought::{DEFAULT_LADDER_SECS, FOLLOWUP_RESUME_STAGE, Ladder};
use crate::sink::AfterthoughtToggle;

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8080";
pub const DEFAULT_USER_DISPLAY_NAME: &str = "You";
pub const DEFAULT_ASSISTANT_DISPLAY_NAME: &str = "Assistant";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const SETTINGS_DIRECTORY_NAME: &str = "lull";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "LULL_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AfterthoughtSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_ladder_secs")]
    pub ladder_secs: Vec<u64>,
    #[serde(default = "default_resume_stage")]
    pub resume_stage: usize,
}

impl Default for AfterthoughtSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            ladder_secs: default_ladder_secs(),
            resume_stage: default_resume_stage(),
        }
    }
}

impl AfterthoughtSettings {
    fn normalized(mut self) -> Self {
        self.ladder_secs.retain(|secs| *secs > 0);
        if self.ladder_secs.is_empty() {
            self.ladder_secs = default_ladder_secs();
        }
        if self.resume_stage >= self.ladder_secs.len() {
            self.resume_stage = self.ladder_secs.len() - 1;
        }
        self
    }

    pub fn ladder(&self) -> Ladder {
        Ladder::from_secs(&self.ladder_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_user_display_name")]
    pub user_display_name: String,
    #[serde(default = "default_assistant_display_name")]
    pub assistant_display_name: String,
    #[serde(default)]
    pub afterthought: AfterthoughtSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
            user_display_name: default_user_display_name(),
            assistant_display_name: default_assistant_display_name(),
            afterthought: AfterthoughtSettings::default(),
        }
    }
}

impl Settings {
    pub fn normalized(mut self) -> Self {
        self.endpoint = non_blank_or(self.endpoint, default_endpoint);
        self.api_key = self.api_key.trim().to_string();
        if self.request_timeout_secs == 0 {
            self.request_timeout_secs = default_request_timeout_secs();
        }
        self.user_display_name = non_blank_or(self.user_display_name, default_user_display_name);
        self.assistant_display_name =
            non_blank_or(self.assistant_display_name, default_assistant_display_name);
        self.afterthought = self.afterthought.normalized();
        self
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    pub fn http_config(&self) -> HttpConfig {
        HttpConfig::new(self.endpoint.clone())
            .with_api_key(self.api_key.clone())
            .with_decision_timeout(Duration::from_secs(self.request_timeout_secs))
    }
}

/// Live settings backed by a JSON file, with `LULL_*` environment overrides.
pub struct SettingsStore {
    settings: Arc<ArcSwap<Settings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".lull"))
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

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    /// Flips the afterthought flag. Only the file layer is written back, so `LULL_*`
    /// overrides never end up on disk.
    pub fn set_afterthoughts_enabled(&self, enabled: bool) -> SettingsResult<()> {
        let mut live = Settings::clone(&self.settings());
        live.afterthought.enabled = enabled;
        self.settings.store(Arc::new(live));

        let mut stored = Self::load_file_layer(&self.config_path);
        stored.afterthought.enabled = enabled;
        self.persist(&stored.normalized())
    }

    fn file_figment(path: &Path) -> Figment {
        let figment = Figment::from(Serialized::defaults(Settings::default()));
        if path.exists() {
            figment.merge(Json::file(path))
        } else {
            figment
        }
    }

    fn load_file_layer(path: &Path) -> Settings {
        Self::file_figment(path)
            .extract::<Settings>()
            .unwrap_or_else(|error| {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "failed to parse settings file, rewriting from defaults"
                );
                Settings::default()
            })
    }

    fn load_from_disk(path: &Path) -> Settings {
        if !path.exists() {
            tracing::info!(path = %path.display(), "settings file not found, using defaults");
        }
        let figment = Self::file_figment(path).merge(Env::prefixed(ENV_PREFIX).split("__"));

        match figment.extract::<Settings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                Settings::default()
            }
        }
    }

    fn persist(&self, settings: &Settings) -> SettingsResult<()> {
        if let Some(parent) = self.config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).context(CreateConfigDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(EncodeSettingsSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteTempFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(ReplaceFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = %self.config_path.display(), "saved settings");
        Ok(())
    }
}

impl AfterthoughtToggle for SettingsStore {
    fn afterthoughts_enabled(&self) -> bool {
        self.settings.load().afterthought.enabled
    }
}

pub type SettingsResult<T> = Result<T, SettingsError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("cannot create config directory {path:?} on `{stage}`: {source}"))]
    CreateConfigDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot encode settings as json on `{stage}`: {source}"))]
    EncodeSettings {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("cannot write {path:?} on `{stage}`: {source}"))]
    WriteTempFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot move {from:?} over {to:?} on `{stage}`: {source}"))]
    ReplaceFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn non_blank_or(value: String, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_user_display_name() -> String {
    DEFAULT_USER_DISPLAY_NAME.to_string()
}

fn default_assistant_display_name() -> String {
    DEFAULT_ASSISTANT_DISPLAY_NAME.to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_ladder_secs() -> Vec<u64> {
    DEFAULT_LADDER_SECS.to_vec()
}

fn default_resume_stage() -> usize {
    FOLLOWUP_RESUME_STAGE
}

#[cfg(test)]
mod tests {
    use figment::Jail;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn missing_file_uses_defaults() {
        Jail::expect_with(|jail| {
            let store = SettingsStore::new(jail.directory().join("absent.json"));
            assert_eq!(*store.settings(), Settings::default());
            assert!(store.afterthoughts_enabled());
            Ok(())
        });
    }

    #[test]
    fn file_and_environment_are_layered() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "settings.json",
                r#"{
                    "endpoint": "  https://chat.example.com  ",
                    "api_key": "from-file",
                    "afterthought": { "ladder_secs": [5, 0, 20] }
                }"#,
            )?;
            jail.set_env("LULL_API_KEY", "from-env");
            jail.set_env("LULL_AFTERTHOUGHT__ENABLED", "false");

            let store = SettingsStore::new(jail.directory().join("settings.json"));
            let settings = store.settings();
            assert_eq!(settings.endpoint, "https://chat.example.com");
            assert_eq!(settings.api_key, "from-env");
            assert!(!store.afterthoughts_enabled());
            assert_eq!(settings.afterthought.ladder_secs, vec![5, 20]);
            assert_eq!(settings.afterthought.resume_stage, 1);
            Ok(())
        });
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file("settings.json", "{ not json")?;
            let store = SettingsStore::new(jail.directory().join("settings.json"));
            assert_eq!(*store.settings(), Settings::default());
            Ok(())
        });
    }

    #[test]
    fn toggling_afterthoughts_persists() {
        Jail::expect_with(|jail| {
            let path = jail.directory().join("nested").join("settings.json");
            let store = SettingsStore::new(path.clone());
            store.set_afterthoughts_enabled(false).unwrap();
            assert!(!store.afterthoughts_enabled());

            let reloaded = SettingsStore::new(path);
            assert!(!reloaded.afterthoughts_enabled());
            assert_eq!(reloaded.settings().afterthought.ladder_secs, DEFAULT_LADDER_SECS);
            Ok(())
        });
    }

    #[test]
    fn blank_api_key_is_not_sent() {
        let settings = Settings {
            api_key: "   ".to_string(),
            ..Settings::default()
        }
        .normalized();
        assert!(!settings.has_api_key());
        assert_eq!(settings.http_config().api_key, None);
    }

    #[test]
    fn environment_overrides_stay_off_disk() {
        Jail::expect_with(|jail| {
            jail.create_file("settings.json", r#"{ "endpoint": "https://chat.example.com" }"#)?;
            jail.set_env("LULL_API_KEY", "sk-env-only");
            jail.set_env("LULL_USER_DISPLAY_NAME", "Grace");

            let path = jail.directory().join("settings.json");
            let store = SettingsStore::new(path.clone());
            store.set_afterthoughts_enabled(false).unwrap();

            assert_eq!(store.settings().api_key, "sk-env-only");
            assert!(!store.afterthoughts_enabled());

            let written = std::fs::read_to_string(&path).unwrap();
            assert!(!written.contains("sk-env-only"));
            assert!(!written.contains("Grace"));

            let on_disk: Settings = serde_json::from_str(&written).unwrap();
            assert_eq!(on_disk.endpoint, "https://chat.example.com");
            assert_eq!(on_disk.api_key, "");
            assert!(!on_disk.afterthought.enabled);
            Ok(())
        });
    }

    #[test]
    fn toggle_applies_even_when_the_write_fails() {
        Jail::expect_with(|jail| {
            jail.create_file("blocker", "not a directory")?;
            let store = SettingsStore::new(jail.directory().join("blocker").join("settings.json"));
            assert!(store.afterthoughts_enabled());

            let result = store.set_afterthoughts_enabled(false);
            assert!(matches!(result, Err(SettingsError::CreateConfigDir { .. })));
            assert!(!store.afterthoughts_enabled());
            Ok(())
        });
    }
}
