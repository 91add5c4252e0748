use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::format::{Item, StrftimeItems};
use chrono::{FixedOffset, Offset, Utc};
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "parlor";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const SETTINGS_ENV_PREFIX: &str = "PARLOR_";
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_EVENT_BUFFER: usize = 64;
pub const DEFAULT_DATE_LABEL_FORMAT: &str = "%b %-d, %Y";
pub const DEFAULT_TIME_LABEL_FORMAT: &str = "%H:%M";

// A day either side of UTC covers every real zone.
const MAX_UTC_OFFSET_MINUTES: i32 = 24 * 60 - 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessengerSettings {
    /// Upper bound for `list_conversations`/`list_messages`; `0` waits forever.
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: Option<u64>,
    /// Upper bound for `send_message`; a timed-out send is rolled back. `0` waits forever.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: Option<u64>,
    #[serde(default = "default_auto_select_first")]
    pub auto_select_first: bool,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Offset used to decide which calendar day a message belongs to.
    #[serde(default)]
    pub display_utc_offset_minutes: i32,
    #[serde(default = "default_date_label_format")]
    pub date_label_format: String,
    #[serde(default = "default_time_label_format")]
    pub time_label_format: String,
}

impl Default for MessengerSettings {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: default_fetch_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            auto_select_first: default_auto_select_first(),
            event_buffer: default_event_buffer(),
            display_utc_offset_minutes: 0,
            date_label_format: default_date_label_format(),
            time_label_format: default_time_label_format(),
        }
    }
}

impl MessengerSettings {
    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_ms.map(Duration::from_millis)
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout_ms.map(Duration::from_millis)
    }

    pub fn display_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.display_utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix())
    }

    pub fn normalized(mut self) -> Self {
        // Zero would fail every call immediately; treat it as "no timeout".
        self.fetch_timeout_ms = self.fetch_timeout_ms.filter(|timeout| *timeout > 0);
        self.send_timeout_ms = self.send_timeout_ms.filter(|timeout| *timeout > 0);
        self.event_buffer = self.event_buffer.max(1);
        self.display_utc_offset_minutes = self
            .display_utc_offset_minutes
            .clamp(-MAX_UTC_OFFSET_MINUTES, MAX_UTC_OFFSET_MINUTES);

        self.date_label_format =
            usable_label_format(&self.date_label_format, DEFAULT_DATE_LABEL_FORMAT);
        self.time_label_format =
            usable_label_format(&self.time_label_format, DEFAULT_TIME_LABEL_FORMAT);

        self
    }

    /// Defaults, then the JSON file (if present), then `PARLOR_*` environment variables.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(SETTINGS_ENV_PREFIX))
    }
}

/// Live settings for one process, backed by a JSON file.
pub struct SettingsStore {
    settings: Arc<ArcSwap<MessengerSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(SETTINGS_DIRECTORY_NAME)
            .join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = read_layers(&config_path);
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

    pub fn settings(&self) -> Arc<MessengerSettings> {
        self.settings.load_full()
    }

    /// Re-reads the file and environment, replacing the live value.
    pub fn reload(&self) -> Arc<MessengerSettings> {
        let settings = Arc::new(read_layers(&self.config_path));
        self.settings.store(Arc::clone(&settings));
        settings
    }

    /// Normalizes `settings`, writes them to disk, then swaps them in.
    ///
    /// The file is replaced atomically, so a crash mid-write leaves the previous
    /// settings intact.
    pub fn update(
        &self,
        settings: MessengerSettings,
    ) -> Result<Arc<MessengerSettings>, SettingsError> {
        let settings = Arc::new(settings.normalized());
        write_atomically(&self.config_path, &settings)?;
        self.settings.store(Arc::clone(&settings));
        tracing::info!(
            path = %self.config_path.display(),
            fetch_timeout_ms = ?settings.fetch_timeout_ms,
            send_timeout_ms = ?settings.send_timeout_ms,
            "messenger settings updated"
        );
        Ok(settings)
    }
}

fn read_layers(path: &Path) -> MessengerSettings {
    if !path.exists() {
        tracing::debug!(
            path = %path.display(),
            "no settings file, using defaults and environment"
        );
    }

    MessengerSettings::figment(path)
        .extract::<MessengerSettings>()
        .map(MessengerSettings::normalized)
        .unwrap_or_else(|error| {
            tracing::warn!(
                path = %path.display(),
                %error,
                "ignoring unreadable messenger settings"
            );
            MessengerSettings::default()
        })
}

fn write_atomically(path: &Path, settings: &MessengerSettings) -> Result<(), SettingsError> {
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&directory).context(SettingsDirectorySnafu {
        stage: "settings-ensure-directory",
        directory: directory.clone(),
    })?;

    let encoded = serde_json::to_vec_pretty(settings).context(EncodeSettingsSnafu {
        stage: "settings-encode",
    })?;

    let mut staged = tempfile::NamedTempFile::new_in(&directory).context(StageSettingsSnafu {
        stage: "settings-stage-file",
        directory,
    })?;
    staged.write_all(&encoded).context(WriteStagedSettingsSnafu {
        stage: "settings-write-staged",
        path: staged.path().to_path_buf(),
    })?;

    staged.persist(path).context(CommitSettingsSnafu {
        stage: "settings-commit",
        path: path.to_path_buf(),
    })?;
    Ok(())
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("settings directory {directory:?} is not usable (`{stage}`): {source}"))]
    SettingsDirectory {
        stage: &'static str,
        directory: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("messenger settings could not be encoded (`{stage}`): {source}"))]
    EncodeSettings {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("could not stage new settings in {directory:?} (`{stage}`): {source}"))]
    StageSettings {
        stage: &'static str,
        directory: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("could not write staged settings to {path:?} (`{stage}`): {source}"))]
    WriteStagedSettings {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("could not move staged settings over {path:?} (`{stage}`): {source}"))]
    CommitSettings {
        stage: &'static str,
        path: PathBuf,
        source: tempfile::PersistError,
    },
}

/// Returns `format` trimmed, or `fallback` when it is blank or not a valid strftime pattern.
pub(crate) fn usable_label_format(format: &str, fallback: &str) -> String {
    let format = format.trim();
    let invalid = StrftimeItems::new(format).any(|item| matches!(item, Item::Error));
    if format.is_empty() || invalid {
        if !format.is_empty() {
            tracing::warn!(format, fallback, "invalid label format, using fallback");
        }
        return fallback.to_string();
    }
    format.to_string()
}

fn default_fetch_timeout_ms() -> Option<u64> {
    Some(DEFAULT_FETCH_TIMEOUT_MS)
}

fn default_send_timeout_ms() -> Option<u64> {
    Some(DEFAULT_SEND_TIMEOUT_MS)
}

fn default_auto_select_first() -> bool {
    true
}

fn default_event_buffer() -> usize {
    DEFAULT_EVENT_BUFFER
}

fn default_date_label_format() -> String {
    DEFAULT_DATE_LABEL_FORMAT.to_string()
}

fn default_time_label_format() -> String {
    DEFAULT_TIME_LABEL_FORMAT.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        figment::Jail::expect_with(|jail| {
            let path = jail.directory().join("absent.json");
            let store = SettingsStore::new(path);

            assert_eq!(*store.settings(), MessengerSettings::default());
            Ok(())
        });
    }

    #[test]
    fn file_values_merge_over_defaults_and_env_wins() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "settings.json",
                r#"{ "send_timeout_ms": 2500, "auto_select_first": false }"#,
            )?;
            jail.set_env("PARLOR_DISPLAY_UTC_OFFSET_MINUTES", "-300");

            let store = SettingsStore::new(jail.directory().join("settings.json"));
            let settings = store.settings();

            assert_eq!(settings.send_timeout_ms, Some(2500));
            assert!(!settings.auto_select_first);
            assert_eq!(settings.display_utc_offset_minutes, -300);
            assert_eq!(settings.fetch_timeout_ms, Some(DEFAULT_FETCH_TIMEOUT_MS));
            assert_eq!(settings.display_offset().local_minus_utc(), -300 * 60);
            Ok(())
        });
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("settings.json", r#"{ "event_buffer": "many" }"#)?;

            let store = SettingsStore::new(jail.directory().join("settings.json"));
            assert_eq!(*store.settings(), MessengerSettings::default());
            Ok(())
        });
    }

    #[test]
    fn normalization_repairs_out_of_range_values() {
        let settings = MessengerSettings {
            fetch_timeout_ms: Some(0),
            event_buffer: 0,
            display_utc_offset_minutes: 10_000,
            date_label_format: "   ".to_string(),
            ..MessengerSettings::default()
        }
        .normalized();

        assert_eq!(settings.fetch_timeout(), None);
        assert_eq!(settings.event_buffer, 1);
        assert_eq!(settings.display_utc_offset_minutes, MAX_UTC_OFFSET_MINUTES);
        assert_eq!(settings.date_label_format, DEFAULT_DATE_LABEL_FORMAT);
    }

    #[test]
    fn update_persists_and_reloads() {
        let directory = tempfile::tempdir().expect("create temp dir");
        let path = directory.path().join("nested").join(SETTINGS_FILE_NAME);
        let store = SettingsStore::new(path.clone());

        let updated = MessengerSettings {
            send_timeout_ms: Some(900),
            ..MessengerSettings::default()
        };
        store.update(updated.clone()).expect("persist settings");

        assert_eq!(*store.settings(), updated);
        let leftovers = std::fs::read_dir(path.parent().expect("settings directory"))
            .expect("list settings directory")
            .count();
        assert_eq!(leftovers, 1);
        assert_eq!(*SettingsStore::new(path).settings(), updated);
    }

    #[test]
    fn unparseable_label_formats_fall_back_to_defaults() {
        let settings = MessengerSettings {
            date_label_format: "%Q".to_string(),
            time_label_format: " %H:%M %! ".to_string(),
            ..MessengerSettings::default()
        }
        .normalized();

        assert_eq!(settings.date_label_format, DEFAULT_DATE_LABEL_FORMAT);
        assert_eq!(settings.time_label_format, DEFAULT_TIME_LABEL_FORMAT);
    }

    #[test]
    fn label_format_from_environment_is_validated() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("PARLOR_DATE_LABEL_FORMAT", "%Q %Y");
            jail.set_env("PARLOR_TIME_LABEL_FORMAT", "%I:%M %p");

            let store = SettingsStore::new(jail.directory().join("settings.json"));
            let settings = store.settings();

            assert_eq!(settings.date_label_format, DEFAULT_DATE_LABEL_FORMAT);
            assert_eq!(settings.time_label_format, "%I:%M %p");
            Ok(())
        });
    }

    #[test]
    fn reload_picks_up_edits_on_disk() {
        figment::Jail::expect_with(|jail| {
            let store = SettingsStore::new(jail.directory().join("settings.json"));
            assert!(store.settings().auto_select_first);

            jail.create_file("settings.json", r#"{ "auto_select_first": false }"#)?;
            let reloaded = store.reload();

            assert!(!reloaded.auto_select_first);
            assert_eq!(store.settings(), reloaded);
            Ok(())
        });
    }
}
