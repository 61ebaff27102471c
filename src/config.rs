use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_MDSTAT_PATH: &str = "/proc/mdstat";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    #[serde(default = "default_mdstat_path")]
    pub mdstat_path: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_renotify_interval_secs")]
    pub renotify_interval_secs: u64,
    #[serde(default = "default_blink_interval_ms")]
    pub blink_interval_ms: u64,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotifyConfig {
    #[serde(default = "default_notify_enabled")]
    pub enabled: bool,
    #[serde(default = "default_notify_title")]
    pub title: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bot_token_env")]
    pub bot_token_env: String,
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default)]
    pub allowed_chat_ids: Vec<i64>,
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
    #[serde(default = "default_notify_by_default")]
    pub notify_by_default: bool,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: default_notify_enabled(),
            title: default_notify_title(),
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token_env: default_bot_token_env(),
            bot_token: None,
            allowed_chat_ids: Vec::new(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
            notify_by_default: default_notify_by_default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation(
                "поле listen обязательно".to_string(),
            ));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "поле listen должно быть корректным адресом host:port".to_string(),
            ));
        }
        if self.mdstat_path.trim().is_empty() {
            return Err(ConfigError::Validation(
                "поле mdstat_path не должно быть пустым".to_string(),
            ));
        }
        if self.interval_secs < 1 {
            return Err(ConfigError::Validation(
                "interval_secs должно быть >= 1".to_string(),
            ));
        }
        if self.renotify_interval_secs < 60 {
            return Err(ConfigError::Validation(
                "renotify_interval_secs должно быть >= 60".to_string(),
            ));
        }
        if self.blink_interval_ms < 100 {
            return Err(ConfigError::Validation(
                "blink_interval_ms должно быть >= 100".to_string(),
            ));
        }
        if self.notify.title.trim().is_empty() {
            return Err(ConfigError::Validation(
                "notify.title не должен быть пустым".to_string(),
            ));
        }

        validate_telegram(&self.telegram)?;

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_telegram(cfg: &TelegramConfig) -> Result<(), ConfigError> {
    if cfg.rate_limit_per_minute < 1 {
        return Err(ConfigError::Validation(
            "telegram.rate_limit_per_minute должно быть >= 1".to_string(),
        ));
    }
    if cfg.bot_token_env.trim().is_empty() {
        return Err(ConfigError::Validation(
            "telegram.bot_token_env не должен быть пустым".to_string(),
        ));
    }

    Ok(())
}

fn default_mdstat_path() -> String {
    DEFAULT_MDSTAT_PATH.to_string()
}

const fn default_interval_secs() -> u64 {
    60
}

const fn default_renotify_interval_secs() -> u64 {
    900
}

const fn default_blink_interval_ms() -> u64 {
    500
}

const fn default_notify_enabled() -> bool {
    true
}

fn default_notify_title() -> String {
    "RAID failed or degraded".to_string()
}

fn default_bot_token_env() -> String {
    "TELEGRAM_BOT_TOKEN".to_string()
}

const fn default_rate_limit_per_minute() -> u32 {
    30
}

const fn default_notify_by_default() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            listen: "127.0.0.1:9109".to_string(),
            mdstat_path: DEFAULT_MDSTAT_PATH.to_string(),
            interval_secs: 60,
            renotify_interval_secs: 900,
            blink_interval_ms: 500,
            notify: NotifyConfig::default(),
            telegram: TelegramConfig::default(),
        }
    }

    #[test]
    fn example_config_parses_and_validates() {
        let cfg: Config = serde_yaml::from_str(Config::example_yaml()).expect("пример конфигурации");
        cfg.validate().expect("пример должен проходить валидацию");
        assert_eq!(cfg.mdstat_path, DEFAULT_MDSTAT_PATH);
        assert_eq!(cfg.interval_secs, 60);
        assert_eq!(cfg.renotify_interval_secs, 900);
        assert_eq!(cfg.blink_interval_ms, 500);
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg: Config = serde_yaml::from_str("listen: \"0.0.0.0:9109\"\n").expect("yaml");
        cfg.validate().expect("валидация");
        assert!(cfg.notify.enabled);
        assert_eq!(cfg.notify.title, "RAID failed or degraded");
        assert!(!cfg.telegram.enabled);
        assert!(cfg.telegram.notify_by_default);
    }

    #[test]
    fn rejects_bad_intervals() {
        let mut cfg = valid_config();
        cfg.interval_secs = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));

        let mut cfg = valid_config();
        cfg.renotify_interval_secs = 10;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));

        let mut cfg = valid_config();
        cfg.blink_interval_ms = 5;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn rejects_invalid_listen() {
        let mut cfg = valid_config();
        cfg.listen = "localhost".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn telegram_enabled_allows_empty_allowed_chat_ids() {
        let mut cfg = valid_config();
        cfg.telegram.enabled = true;
        cfg.telegram.allowed_chat_ids = vec![];
        cfg.validate()
            .expect("валидация должна проходить, chat id проверяется на этапе запуска");
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = Config::load_from_file("/nonexistent/raidmond-config.yaml")
            .expect_err("файла нет");
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
