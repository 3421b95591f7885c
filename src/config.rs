use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    pub beszel: BeszelConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BeszelConfig {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_password_env")]
    pub password_env: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
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

        Self::from_yaml(&text, &path_display)
    }

    pub fn from_yaml(text: &str, origin: &str) -> Result<Self, ConfigError> {
        let cfg: Config = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
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
        if self.interval_secs < 1 {
            return Err(ConfigError::Validation(
                "interval_secs должно быть >= 1".to_string(),
            ));
        }

        validate_beszel(&self.beszel)?;

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_beszel(cfg: &BeszelConfig) -> Result<(), ConfigError> {
    if cfg.url.trim().is_empty() {
        return Err(ConfigError::Validation(
            "beszel.url обязательно".to_string(),
        ));
    }
    match Url::parse(cfg.url.trim()) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {}
        Ok(_) => {
            return Err(ConfigError::Validation(
                "beszel.url должен использовать схему http или https".to_string(),
            ))
        }
        Err(err) => {
            return Err(ConfigError::Validation(format!(
                "beszel.url некорректен: {err}"
            )))
        }
    }
    if cfg
        .username
        .as_ref()
        .is_some_and(|u| u.trim().is_empty())
    {
        return Err(ConfigError::Validation(
            "beszel.username не должен быть пустым".to_string(),
        ));
    }
    if cfg.password_env.trim().is_empty() {
        return Err(ConfigError::Validation(
            "beszel.password_env не должен быть пустым".to_string(),
        ));
    }
    if cfg.timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "beszel.timeout_ms должен быть > 0".to_string(),
        ));
    }
    Ok(())
}

const fn default_interval_secs() -> u64 {
    60
}

fn default_password_env() -> String {
    "BESZEL_PASSWORD".to_string()
}

const fn default_timeout_ms() -> u64 {
    10_000
}
