use std::net::SocketAddr;
use std::path::PathBuf;

use santa_core::{ParticipantId, DEFAULT_MAX_ATTEMPTS};
use thiserror::Error;

pub const BIND_ADDR_VAR: &str = "SANTA_BIND_ADDR";
pub const ADMINS_VAR: &str = "SANTA_ADMINS";
pub const STORE_PATH_VAR: &str = "SANTA_STORE_PATH";
pub const MAX_ATTEMPTS_VAR: &str = "SANTA_MAX_ATTEMPTS";

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} is not a valid value: {value:?}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub admins: Vec<ParticipantId>,
    pub store_path: Option<PathBuf>,
    pub max_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            admins: Vec::new(),
            store_path: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| {
            lookup(var)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let bind_addr = get(BIND_ADDR_VAR)
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_addr.parse::<SocketAddr>().map_err(|_| ConfigError::Invalid {
            var: BIND_ADDR_VAR,
            value: bind_addr.clone(),
        })?;

        // Entries that are not valid ids are skipped rather than fatal.
        let admins = get(ADMINS_VAR)
            .map(|raw| {
                raw.split(',')
                    .filter_map(|entry| ParticipantId::new(entry).ok())
                    .collect()
            })
            .unwrap_or_default();

        let max_attempts = match get(MAX_ATTEMPTS_VAR) {
            Some(raw) => match raw.parse::<u32>() {
                Ok(attempts) if attempts > 0 => attempts,
                _ => {
                    return Err(ConfigError::Invalid {
                        var: MAX_ATTEMPTS_VAR,
                        value: raw,
                    })
                }
            },
            None => DEFAULT_MAX_ATTEMPTS,
        };

        Ok(Self {
            bind_addr,
            admins,
            store_path: get(STORE_PATH_VAR).map(PathBuf::from),
            max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(config(&[]).unwrap(), Config::default());
    }

    #[test]
    fn reads_every_variable() {
        let config = config(&[
            (BIND_ADDR_VAR, "127.0.0.1:8080"),
            (ADMINS_VAR, " 42, ,alice "),
            (STORE_PATH_VAR, "data/santa.json"),
            (MAX_ATTEMPTS_VAR, "250"),
        ])
        .unwrap();

        assert_eq!(config.bind_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(
            config.admins,
            vec![
                ParticipantId::new("42").unwrap(),
                ParticipantId::new("alice").unwrap()
            ]
        );
        assert_eq!(config.store_path, Some(PathBuf::from("data/santa.json")));
        assert_eq!(config.max_attempts, 250);
    }

    #[test]
    fn blank_store_path_means_memory() {
        assert_eq!(config(&[(STORE_PATH_VAR, "  ")]).unwrap().store_path, None);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            config(&[(MAX_ATTEMPTS_VAR, "0")]),
            Err(ConfigError::Invalid { var: MAX_ATTEMPTS_VAR, .. })
        ));
        assert!(matches!(
            config(&[(BIND_ADDR_VAR, "nowhere")]),
            Err(ConfigError::Invalid { var: BIND_ADDR_VAR, .. })
        ));
    }
}
