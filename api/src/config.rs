use std::env;
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DATABASE: &str = "models";

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error(
        "Invalid database name '{0}': must start with a lowercase letter and contain only a-z, 0-9, _, $, (, ), +, - or /"
    )]
    InvalidDatabaseName(String),
}

/// Server settings read from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub port: u16,
    /// Document store database holding every model.
    pub database: String,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// A bad `PORT` falls back to the default; a bad database name is an
    /// error, since a silent fallback would write to the wrong database.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = match lookup("PORT") {
            Some(port_str) => match port_str.parse::<u16>() {
                Ok(port_num) => {
                    info!("Using port {} from environment variable PORT.", port_num);
                    port_num
                }
                Err(_) => {
                    warn!(
                        "Invalid PORT value '{}' in environment variable. Using default port {}.",
                        port_str, DEFAULT_PORT
                    );
                    DEFAULT_PORT
                }
            },
            None => {
                info!(
                    "PORT environment variable not set. Using default port {}.",
                    DEFAULT_PORT
                );
                DEFAULT_PORT
            }
        };

        let database = match lookup("COUCH_DATABASE") {
            Some(name) if !name.trim().is_empty() => {
                let name = name.trim().to_string();
                if !is_valid_database_name(&name) {
                    return Err(ConfigError::InvalidDatabaseName(name));
                }
                info!("Using database '{}' from environment variable COUCH_DATABASE.", name);
                name
            }
            _ => {
                info!(
                    "COUCH_DATABASE environment variable not set. Using default database '{}'.",
                    DEFAULT_DATABASE
                );
                DEFAULT_DATABASE.to_string()
            }
        };

        Ok(Self { port, database })
    }
}

fn is_valid_database_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_lowercase())
        && chars.all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || "_$()+-/".contains(c)
        })
}
