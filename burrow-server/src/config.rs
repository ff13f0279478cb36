//! Environment configuration with typed defaults. A configured `ROOT_CA`
//! switches the listener to mandatory client-certificate verification.

use std::{env, path::PathBuf};

#[derive(Debug)]
pub struct Config {
    pub log_level: String,
    pub listen_addr: String,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    pub root_ca: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Config {
        Config {
            log_level: env_or("LOG_LEVEL", "info"),
            listen_addr: env_or("LISTEN_ADDR", "0.0.0.0:8443"),
            server_cert: PathBuf::from(env_or("SERVER_CERT", "server.pem")),
            server_key: PathBuf::from(env_or("SERVER_KEY", "server.key")),
            root_ca: optional_path("ROOT_CA"),
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn optional_path(name: &str) -> Option<PathBuf> {
    env::var(name).ok().filter(|value| !value.is_empty()).map(PathBuf::from)
}
