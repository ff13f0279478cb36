//! Environment configuration with typed defaults. An empty `ROOT_CA` means
//! the system trust store.

use std::{env, path::PathBuf};

#[derive(Debug)]
pub struct Config {
    pub log_level: String,
    pub listen_addr: String,
    pub root_ca: Option<PathBuf>,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
    pub remote_url: String,
    pub insecure_skip_verify: bool,
}

impl Config {
    pub fn from_env() -> Config {
        Config {
            log_level: env_or("LOG_LEVEL", "info"),
            listen_addr: env_or("LISTEN_ADDR", "localhost:8080"),
            root_ca: optional_path("ROOT_CA"),
            client_cert: PathBuf::from(env_or("CLIENT_CERT", "client.pem")),
            client_key: PathBuf::from(env_or("CLIENT_KEY", "client.key")),
            remote_url: env_or("REMOTE_URL", "https://localhost:8443"),
            insecure_skip_verify: env_flag("INSECURE_SKIP_VERIFY"),
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

fn env_flag(name: &str) -> bool {
    matches!(env::var(name).as_deref(), Ok("1") | Ok("true") | Ok("yes"))
}
