use std::{collections::HashMap, fs};

use serde::Deserialize;
use tracing::warn;

pub const DEV_JWT_SECRET: &str = "dev-secret-change-me";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub jwt_secret: String,
    pub history_default_limit: i64,
    pub history_max_limit: i64,
    pub session_outbound_capacity: usize,
    pub enforce_token_expiry: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8000".into(),
            database_url: "sqlite://./data/chat.db".into(),
            jwt_secret: DEV_JWT_SECRET.into(),
            history_default_limit: 50,
            history_max_limit: 500,
            session_outbound_capacity: 64,
            enforce_token_expiry: true,
        }
    }
}

/// Defaults, then `server.toml` in the working directory, then environment.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        match toml::from_str::<HashMap<String, String>>(&raw) {
            Ok(file_cfg) => {
                for (key, value) in &file_cfg {
                    settings.apply(key, value);
                }
            }
            Err(error) => warn!(%error, "ignoring unreadable server.toml"),
        }
    }

    for (var, key) in ENV_KEYS {
        if let Ok(value) = std::env::var(var) {
            settings.apply(key, &value);
        }
    }

    settings.reconcile();
    settings
}

/// Later entries win, so the `APP__` form overrides the short form.
const ENV_KEYS: &[(&str, &str)] = &[
    ("SERVER_BIND", "bind_addr"),
    ("APP__BIND_ADDR", "bind_addr"),
    ("DATABASE_URL", "database_url"),
    ("APP__DATABASE_URL", "database_url"),
    ("JWT_SECRET", "jwt_secret"),
    ("APP__JWT_SECRET", "jwt_secret"),
    ("APP__HISTORY_DEFAULT_LIMIT", "history_default_limit"),
    ("APP__HISTORY_MAX_LIMIT", "history_max_limit"),
    ("APP__SESSION_OUTBOUND_CAPACITY", "session_outbound_capacity"),
    ("APP__ENFORCE_TOKEN_EXPIRY", "enforce_token_expiry"),
];

impl Settings {
    pub fn apply(&mut self, key: &str, value: &str) {
        let value = value.trim();
        match key {
            "bind_addr" | "server_bind" => self.server_bind = value.to_string(),
            "database_url" => self.database_url = value.to_string(),
            "jwt_secret" => self.jwt_secret = value.to_string(),
            "history_default_limit" => parse_into(key, value, &mut self.history_default_limit),
            "history_max_limit" => parse_into(key, value, &mut self.history_max_limit),
            "session_outbound_capacity" => {
                parse_into(key, value, &mut self.session_outbound_capacity)
            }
            "enforce_token_expiry" => parse_into(key, value, &mut self.enforce_token_expiry),
            _ => warn!(%key, "unknown setting ignored"),
        }
    }

    /// Brings dependent settings back into a usable range after loading.
    pub fn reconcile(&mut self) {
        if self.history_max_limit < 1 {
            warn!(
                history_max_limit = self.history_max_limit,
                "history_max_limit must be positive; using 1"
            );
            self.history_max_limit = 1;
        }
        if self.history_default_limit < 0 {
            warn!(
                history_default_limit = self.history_default_limit,
                "history_default_limit must not be negative; using 0"
            );
            self.history_default_limit = 0;
        }
        if self.history_default_limit > self.history_max_limit {
            warn!(
                history_default_limit = self.history_default_limit,
                history_max_limit = self.history_max_limit,
                "history_default_limit exceeds history_max_limit; clamping"
            );
            self.history_default_limit = self.history_max_limit;
        }
        if self.session_outbound_capacity == 0 {
            warn!("session_outbound_capacity must be positive; using 1");
            self.session_outbound_capacity = 1;
        }
    }

    pub fn uses_dev_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

fn parse_into<T: std::str::FromStr>(key: &str, value: &str, slot: &mut T) {
    match value.parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(%key, %value, "invalid setting value ignored"),
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
