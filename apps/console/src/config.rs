use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;
use sync_core::SyncConfig;
use tracing::warn;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server_url: String,
    pub realtime_url: Option<String>,
    /// Append SockJS's `/websocket` when deriving the push endpoint.
    pub sockjs: bool,
    /// Auth service origin; defaults to `server_url`.
    pub auth_url: Option<String>,
    pub room: String,
    pub token: Option<String>,
    pub session_cookie: Option<String>,
    pub actor_id: Option<String>,
    pub reconnect_delay_ms: u64,
    pub heartbeat_ms: u64,
    pub max_defense_bonus: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".into(),
            realtime_url: None,
            sockjs: true,
            auth_url: None,
            room: "default".into(),
            token: None,
            session_cookie: None,
            actor_id: None,
            reconnect_delay_ms: 5000,
            heartbeat_ms: 4000,
            max_defense_bonus: 3,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    realtime_url: Option<String>,
    sockjs: Option<bool>,
    auth_url: Option<String>,
    room: Option<String>,
    token: Option<String>,
    session_cookie: Option<String>,
    actor_id: Option<String>,
    reconnect_delay_ms: Option<u64>,
    heartbeat_ms: Option<u64>,
    max_defense_bonus: Option<u32>,
}

pub fn load_settings(path: &Path) -> Settings {
    load_settings_with(path, |key| std::env::var(key).ok())
}

/// Defaults, then the TOML file, then `APP__*` variables.
pub fn load_settings_with(path: &Path, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file) => apply_file(&mut settings, file),
            Err(err) => warn!(
                path = %path.display(),
                error = %err,
                "config: ignoring unreadable settings file"
            ),
        }
    }

    if let Some(v) = env("APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = env("APP__REALTIME_URL") {
        settings.realtime_url = Some(v);
    }
    if let Some(parsed) = env("APP__SOCKJS").and_then(|v| v.parse().ok()) {
        settings.sockjs = parsed;
    }
    if let Some(v) = env("APP__AUTH_URL") {
        settings.auth_url = Some(v);
    }
    if let Some(v) = env("APP__ROOM") {
        settings.room = v;
    }
    if let Some(v) = env("APP__TOKEN") {
        settings.token = Some(v);
    }
    if let Some(v) = env("APP__SESSION_COOKIE") {
        settings.session_cookie = Some(v);
    }
    if let Some(v) = env("APP__ACTOR_ID") {
        settings.actor_id = Some(v);
    }
    if let Some(parsed) = env("APP__RECONNECT_DELAY_MS").and_then(|v| v.parse().ok()) {
        settings.reconnect_delay_ms = parsed;
    }
    if let Some(parsed) = env("APP__HEARTBEAT_MS").and_then(|v| v.parse().ok()) {
        settings.heartbeat_ms = parsed;
    }
    if let Some(parsed) = env("APP__MAX_DEFENSE_BONUS").and_then(|v| v.parse().ok()) {
        settings.max_defense_bonus = parsed;
    }

    settings
}

fn apply_file(settings: &mut Settings, file: FileSettings) {
    if let Some(v) = file.server_url {
        settings.server_url = v;
    }
    if file.realtime_url.is_some() {
        settings.realtime_url = file.realtime_url;
    }
    if let Some(v) = file.sockjs {
        settings.sockjs = v;
    }
    if file.auth_url.is_some() {
        settings.auth_url = file.auth_url;
    }
    if let Some(v) = file.room {
        settings.room = v;
    }
    if file.token.is_some() {
        settings.token = file.token;
    }
    if file.session_cookie.is_some() {
        settings.session_cookie = file.session_cookie;
    }
    if file.actor_id.is_some() {
        settings.actor_id = file.actor_id;
    }
    if let Some(v) = file.reconnect_delay_ms {
        settings.reconnect_delay_ms = v;
    }
    if let Some(v) = file.heartbeat_ms {
        settings.heartbeat_ms = v;
    }
    if let Some(v) = file.max_defense_bonus {
        settings.max_defense_bonus = v;
    }
}

impl Settings {
    pub fn sync_config(&self) -> anyhow::Result<SyncConfig> {
        let heartbeat = Duration::from_millis(self.heartbeat_ms);
        let mut config = SyncConfig::parse(&self.server_url)
            .with_context(|| format!("invalid server url '{}'", self.server_url))?
            .with_reconnect_delay(Duration::from_millis(self.reconnect_delay_ms))
            .with_heartbeat(heartbeat, heartbeat)
            .with_max_defense_bonus(self.max_defense_bonus)
            .with_sockjs(self.sockjs);
        if let Some(raw) = &self.realtime_url {
            let url = Url::parse(raw).with_context(|| format!("invalid realtime url '{raw}'"))?;
            config = config.with_realtime_url(url);
        }
        Ok(config)
    }

    pub fn auth_base(&self) -> anyhow::Result<Url> {
        let raw = self.auth_url.as_deref().unwrap_or(&self.server_url);
        Url::parse(raw).with_context(|| format!("invalid auth url '{raw}'"))
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
