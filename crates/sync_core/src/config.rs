use std::time::Duration;

use url::Url;

use crate::error::ConfigError;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(5000);
pub const DEFAULT_HEARTBEAT_INCOMING: Duration = Duration::from_millis(4000);
pub const DEFAULT_HEARTBEAT_OUTGOING: Duration = Duration::from_millis(4000);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_RESET_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_INBOUND_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_MAX_DEFENSE_BONUS: u32 = 3;

/// Connection and reconciliation tuning for one room session.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Game service origin, e.g. `http://localhost:8080`.
    pub base_url: Url,
    /// Push channel endpoint. Derived from `base_url` when unset.
    pub realtime_url: Option<Url>,
    /// The push endpoint is a SockJS prefix; the raw WebSocket lives at
    /// `<prefix>/websocket`. Only affects the derived URL.
    pub sockjs: bool,
    pub reconnect_delay: Duration,
    /// Zero disables the direction.
    pub heartbeat_incoming: Duration,
    pub heartbeat_outgoing: Duration,
    pub handshake_timeout: Duration,
    /// Bound on the graceful unsubscribe/disconnect performed by `close`.
    pub shutdown_timeout: Duration,
    /// How long a reset waits for its broadcast before reloading the board.
    pub reset_confirmation_timeout: Duration,
    pub inbound_queue_capacity: usize,
    pub max_defense_bonus: u32,
}

impl SyncConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            realtime_url: None,
            sockjs: true,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            heartbeat_incoming: DEFAULT_HEARTBEAT_INCOMING,
            heartbeat_outgoing: DEFAULT_HEARTBEAT_OUTGOING,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            reset_confirmation_timeout: DEFAULT_RESET_CONFIRMATION_TIMEOUT,
            inbound_queue_capacity: DEFAULT_INBOUND_QUEUE_CAPACITY,
            max_defense_bonus: DEFAULT_MAX_DEFENSE_BONUS,
        }
    }

    pub fn parse(base_url: &str) -> Result<Self, ConfigError> {
        let base_url = Url::parse(base_url.trim()).map_err(|source| ConfigError::InvalidUrl {
            value: base_url.to_string(),
            source,
        })?;
        match base_url.scheme() {
            "http" | "https" => Ok(Self::new(base_url)),
            other => Err(ConfigError::UnsupportedScheme(other.to_string())),
        }
    }

    #[must_use]
    pub fn with_realtime_url(mut self, realtime_url: Url) -> Self {
        self.realtime_url = Some(realtime_url);
        self
    }

    #[must_use]
    pub fn with_sockjs(mut self, sockjs: bool) -> Self {
        self.sockjs = sockjs;
        self
    }

    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    #[must_use]
    pub fn with_heartbeat(mut self, incoming: Duration, outgoing: Duration) -> Self {
        self.heartbeat_incoming = incoming;
        self.heartbeat_outgoing = outgoing;
        self
    }

    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_reset_confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.reset_confirmation_timeout = timeout;
        self
    }

    /// Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_inbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.inbound_queue_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_max_defense_bonus(mut self, max_defense_bonus: u32) -> Self {
        self.max_defense_bonus = max_defense_bonus;
        self
    }

    /// `http(s)://host/base` becomes `ws(s)://host/base/ws/websocket`, or
    /// `ws(s)://host/base/ws` with SockJS off.
    pub fn resolved_realtime_url(&self) -> Result<Url, ConfigError> {
        if let Some(url) = &self.realtime_url {
            return Ok(url.clone());
        }
        let scheme = match self.base_url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        };
        let mut url = self.base_url.clone();
        url.set_scheme(scheme)
            .map_err(|()| ConfigError::UnsupportedScheme(scheme.to_string()))?;
        let suffix = if self.sockjs { "ws/websocket" } else { "ws" };
        let path = format!("{}/{suffix}", url.path().trim_end_matches('/'));
        url.set_path(&path);
        url.set_query(None);
        Ok(url)
    }

    /// Joins `path` onto the service origin, keeping any base path prefix.
    pub fn endpoint(&self, path: &str) -> Result<Url, ConfigError> {
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            let with_slash = format!("{}/", base.path());
            base.set_path(&with_slash);
        }
        base.join(path.trim_start_matches('/'))
            .map_err(|source| ConfigError::InvalidUrl {
                value: path.to_string(),
                source,
            })
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
