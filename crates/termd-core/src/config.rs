//! Core configuration
//!
//! Fixed constants from the design, overridable through `TERMD_*`
//! environment variables.

use std::time::Duration;

/// Configuration for the terminal/process core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// WebSocket URL of the PTY gateway process.
    pub gateway_url: String,
    /// Port for the bidirectional control channel server.
    pub control_port: u16,
    /// Delay before a reconnect attempt after the gateway connection drops.
    pub reconnect_delay: Duration,
    /// How long a gateway create request may stay unanswered.
    pub create_timeout: Duration,
    /// Exec processes idle longer than this are reaped.
    pub idle_threshold: Duration,
    /// Reaper sweep interval.
    pub reaper_interval: Duration,
    /// Grace period between SIGTERM and SIGKILL when killing an exec process.
    pub kill_grace: Duration,
    /// Max buffered output lines per terminal session (oldest evicted first).
    pub buffer_capacity: usize,
    /// Max buffered lines replayed to a newly attached client.
    pub replay_lines: usize,
    /// Default terminal geometry.
    pub default_cols: u16,
    pub default_rows: u16,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            gateway_url: "ws://127.0.0.1:9301/gateway".to_string(),
            control_port: 9300,
            reconnect_delay: Duration::from_secs(3),
            create_timeout: Duration::from_secs(10),
            idle_threshold: Duration::from_secs(300),
            reaper_interval: Duration::from_secs(30),
            kill_grace: Duration::from_secs(5),
            buffer_capacity: 1000,
            replay_lines: 200,
            default_cols: 80,
            default_rows: 24,
        }
    }
}

impl CoreConfig {
    /// Build a config from the environment, falling back to defaults.
    ///
    /// Durations are given in milliseconds (`TERMD_RECONNECT_DELAY_MS` etc.).
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("TERMD_GATEWAY_URL") {
            config.gateway_url = url;
        }
        if let Some(port) = env_parse("TERMD_CONTROL_PORT") {
            config.control_port = port;
        }
        if let Some(ms) = env_parse("TERMD_RECONNECT_DELAY_MS") {
            config.reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("TERMD_CREATE_TIMEOUT_MS") {
            config.create_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("TERMD_IDLE_THRESHOLD_MS") {
            config.idle_threshold = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("TERMD_REAPER_INTERVAL_MS") {
            config.reaper_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("TERMD_KILL_GRACE_MS") {
            config.kill_grace = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse("TERMD_BUFFER_CAPACITY") {
            config.buffer_capacity = n;
        }
        if let Some(n) = env_parse("TERMD_REPLAY_LINES") {
            config.replay_lines = n;
        }
        if let Some(n) = env_parse("TERMD_DEFAULT_COLS") {
            config.default_cols = n;
        }
        if let Some(n) = env_parse("TERMD_DEFAULT_ROWS") {
            config.default_rows = n;
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.control_port, 9300);
        assert_eq!(config.buffer_capacity, 1000);
        assert!(config.replay_lines <= config.buffer_capacity);
        assert_eq!(config.reconnect_delay, Duration::from_secs(3));
        assert_eq!(config.default_cols, 80);
        assert_eq!(config.default_rows, 24);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("TERMD_BUFFER_CAPACITY", "64");
        std::env::set_var("TERMD_CREATE_TIMEOUT_MS", "2500");
        let config = CoreConfig::from_env();
        assert_eq!(config.buffer_capacity, 64);
        assert_eq!(config.create_timeout, Duration::from_millis(2500));
        std::env::remove_var("TERMD_BUFFER_CAPACITY");
        std::env::remove_var("TERMD_CREATE_TIMEOUT_MS");
    }

    #[test]
    fn test_env_parse_rejects_garbage() {
        std::env::set_var("TERMD_CONTROL_PORT_BAD", "not-a-port");
        let parsed: Option<u16> = env_parse("TERMD_CONTROL_PORT_BAD");
        assert!(parsed.is_none());
        std::env::remove_var("TERMD_CONTROL_PORT_BAD");
    }
}
