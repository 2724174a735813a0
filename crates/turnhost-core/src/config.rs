//! Server configuration shared by every client.
//!
//! Build one programmatically with [`Config::default()`] or read it from the
//! environment with [`Config::from_env()`].
//!
//! # Environment Variables
//!
//! All values are optional. Flags are case-insensitive and enabled by `"true"`;
//! numbers that fail to parse fall back to their default.
//!
//! - `TURNHOST_TIMEOUTS` - enforce per-player compute budgets (default: `true`)
//! - `TURNHOST_PRINT_TCP` - log every raw message in and out (default: `false`)
//! - `TURNHOST_TCP_PORT` - port for TCP clients (default: `3000`)
//! - `TURNHOST_WS_PORT` - port for WebSocket clients (default: `3088`)
//! - `TURNHOST_STARTING_TIME_NS` - budget handed to each player (default: 60s)

use std::time::Duration;

/// Default compute budget for a freshly lobbied player.
const DEFAULT_STARTING_TIME_NS: u64 = 60_000_000_000;

/// Process-wide settings, copied into each client at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// When false, clients never tick and never time out.
    pub timeouts_enabled: bool,
    /// Log raw inbound and outbound traffic at debug level.
    pub print_tcp: bool,
    /// Port the TCP listener binds.
    pub tcp_port: u16,
    /// Port the WebSocket listener binds.
    pub ws_port: u16,
    /// Compute budget given to each player when they join a match.
    pub starting_time: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeouts_enabled: true,
            print_tcp: false,
            tcp_port: 3000,
            ws_port: 3088,
            starting_time: Duration::from_nanos(DEFAULT_STARTING_TIME_NS),
        }
    }
}

impl Config {
    /// Create configuration from environment variables.
    ///
    /// Any variable that is unset or malformed keeps its default value.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let flag = |var: &str, default: bool| {
            lookup(var).map_or(default, |val| val.trim().eq_ignore_ascii_case("true"))
        };
        let port = |var: &str, default: u16| {
            lookup(var)
                .and_then(|val| val.trim().parse().ok())
                .unwrap_or(default)
        };

        Self {
            timeouts_enabled: flag("TURNHOST_TIMEOUTS", defaults.timeouts_enabled),
            print_tcp: flag("TURNHOST_PRINT_TCP", defaults.print_tcp),
            tcp_port: port("TURNHOST_TCP_PORT", defaults.tcp_port),
            ws_port: port("TURNHOST_WS_PORT", defaults.ws_port),
            starting_time: lookup("TURNHOST_STARTING_TIME_NS")
                .and_then(|val| val.trim().parse().ok())
                .map_or(defaults.starting_time, Duration::from_nanos),
        }
    }

    /// Config with match timing switched off; handy for spectator-only hosts.
    #[must_use]
    pub fn without_timeouts() -> Self {
        Self {
            timeouts_enabled: false,
            ..Self::default()
        }
    }
}
