use crate::error::ConfigError;
use std::time::Duration;

/// The original engine's fixed, non-secret initial sequence number (§9). Kept as a configurable
/// default rather than hardcoded, so an embedder wanting randomized ISNs can supply one without
/// forking the crate.
pub const DEFAULT_INITIAL_SEQ: u32 = 0x77EB_77EB;

/// Typed knobs for the handful of constants the original engine fixes at compile time.
///
/// Construct with [`Config::default`] and adjust with the `with_*` builder methods, then call
/// [`Config::validate`] (the engine constructor does this for you).
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub max_window: u32,
    pub socket_ceiling: usize,
    pub overload_target: usize,
    pub tcp_idle_timeout: Duration,
    pub udp_idle_timeout: Duration,
    pub icmp_idle_timeout: Duration,
    pub initial_seq: u32,
}

impl Config {
    /// Platform-dependent defaults matching the original engine: a 55/40 ceiling/target pair on
    /// systems limited to 64 descriptors per readiness set, 128/96 otherwise. This crate doesn't
    /// own the readiness set itself (§5 — that's external), so it picks the conservative pair;
    /// an embedder that knows its platform's actual limit should override it with
    /// [`Config::with_socket_ceiling`].
    pub fn new() -> Config {
        Config {
            max_window: 14600,
            socket_ceiling: 55,
            overload_target: 40,
            tcp_idle_timeout: Duration::from_secs(30),
            udp_idle_timeout: Duration::from_secs(15),
            icmp_idle_timeout: Duration::from_secs(5),
            initial_seq: DEFAULT_INITIAL_SEQ,
        }
    }

    pub fn with_max_window(mut self, max_window: u32) -> Self {
        self.max_window = max_window;
        self
    }

    pub fn with_socket_ceiling(mut self, ceiling: usize, overload_target: usize) -> Self {
        self.socket_ceiling = ceiling;
        self.overload_target = overload_target;
        self
    }

    pub fn with_idle_timeouts(mut self, tcp: Duration, udp: Duration, icmp: Duration) -> Self {
        self.tcp_idle_timeout = tcp;
        self.udp_idle_timeout = udp;
        self.icmp_idle_timeout = icmp;
        self
    }

    pub fn with_initial_seq(mut self, seed: u32) -> Self {
        self.initial_seq = seed;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.overload_target >= self.socket_ceiling {
            return Err(ConfigError::OverloadTargetNotBelowCeiling);
        }

        if self.tcp_idle_timeout.is_zero() || self.udp_idle_timeout.is_zero() || self.icmp_idle_timeout.is_zero() {
            return Err(ConfigError::ZeroIdleTimeout);
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}
