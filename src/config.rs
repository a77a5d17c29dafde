//! Tunables for a [`TcpStack`](crate::tcp::TcpStack).

use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

/// Every knob the TCP engine reads. Durations are in milliseconds and are
/// turned into coarse timer ticks with [`TcpConfig::ticks`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Time to live of outgoing datagrams
    pub ttl: u8,
    /// Maximum segment size announced and used until the peer announces its
    /// own
    pub mss: u16,
    /// Receive window, also the upper bound for reopening it
    pub wnd: u32,
    /// Send buffer credit of a new connection, in bytes
    pub snd_buf: usize,
    /// Maximum number of buffers queued on one connection. Defaults to
    /// `4 * snd_buf / mss`.
    pub snd_queuelen: Option<usize>,
    /// Smallest allocation for a short trailing segment, so that later small
    /// writes can be appended to it in place
    pub min_seg_size: usize,
    /// Retransmissions before a connection is dropped
    pub max_rtx: u8,
    /// Retransmissions of a SYN before an active open gives up
    pub syn_max_rtx: u8,
    pub slow_interval_ms: u64,
    pub fast_interval_ms: u64,
    pub fin_wait_timeout_ms: u64,
    pub syn_rcvd_timeout_ms: u64,
    /// Maximum segment lifetime; TIME_WAIT lasts twice this
    pub msl_ms: u64,
    pub initial_rto_ms: u64,
    /// First port of the ephemeral range
    pub first_port: u16,
    /// Last port of the ephemeral range
    pub last_port: u16,
    /// Seed for initial sequence numbers. Random when absent.
    pub iss_seed: Option<u64>,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            ttl: 255,
            mss: 536,
            wnd: 4096,
            snd_buf: 2048,
            snd_queuelen: None,
            min_seg_size: 64,
            max_rtx: 12,
            syn_max_rtx: 6,
            slow_interval_ms: 500,
            fast_interval_ms: 100,
            fin_wait_timeout_ms: 20_000,
            syn_rcvd_timeout_ms: 20_000,
            msl_ms: 60_000,
            initial_rto_ms: 3000,
            first_port: 4096,
            last_port: 0x7fff,
            iss_seed: None,
        }
    }
}

impl TcpConfig {
    /// Parses a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the values that would make the engine misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mss == 0 {
            return Err(ConfigError::Invalid("mss must be positive"));
        }
        if self.wnd > u16::MAX as u32 {
            return Err(ConfigError::Invalid("wnd must fit the 16-bit window field"));
        }
        if self.slow_interval_ms == 0 || self.fast_interval_ms == 0 {
            return Err(ConfigError::Invalid("timer intervals must be positive"));
        }
        if self.first_port == 0 || self.first_port > self.last_port {
            return Err(ConfigError::Invalid("ephemeral port range is empty"));
        }
        if self.snd_queuelen() == 0 {
            return Err(ConfigError::Invalid("snd_queuelen must be positive"));
        }
        Ok(())
    }

    /// The maximum number of buffers queued on one connection.
    pub fn snd_queuelen(&self) -> usize {
        self.snd_queuelen
            .unwrap_or(4 * self.snd_buf / self.mss.max(1) as usize)
    }

    /// Converts a duration to coarse timer ticks, rounding down.
    pub fn ticks(&self, ms: u64) -> u32 {
        (ms / self.slow_interval_ms.max(1)).try_into().unwrap_or(u32::MAX)
    }

    /// The retransmission timeout of a new connection, in ticks.
    pub fn initial_rto(&self) -> u32 {
        self.ticks(self.initial_rto_ms)
    }
}

#[derive(Debug, ThisError)]
pub enum ConfigError {
    #[error("Malformed configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
