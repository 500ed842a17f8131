//! Transport configuration.
//!
//! Retry counts, timeouts and the fragmentation threshold are tunable
//! product parameters, so every endpoint takes them from a
//! [`TransportConfig`] instead of hard-coding them.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::constants::{
    DEFAULT_HANDSHAKE_ATTEMPTS, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_BUFFERED_BYTES,
    DEFAULT_MAX_PARTIAL_MESSAGES, DEFAULT_MAX_PAYLOAD, DEFAULT_MAX_RETRIES, DEFAULT_MAX_SESSIONS,
    DEFAULT_POLL_INTERVAL, DEFAULT_RECEIVE_TIMEOUT, DEFAULT_RECEIVE_WINDOW,
    DEFAULT_RETRANSMIT_TIMEOUT, MAX_TIMEOUT, MAX_WIRE_PAYLOAD,
};
use super::error::CofError;

/// Endpoint configuration.
///
/// Deserializes from the `network` section of a repository config:
///
/// ```json
/// { "network": { "packet_size": 1200, "timeout_ms": 5000, "max_retries": 3 } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Largest payload carried by one packet; larger messages are fragmented.
    #[serde(alias = "packet_size")]
    pub max_payload_size: usize,

    /// Retransmission timeout in milliseconds.
    pub timeout_ms: u64,

    /// Retransmissions of one DATA packet before the send fails.
    pub max_retries: u32,

    /// Handshake requests sent per connect.
    pub handshake_attempts: u32,

    /// Bound on a single `receive` in milliseconds.
    pub receive_timeout_ms: u64,

    /// Close sessions with no inbound traffic for this long (milliseconds).
    pub idle_timeout_ms: u64,

    /// Reliability tick period in milliseconds.
    pub poll_interval_ms: u64,

    /// Maximum concurrent sessions on a server endpoint.
    pub max_sessions: usize,

    /// Inbound sequences accepted beyond the lowest one still missing.
    /// DATA further ahead is dropped unacknowledged.
    pub receive_window: u32,

    /// Partially reassembled messages kept per session.
    pub max_partial_messages: usize,

    /// Bytes buffered per session for the application, reassembly included.
    /// DATA that would exceed it is dropped unacknowledged.
    pub max_buffered_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            timeout_ms: DEFAULT_RETRANSMIT_TIMEOUT.as_millis() as u64,
            max_retries: DEFAULT_MAX_RETRIES,
            handshake_attempts: DEFAULT_HANDSHAKE_ATTEMPTS,
            receive_timeout_ms: DEFAULT_RECEIVE_TIMEOUT.as_millis() as u64,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT.as_millis() as u64,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            max_sessions: DEFAULT_MAX_SESSIONS,
            receive_window: DEFAULT_RECEIVE_WINDOW,
            max_partial_messages: DEFAULT_MAX_PARTIAL_MESSAGES,
            max_buffered_bytes: DEFAULT_MAX_BUFFERED_BYTES,
        }
    }
}

/// Accepts both a bare config object and `{"network": {...}}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ConfigDocument {
    Wrapped { network: TransportConfig },
    Bare(TransportConfig),
}

impl TransportConfig {
    /// Parse and validate a JSON config.
    pub fn from_json(json: &str) -> Result<Self, CofError> {
        let document: ConfigDocument =
            serde_json::from_str(json).map_err(|e| CofError::Config(e.to_string()))?;
        let config = match document {
            ConfigDocument::Wrapped { network } => network,
            ConfigDocument::Bare(config) => config,
        };
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CofError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Reject values the transport cannot operate with.
    pub fn validate(&self) -> Result<(), CofError> {
        if self.max_payload_size == 0 || self.max_payload_size > MAX_WIRE_PAYLOAD {
            return Err(CofError::Config(format!(
                "max_payload_size must be in 1..={MAX_WIRE_PAYLOAD}, got {}",
                self.max_payload_size
            )));
        }
        check_millis("timeout_ms", self.timeout_ms)?;
        check_millis("receive_timeout_ms", self.receive_timeout_ms)?;
        check_millis("idle_timeout_ms", self.idle_timeout_ms)?;
        check_millis("poll_interval_ms", self.poll_interval_ms)?;
        if self.handshake_attempts == 0 {
            return Err(CofError::Config("handshake_attempts must be positive".into()));
        }
        if self.max_sessions == 0 {
            return Err(CofError::Config("max_sessions must be positive".into()));
        }
        if self.receive_window == 0 {
            return Err(CofError::Config("receive_window must be positive".into()));
        }
        if self.max_partial_messages == 0 {
            return Err(CofError::Config("max_partial_messages must be positive".into()));
        }
        if self.max_buffered_bytes < self.max_payload_size {
            return Err(CofError::Config(format!(
                "max_buffered_bytes must hold at least one packet ({} bytes), got {}",
                self.max_payload_size, self.max_buffered_bytes
            )));
        }
        Ok(())
    }

    /// Retransmission timeout.
    pub fn retransmit_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Bound on a single `receive`.
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    /// Inbound idle limit per session.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Reliability tick period.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Timeouts must be positive and no longer than [`MAX_TIMEOUT`], so that
/// deadlines computed from them never overflow an `Instant`.
fn check_millis(name: &str, value: u64) -> Result<(), CofError> {
    let max = MAX_TIMEOUT.as_millis() as u64;
    if value == 0 || value > max {
        return Err(CofError::Config(format!(
            "{name} must be in 1..={max} ms, got {value}"
        )));
    }
    Ok(())
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Builder for [`TransportConfig`].
#[derive(Debug, Default)]
pub struct TransportConfigBuilder {
    config: TransportConfig,
}

impl TransportConfigBuilder {
    /// Start from the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fragmentation threshold.
    pub fn max_payload_size(mut self, size: usize) -> Self {
        self.config.max_payload_size = size;
        self
    }

    /// Set the retransmission timeout.
    pub fn retransmit_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout_ms = millis(timeout);
        self
    }

    /// Set the retransmission budget per DATA packet.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    /// Set the handshake request budget.
    pub fn handshake_attempts(mut self, attempts: u32) -> Self {
        self.config.handshake_attempts = attempts;
        self
    }

    /// Set the `receive` bound.
    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.config.receive_timeout_ms = millis(timeout);
        self
    }

    /// Set the idle limit.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout_ms = millis(timeout);
        self
    }

    /// Set the reliability tick period.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval_ms = millis(interval);
        self
    }

    /// Set the server session limit.
    pub fn max_sessions(mut self, max: usize) -> Self {
        self.config.max_sessions = max;
        self
    }

    /// Set the inbound sequence window.
    pub fn receive_window(mut self, window: u32) -> Self {
        self.config.receive_window = window;
        self
    }

    /// Set the per-session limit on partially reassembled messages.
    pub fn max_partial_messages(mut self, max: usize) -> Self {
        self.config.max_partial_messages = max;
        self
    }

    /// Set the per-session inbound buffer limit.
    pub fn max_buffered_bytes(mut self, max: usize) -> Self {
        self.config.max_buffered_bytes = max;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<TransportConfig, CofError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TransportConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_payload_size, DEFAULT_MAX_PAYLOAD);
        assert_eq!(config.retransmit_timeout(), DEFAULT_RETRANSMIT_TIMEOUT);
    }

    #[test]
    fn test_network_section() {
        let json = r#"{ "network": { "packet_size": 1024, "timeout_ms": 500, "max_retries": 2 } }"#;
        let config = TransportConfig::from_json(json).unwrap();

        assert_eq!(config.max_payload_size, 1024);
        assert_eq!(config.retransmit_timeout(), Duration::from_millis(500));
        assert_eq!(config.max_retries, 2);
        // Unspecified fields keep their defaults
        assert_eq!(config.handshake_attempts, DEFAULT_HANDSHAKE_ATTEMPTS);
    }

    #[test]
    fn test_bare_object() {
        let config = TransportConfig::from_json(r#"{ "max_payload_size": 512 }"#).unwrap();
        assert_eq!(config.max_payload_size, 512);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            TransportConfig::from_json(r#"{ "max_payload_size": 0 }"#),
            Err(CofError::Config(_))
        ));
        assert!(matches!(
            TransportConfig::from_json(r#"{ "max_payload_size": 70000 }"#),
            Err(CofError::Config(_))
        ));
        assert!(matches!(
            TransportConfig::from_json(r#"{ "timeout_ms": 0 }"#),
            Err(CofError::Config(_))
        ));
        assert!(matches!(
            TransportConfig::from_json(r#"{ "receive_window": 0 }"#),
            Err(CofError::Config(_))
        ));
        assert!(matches!(
            TransportConfig::from_json(r#"{ "packet_size": 1200, "max_buffered_bytes": 100 }"#),
            Err(CofError::Config(_))
        ));
        assert!(matches!(
            TransportConfig::from_json("not json"),
            Err(CofError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_timeouts_past_a_day() {
        for field in ["timeout_ms", "receive_timeout_ms", "idle_timeout_ms", "poll_interval_ms"] {
            let json = format!(r#"{{ "{field}": 18446744073709551615 }}"#);
            assert!(
                matches!(TransportConfig::from_json(&json), Err(CofError::Config(_))),
                "{field} accepted u64::MAX"
            );
        }

        let day = MAX_TIMEOUT.as_millis() as u64;
        let json = format!(r#"{{ "idle_timeout_ms": {day} }}"#);
        assert_eq!(TransportConfig::from_json(&json).unwrap().idle_timeout(), MAX_TIMEOUT);

        let huge = Duration::from_secs(u64::MAX);
        assert!(TransportConfigBuilder::new().retransmit_timeout(huge).build().is_err());
        assert!(TransportConfigBuilder::new().receive_timeout(huge).build().is_err());
    }

    #[test]
    fn test_builder() {
        let config = TransportConfigBuilder::new()
            .max_payload_size(64)
            .retransmit_timeout(Duration::from_millis(50))
            .max_retries(5)
            .handshake_attempts(2)
            .build()
            .unwrap();

        assert_eq!(config.max_payload_size, 64);
        assert_eq!(config.timeout_ms, 50);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.handshake_attempts, 2);

        assert!(TransportConfigBuilder::new().max_sessions(0).build().is_err());

        let config = TransportConfigBuilder::new()
            .receive_window(16)
            .max_partial_messages(2)
            .max_buffered_bytes(4096)
            .build()
            .unwrap();
        assert_eq!(config.receive_window, 16);
        assert_eq!(config.max_partial_messages, 2);
        assert_eq!(config.max_buffered_bytes, 4096);
        assert!(TransportConfigBuilder::new().max_partial_messages(0).build().is_err());
    }
}
