//! Session configuration.
//!
//! All fields have defaults, so a JSON document only needs the keys it
//! overrides:
//!
//! ```
//! use wiredrop::SessionConfig;
//!
//! let config = SessionConfig::from_json_str(r#"{ "fragment_size": 4096 }"#).unwrap();
//! assert_eq!(config.fragment_size, 4096);
//! assert!(config.teardown_on_malformed);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WireDropError};
use crate::protocol::{ClientType, DEFAULT_MAX_INBOUND_FRAGMENT};
use crate::version::{ConnectionVersion, MIN_SUPPORTED_PROTOCOL_VERSION, PROTOCOL_VERSION};
use crate::writer::{
    WriterConfig, DEFAULT_BACKPRESSURE_TIMEOUT, DEFAULT_CHANNEL_CAPACITY,
    DEFAULT_MAX_PENDING_MESSAGES,
};

/// Default outbound fragment size (64 KiB).
pub const DEFAULT_FRAGMENT_SIZE: u32 = 64 * 1024;

/// Versions declared by the peer during connection setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerVersion {
    pub version: u32,
    pub min_supported: u32,
}

/// Configuration for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum payload bytes per outbound fragment.
    pub fragment_size: u32,
    /// Inbound fragments declaring more bytes than this are malformed.
    pub max_inbound_fragment_size: u32,
    pub local_version: u32,
    pub local_min_supported_version: u32,
    /// Peer versions, if already exchanged. Transfers are refused until set.
    pub peer_version: Option<PeerVersion>,
    /// Client type announced in outbound start requests.
    pub client_type: ClientType,
    /// Queued outbound messages before senders wait.
    pub max_pending_messages: usize,
    pub channel_capacity: usize,
    pub backpressure_timeout_ms: u64,
    /// Stop reading after a malformed message instead of resynchronising.
    pub teardown_on_malformed: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            max_inbound_fragment_size: DEFAULT_MAX_INBOUND_FRAGMENT,
            local_version: PROTOCOL_VERSION,
            local_min_supported_version: MIN_SUPPORTED_PROTOCOL_VERSION,
            peer_version: None,
            client_type: ClientType::MacApp,
            max_pending_messages: DEFAULT_MAX_PENDING_MESSAGES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout_ms: DEFAULT_BACKPRESSURE_TIMEOUT.as_millis() as u64,
            teardown_on_malformed: true,
        }
    }
}

impl SessionConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the session cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.fragment_size == 0 {
            return Err(WireDropError::InvalidConfig(
                "fragment_size must be greater than zero".into(),
            ));
        }
        if self.max_inbound_fragment_size == 0 {
            return Err(WireDropError::InvalidConfig(
                "max_inbound_fragment_size must be greater than zero".into(),
            ));
        }
        if self.channel_capacity == 0 || self.max_pending_messages == 0 {
            return Err(WireDropError::InvalidConfig(
                "channel_capacity and max_pending_messages must be greater than zero".into(),
            ));
        }
        if self.local_min_supported_version > self.local_version {
            return Err(WireDropError::InvalidConfig(format!(
                "local_min_supported_version {} is newer than local_version {}",
                self.local_min_supported_version, self.local_version
            )));
        }
        Ok(())
    }

    pub fn backpressure_timeout(&self) -> Duration {
        Duration::from_millis(self.backpressure_timeout_ms)
    }

    /// Writer settings derived from this configuration.
    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            max_pending_messages: self.max_pending_messages,
            channel_capacity: self.channel_capacity,
            backpressure_timeout: self.backpressure_timeout(),
        }
    }

    /// Version record for `peer` against the local versions.
    pub fn connection_version(&self, peer: PeerVersion) -> ConnectionVersion {
        ConnectionVersion::new(
            self.local_version,
            self.local_min_supported_version,
            peer.version,
            peer.min_supported,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.fragment_size, 64 * 1024);
        assert_eq!(config.max_inbound_fragment_size, 1024 * 1024);
        assert_eq!(config.local_version, 0);
        assert_eq!(config.local_min_supported_version, 0);
        assert!(config.peer_version.is_none());
        assert!(config.teardown_on_malformed);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config = SessionConfig::from_json_str(
            r#"{
                "fragment_size": 4,
                "client_type": "ios_extension",
                "peer_version": { "version": 0, "min_supported": 0 },
                "teardown_on_malformed": false
            }"#,
        )
        .unwrap();

        assert_eq!(config.fragment_size, 4);
        assert_eq!(config.client_type, ClientType::IosExtension);
        assert_eq!(
            config.peer_version,
            Some(PeerVersion {
                version: 0,
                min_supported: 0
            })
        );
        assert!(!config.teardown_on_malformed);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
    }

    #[test]
    fn test_invalid_json() {
        let err = SessionConfig::from_json_str("{ fragment_size: }").unwrap_err();
        assert!(matches!(err, WireDropError::Json(_)));
    }

    #[test]
    fn test_zero_fragment_size_rejected() {
        let err = SessionConfig::from_json_str(r#"{ "fragment_size": 0 }"#).unwrap_err();
        assert!(matches!(err, WireDropError::InvalidConfig(_)));
    }

    #[test]
    fn test_min_above_version_rejected() {
        let config = SessionConfig {
            local_version: 1,
            local_min_supported_version: 2,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_writer_config() {
        let config = SessionConfig {
            max_pending_messages: 8,
            channel_capacity: 4,
            backpressure_timeout_ms: 250,
            ..SessionConfig::default()
        };
        let writer = config.writer_config();
        assert_eq!(writer.max_pending_messages, 8);
        assert_eq!(writer.channel_capacity, 4);
        assert_eq!(writer.backpressure_timeout, Duration::from_millis(250));
    }
}
