//! Connection configuration and backend URL parsing.

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::DEFAULT_PKT_SIZE;
use crate::wire::MIN_PKT_SIZE;
use crate::{GcsError, GcsResult};

// ============================================================================
// Backend URL
// ============================================================================

/// Recognized backend types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendType {
    /// In-process loopback; the address is ignored. Used for testing and
    /// single-process deployments.
    Dummy,
    /// Spread toolkit daemon.
    Spread,
    /// Native group communication transport.
    Gcomm,
}

impl Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BackendType::Dummy => "dummy",
            BackendType::Spread => "spread",
            BackendType::Gcomm => "gcomm",
        };
        write!(f, "{name}")
    }
}

/// A parsed backend URL of the form `type://address`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendUrl {
    /// The transport type.
    pub backend: BackendType,
    /// The address part; interpretation is transport-specific.
    pub address: String,
}

impl FromStr for BackendUrl {
    type Err = GcsError;

    fn from_str(s: &str) -> GcsResult<Self> {
        let (scheme, address) = s
            .split_once("://")
            .ok_or_else(|| GcsError::InvalidUrl(s.to_owned()))?;

        let backend = match scheme {
            "dummy" => BackendType::Dummy,
            "spread" => BackendType::Spread,
            "gcomm" => BackendType::Gcomm,
            _ => return Err(GcsError::InvalidUrl(s.to_owned())),
        };

        Ok(Self {
            backend,
            address: address.to_owned(),
        })
    }
}

impl Display for BackendUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.backend, self.address)
    }
}

// ============================================================================
// Connection Configuration
// ============================================================================

/// Tunables of a connection.
///
/// The packet size can also be changed after `open` via
/// [`Connection::set_pkt_size`](crate::Connection::set_pkt_size); the other
/// knobs are fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Maximum desired network packet size in bytes. Ideally a multiple of
    /// the path MTU. Must be at least [`MIN_PKT_SIZE`].
    pub pkt_size: usize,

    /// Capacity of the receive queue between the delivery worker and `recv`.
    pub recv_queue_depth: usize,

    /// Applier lag (in actions) below which a paused node resumes the group.
    pub fc_low_watermark: u64,

    /// Applier lag (in actions) above which a node pauses the group.
    pub fc_high_watermark: u64,

    /// Timestamp outgoing actions locally.
    pub self_tstamp: bool,

    /// Verbose protocol tracing.
    pub debug: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            pkt_size: DEFAULT_PKT_SIZE,
            recv_queue_depth: 4096,
            fc_low_watermark: 128,
            fc_high_watermark: 512,
            self_tstamp: false,
            debug: false,
        }
    }
}

impl ConnectionConfig {
    /// Configuration with small bounds, suitable for tests.
    pub fn testing() -> Self {
        Self {
            pkt_size: 1024,
            recv_queue_depth: 256,
            fc_low_watermark: 4,
            fc_high_watermark: 16,
            self_tstamp: false,
            debug: true,
        }
    }

    /// Validates the packet size against the fragment header overhead.
    pub fn validate(&self) -> GcsResult<()> {
        validate_pkt_size(self.pkt_size)?;
        if self.fc_low_watermark >= self.fc_high_watermark {
            return Err(GcsError::InvalidConfig(format!(
                "flow control watermarks inverted: low {} >= high {}",
                self.fc_low_watermark, self.fc_high_watermark
            )));
        }
        Ok(())
    }
}

/// Checks that a packet size leaves room for a header and payload.
pub fn validate_pkt_size(pkt_size: usize) -> GcsResult<()> {
    if pkt_size < MIN_PKT_SIZE {
        return Err(GcsError::InvalidPacketSize {
            requested: pkt_size,
            min: MIN_PKT_SIZE,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_parsing() {
        let url: BackendUrl = "dummy://".parse().unwrap();
        assert_eq!(url.backend, BackendType::Dummy);
        assert!(url.address.is_empty());

        let url: BackendUrl = "spread://localhost:4803".parse().unwrap();
        assert_eq!(url.backend, BackendType::Spread);
        assert_eq!(url.address, "localhost:4803");

        let url: BackendUrl = "gcomm://10.0.0.1".parse().unwrap();
        assert_eq!(url.backend, BackendType::Gcomm);
    }

    #[test]
    fn url_parsing_rejects_garbage() {
        assert!(matches!(
            "dummy".parse::<BackendUrl>(),
            Err(GcsError::InvalidUrl(_))
        ));
        assert!(matches!(
            "tcp://host".parse::<BackendUrl>(),
            Err(GcsError::InvalidUrl(_))
        ));
    }

    #[test]
    fn url_display_round_trip() {
        let url: BackendUrl = "spread://localhost:4803".parse().unwrap();
        assert_eq!(url.to_string(), "spread://localhost:4803");
    }

    #[test]
    fn default_config_is_valid() {
        ConnectionConfig::default().validate().unwrap();
        ConnectionConfig::testing().validate().unwrap();
    }

    #[test]
    fn tiny_pkt_size_rejected() {
        assert!(matches!(
            validate_pkt_size(8),
            Err(GcsError::InvalidPacketSize { .. })
        ));
        validate_pkt_size(MIN_PKT_SIZE).unwrap();
    }

    #[test]
    fn inverted_watermarks_rejected() {
        let cfg = ConnectionConfig {
            fc_low_watermark: 100,
            fc_high_watermark: 10,
            ..ConnectionConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
