//! Configuration types for listeners, associations and remote nodes

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::association::AssociationOptions;
use crate::error::{Result, UlError};
use crate::exchange::ReassemblyLimits;
use crate::DEFAULT_PORT;

/// Smallest data fragment size a local node may be configured with
pub const MIN_PDU_LENGTH: u32 = 4096;

/// Largest data fragment size a local node may be configured with
pub const MAX_PDU_LENGTH: u32 = 4 * 1024 * 1024;

/// Fragment size used when none is configured or the peer announces no limit
pub const DEFAULT_PDU_LENGTH: u32 = 16384;

/// Configuration for the association engine on one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UlConfig {
    /// Local entity title, announced as calling entity and matched as called entity
    pub local_entity: String,

    /// Bind address for the listener
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Port for the listener
    #[serde(default = "default_port")]
    pub port: u16,

    /// Largest data fragment this node accepts, in bytes
    #[serde(default = "default_max_pdu_length")]
    pub max_pdu_length: u32,

    /// Transport connect timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Deadline for the negotiation exchange in milliseconds
    #[serde(default = "default_negotiation_timeout")]
    pub negotiation_timeout_ms: u64,

    /// Deadline for the release exchange in milliseconds
    #[serde(default = "default_release_timeout")]
    pub release_timeout_ms: u64,

    /// Idle read timeout of an established association in milliseconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// Maximum number of concurrent associations accepted by the listener
    #[serde(default = "default_max_associations")]
    pub max_associations: u32,

    /// Largest reassembled command plus payload, in bytes
    #[serde(default = "default_reassembly_max_bytes")]
    pub reassembly_max_bytes: u64,

    /// Time allowed for a fragmented message to complete, in milliseconds
    #[serde(default = "default_reassembly_timeout")]
    pub reassembly_timeout_ms: u64,

    /// Calling entities allowed to associate; empty accepts any
    #[serde(default)]
    pub accepted_calling_entities: Vec<String>,

    /// Reject proposals whose called entity is not our local entity
    #[serde(default = "default_true")]
    pub require_called_entity: bool,

    /// TLS configuration (optional)
    pub tls: Option<TlsConfig>,
}

/// Configuration for a remote node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteNode {
    /// Remote entity title
    pub entity: String,

    /// Remote host address
    pub host: String,

    /// Remote port
    pub port: u16,

    /// Connection timeout in milliseconds (overrides global setting)
    pub connect_timeout_ms: Option<u64>,

    /// Largest data fragment accepted from this node (overrides global setting)
    pub max_pdu_length: Option<u32>,
}

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to certificate chain file (PEM format)
    pub cert_path: PathBuf,

    /// Path to private key file (PEM format)
    pub key_path: PathBuf,
}

impl Default for UlConfig {
    fn default() -> Self {
        Self {
            local_entity: "PACSNODE".to_string(),
            bind_addr: default_bind_addr(),
            port: default_port(),
            max_pdu_length: default_max_pdu_length(),
            connect_timeout_ms: default_connect_timeout(),
            negotiation_timeout_ms: default_negotiation_timeout(),
            release_timeout_ms: default_release_timeout(),
            idle_timeout_ms: default_idle_timeout(),
            max_associations: default_max_associations(),
            reassembly_max_bytes: default_reassembly_max_bytes(),
            reassembly_timeout_ms: default_reassembly_timeout(),
            accepted_calling_entities: Vec::new(),
            require_called_entity: true,
            tls: None,
        }
    }
}

impl UlConfig {
    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Check if TLS is enabled
    pub fn tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    /// Per-association settings derived from this configuration
    pub fn association_options(&self) -> AssociationOptions {
        AssociationOptions {
            local_entity: self.local_entity.clone(),
            max_pdu_length: self.max_pdu_length,
            negotiation_timeout: Duration::from_millis(self.negotiation_timeout_ms),
            release_timeout: Duration::from_millis(self.release_timeout_ms),
            idle_timeout: Some(Duration::from_millis(self.idle_timeout_ms)),
            reassembly: ReassemblyLimits {
                max_bytes: self.reassembly_max_bytes,
                timeout: Duration::from_millis(self.reassembly_timeout_ms),
            },
            accepted_calling_entities: self.accepted_calling_entities.clone(),
            require_called_entity: self.require_called_entity,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validate_entity("Local entity title", &self.local_entity)?;

        if self.port == 0 {
            return Err(UlError::config("Port must be greater than 0"));
        }

        if !(MIN_PDU_LENGTH..=MAX_PDU_LENGTH).contains(&self.max_pdu_length) {
            return Err(UlError::config(format!(
                "Max PDU length must be between {} and {} bytes",
                MIN_PDU_LENGTH, MAX_PDU_LENGTH
            )));
        }

        let timeouts = [
            ("connect", self.connect_timeout_ms),
            ("negotiation", self.negotiation_timeout_ms),
            ("release", self.release_timeout_ms),
            ("idle", self.idle_timeout_ms),
            ("reassembly", self.reassembly_timeout_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, ms)| *ms == 0) {
            return Err(UlError::config(format!(
                "The {} timeout must be greater than 0",
                name
            )));
        }

        if self.max_associations == 0 {
            return Err(UlError::config("Max associations must be greater than 0"));
        }

        if self.reassembly_max_bytes < u64::from(self.max_pdu_length) {
            return Err(UlError::config(
                "Reassembly budget must hold at least one full fragment",
            ));
        }

        for entity in &self.accepted_calling_entities {
            validate_entity("Accepted calling entity", entity)?;
        }

        Ok(())
    }
}

impl RemoteNode {
    /// Create a new remote node configuration
    pub fn new(entity: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            entity: entity.into(),
            host: host.into(),
            port,
            connect_timeout_ms: None,
            max_pdu_length: None,
        }
    }

    /// Set connection timeout for this node
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = Some(timeout_ms);
        self
    }

    /// Set the largest data fragment accepted from this node
    pub fn with_max_pdu_length(mut self, max_pdu_length: u32) -> Self {
        self.max_pdu_length = Some(max_pdu_length);
        self
    }

    /// `host:port` for connecting
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate the remote node configuration
    pub fn validate(&self) -> Result<()> {
        validate_entity("Remote entity title", &self.entity)?;

        if self.host.is_empty() {
            return Err(UlError::config("Remote host cannot be empty"));
        }

        if self.port == 0 {
            return Err(UlError::config("Remote port must be greater than 0"));
        }

        if let Some(len) = self.max_pdu_length {
            if !(MIN_PDU_LENGTH..=MAX_PDU_LENGTH).contains(&len) {
                return Err(UlError::config(format!(
                    "Remote max PDU length must be between {} and {} bytes",
                    MIN_PDU_LENGTH, MAX_PDU_LENGTH
                )));
            }
        }

        Ok(())
    }
}

fn validate_entity(what: &str, entity: &str) -> Result<()> {
    if entity.is_empty() || entity.len() > 16 {
        return Err(UlError::config(format!("{} must be 1-16 characters", what)));
    }
    Ok(())
}

// Default value functions
fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_pdu_length() -> u32 {
    DEFAULT_PDU_LENGTH
}

fn default_connect_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_negotiation_timeout() -> u64 {
    30_000
}

fn default_release_timeout() -> u64 {
    10_000
}

fn default_idle_timeout() -> u64 {
    300_000 // 5 minutes
}

fn default_max_associations() -> u32 {
    10
}

fn default_reassembly_max_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_reassembly_timeout() -> u64 {
    120_000
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = UlConfig::default();
        assert_eq!(config.local_entity, "PACSNODE");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.max_pdu_length, DEFAULT_PDU_LENGTH);
        assert!(config.require_called_entity);
        assert!(!config.tls_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: UlConfig = toml::from_str(
            r#"
            local_entity = "ARCHIVE"
            port = 4242
            accepted_calling_entities = ["MODALITY1"]
            "#,
        )
        .unwrap();
        assert_eq!(config.local_entity, "ARCHIVE");
        assert_eq!(config.port, 4242);
        assert_eq!(config.idle_timeout_ms, 300_000);
        assert_eq!(config.accepted_calling_entities, vec!["MODALITY1"]);

        let options = config.association_options();
        assert_eq!(options.local_entity, "ARCHIVE");
        assert_eq!(options.idle_timeout, Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_remote_node_builder() {
        let node = RemoteNode::new("TEST_AET", "localhost", 11112)
            .with_timeout(10_000)
            .with_max_pdu_length(32768);

        assert_eq!(node.entity, "TEST_AET");
        assert_eq!(node.address(), "localhost:11112");
        assert_eq!(node.connect_timeout_ms, Some(10_000));
        assert!(node.validate().is_ok());

        assert!(RemoteNode::new("X", "", 1).validate().is_err());
        assert!(RemoteNode::new("X", "h", 1)
            .with_max_pdu_length(16)
            .validate()
            .is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = UlConfig::default();
        assert!(config.validate().is_ok());

        config.local_entity = "".to_string();
        assert!(config.validate().is_err());

        config.local_entity = "A".repeat(17);
        assert!(config.validate().is_err());

        let mut config = UlConfig::default();
        config.max_pdu_length = 1024;
        assert!(config.validate().is_err());

        let mut config = UlConfig::default();
        config.release_timeout_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("release"));

        let mut config = UlConfig::default();
        config.max_associations = 0;
        assert!(config.validate().is_err());
    }
}
