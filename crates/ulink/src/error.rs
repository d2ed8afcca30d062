//! Error types for association and message exchange operations

use thiserror::Error;

use crate::association::{AbortOrigin, AssociationState};
use crate::pdu::{AbortReason, PduError, RejectReason};

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, UlError>;

/// Error types that can occur while running an association
#[derive(Error, Debug)]
pub enum UlError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("Framing error: {0}")]
    Framing(#[from] PduError),

    #[error("Association rejected: {reason}")]
    Rejected { reason: RejectReason },

    #[error("Association aborted ({origin}): {detail}")]
    Aborted {
        origin: AbortOrigin,
        reason: Option<AbortReason>,
        detail: String,
    },

    #[error("Association released before the exchange completed")]
    Released,

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Timeout occurred: {0}")]
    Timeout(String),

    #[error("Capability not negotiated: {0}")]
    CapabilityNotNegotiated(String),

    #[error("Association is not established (state: {0})")]
    NotEstablished(AssociationState),

    #[error("Invalid state transition from {from} on {event}")]
    InvalidTransition {
        from: AssociationState,
        event: &'static str,
    },

    #[error("No inbound request with exchange id {0} awaits a response")]
    UnknownExchange(u16),

    #[error("All exchange identifiers are in use")]
    ExchangeIdsExhausted,

    #[error("Exchange {0} was cancelled")]
    Cancelled(u16),

    #[error("Handler registration failed: {0}")]
    Registry(String),

    #[cfg(feature = "tls")]
    #[error("TLS error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl UlError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new protocol violation error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    /// Create a new timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the failure came from the association going away
    /// rather than from the caller's own usage.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            UlError::Network(_) | UlError::Aborted { .. } | UlError::Released
        )
    }

    /// Check if this error is recoverable by retrying on a new association
    pub fn is_recoverable(&self) -> bool {
        match self {
            UlError::Network(_) | UlError::Timeout(_) | UlError::Aborted { .. } => true,
            UlError::Rejected { reason } => reason.is_transient(),
            _ => false,
        }
    }
}
