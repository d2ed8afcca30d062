//! Upper-layer association and message exchange engine
//!
//! This crate implements both sides of a negotiated, connection-oriented
//! protocol for exchanging commands and bulk payloads between imaging nodes.
//!
//! # Features
//! - Frame codec for the fixed set of protocol data units
//! - Capability negotiation against an acceptance policy
//! - Association state machine with release, abort and timeouts
//! - Fragmented message exchange with request/response correlation
//! - Service registry dispatching inbound requests to handlers
//! - TLS support (optional, feature = "tls")

pub mod acceptor;
pub mod association;
pub mod config;
pub mod error;
pub mod exchange;
pub mod negotiation;
pub mod pdu;
pub mod registry;
pub mod requester;
pub mod types;

#[cfg(feature = "tls")]
pub mod tls;

// Re-export commonly used types
pub use acceptor::Acceptor;
pub use association::{
    AbortOrigin, Association, AssociationId, AssociationOptions, AssociationState, CloseReason,
};
pub use config::{RemoteNode, UlConfig};
pub use error::{Result, UlError};
pub use exchange::PendingResponse;
pub use negotiation::{AcceptancePolicy, CapabilityPolicy, CapabilityTable, ExtendedReply};
pub use pdu::{ProposedContext, RejectReason};
pub use registry::{HandlerError, RegistrationPolicy, Reply, RequestContext, ServiceHandler, ServiceRegistry};
pub use requester::Requester;
pub use types::{Command, CommandField, Message, Status};

/// Default listener port (non-TLS)
pub const DEFAULT_PORT: u16 = 11112;

/// Capability every node offers for connectivity checks
pub const VERIFY_CAPABILITY: &str = "VERIFY";

/// Uncompressed payload encoding
pub const RAW_ENCODING: &str = "RAW";

/// Compressed payload encoding
pub const COMPRESSED_ENCODING: &str = "COMPRESSED";
