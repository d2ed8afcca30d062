//! Service registry and dispatcher
//!
//! Maps a negotiated capability to the handler serving it. The registry is
//! shared by every association of a node; lookups take a read lock and
//! never hold it across a handler call.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::association::AssociationId;
use crate::error::{Result, UlError};
use crate::types::{codes, tags, AttributeValue, Command, Message, Status};

/// What a handler knows about the request it serves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Opaque reference to the association the request arrived on
    pub association_id: AssociationId,
    pub calling_entity: String,
    pub called_entity: String,
    pub capability: String,
    /// Transfer encoding negotiated for the capability
    pub encoding: String,
    pub context_id: u8,
    pub exchange_id: u16,
}

/// Failures a handler may declare. Each maps to a response status.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Missing mandatory attribute {0:08X}")]
    MissingAttribute(u32),

    #[error("Invalid value for attribute {tag:08X}: {detail}")]
    InvalidValue { tag: u32, detail: String },

    #[error("Request carries no payload")]
    MissingPayload,

    #[error("Resource unavailable: {0}")]
    Unavailable(String),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Processing failed: {0}")]
    Processing(String),
}

impl HandlerError {
    pub fn invalid(tag: u32, detail: impl Into<String>) -> Self {
        Self::InvalidValue {
            tag,
            detail: detail.into(),
        }
    }

    pub fn processing(detail: impl Into<String>) -> Self {
        Self::Processing(detail.into())
    }

    /// Status reported to the peer for this failure
    pub fn status(&self) -> Status {
        let code = match self {
            HandlerError::MissingAttribute(_) => codes::MISSING_ATTRIBUTE,
            HandlerError::InvalidValue { .. } => codes::INVALID_ATTRIBUTE_VALUE,
            HandlerError::MissingPayload => codes::PAYLOAD_MISMATCH,
            HandlerError::Unavailable(_) => codes::OUT_OF_RESOURCES,
            HandlerError::NotAuthorized(_) => codes::NOT_AUTHORIZED,
            HandlerError::Processing(_) => codes::PROCESSING_FAILURE,
        };
        Status::Failure(code)
    }
}

/// Result a handler produces on success
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: Status,
    pub attributes: BTreeMap<u32, AttributeValue>,
    pub payload: Option<Bytes>,
}

impl Reply {
    pub fn success() -> Self {
        Self::with_status(Status::Success)
    }

    pub fn with_status(status: Status) -> Self {
        Self {
            status,
            attributes: BTreeMap::new(),
            payload: None,
        }
    }

    pub fn attribute(mut self, tag: u32, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(tag, value.into());
        self
    }

    pub fn payload(mut self, payload: Bytes) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Application logic serving one capability.
///
/// Handlers run on their own task, so slow work does not stall the
/// association's reader, but they should still hand long jobs elsewhere.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn handle(&self, ctx: &RequestContext, request: &Message)
        -> std::result::Result<Reply, HandlerError>;
}

/// Hook consulted before a handler runs
pub trait Authorizer: Send + Sync {
    fn authorize(&self, ctx: &RequestContext, command: &Command) -> std::result::Result<(), String>;
}

/// What happens when a capability is registered twice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationPolicy {
    /// The last registration wins
    #[default]
    Replace,
    /// A second registration fails
    Unique,
}

/// Capability to handler map with dispatch
pub struct ServiceRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn ServiceHandler>>>,
    policy: RegistrationPolicy,
    authorizer: Option<Arc<dyn Authorizer>>,
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("capabilities", &self.capabilities())
            .field("policy", &self.policy)
            .field("authorizer", &self.authorizer.is_some())
            .finish()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new(RegistrationPolicy::default())
    }
}

impl ServiceRegistry {
    pub fn new(policy: RegistrationPolicy) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            policy,
            authorizer: None,
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn policy(&self) -> RegistrationPolicy {
        self.policy
    }

    /// Register `handler` for `capability`.
    ///
    /// Under [`RegistrationPolicy::Replace`] the previous handler is
    /// returned; under [`RegistrationPolicy::Unique`] a duplicate fails.
    pub fn register(
        &self,
        capability: impl Into<String>,
        handler: Arc<dyn ServiceHandler>,
    ) -> Result<Option<Arc<dyn ServiceHandler>>> {
        let capability = capability.into();
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if self.policy == RegistrationPolicy::Unique && handlers.contains_key(&capability) {
            return Err(UlError::Registry(format!(
                "capability '{}' already has a handler",
                capability
            )));
        }
        debug!(%capability, "Registered handler");
        Ok(handlers.insert(capability, handler))
    }

    pub fn unregister(&self, capability: &str) -> Option<Arc<dyn ServiceHandler>> {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(capability)
    }

    pub fn handler(&self, capability: &str) -> Option<Arc<dyn ServiceHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(capability)
            .cloned()
    }

    /// Registered capabilities, sorted
    pub fn capabilities(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Route `request` to the handler for its capability.
    ///
    /// The handler is looked up when this is called; the returned future
    /// runs it and always yields a response. Handler failures and panics
    /// become failure statuses.
    pub fn dispatch(&self, ctx: RequestContext, request: Message) -> BoxFuture<'static, Message> {
        let Some(handler) = self.handler(&request.command.capability) else {
            debug!(capability = %request.command.capability, "No handler registered");
            return futures::future::ready(no_provider_response(&request)).boxed();
        };
        let authorizer = self.authorizer.clone();

        async move {
            if let Some(authorizer) = authorizer {
                if let Err(detail) = authorizer.authorize(&ctx, &request.command) {
                    warn!(
                        association = %ctx.association_id,
                        calling = %ctx.calling_entity,
                        capability = %ctx.capability,
                        "Request not authorized"
                    );
                    return failure_response(&request, &HandlerError::NotAuthorized(detail));
                }
            }

            let outcome = AssertUnwindSafe(handler.handle(&ctx, &request))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(reply)) => reply_response(&request, reply),
                Ok(Err(e)) => {
                    debug!(exchange_id = ctx.exchange_id, error = %e, "Handler failed");
                    failure_response(&request, &e)
                }
                Err(_) => {
                    error!(
                        capability = %ctx.capability,
                        exchange_id = ctx.exchange_id,
                        "Handler panicked"
                    );
                    failure_response(&request, &HandlerError::processing("handler panicked"))
                }
            }
        }
        .boxed()
    }
}

fn reply_response(request: &Message, reply: Reply) -> Message {
    let mut command = Command::response_to(&request.command, reply.status);
    command.attributes = reply.attributes;
    Message::new(command, reply.payload)
}

fn failure_response(request: &Message, error: &HandlerError) -> Message {
    let mut command = Command::response_to(&request.command, error.status())
        .with_attribute(tags::ERROR_COMMENT, error.to_string());
    if let HandlerError::MissingAttribute(tag) | HandlerError::InvalidValue { tag, .. } = error {
        command = command.with_attribute(tags::OFFENDING_ELEMENT, *tag);
    }
    Message::new(command, None)
}

/// Response for a request whose capability has no handler
pub fn no_provider_response(request: &Message) -> Message {
    let command = Command::response_to(&request.command, Status::Failure(codes::NO_PROVIDER))
        .with_attribute(
            tags::ERROR_COMMENT,
            format!("no provider for capability '{}'", request.command.capability),
        );
    Message::new(command, None)
}
