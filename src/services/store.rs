use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use ulink::types::{codes, tags, CommandField};
use ulink::{HandlerError, Message, Reply, RequestContext, ServiceHandler, Status};

use crate::storage::{PayloadStore, StorageError};

/// Persists the payload of each store request under its instance identifier
#[derive(Debug)]
pub struct StoreHandler {
    store: Arc<dyn PayloadStore>,
}

impl StoreHandler {
    pub fn new(store: Arc<dyn PayloadStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ServiceHandler for StoreHandler {
    async fn handle(&self, ctx: &RequestContext, request: &Message) -> Result<Reply, HandlerError> {
        if request.command.field != CommandField::STORE_RQ {
            return Ok(Reply::with_status(Status::Failure(codes::UNRECOGNIZED_OPERATION)));
        }
        let instance = request
            .command
            .text(tags::AFFECTED_INSTANCE_UID)
            .ok_or(HandlerError::MissingAttribute(tags::AFFECTED_INSTANCE_UID))?;
        let payload = request.payload.clone().ok_or(HandlerError::MissingPayload)?;
        let size = payload.len();

        let path = self.store.store(instance, payload).await.map_err(|e| {
            if matches!(e, StorageError::InvalidKey(_)) {
                HandlerError::invalid(tags::AFFECTED_INSTANCE_UID, e.to_string())
            } else {
                warn!("Storing {} failed: {}", instance, e);
                HandlerError::processing(e.to_string())
            }
        })?;

        info!(
            association = %ctx.association_id,
            encoding = %ctx.encoding,
            "Stored {} ({} bytes) at {}",
            instance,
            size,
            path.display()
        );
        Ok(Reply::success().attribute(tags::AFFECTED_INSTANCE_UID, instance))
    }
}
