use async_trait::async_trait;
use tracing::debug;
use ulink::types::{codes, CommandField};
use ulink::{HandlerError, Message, Reply, RequestContext, ServiceHandler, Status};

/// Verification handler: answers every echo request with success
#[derive(Debug, Default)]
pub struct EchoHandler;

#[async_trait]
impl ServiceHandler for EchoHandler {
    async fn handle(&self, ctx: &RequestContext, request: &Message) -> Result<Reply, HandlerError> {
        if request.command.field != CommandField::ECHO_RQ {
            return Ok(Reply::with_status(Status::Failure(codes::UNRECOGNIZED_OPERATION)));
        }
        debug!(association = %ctx.association_id, "Echo from {}", ctx.calling_entity);
        Ok(Reply::success())
    }
}
