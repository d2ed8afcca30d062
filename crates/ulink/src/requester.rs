//! Outbound associations to remote nodes

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::association::Association;
use crate::config::{RemoteNode, UlConfig};
use crate::pdu::ProposedContext;
use crate::registry::ServiceRegistry;
use crate::types::{Command, CommandField, Status};
use crate::{Result, UlError, RAW_ENCODING, VERIFY_CAPABILITY};

/// Opens associations to remote nodes on behalf of the local node
#[derive(Debug, Clone)]
pub struct Requester {
    config: UlConfig,
    registry: Option<Arc<ServiceRegistry>>,
}

impl Requester {
    /// Create a new requester with the given configuration
    pub fn new(config: UlConfig) -> Self {
        Self {
            config,
            registry: None,
        }
    }

    /// Serve requests the remote node sends back over our associations
    pub fn with_registry(mut self, registry: Arc<ServiceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(&self) -> &UlConfig {
        &self.config
    }

    /// Connect to `node` and negotiate `contexts`
    pub async fn connect(
        &self,
        node: &RemoteNode,
        contexts: Vec<ProposedContext>,
    ) -> Result<Association> {
        node.validate()?;
        let timeout = self.connection_timeout(node);
        debug!("Connecting to {} at {}", node.entity, node.address());

        let stream = tokio::time::timeout(timeout, TcpStream::connect(node.address()))
            .await
            .map_err(|_| {
                UlError::timeout(format!("connecting to {} took longer than {:?}", node.address(), timeout))
            })??;
        stream.set_nodelay(true)?;

        let mut options = self.config.association_options();
        options.max_pdu_length = self.max_pdu_length(node);

        let mut association = Association::requester(stream, options);
        if let Some(registry) = &self.registry {
            association = association.with_registry(Arc::clone(registry));
        }
        association.propose(&node.entity, contexts).await?;
        info!(
            association = %association.id(),
            "Associated with {} at {}",
            node.entity,
            node.address()
        );
        Ok(association)
    }

    /// Verify connectivity: associate, send one echo request, release
    pub async fn echo(&self, node: &RemoteNode) -> Result<Status> {
        let contexts = vec![ProposedContext::new(
            1,
            VERIFY_CAPABILITY,
            vec![RAW_ENCODING.to_string()],
        )];
        let association = self.connect(node, contexts).await?;

        let outcome = association
            .request(
                VERIFY_CAPABILITY,
                Command::request(CommandField::ECHO_RQ),
                None,
                Some(self.config.connect_timeout()),
            )
            .await;

        if let Err(e) = association.release().await {
            warn!("Release after echo failed: {}", e);
        }

        let status = outcome?
            .status()
            .ok_or_else(|| UlError::protocol("echo response carries no status"))?;
        info!("Echo to {} answered with {}", node.entity, status);
        Ok(status)
    }

    /// Echo with retries and exponential backoff for recoverable failures
    pub async fn test_connection(&self, node: &RemoteNode, max_retries: u32) -> Result<bool> {
        let mut retries = 0;

        while retries <= max_retries {
            if retries > 0 {
                info!("Connection test retry {} of {}", retries, max_retries);
                tokio::time::sleep(Duration::from_secs(1 << retries.min(5))).await;
            }

            match self.echo(node).await {
                Ok(status) => return Ok(status.is_success()),
                Err(e) if e.is_recoverable() && retries < max_retries => {
                    warn!("Connection test failed (attempt {}): {}", retries + 1, e);
                    retries += 1;
                }
                Err(e) => {
                    error!("Connection test failed permanently: {}", e);
                    return Err(e);
                }
            }
        }

        Err(UlError::internal("Connection test failed after all retries"))
    }

    /// Connection timeout for a node (uses node-specific or global setting)
    fn connection_timeout(&self, node: &RemoteNode) -> Duration {
        node.connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.connect_timeout())
    }

    /// Largest inbound fragment for a node (uses node-specific or global setting)
    fn max_pdu_length(&self, node: &RemoteNode) -> u32 {
        node.max_pdu_length.unwrap_or(self.config.max_pdu_length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_overrides() {
        let requester = Requester::new(UlConfig::default());
        let plain = RemoteNode::new("ARCHIVE", "localhost", 11112);
        let tuned = RemoteNode::new("ARCHIVE", "localhost", 11112)
            .with_timeout(500)
            .with_max_pdu_length(65536);

        assert_eq!(requester.connection_timeout(&plain), Duration::from_secs(30));
        assert_eq!(requester.connection_timeout(&tuned), Duration::from_millis(500));
        assert_eq!(requester.max_pdu_length(&plain), requester.config().max_pdu_length);
        assert_eq!(requester.max_pdu_length(&tuned), 65536);
    }

    #[tokio::test]
    async fn test_connect_refused_is_network_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let requester = Requester::new(UlConfig::default());
        let node = RemoteNode::new("ARCHIVE", "127.0.0.1", port).with_timeout(2000);
        let err = requester.echo(&node).await.unwrap_err();
        assert!(matches!(err, UlError::Network(_)));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_invalid_node_fails_fast() {
        let requester = Requester::new(UlConfig::default());
        let node = RemoteNode::new("", "localhost", 11112);
        assert!(matches!(
            requester.connect(&node, Vec::new()).await,
            Err(UlError::Config(_))
        ));
    }
}
