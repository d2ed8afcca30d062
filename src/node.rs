//! Wires configuration, storage, probe and handlers into a running listener

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use ulink::{Acceptor, Requester, ServiceRegistry, Status};

use crate::config::Config;
use crate::probe::FilesystemProbe;
use crate::services::{self, InMemoryAvailabilityLedger, ServiceContext};
use crate::storage;

/// A configured node, ready to accept associations
pub struct Node {
    config: Config,
    registry: Arc<ServiceRegistry>,
}

impl Node {
    /// Build the node with the filesystem store and probe and an in-memory ledger
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let store =
            storage::create_payload_store(&config.storage).context("cannot open payload store")?;
        let services = ServiceContext {
            store,
            probe: Arc::new(FilesystemProbe::from_config(&config.locations)),
            notifier: Arc::new(InMemoryAvailabilityLedger::new()),
        };
        Self::with_services(config, services)
    }

    pub fn with_services(config: Config, services: ServiceContext) -> anyhow::Result<Self> {
        let registry = services::build_registry(&config.capabilities, &services)
            .context("cannot build service registry")?;
        Ok(Self {
            config,
            registry: Arc::new(registry),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    fn acceptor(&self) -> Acceptor {
        Acceptor::new(
            self.config.listener.clone(),
            self.config.acceptance_policy(),
            Arc::clone(&self.registry),
        )
    }

    /// Bind the configured address and serve until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(
            "Starting node '{}' with capabilities {:?}",
            self.config.node.id,
            self.registry.capabilities()
        );
        self.acceptor().run(shutdown).await?;
        Ok(())
    }

    /// Serve on an already bound listener until `shutdown` fires
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.acceptor().serve(listener, shutdown).await?;
        Ok(())
    }
}

/// Verify connectivity with the configured remote `name`
pub async fn echo(config: &Config, name: &str) -> anyhow::Result<Status> {
    let remote = config.remote(name)?;
    let requester = Requester::new(config.listener.clone());
    let status = requester
        .echo(remote)
        .await
        .with_context(|| format!("echo to '{}' failed", name))?;
    Ok(status)
}
