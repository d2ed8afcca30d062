//! Listener accepting inbound associations

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::association::{Association, CloseReason};
use crate::config::UlConfig;
use crate::negotiation::AcceptancePolicy;
use crate::pdu::RejectReason;
use crate::registry::ServiceRegistry;
use crate::{Result, UlError};

const KEEPALIVE_TIME: Duration = Duration::from_secs(60);

/// Accepts connections and runs one association per connection
pub struct Acceptor {
    config: UlConfig,
    policy: Arc<AcceptancePolicy>,
    registry: Arc<ServiceRegistry>,
    slots: Arc<Semaphore>,
    #[cfg(feature = "tls")]
    tls: Option<tokio_rustls::TlsAcceptor>,
}

impl Acceptor {
    /// Create a new acceptor for `policy`, dispatching to `registry`
    pub fn new(config: UlConfig, policy: AcceptancePolicy, registry: Arc<ServiceRegistry>) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_associations as usize));
        Self {
            config,
            policy: Arc::new(policy),
            registry,
            slots,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    /// Number of associations currently being served
    pub fn active_associations(&self) -> usize {
        (self.config.max_associations as usize).saturating_sub(self.slots.available_permits())
    }

    /// Bind the configured address and serve until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.config.validate()?;
        if self.policy.is_empty() {
            return Err(UlError::config("acceptance policy has no capabilities"));
        }

        let addr = SocketAddr::new(self.config.bind_addr, self.config.port);
        let listener = TcpListener::bind(addr).await?;
        info!(
            "Listening on {} (entity: {})",
            addr, self.config.local_entity
        );
        self.serve(listener, shutdown).await
    }

    /// Serve associations from an already bound listener until `shutdown` fires.
    ///
    /// Established associations are released on shutdown.
    pub async fn serve(
        #[allow(unused_mut)] mut self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        #[cfg(feature = "tls")]
        if let Some(tls) = &self.config.tls {
            self.tls = Some(crate::tls::build_acceptor(tls)?);
            info!("TLS enabled for inbound associations");
        }

        let acceptor = Arc::new(self);
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {}", peer);
                    if let Err(e) = configure_socket(&stream) {
                        warn!("Could not tune socket for {}: {}", peer, e);
                    }
                    let permit = Arc::clone(&acceptor.slots).try_acquire_owned().ok();
                    let acceptor = Arc::clone(&acceptor);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        acceptor.handle_connection(stream, peer, permit, shutdown).await;
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            }
        }

        info!("Listener stopped");
        Ok(())
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        permit: Option<OwnedSemaphorePermit>,
        shutdown: CancellationToken,
    ) {
        #[cfg(feature = "tls")]
        if let Some(tls) = &self.tls {
            match tls.accept(stream).await {
                Ok(stream) => self.run_association(stream, peer, permit, shutdown).await,
                Err(e) => warn!("TLS handshake with {} failed: {}", peer, e),
            }
            return;
        }

        self.run_association(stream, peer, permit, shutdown).await
    }

    async fn run_association<T>(
        &self,
        io: T,
        peer: SocketAddr,
        permit: Option<OwnedSemaphorePermit>,
        shutdown: CancellationToken,
    ) where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let association = Association::acceptor(
            io,
            self.config.association_options(),
            Arc::clone(&self.policy),
        )
        .with_registry(Arc::clone(&self.registry));

        let Some(_permit) = permit else {
            warn!(
                "Maximum associations reached, rejecting association from {}",
                peer
            );
            if let Err(e) = association.refuse(RejectReason::LocalLimitExceeded).await {
                debug!("Refusing {} failed: {}", peer, e);
            }
            return;
        };

        match association.answer().await {
            Ok(table) => {
                info!(
                    association = %association.id(),
                    "Association with {} established ({} capabilities)",
                    peer,
                    table.len()
                );
            }
            Err(UlError::Rejected { reason }) => {
                info!("Rejected association from {}: {}", peer, reason);
                return;
            }
            Err(e) => {
                warn!("Negotiation with {} failed: {}", peer, e);
                return;
            }
        }

        let reason = tokio::select! {
            reason = association.closed() => reason,
            _ = shutdown.cancelled() => {
                if let Err(e) = association.release().await {
                    debug!("Release on shutdown failed: {}", e);
                }
                association.closed().await
            }
        };
        match reason {
            CloseReason::Aborted { .. } => warn!("Association with {} {}", peer, reason),
            _ => info!("Association with {} {}", peer, reason),
        }
    }
}

fn configure_socket(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let socket = SockRef::from(stream);
    socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_TIME))
}
