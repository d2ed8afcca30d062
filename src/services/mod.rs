//! Handlers served by the node and the registry wiring them to capabilities

use std::collections::BTreeMap;
use std::sync::Arc;

use ulink::{RegistrationPolicy, ServiceHandler, ServiceRegistry, UlError};

use crate::config::CapabilityConfig;
use crate::probe::CapacityProbe;
use crate::storage::PayloadStore;

pub mod echo;
pub mod notify;
pub mod store;

pub use echo::EchoHandler;
pub use notify::{
    AvailabilityNotifier, AvailabilityUpdate, InMemoryAvailabilityLedger, InstanceAvailability,
    NotifyHandler,
};
pub use store::StoreHandler;

pub const ECHO_HANDLER: &str = "echo";
pub const NOTIFY_HANDLER: &str = "notify";
pub const STORE_HANDLER: &str = "store";

/// Handler names a capability may be configured with
pub const HANDLERS: &[&str] = &[ECHO_HANDLER, NOTIFY_HANDLER, STORE_HANDLER];

/// Collaborators the handlers write through
#[derive(Clone)]
pub struct ServiceContext {
    pub store: Arc<dyn PayloadStore>,
    pub probe: Arc<dyn CapacityProbe>,
    pub notifier: Arc<dyn AvailabilityNotifier>,
}

/// Build the registry serving every configured capability
pub fn build_registry(
    capabilities: &BTreeMap<String, CapabilityConfig>,
    services: &ServiceContext,
) -> ulink::Result<ServiceRegistry> {
    let registry = ServiceRegistry::new(RegistrationPolicy::Unique);
    for (capability, config) in capabilities {
        let handler: Arc<dyn ServiceHandler> = match config.handler.as_str() {
            ECHO_HANDLER => Arc::new(EchoHandler),
            NOTIFY_HANDLER => Arc::new(NotifyHandler::new(
                Arc::clone(&services.notifier),
                Arc::clone(&services.probe),
            )),
            STORE_HANDLER => Arc::new(StoreHandler::new(Arc::clone(&services.store))),
            other => {
                return Err(UlError::Registry(format!(
                    "capability '{}' names unknown handler '{}'",
                    capability, other
                )))
            }
        };
        registry.register(capability.clone(), handler)?;
    }
    Ok(registry)
}
