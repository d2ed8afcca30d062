pub mod config;
pub mod logging;
pub mod node;
pub mod probe;
pub mod services;
pub mod storage;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::node::Node;

/// Run the node until Ctrl-C
pub async fn run(config: Config) -> anyhow::Result<()> {
    logging::init(&config)?;

    tracing::info!("🔧 Starting pacsnode '{}'", config.node.id);

    let node = Node::new(config)?;
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            trigger.cancel();
        }
    });

    node.run(shutdown).await
}
