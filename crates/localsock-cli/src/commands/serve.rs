use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use localsock_core::{
    ClientSocket, ConnectionHandler, Manager, PeerCredentials, RunConfig, SocketDefaults,
};

/// Echoes each request back after the peer half-closes its side
pub struct EchoHandler;

#[async_trait]
impl ConnectionHandler for EchoHandler {
    async fn on_client_accepted(&self, mut client: ClientSocket, peer: PeerCredentials) {
        info!("Client {} connected: {}", client.id(), peer);

        let mut request = Vec::new();
        let result = match client.read_to_end(&mut request).await {
            Ok(n) => {
                info!("Client {} sent {} bytes", client.id(), n);
                match client.write_all(&request).await {
                    Ok(()) => client.shutdown_write().await,
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            warn!("Client {} failed: {}\n{}", client.id(), e, client.markdown_string());
        }
    }
}

pub struct ServeOptions {
    pub title: String,
    pub path: String,
    pub deadline_ms: Option<u64>,
    pub backlog: Option<i32>,
}

/// Run the echo server until Ctrl+C
pub async fn run(options: ServeOptions, defaults: SocketDefaults) -> Result<()> {
    let handler = Arc::new(EchoHandler);

    let mut config =
        RunConfig::with_defaults(&options.title, options.path, handler.as_ref(), defaults)?;
    if let Some(deadline_ms) = options.deadline_ms {
        config.set_deadline_ms(deadline_ms);
    }
    if let Some(backlog) = options.backlog {
        config.set_backlog(backlog)?;
    }

    let manager = Manager::new();
    manager.start(config, handler)?;

    println!("Serving. Press Ctrl+C to stop.");
    println!("{}", manager.markdown_string());

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    manager.stop().await?;
    println!(
        "Stopped after {} connection(s).",
        manager.accepted_connections()
    );

    Ok(())
}
