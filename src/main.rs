#![warn(unused_crate_dependencies)]

use crate::{
    cloud::StorageCloudControl,
    config::{load_config, VERSION},
    cross_node::{listener::run_listener, run_idle_scrubber},
    session::{manager::SessionManager, socket::TransportBackend},
    storage::MemoryStorage,
};
use log::{debug, error, info};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal};

mod cloud;
mod config;
mod cross_node;
mod logging;
mod session;
mod storage;
mod utils;

/// Grace period granted to active tunnels on ctrl-c
const SHUTDOWN_GRACE_SECS: u64 = 30;

#[tokio::main]
async fn main() {
    // Load configuration
    let config = load_config().unwrap_or_default();

    // Initialize logging
    logging::setup(config.logging);

    let storage = Arc::new(MemoryStorage::default());
    tokio::spawn(storage::expiry_sweep(storage.clone()));

    let cloud = Arc::new(StorageCloudControl::new(storage.clone()));

    let session = SessionManager::new(
        config.session_options(),
        storage,
        cloud,
        &config.state_signature_secret,
    );

    // Publish where peers can reach this node's cross-node listener
    if let Some(advertise_addr) = &config.advertise_addr {
        if let Err(err) = session.state_store().register_node_address(advertise_addr).await {
            error!("failed to publish node address: {}", err);
        }
    }

    // Cross-node listener
    let cross_addr = SocketAddr::new(config.host, config.cross_node_port);
    let cross_listener = match TcpListener::bind(cross_addr).await {
        Ok(value) => value,
        Err(err) => {
            error!("Failed to bind cross-node listener on {}: {:?}", cross_addr, err);
            return;
        }
    };
    tokio::spawn(run_listener(
        cross_listener,
        Arc::downgrade(&session),
        session.shutdown_signal(),
    ));

    // Background maintenance
    tokio::spawn(session.clone().run_cleanup());
    tokio::spawn(run_idle_scrubber(
        session.cross_pool().clone(),
        session.shutdown_signal(),
    ));

    // Client-facing control listener
    let addr = SocketAddr::new(config.host, config.port);
    let listener = match TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!("Failed to bind control listener on {}: {:?}", addr, err);
            return;
        }
    };

    info!(
        "Starting gateway node {} on {} (v{})",
        session.node_id(),
        addr,
        VERSION
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("accepted connection from {}", peer);
                    let session = session.clone();
                    tokio::spawn(async move {
                        if let Err(err) = session
                            .accept_connection(TransportBackend::RawTcp(stream))
                            .await
                        {
                            debug!("connection from {} ended: {}", peer, err);
                        }
                    });
                }
                Err(err) => {
                    error!("accept failed: {:?}", err);
                    break;
                }
            },
            _ = signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    session
        .shutdown(
            "maintenance",
            SHUTDOWN_GRACE_SECS,
            "gateway node is restarting",
        )
        .await;
    info!("shutdown complete");
}
