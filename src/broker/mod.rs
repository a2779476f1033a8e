//! Broker core
//!
//! Owns the shared topic index and the client-id registry, accepts TCP
//! connections and hands each one to a [`Connection`]. Everything per-client
//! lives in `connection.rs`; persisted state does not exist - the broker is
//! purely in-memory.

mod connection;

pub use connection::{Connection, ConnectionError};

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::codec::DEFAULT_MAX_PACKET_SIZE;
use crate::topic::TopicIndex;

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// Maximum accepted remaining length
    pub max_packet_size: usize,
    /// Capacity of each session's subscriber channel; absorbs publish
    /// bursts so one slow reader does not immediately stall fanout
    pub channel_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:1883".parse().expect("valid default bind address"),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            channel_capacity: 64,
        }
    }
}

/// The MQTT broker
pub struct Broker {
    config: BrokerConfig,
    /// Filter -> feed routing, shared with every session
    topics: Arc<TopicIndex>,
    /// Connected client identifiers
    client_ids: Arc<DashMap<Arc<str>, (), ahash::RandomState>>,
    /// Shutdown signal for the accept loop and all sessions
    shutdown: broadcast::Sender<()>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config,
            topics: Arc::new(TopicIndex::new()),
            client_ids: Arc::new(DashMap::default()),
            shutdown,
        }
    }

    /// The shared topic index
    pub fn topics(&self) -> &Arc<TopicIndex> {
        &self.topics
    }

    /// Signal every session and the accept loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        info!("MQTT listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("accept error: {}", e);
                            continue;
                        }
                    };
                    debug!("new connection from {}", addr);

                    let connection = Connection::new(
                        self.config.clone(),
                        self.topics.clone(),
                        self.client_ids.clone(),
                        self.shutdown.subscribe(),
                    );
                    tokio::spawn(async move {
                        if let Err(e) = connection.handle(stream).await {
                            debug!("connection {} closed: {}", addr, e);
                        }
                    });
                }
                _ = shutdown_rx.recv() => {
                    info!("broker shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}
