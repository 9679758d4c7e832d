//! Remote endpoints and their connections.
//!
//! A [Peer] is identified by its `host:port` and owns the connections to it, tracked separately
//!  for both directions. Calls prefer connections this side opened, then connections the peer
//!  opened; a new connection is only opened if there is no open one.

pub mod peer_group;

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, instrument};

use crate::connection::{Connection, ConnectionParams};
use crate::error::{TChannelError, TChannelResult};
use crate::util::random::Random;


/// Opens outgoing connections. The default is [TcpConnector].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, host_port: &str, params: ConnectionParams) -> TChannelResult<Arc<Connection>>;
}

pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host_port: &str, params: ConnectionParams) -> TChannelResult<Arc<Connection>> {
        let timeout = params.config.handshake_timeout;
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(host_port)).await {
            Ok(stream) => stream?,
            Err(_) => return Err(TChannelError::ConnectionClosed(format!("connecting to {} timed out after {:?}", host_port, timeout))),
        };
        stream.set_nodelay(true)?;
        Connection::outgoing(stream, params).await
    }
}

/// What a peer's selection score is based on
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PeerState {
    Connected,
    Unconnected,
}

impl PeerState {
    /// Connected peers score in `[0.2, 1.0)`, unconnected ones in `[0.1, 0.2)`. So an
    ///  established connection is always preferred over opening a new one, and the random part
    ///  spreads load between equally eligible peers.
    pub fn score<R: Random>(&self) -> f64 {
        match self {
            PeerState::Connected => 0.2 + R::gen_f64_range(0.0..0.8),
            PeerState::Unconnected => 0.1 + R::gen_f64_range(0.0..0.1),
        }
    }
}

#[derive(Default)]
struct PeerConnections {
    outgoing: Vec<Arc<Connection>>,
    incoming: Vec<Arc<Connection>>,
}

impl PeerConnections {
    fn prune_closed(&mut self) {
        self.outgoing.retain(|c| !c.is_closed());
        self.incoming.retain(|c| !c.is_closed());
    }
}

pub struct Peer {
    host_port: String,
    params: Arc<RwLock<ConnectionParams>>,
    connector: Arc<dyn Connector>,
    connections: RwLock<PeerConnections>,
    /// held while opening a connection, so concurrent callers reuse a connection rather than
    ///  opening one each
    connect_lock: Mutex<()>,
}

impl Peer {
    pub fn new(host_port: &str, params: Arc<RwLock<ConnectionParams>>, connector: Arc<dyn Connector>) -> Peer {
        Peer {
            host_port: host_port.to_string(),
            params,
            connector,
            connections: Default::default(),
            connect_lock: Mutex::new(()),
        }
    }

    pub fn host_port(&self) -> &str {
        &self.host_port
    }

    pub async fn outgoing_connections(&self) -> Vec<Arc<Connection>> {
        let mut connections = self.connections.write().await;
        connections.prune_closed();
        connections.outgoing.clone()
    }

    pub async fn incoming_connections(&self) -> Vec<Arc<Connection>> {
        let mut connections = self.connections.write().await;
        connections.prune_closed();
        connections.incoming.clone()
    }

    /// All open connections, outgoing ones first
    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        let mut connections = self.connections.write().await;
        connections.prune_closed();
        connections.outgoing.iter()
            .chain(connections.incoming.iter())
            .cloned()
            .collect()
    }

    async fn open_connection(&self) -> Option<Arc<Connection>> {
        self.connections().await
            .into_iter()
            .next()
    }

    pub async fn is_connected(&self) -> bool {
        self.open_connection().await.is_some()
    }

    pub async fn state(&self) -> PeerState {
        if self.is_connected().await {
            PeerState::Connected
        }
        else {
            PeerState::Unconnected
        }
    }

    pub async fn score<R: Random>(&self) -> f64 {
        self.state().await.score::<R>()
    }

    /// Returns an open connection to the peer, opening one if there is none.
    #[instrument(name = "peer_connect", skip_all, fields(peer = %self.host_port))]
    pub async fn connect(&self) -> TChannelResult<Arc<Connection>> {
        if let Some(connection) = self.open_connection().await {
            return Ok(connection);
        }

        let _guard = self.connect_lock.lock().await;
        // another caller may have connected while this one was waiting
        if let Some(connection) = self.open_connection().await {
            return Ok(connection);
        }

        debug!("opening connection");
        let params = self.params.read().await.clone();
        let connection = self.connector.connect(&self.host_port, params).await?;
        self.connections.write().await.outgoing.push(connection.clone());
        Ok(connection)
    }

    /// Registers a connection the peer opened to this side
    pub async fn register_incoming(&self, connection: Arc<Connection>) {
        let mut connections = self.connections.write().await;
        connections.prune_closed();
        connections.incoming.push(connection);
    }

    /// Closes all connections concurrently, returning when all of them are closed
    pub async fn close(&self) {
        let connections = std::mem::take(&mut *self.connections.write().await);

        let mut tasks = JoinSet::new();
        for connection in connections.outgoing.into_iter().chain(connections.incoming) {
            tasks.spawn(async move { connection.close().await });
        }
        while tasks.join_next().await.is_some() {}
        debug!(peer = %self.host_port, "closed all connections");
    }
}
