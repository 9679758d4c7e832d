use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::call::tracer::{NoopTracer, Tracer};
use crate::call::{CallHandle, RequestOptions};
use crate::config::ChannelConfig;
use crate::connection::handler::RequestHandler;
use crate::connection::{Connection, ConnectionParams};
use crate::messages::init::EPHEMERAL_HOST_PORT;
use crate::peer::peer_group::PeerGroup;
use crate::peer::{Connector, TcpConnector};
use crate::util::random::RngRandom;


/// The local TChannel endpoint: makes outgoing calls through its [PeerGroup] and, after
///  [TChannel::listen], accepts connections and dispatches inbound calls to its handler.
pub struct TChannel {
    config: Arc<ChannelConfig>,
    peers: Arc<PeerGroup<RngRandom>>,
    host_port: RwLock<String>,
    /// accepted connections from callers that announced the ephemeral host_port, i.e. that
    ///  can not be called back
    anonymous: Arc<Mutex<Vec<Arc<Connection>>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TChannel {
    pub fn new(config: ChannelConfig) -> anyhow::Result<TChannel> {
        Self::new_with(config, Arc::new(TcpConnector), Arc::new(NoopTracer))
    }

    pub fn new_with(config: ChannelConfig, connector: Arc<dyn Connector>, tracer: Arc<dyn Tracer>) -> anyhow::Result<TChannel> {
        config.validate()?;
        let config = Arc::new(config);

        let params = ConnectionParams {
            config: config.clone(),
            host_port: EPHEMERAL_HOST_PORT.to_string(),
            handler: None,
        };

        Ok(TChannel {
            config,
            peers: Arc::new(PeerGroup::new(params, connector, tracer)),
            host_port: RwLock::new(EPHEMERAL_HOST_PORT.to_string()),
            anonymous: Default::default(),
            accept_task: Default::default(),
        })
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn peers(&self) -> &Arc<PeerGroup<RngRandom>> {
        &self.peers
    }

    /// The host_port announced to remote endpoints: the listener's address, or `0.0.0.0:0` if
    ///  the channel is not listening
    pub async fn host_port(&self) -> String {
        self.host_port.read().await.clone()
    }

    /// Installs the handler for inbound calls on connections opened from now on, in both
    ///  directions
    pub async fn handle_calls(&self, handler: Arc<dyn RequestHandler>) {
        self.peers.set_handler(handler).await;
    }

    pub async fn request(&self, options: RequestOptions) -> CallHandle<RngRandom> {
        self.peers.request(options).await
    }

    /// Binds the configured listen address and starts accepting connections. Returns the bound
    ///  address, which is also announced as this channel's host_port from now on.
    pub async fn listen(&self) -> anyhow::Result<SocketAddr> {
        let Some(listen_addr) = self.config.listen_addr else {
            bail!("no listen address configured");
        };

        let mut accept_task = self.accept_task.lock().await;
        if accept_task.is_some() {
            bail!("channel is already listening");
        }

        let listener = TcpListener::bind(listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let host_port = local_addr.to_string();

        *self.host_port.write().await = host_port.clone();
        self.peers.set_local_host_port(&host_port).await;
        info!(%host_port, "listening");

        *accept_task = Some(tokio::spawn(accept_loop(listener, self.peers.clone(), self.anonymous.clone())));
        Ok(local_addr)
    }

    /// Stops accepting connections and closes all connections
    pub async fn close(&self) {
        if let Some(accept_task) = self.accept_task.lock().await.take() {
            accept_task.abort();
            // the listener is released when the task is gone
            let _ = accept_task.await;
        }

        let anonymous = std::mem::take(&mut *self.anonymous.lock().await);
        for connection in anonymous {
            connection.close().await;
        }

        self.peers.clear().await;
        debug!("channel closed");
    }
}

async fn accept_loop(listener: TcpListener, peers: Arc<PeerGroup<RngRandom>>, anonymous: Arc<Mutex<Vec<Arc<Connection>>>>) {
    loop {
        match listener.accept().await {
            Ok((stream, remote_addr)) => {
                tokio::spawn(on_accepted(stream, remote_addr, peers.clone(), anonymous.clone()));
            }
            Err(e) => {
                error!("error accepting connection: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

#[instrument(name = "accepted_connection", skip(stream, peers, anonymous))]
async fn on_accepted(stream: TcpStream, remote_addr: SocketAddr, peers: Arc<PeerGroup<RngRandom>>, anonymous: Arc<Mutex<Vec<Arc<Connection>>>>) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("could not set TCP_NODELAY: {}", e);
    }

    let params = peers.params().await;
    let connection = match Connection::incoming(stream, params).await {
        Ok(connection) => connection,
        Err(e) => {
            warn!("handshake failed: {}", e);
            return;
        }
    };

    let remote_host_port = connection.remote_host_port().to_string();
    if remote_host_port == EPHEMERAL_HOST_PORT {
        debug!("caller can not be called back, keeping the connection outside the peer group");
        let mut anonymous = anonymous.lock().await;
        anonymous.retain(|c| !c.is_closed());
        anonymous.push(connection);
    }
    else {
        debug!(peer = %remote_host_port, "registering incoming connection");
        peers.get(&remote_host_port).await
            .register_incoming(connection).await;
    }
}
