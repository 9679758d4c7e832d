use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::call::tracer::Tracer;
use crate::call::{CallHandle, RequestOptions};
use crate::connection::handler::RequestHandler;
use crate::connection::ConnectionParams;
use crate::peer::{Connector, Peer};
use crate::util::random::{Random, RngRandom};


/// The set of known peers, keyed by `host:port`, and peer selection for outgoing calls.
///
/// Peers are created lazily on first use. Selection is based on [Peer::score], so peers with an
///  open connection are preferred; `R` is the source of the score's random part.
pub struct PeerGroup<R: Random> {
    params: Arc<RwLock<ConnectionParams>>,
    connector: Arc<dyn Connector>,
    tracer: Arc<dyn Tracer>,
    peers: RwLock<FxHashMap<String, Arc<Peer>>>,
    clear_lock: Mutex<()>,
    /// number of completed clears, used to join a clear that is in progress
    clear_generation: AtomicU64,
    pd: PhantomData<fn() -> R>,
}

impl PeerGroup<RngRandom> {
    pub fn new(params: ConnectionParams, connector: Arc<dyn Connector>, tracer: Arc<dyn Tracer>) -> PeerGroup<RngRandom> {
        Self::new_with_random(params, connector, tracer)
    }
}

impl<R: Random> PeerGroup<R> {
    pub fn new_with_random(params: ConnectionParams, connector: Arc<dyn Connector>, tracer: Arc<dyn Tracer>) -> PeerGroup<R> {
        PeerGroup {
            params: Arc::new(RwLock::new(params)),
            connector,
            tracer,
            peers: Default::default(),
            clear_lock: Mutex::new(()),
            clear_generation: AtomicU64::new(0),
            pd: Default::default(),
        }
    }

    pub async fn params(&self) -> ConnectionParams {
        self.params.read().await.clone()
    }

    /// Changes the host_port announced in handshakes of connections opened from now on
    pub async fn set_local_host_port(&self, host_port: &str) {
        self.params.write().await.host_port = host_port.to_string();
    }

    /// Installs the handler for calls arriving on connections opened from now on
    pub async fn set_handler(&self, handler: Arc<dyn RequestHandler>) {
        self.params.write().await.handler = Some(handler);
    }

    pub fn tracer(&self) -> &Arc<dyn Tracer> {
        &self.tracer
    }

    /// Returns the peer for `host_port`, creating it if it is not known yet
    pub async fn get(&self, host_port: &str) -> Arc<Peer> {
        if let Some(peer) = self.lookup(host_port).await {
            return peer;
        }
        self.peers.write().await
            .entry(host_port.to_string())
            .or_insert_with(|| {
                debug!(peer = host_port, "adding peer");
                Arc::new(Peer::new(host_port, self.params.clone(), self.connector.clone()))
            })
            .clone()
    }

    pub async fn lookup(&self, host_port: &str) -> Option<Arc<Peer>> {
        self.peers.read().await
            .get(host_port)
            .cloned()
    }

    /// Adds an existing peer, replacing a peer with the same host_port
    pub async fn add(&self, peer: Arc<Peer>) {
        self.peers.write().await
            .insert(peer.host_port().to_string(), peer);
    }

    /// Removes a peer from the group without closing its connections
    pub async fn remove(&self, host_port: &str) -> Option<Arc<Peer>> {
        self.peers.write().await
            .remove(host_port)
    }

    pub async fn hosts(&self) -> Vec<String> {
        self.peers.read().await
            .keys()
            .cloned()
            .collect()
    }

    pub async fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.read().await
            .values()
            .cloned()
            .collect()
    }

    /// Picks the peer for the next attempt of a call.
    ///
    /// An explicit `host_port` is used unless it is blacklisted. Otherwise the non-blacklisted peer
    ///  with the highest score wins, provided its score is above `score_threshold`.
    pub async fn choose(&self, host_port: Option<&str>, blacklist: &FxHashSet<String>, score_threshold: f64) -> Option<Arc<Peer>> {
        if let Some(host_port) = host_port {
            if blacklist.contains(host_port) {
                return None;
            }
            return Some(self.get(host_port).await);
        }

        let mut best = None;
        let mut best_score = score_threshold;
        for peer in self.peers().await {
            if blacklist.contains(peer.host_port()) {
                continue;
            }
            let score = peer.score::<R>().await;
            if score > best_score {
                best_score = score;
                best = Some(peer);
            }
        }
        best
    }

    /// Closes all peers' connections and forgets the peers. A clear that is requested while
    ///  another one is in progress completes with that one instead of starting a second one.
    pub async fn clear(&self) {
        let generation = self.clear_generation.load(Ordering::Acquire);
        let _guard = self.clear_lock.lock().await;
        if self.clear_generation.load(Ordering::Acquire) != generation {
            return;
        }

        let peers = std::mem::take(&mut *self.peers.write().await);
        info!(num_peers = peers.len(), "clearing peer group");

        let mut tasks = JoinSet::new();
        for peer in peers.into_values() {
            tasks.spawn(async move { peer.close().await });
        }
        while tasks.join_next().await.is_some() {}

        self.clear_generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Starts building an outgoing call. Nothing is sent before [CallHandle::send].
    pub async fn request(self: &Arc<Self>, options: RequestOptions) -> CallHandle<R> {
        let config = self.params.read().await.config.clone();
        CallHandle::new(self.clone(), config, options)
    }
}
