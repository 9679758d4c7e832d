//! Utilities for testing code that sends or handles TChannel calls: in-memory connection pairs
//!  and a few canned request handlers. They are used for testing this crate itself, and they are
//!  exported for application testing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Mutex;

use crate::checksum::{Checksum, ChecksumType};
use crate::config::ChannelConfig;
use crate::connection::handler::{CallError, RequestHandler};
use crate::connection::{Connection, ConnectionParams};
use crate::error::{ErrorCode, TChannelResult};
use crate::frame::MAX_FRAME_SIZE;
use crate::messages::call::{CallRequest, CallResponse, ResponseCode};
use crate::peer::Connector;


pub fn test_params(host_port: &str, process_name: &str, handler: Option<Arc<dyn RequestHandler>>) -> ConnectionParams {
    ConnectionParams {
        config: Arc::new(ChannelConfig::new(process_name)),
        host_port: host_port.to_string(),
        handler,
    }
}

/// Two handshaken connections over an in-memory stream: an outgoing one from `127.0.0.1:1`
///  ("client") and the incoming one on `127.0.0.1:2` ("server")
pub async fn connection_pair(server_handler: Option<Arc<dyn RequestHandler>>) -> (Arc<Connection>, Arc<Connection>) {
    let (client, server) = handshaken_pair(
        test_params("127.0.0.1:1", "client", None),
        test_params("127.0.0.1:2", "server", server_handler),
    ).await;
    (
        client.expect("client side handshake failed"),
        server.expect("server side handshake failed"),
    )
}

async fn handshaken_pair(client_params: ConnectionParams, server_params: ConnectionParams) -> (TChannelResult<Arc<Connection>>, TChannelResult<Arc<Connection>>) {
    let (client_stream, server_stream) = tokio::io::duplex(4 * MAX_FRAME_SIZE);
    tokio::join!(
        Connection::outgoing(client_stream, client_params),
        Connection::incoming(server_stream, server_params),
    )
}

/// Connects to simulated remote endpoints over in-memory streams, so peer selection and retries
///  can be tested without sockets. Each `host_port` gets its own server side, running the
///  handler registered for it (if any).
#[derive(Default)]
pub struct InMemoryConnector {
    handlers: FxHashMap<String, Arc<dyn RequestHandler>>,
    refused: FxHashSet<String>,
    num_connects: AtomicUsize,
    servers: Mutex<Vec<Arc<Connection>>>,
}

impl InMemoryConnector {
    pub fn new() -> InMemoryConnector {
        Default::default()
    }

    pub fn with_handler(mut self, host_port: &str, handler: Arc<dyn RequestHandler>) -> InMemoryConnector {
        self.handlers.insert(host_port.to_string(), handler);
        self
    }

    /// Connecting to `host_port` fails with 'connection refused'
    pub fn refusing(mut self, host_port: &str) -> InMemoryConnector {
        self.refused.insert(host_port.to_string());
        self
    }

    pub fn num_connects(&self) -> usize {
        self.num_connects.load(Ordering::Acquire)
    }

    /// The server sides of all connections opened so far
    pub async fn servers(&self) -> Vec<Arc<Connection>> {
        self.servers.lock().await.clone()
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn connect(&self, host_port: &str, params: ConnectionParams) -> TChannelResult<Arc<Connection>> {
        self.num_connects.fetch_add(1, Ordering::AcqRel);
        if self.refused.contains(host_port) {
            return Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into());
        }

        let server_params = test_params(host_port, "server", self.handlers.get(host_port).cloned());
        let (client, server) = handshaken_pair(params, server_params).await;
        self.servers.lock().await.push(server?);
        client
    }
}

/// A crc32-checksummed request for service `test` with a TTL of five seconds
pub fn call_request(arg1: &[u8], arg2: &[u8], arg3: &[u8]) -> CallRequest {
    let mut request = CallRequest::new("test", 5000, vec![("as".to_string(), "raw".to_string())], vec![
        Bytes::copy_from_slice(arg1),
        Bytes::copy_from_slice(arg2),
        Bytes::copy_from_slice(arg3),
    ]);
    request.checksum = Checksum::empty(ChecksumType::Crc32);
    request
}

/// Responds with the request's args
pub struct EchoHandler;

#[async_trait]
impl RequestHandler for EchoHandler {
    async fn handle_call(&self, request: CallRequest, _connection: Arc<Connection>) -> Result<CallResponse, CallError> {
        Ok(CallResponse::new(ResponseCode::Ok, vec![], request.args))
    }
}

/// Never responds
pub struct HangingHandler;

#[async_trait]
impl RequestHandler for HangingHandler {
    async fn handle_call(&self, _request: CallRequest, _connection: Arc<Connection>) -> Result<CallResponse, CallError> {
        std::future::pending().await
    }
}

/// Rejects every call with a fixed error code, counting the calls
pub struct RejectingHandler {
    code: ErrorCode,
    num_calls: AtomicUsize,
}

impl RejectingHandler {
    pub fn new(code: ErrorCode) -> RejectingHandler {
        RejectingHandler {
            code,
            num_calls: AtomicUsize::new(0),
        }
    }

    pub fn num_calls(&self) -> usize {
        self.num_calls.load(Ordering::Acquire)
    }
}

#[async_trait]
impl RequestHandler for RejectingHandler {
    async fn handle_call(&self, _request: CallRequest, _connection: Arc<Connection>) -> Result<CallResponse, CallError> {
        self.num_calls.fetch_add(1, Ordering::AcqRel);
        Err(CallError::new(self.code, "rejected"))
    }
}
