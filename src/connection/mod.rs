//! A handshaken TChannel connection over a byte stream.
//!
//! Outgoing requests are multiplexed by message id: [Connection::send] registers a response slot
//!  and writes the request's frames, and the connection's receive loop resolves the slot when the
//!  (reassembled) response or an ERROR frame for the id arrives. Inbound requests are reassembled
//!  and dispatched to the connection's [RequestHandler], one task per call.
//!
//! All frames of a logical message are written under the write lock, so fragments of different
//!  messages never interleave on the wire. A message with complete args is encoded up front and
//!  written in one go. A request with streamed args ([Connection::send_streamed]) keeps the write
//!  lock while its producers deliver chunks, writing frames as they fill up.

pub mod handler;
pub mod handshake;
pub mod pending;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, instrument, trace, warn};

use crate::call::ArgSource;
use crate::checksum::Checksum;
use crate::config::ChannelConfig;
use crate::connection::handler::RequestHandler;
use crate::connection::handshake::Handshake;
use crate::connection::pending::PendingResponse;
use crate::error::{ErrorCode, ProtocolError, TChannelError, TChannelResult};
use crate::fragment::{fragment, Reassembler, StreamingFragmenter};
use crate::frame::{read_frame, Frame, MAX_MESSAGE_ID};
use crate::messages::call::{CallRequest, CallResponse};
use crate::messages::control::ErrorMessage;
use crate::messages::init::InitMessage;
use crate::messages::{Headers, Message, MessageType};


#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ConnectionState {
    Init,
    Ready,
    Closed,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Anything a connection can run on: a TCP stream, or an in-memory duplex stream in tests
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> ByteStream for T {}

type BoxedStream = Box<dyn ByteStream>;
type ResponseSlot = oneshot::Sender<TChannelResult<Message>>;
type ResponseReceiver = oneshot::Receiver<TChannelResult<Message>>;

/// A request waiting for its response
struct Outstanding {
    slot: ResponseSlot,
    /// bounds the reassembly of a fragmented response
    ttl: Duration,
}

/// What a connection needs to know about its local endpoint
#[derive(Clone)]
pub struct ConnectionParams {
    pub config: Arc<ChannelConfig>,
    /// announced in the handshake
    pub host_port: String,
    pub handler: Option<Arc<dyn RequestHandler>>,
}

impl ConnectionParams {
    fn handshake_headers(&self) -> Headers {
        InitMessage::handshake_headers(&self.host_port, &self.config.process_name)
    }
}

/// Message ids of requests sent on a connection. Ids are never reused, and the counter does not
///  wrap around.
#[derive(Debug)]
pub struct MessageIds {
    next: u32,
}

impl Default for MessageIds {
    fn default() -> MessageIds {
        MessageIds { next: 1 }
    }
}

impl MessageIds {
    #[cfg(test)]
    fn starting_at(next: u32) -> MessageIds {
        MessageIds { next }
    }

    pub fn next_id(&mut self) -> Result<u32, ProtocolError> {
        if self.next > MAX_MESSAGE_ID {
            return Err(ProtocolError::IdSpaceExhausted);
        }
        let id = self.next;
        self.next += 1;
        Ok(id)
    }
}

pub struct Connection {
    direction: Direction,
    remote_host_port: String,
    remote_process_name: String,
    config: Arc<ChannelConfig>,
    closed: AtomicBool,
    ids: Mutex<MessageIds>,
    outstanding: Mutex<FxHashMap<u32, Outstanding>>,
    response_reassembler: Mutex<Reassembler>,
    handler: RwLock<Option<Arc<dyn RequestHandler>>>,
    writer: Mutex<WriteHalf<BoxedStream>>,
    receive_task: OnceLock<AbortHandle>,
}

impl Connection {
    /// Runs the connecting side of the handshake on `stream` and starts the receive loop
    #[instrument(name = "outgoing_connection", skip_all, fields(local = %params.host_port))]
    pub async fn outgoing<S: ByteStream>(mut stream: S, params: ConnectionParams) -> TChannelResult<Arc<Connection>> {
        let mut ids = MessageIds::default();
        let init_id = ids.next_id()?;

        let mut handshake = Handshake::new(&mut stream, init_id, params.config.handshake_timeout);
        handshake.initiate_handshake(params.handshake_headers()).await?;
        let remote = handshake.await_handshake_reply().await?;

        Connection::start(Box::new(stream), Direction::Outgoing, &remote, ids, params)
    }

    /// Runs the accepting side of the handshake on `stream` and starts the receive loop
    #[instrument(name = "incoming_connection", skip_all, fields(local = %params.host_port))]
    pub async fn incoming<S: ByteStream>(mut stream: S, params: ConnectionParams) -> TChannelResult<Arc<Connection>> {
        let mut handshake = Handshake::new(&mut stream, 0, params.config.handshake_timeout);
        let remote = handshake.await_handshake(params.handshake_headers()).await?;

        Connection::start(Box::new(stream), Direction::Incoming, &remote, MessageIds::default(), params)
    }

    fn start(stream: BoxedStream, direction: Direction, remote: &InitMessage, ids: MessageIds, params: ConnectionParams) -> TChannelResult<Arc<Connection>> {
        let remote_host_port = remote.host_port()?.to_string();
        let remote_process_name = remote.process_name()?.to_string();
        let (reader, writer) = tokio::io::split(stream);

        let connection = Arc::new(Connection {
            direction,
            remote_host_port: remote_host_port.clone(),
            remote_process_name,
            closed: AtomicBool::new(false),
            ids: Mutex::new(ids),
            outstanding: Default::default(),
            response_reassembler: Mutex::new(Reassembler::new(params.config.default_ttl)),
            handler: RwLock::new(params.handler),
            writer: Mutex::new(writer),
            receive_task: OnceLock::new(),
            config: params.config.clone(),
        });

        let requests = Reassembler::new(params.config.default_ttl);
        let task = tokio::spawn(receive_loop(Arc::downgrade(&connection), reader, requests, remote_host_port));
        let _ = connection.receive_task.set(task.abort_handle());

        debug!(remote = %connection.remote_host_port, ?direction, "connection ready");
        Ok(connection)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn remote_host_port(&self) -> &str {
        &self.remote_host_port
    }

    pub fn remote_process_name(&self) -> &str {
        &self.remote_process_name
    }

    /// Connections only exist after a successful handshake, so they are either ready or closed
    pub fn state(&self) -> ConnectionState {
        if self.is_closed() {
            ConnectionState::Closed
        }
        else {
            ConnectionState::Ready
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn num_outstanding(&self) -> usize {
        self.outstanding.lock().await.len()
    }

    pub async fn next_message_id(&self) -> Result<u32, ProtocolError> {
        self.ids.lock().await.next_id()
    }

    /// Installs the handler for inbound calls, replacing a previously installed one
    pub async fn handle_calls(&self, handler: Arc<dyn RequestHandler>) {
        *self.handler.write().await = Some(handler);
    }

    /// Sends a call request or ping request under a fresh message id. Call requests are
    ///  fragmented as necessary.
    pub async fn send(self: &Arc<Self>, message: Message) -> TChannelResult<PendingResponse> {
        if self.is_closed() {
            return Err(TChannelError::InvalidState(ConnectionState::Closed));
        }
        match message.message_type() {
            MessageType::CallRequest | MessageType::PingRequest => {}
            other => return Err(ProtocolError::NotARequest(other).into()),
        }

        let ttl = match &message {
            Message::CallRequest(request) => self.request_ttl(request),
            _ => self.config.default_ttl,
        };
        let messages = self.frames_for(message)?;
        let (message_id, receiver) = self.register(ttl).await?;

        if let Err(e) = self.write_messages(message_id, messages).await {
            self.outstanding.lock().await.remove(&message_id);
            return Err(e);
        }
        trace!(message_id, remote = %self.remote_host_port, "sent request");
        Ok(PendingResponse::new(message_id, receiver, Arc::downgrade(self)))
    }

    /// Sends a call request whose arg2 and arg3 may be streamed, under a fresh message id.
    ///  `request` carries no args. Frames are written as the streams deliver chunks, and the
    ///  write lock is held until the last frame is out, so other messages on this connection wait
    ///  for a slow producer.
    pub async fn send_streamed(self: &Arc<Self>, request: CallRequest, arg1: Bytes, arg2: ArgSource, arg3: ArgSource) -> TChannelResult<PendingResponse> {
        if self.is_closed() {
            return Err(TChannelError::InvalidState(ConnectionState::Closed));
        }

        let ttl = self.request_ttl(&request);
        let fragmenter = StreamingFragmenter::new(Message::CallRequest(request), self.config.max_frame_payload)?;
        let (message_id, receiver) = self.register(ttl).await?;

        if let Err(e) = self.write_streamed(message_id, fragmenter, arg1, [arg2, arg3]).await {
            self.outstanding.lock().await.remove(&message_id);
            return Err(e);
        }
        trace!(message_id, remote = %self.remote_host_port, "sent streamed request");
        Ok(PendingResponse::new(message_id, receiver, Arc::downgrade(self)))
    }

    fn request_ttl(&self, request: &CallRequest) -> Duration {
        if request.ttl > 0 {
            Duration::from_millis(request.ttl as u64)
        }
        else {
            self.config.default_ttl
        }
    }

    /// Allocates a message id and registers the slot its response is passed to
    async fn register(&self, ttl: Duration) -> TChannelResult<(u32, ResponseReceiver)> {
        let message_id = self.next_message_id().await?;

        let (slot, receiver) = oneshot::channel();
        self.outstanding.lock().await.insert(message_id, Outstanding { slot, ttl });
        // a concurrent close may have failed all slots before this one was registered
        if self.is_closed() {
            self.outstanding.lock().await.remove(&message_id);
            return Err(TChannelError::ConnectionClosed("connection closed while sending".to_string()));
        }
        Ok((message_id, receiver))
    }

    /// Convenience for a call request: sends it and waits for the response for the request's TTL
    pub async fn call(self: &Arc<Self>, request: CallRequest) -> TChannelResult<CallResponse> {
        let ttl = Duration::from_millis(request.ttl as u64);
        match self.send(Message::CallRequest(request)).await?.wait(ttl).await? {
            Message::CallResponse(response) => Ok(response),
            other => Err(ProtocolError::StreamingProtocolError(format!("expected a call response, got {:?}", other.message_type())).into()),
        }
    }

    pub async fn ping(self: &Arc<Self>) -> TChannelResult<()> {
        self.send(Message::PingRequest).await?
            .wait(self.config.default_ttl).await?;
        Ok(())
    }

    /// Sends the response to an inbound call, using the configured checksum type
    pub async fn send_response(&self, message_id: u32, mut response: CallResponse) -> TChannelResult<()> {
        response.checksum = Checksum::empty(self.config.checksum_type);
        let messages = self.frames_for(Message::CallResponse(response))?;
        self.write_messages(message_id, messages).await
    }

    pub async fn send_error(&self, message_id: u32, code: ErrorCode, description: &str) -> TChannelResult<()> {
        self.write_messages(message_id, vec![Message::Error(ErrorMessage::new(code, description))]).await
    }

    /// Closes the connection: fails all outstanding requests with [TChannelError::ConnectionClosed],
    ///  stops the receive loop and shuts down the writing side of the stream. Closing a closed
    ///  connection has no effect.
    pub async fn close(&self) {
        if !self.shut_down("connection closed locally").await {
            return;
        }
        if let Some(task) = self.receive_task.get() {
            task.abort();
        }
    }

    /// Terminates the connection and shuts down the writing side of the stream, so the remote
    ///  side sees the end of the stream
    async fn shut_down(&self, reason: &str) -> bool {
        if !self.terminate(reason).await {
            return false;
        }
        if let Err(e) = self.writer.lock().await.shutdown().await {
            debug!(remote = %self.remote_host_port, error = %e, "error shutting down stream");
        }
        true
    }

    /// Moves the connection to `Closed` and fails all outstanding requests. Returns `false` if
    ///  the connection was closed already.
    async fn terminate(&self, reason: &str) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        let slots = std::mem::take(&mut *self.outstanding.lock().await);
        debug!(remote = %self.remote_host_port, reason, num_outstanding = slots.len(), "connection closed");
        for (_, outstanding) in slots {
            let _ = outstanding.slot.send(Err(TChannelError::ConnectionClosed(reason.to_string())));
        }
        true
    }

    /// Discards the response slot and any partial response for a request that timed out
    pub(crate) async fn forget(&self, message_id: u32) {
        self.outstanding.lock().await.remove(&message_id);
        self.response_reassembler.lock().await.purge(message_id);
    }

    fn frames_for(&self, message: Message) -> TChannelResult<Vec<Message>> {
        match message.message_type() {
            MessageType::CallRequest | MessageType::CallResponse => Ok(fragment(message, self.config.max_frame_payload)?),
            _ => Ok(vec![message]),
        }
    }

    async fn write_messages(&self, message_id: u32, messages: Vec<Message>) -> TChannelResult<()> {
        let buf = encode(message_id, &messages)?;
        let mut writer = self.writer.lock().await;
        self.write_buf(&mut writer, &buf).await
    }

    async fn write_streamed(&self, message_id: u32, mut fragmenter: StreamingFragmenter, arg1: Bytes, args: [ArgSource; 2]) -> TChannelResult<()> {
        let mut writer = self.writer.lock().await;

        let mut frames = fragmenter.push(arg1);
        for arg in args {
            frames.extend(fragmenter.end_arg()?);
            match arg {
                ArgSource::Buffered(data) => frames.extend(fragmenter.push(data)),
                ArgSource::Stream(mut chunks) => loop {
                    // send what there is before waiting for the producer
                    frames.extend(fragmenter.flush());
                    let buf = encode(message_id, &std::mem::take(&mut frames))?;
                    self.write_buf(&mut writer, &buf).await?;

                    match chunks.recv().await {
                        Some(chunk) => frames.extend(fragmenter.push(chunk)),
                        None => break,
                    }
                },
            }
        }
        frames.push(fragmenter.finish()?);

        let buf = encode(message_id, &frames)?;
        self.write_buf(&mut writer, &buf).await
    }

    /// Writes while the caller holds the write lock. A failed write closes the connection.
    async fn write_buf(&self, writer: &mut WriteHalf<BoxedStream>, buf: &[u8]) -> TChannelResult<()> {
        if buf.is_empty() {
            return Ok(());
        }

        let result = match writer.write_all(buf).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(remote = %self.remote_host_port, error = %e, "write failed, closing connection");
            self.terminate("write failed").await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Handles a received frame. An error is a protocol violation the connection can not recover
    ///  from.
    async fn on_frame(self: &Arc<Self>, frame: Frame, requests: &mut Reassembler) -> Result<(), ProtocolError> {
        let message_id = frame.header.message_id;
        let message = match Message::from_frame(&frame) {
            Ok(message) => message,
            Err(e) => return self.on_decode_error(message_id, frame.header.message_type, e, requests).await,
        };
        trace!(message_id, message_type = ?message.message_type(), "received message");

        match message {
            Message::PingRequest => {
                if let Err(e) = self.write_messages(message_id, vec![Message::PingResponse]).await {
                    warn!(message_id, error = %e, "failed to answer ping");
                }
            }
            Message::PingResponse => {
                self.resolve(message_id, Ok(Message::PingResponse)).await;
            }
            Message::CallRequest(_) | Message::CallRequestContinue(_) => {
                match requests.on_message(message_id, message, Instant::now()) {
                    Ok(Some(Message::CallRequest(request))) => self.dispatch(message_id, request).await,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(message_id, error = %e, "rejecting call request");
                        self.reply_error(message_id, ErrorCode::BadRequest, &e.to_string()).await;
                    }
                }
            }
            Message::CallResponse(_) | Message::CallResponseContinue(_) => {
                let ttl = self.outstanding.lock().await
                    .get(&message_id)
                    .map(|outstanding| outstanding.ttl);
                let result = {
                    let mut reassembler = self.response_reassembler.lock().await;
                    match ttl {
                        Some(ttl) => reassembler.on_message_with_ttl(message_id, message, Instant::now(), ttl),
                        None => reassembler.on_message(message_id, message, Instant::now()),
                    }
                };
                match result {
                    Ok(Some(response)) => { self.resolve(message_id, Ok(response)).await; }
                    Ok(None) => {}
                    Err(e) => { self.resolve(message_id, Err(e.into())).await; }
                }
            }
            Message::Error(error) => {
                self.response_reassembler.lock().await.purge(message_id);
                let result = Err(TChannelError::Remote { code: error.code, description: error.message });
                self.resolve(message_id, result).await;
            }
            Message::Cancel(_) | Message::Claim(_) => {
                debug!(message_id, "ignoring cancel / claim message");
            }
            Message::InitRequest(_) | Message::InitResponse(_) => {
                warn!(message_id, "ignoring handshake message on an established connection");
            }
        }
        Ok(())
    }

    /// A message of a known type that fails to decode fails only the call it belongs to. An
    ///  unknown message type means the remote side speaks something else: it gets a fatal
    ///  ERROR frame, and the error is returned to close the connection.
    async fn on_decode_error(&self, message_id: u32, raw_message_type: u8, e: ProtocolError, requests: &mut Reassembler) -> Result<(), ProtocolError> {
        match MessageType::try_from(raw_message_type) {
            Ok(MessageType::CallRequest | MessageType::CallRequestContinue) => {
                warn!(message_id, message_type = raw_message_type, error = %e, "failed to decode message");
                requests.purge(message_id);
                self.reply_error(message_id, ErrorCode::BadRequest, &e.to_string()).await;
            }
            Ok(MessageType::CallResponse | MessageType::CallResponseContinue | MessageType::PingResponse | MessageType::Error) => {
                warn!(message_id, message_type = raw_message_type, error = %e, "failed to decode message");
                self.response_reassembler.lock().await.purge(message_id);
                self.resolve(message_id, Err(e.into())).await;
            }
            Ok(_) => {
                warn!(message_id, message_type = raw_message_type, error = %e, "dropping malformed message");
            }
            Err(_) => {
                error!(message_id, message_type = raw_message_type, "received unknown message type, closing connection");
                self.reply_error(message_id, ErrorCode::Fatal, &e.to_string()).await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Passes a response to the request's slot. Returns `false` if there is no such request,
    ///  e.g. because it timed out.
    async fn resolve(&self, message_id: u32, result: TChannelResult<Message>) -> bool {
        match self.outstanding.lock().await.remove(&message_id) {
            Some(outstanding) => {
                let _ = outstanding.slot.send(result);
                true
            }
            None => {
                warn!(message_id, remote = %self.remote_host_port, "dropping response for unknown message id");
                false
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, message_id: u32, request: CallRequest) {
        let handler = self.handler.read().await.clone();
        let Some(handler) = handler else {
            warn!(message_id, service = %request.service, "no handler for inbound calls, rejecting");
            return self.reply_error(message_id, ErrorCode::BadRequest, "no handler for inbound calls").await;
        };

        let connection = self.clone();
        tokio::spawn(async move {
            let tracing = request.tracing;
            let result = match handler.handle_call(request, connection.clone()).await {
                Ok(mut response) => {
                    response.tracing = tracing;
                    connection.send_response(message_id, response).await
                }
                Err(e) => connection.send_error(message_id, e.code, &e.description).await,
            };
            if let Err(e) = result {
                warn!(message_id, error = %e, "failed to send response");
            }
        });
    }

    async fn reply_error(&self, message_id: u32, code: ErrorCode, description: &str) {
        if let Err(e) = self.send_error(message_id, code, description).await {
            warn!(message_id, error = %e, "failed to send error frame");
        }
    }
}

fn encode(message_id: u32, messages: &[Message]) -> Result<BytesMut, ProtocolError> {
    let mut buf = BytesMut::new();
    for message in messages {
        message.to_frame(message_id)?.ser(&mut buf);
    }
    Ok(buf)
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = self.receive_task.get() {
            task.abort();
        }
    }
}

#[instrument(name = "receive_loop", skip_all, fields(remote = %remote_host_port))]
async fn receive_loop(connection: Weak<Connection>, mut reader: ReadHalf<BoxedStream>, mut requests: Reassembler, remote_host_port: String) {
    let reason = loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break "closed by remote side".to_string(),
            Err(e) => {
                error!(error = %e, "terminating receive loop");
                break e.to_string();
            }
        };

        let Some(connection) = connection.upgrade() else {
            debug!("connection was dropped, terminating receive loop");
            return;
        };
        if let Err(e) = connection.on_frame(frame, &mut requests).await {
            break e.to_string();
        }
    };

    if let Some(connection) = connection.upgrade() {
        connection.shut_down(&reason).await;
    }
}
