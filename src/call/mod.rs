//! Outgoing calls with peer selection and retries.
//!
//! A call is built through [crate::peer::peer_group::PeerGroup::request] and sent with
//!  [CallHandle::send]. Each attempt goes to a peer chosen by the peer group; if it fails with a
//!  retryable error (see [should_retry]), the peer is blacklisted for this call and the next attempt
//!  goes elsewhere after `retry_delay`.

pub mod retry;
pub mod tracer;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rustc_hash::FxHashSet;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub use retry::{should_retry, RetryFlag};

use crate::checksum::{Checksum, ChecksumType};
use crate::config::ChannelConfig;
use crate::connection::ConnectionState;
use crate::error::{ProtocolError, TChannelError, TChannelResult};
use crate::messages::call::{CallRequest, CallResponse, HEADER_CALLER_NAME, HEADER_RETRY_FLAGS};
use crate::messages::{Headers, Message, Tracing};
use crate::peer::peer_group::PeerGroup;
use crate::peer::Peer;
use crate::util::random::Random;


/// Per-call settings. Everything left at `None` falls back to the channel's [ChannelConfig].
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub service: String,
    /// Send to this peer rather than choosing one
    pub host_port: Option<String>,
    /// Transport headers, e.g. `as` for the arg scheme
    pub headers: Headers,
    /// Per-attempt time to live
    pub ttl: Option<Duration>,
    pub attempt_times: Option<usize>,
    pub retry_delay: Option<Duration>,
    pub retry_flag: Option<RetryFlag>,
    pub score_threshold: Option<f64>,
    pub checksum_type: Option<ChecksumType>,
    /// Makes the call's spans children of this span
    pub parent_tracing: Option<Tracing>,
}

impl RequestOptions {
    pub fn new(service: &str) -> RequestOptions {
        RequestOptions {
            service: service.to_string(),
            host_port: None,
            headers: vec![],
            ttl: None,
            attempt_times: None,
            retry_delay: None,
            retry_flag: None,
            score_threshold: None,
            checksum_type: None,
            parent_tracing: None,
        }
    }

    pub fn with_host_port(mut self, host_port: &str) -> RequestOptions {
        self.host_port = Some(host_port.to_string());
        self
    }

    pub fn with_header(mut self, key: &str, value: &str) -> RequestOptions {
        self.headers.push((key.to_string(), value.to_string()));
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> RequestOptions {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_attempt_times(mut self, attempt_times: usize) -> RequestOptions {
        self.attempt_times = Some(attempt_times);
        self
    }

    pub fn with_retry_flag(mut self, retry_flag: RetryFlag) -> RequestOptions {
        self.retry_flag = Some(retry_flag);
        self
    }
}

/// An arg of an outgoing call: either complete, or produced in chunks by the application.
///
/// A streamed arg can be consumed only once, so a call with a streamed arg is never retried. Its
///  chunks are framed and written as they arrive, the request's last frame goes out when the
///  stream ends.
#[derive(Debug)]
pub enum ArgSource {
    Buffered(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

impl ArgSource {
    pub fn is_stream(&self) -> bool {
        matches!(self, ArgSource::Stream(_))
    }
}

impl From<Bytes> for ArgSource {
    fn from(value: Bytes) -> Self {
        ArgSource::Buffered(value)
    }
}

impl From<Vec<u8>> for ArgSource {
    fn from(value: Vec<u8>) -> Self {
        ArgSource::Buffered(value.into())
    }
}

impl From<&'static str> for ArgSource {
    fn from(value: &'static str) -> Self {
        ArgSource::Buffered(Bytes::from_static(value.as_bytes()))
    }
}

impl From<mpsc::Receiver<Bytes>> for ArgSource {
    fn from(value: mpsc::Receiver<Bytes>) -> Self {
        ArgSource::Stream(value)
    }
}

/// What one attempt sends
enum AttemptArgs {
    Buffered(Vec<Bytes>),
    Streamed(Bytes, ArgSource, ArgSource),
}

/// A call that is ready to be sent
pub struct CallHandle<R: Random> {
    peers: Arc<PeerGroup<R>>,
    config: Arc<ChannelConfig>,
    options: RequestOptions,
}

impl<R: Random> CallHandle<R> {
    pub(crate) fn new(peers: Arc<PeerGroup<R>>, config: Arc<ChannelConfig>, options: RequestOptions) -> CallHandle<R> {
        CallHandle {
            peers,
            config,
            options,
        }
    }

    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    fn ttl(&self) -> Duration {
        self.options.ttl.unwrap_or(self.config.default_ttl)
    }

    fn retry_flag(&self) -> RetryFlag {
        self.options.retry_flag.unwrap_or(self.config.retry_flag)
    }

    fn score_threshold(&self) -> f64 {
        self.options.score_threshold.unwrap_or(self.config.score_threshold)
    }

    /// Sends the call, retrying on other peers as the retry flag allows. If all attempts fail, or
    ///  no peer is left after a failed attempt, the last attempt's error is returned.
    ///
    /// An application level failure is a successful call with an error response code, and it is
    ///  not retried.
    pub async fn send(&self, arg1: impl Into<Bytes>, arg2: impl Into<ArgSource>, arg3: impl Into<ArgSource>) -> TChannelResult<CallResponse> {
        let arg1 = arg1.into();
        let (arg2, arg3) = match (arg2.into(), arg3.into()) {
            (ArgSource::Buffered(arg2), ArgSource::Buffered(arg3)) => (arg2, arg3),
            (arg2, arg3) => return self.send_streamed(arg1, arg2, arg3).await,
        };
        let args = [arg1, arg2, arg3];

        let attempt_times = self.options.attempt_times.unwrap_or(self.config.attempt_times).max(1);
        let retry_flag = self.retry_flag();
        let retry_delay = self.options.retry_delay.unwrap_or(self.config.retry_delay);
        let score_threshold = self.score_threshold();

        let mut blacklist = FxHashSet::default();
        let mut last_error = None;
        for attempt in 1..=attempt_times {
            if attempt > 1 {
                tokio::time::sleep(retry_delay).await;
            }

            let Some(peer) = self.peers.choose(self.options.host_port.as_deref(), &blacklist, score_threshold).await else {
                break;
            };

            let error = match self.attempt(&peer, AttemptArgs::Buffered(args.to_vec())).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            let retryable = error.retry_code()
                .is_some_and(|code| should_retry(retry_flag, code));
            if !retryable || attempt == attempt_times {
                debug!(service = %self.options.service, peer = peer.host_port(), attempt, "call failed: {}", error);
                return Err(error);
            }

            warn!(service = %self.options.service, peer = peer.host_port(), attempt, "call attempt failed, retrying: {}", error);
            blacklist.insert(peer.host_port().to_string());
            last_error = Some(error);
        }

        Err(last_error.unwrap_or(TChannelError::NoAvailablePeer))
    }

    /// A call with a streamed arg gets a single attempt
    async fn send_streamed(&self, arg1: Bytes, arg2: ArgSource, arg3: ArgSource) -> TChannelResult<CallResponse> {
        let peer = self.peers.choose(self.options.host_port.as_deref(), &FxHashSet::default(), self.score_threshold()).await
            .ok_or(TChannelError::NoAvailablePeer)?;

        let result = self.attempt(&peer, AttemptArgs::Streamed(arg1, arg2, arg3)).await;
        if let Err(e) = &result {
            debug!(service = %self.options.service, peer = peer.host_port(), "streamed call failed: {}", e);
        }
        result
    }

    /// One attempt: a fresh span, a fresh message id on a connection to `peer`
    async fn attempt(&self, peer: &Peer, args: AttemptArgs) -> TChannelResult<CallResponse> {
        let connection = peer.connect().await
            .map_err(|e| match e {
                // a handshake that does not complete in time is a failure to connect
                TChannelError::Timeout(timeout) => TChannelError::ConnectionClosed(format!("handshake with {} timed out after {:?}", peer.host_port(), timeout)),
                e => e,
            })?;

        let tracer = self.peers.tracer();
        let tracing = tracer.new_span(self.options.parent_tracing);

        let ttl = self.ttl();
        let mut request = CallRequest::new(
            &self.options.service,
            u32::try_from(ttl.as_millis()).unwrap_or(u32::MAX),
            self.transport_headers(),
            vec![],
        );
        request.tracing = tracing;
        request.checksum = Checksum::empty(self.options.checksum_type.unwrap_or(self.config.checksum_type));

        let pending = match args {
            AttemptArgs::Buffered(args) => {
                request.args = args;
                connection.send(Message::CallRequest(request)).await
            }
            AttemptArgs::Streamed(arg1, arg2, arg3) => connection.send_streamed(request, arg1, arg2, arg3).await,
        };
        let result = match pending {
            Ok(pending) => pending.wait(ttl).await,
            // the connection was closed after the peer handed it out
            Err(TChannelError::InvalidState(ConnectionState::Closed)) => Err(TChannelError::ConnectionClosed(format!("connection to {} closed before the request was sent", peer.host_port()))),
            Err(e) => Err(e),
        };
        let result = match result {
            Ok(Message::CallResponse(response)) => Ok(response),
            Ok(other) => Err(ProtocolError::StreamingProtocolError(format!("expected a call response, got {:?}", other.message_type())).into()),
            Err(e) => Err(e),
        };

        tracer.span_finished(&tracing, &self.options.service, result.is_ok());
        result
    }

    fn transport_headers(&self) -> Headers {
        let mut headers = self.options.headers.iter()
            .filter(|(k, _)| k != HEADER_RETRY_FLAGS)
            .cloned()
            .collect::<Headers>();
        if let Some(value) = self.retry_flag().header_value() {
            headers.push((HEADER_RETRY_FLAGS.to_string(), value.to_string()));
        }
        if !headers.iter().any(|(k, _)| k == HEADER_CALLER_NAME) {
            headers.push((HEADER_CALLER_NAME.to_string(), self.config.process_name.clone()));
        }
        headers
    }
}
