use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument};

use crate::connection::ConnectionState;
use crate::error::{ProtocolError, TChannelError, TChannelResult};
use crate::frame::read_frame;
use crate::messages::init::{InitMessage, PROTOCOL_VERSION};
use crate::messages::{Headers, Message};


/// The INIT_REQ / INIT_RES exchange on a freshly opened stream, before the stream is handed to
///  a connection's receive loop.
///
/// Both sides wait for the other side's part for at most `timeout`. Any failure moves the
///  handshake to [ConnectionState::Closed].
pub struct Handshake<'a, S> {
    stream: &'a mut S,
    message_id: u32,
    timeout: Duration,
    state: ConnectionState,
    initiated: bool,
}

impl<'a, S: AsyncRead + AsyncWrite + Unpin> Handshake<'a, S> {
    /// `message_id` is the id of the INIT_REQ on the connecting side
    pub fn new(stream: &'a mut S, message_id: u32, timeout: Duration) -> Handshake<'a, S> {
        Handshake {
            stream,
            message_id,
            timeout,
            state: ConnectionState::Init,
            initiated: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Sends the INIT_REQ. Only allowed once, before the handshake completed.
    pub async fn initiate_handshake(&mut self, headers: Headers) -> TChannelResult<()> {
        if self.state != ConnectionState::Init || self.initiated {
            return Err(TChannelError::InvalidState(self.state));
        }
        self.initiated = true;

        let message = Message::InitRequest(InitMessage::new(headers));
        let result = self.write(&message, self.message_id).await;
        self.fail_on_err(result)
    }

    /// Waits for the INIT_RES to a previously sent INIT_REQ, returning its headers
    #[instrument(name = "await_handshake_reply", skip_all, fields(message_id = self.message_id))]
    pub async fn await_handshake_reply(&mut self) -> TChannelResult<InitMessage> {
        if self.state != ConnectionState::Init || !self.initiated {
            return Err(TChannelError::InvalidState(self.state));
        }

        let result = match self.read_init().await {
            Ok((_, Message::InitResponse(init))) => Self::validated(init),
            Ok((_, other)) => Err(unexpected(other)),
            Err(e) => Err(e),
        };
        let init = self.fail_on_err(result)?;

        debug!(remote_host_port = init.header("host_port"), "handshake completed");
        self.state = ConnectionState::Ready;
        Ok(init)
    }

    /// The accepting side: waits for an INIT_REQ and answers it with an INIT_RES carrying
    ///  `headers`, returning the remote side's headers
    #[instrument(name = "await_handshake", skip_all)]
    pub async fn await_handshake(&mut self, headers: Headers) -> TChannelResult<InitMessage> {
        if self.state != ConnectionState::Init || self.initiated {
            return Err(TChannelError::InvalidState(self.state));
        }

        let result = match self.read_init().await {
            Ok((id, Message::InitRequest(init))) => Self::validated(init).map(|init| (id, init)),
            Ok((_, other)) => Err(unexpected(other)),
            Err(e) => Err(e),
        };
        let (id, init) = self.fail_on_err(result)?;

        let reply = Message::InitResponse(InitMessage::new(headers));
        let result = self.write(&reply, id).await;
        self.fail_on_err(result)?;

        debug!(remote_host_port = init.header("host_port"), "handshake completed");
        self.state = ConnectionState::Ready;
        Ok(init)
    }

    fn validated(init: InitMessage) -> TChannelResult<InitMessage> {
        if init.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedProtocolVersion(init.version).into());
        }
        init.validate()?;
        Ok(init)
    }

    async fn read_init(&mut self) -> TChannelResult<(u32, Message)> {
        let frame = match tokio::time::timeout(self.timeout, read_frame(&mut *self.stream)).await {
            Err(_) => return Err(TChannelError::Timeout(self.timeout)),
            Ok(frame) => frame?,
        };
        let frame = frame
            .ok_or_else(|| TChannelError::ConnectionClosed("stream closed during handshake".to_string()))?;
        Ok((frame.header.message_id, Message::from_frame(&frame)?))
    }

    async fn write(&mut self, message: &Message, message_id: u32) -> TChannelResult<()> {
        let buf = message.to_frame(message_id)?.to_bytes();
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    fn fail_on_err<T>(&mut self, result: TChannelResult<T>) -> TChannelResult<T> {
        if result.is_err() {
            self.state = ConnectionState::Closed;
        }
        result
    }
}

/// An ERROR frame in place of a handshake message is the remote side rejecting the handshake
fn unexpected(message: Message) -> TChannelError {
    match message {
        Message::Error(e) => TChannelError::Remote { code: e.code, description: e.message },
        other => ProtocolError::UnexpectedHandshakeMessage(other.message_type()).into(),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;
    use crate::error::ErrorCode;
    use crate::messages::control::ErrorMessage;
    use crate::messages::MessageType;
    use super::*;

    fn headers(host_port: &str, process_name: &str) -> Headers {
        InitMessage::handshake_headers(host_port, process_name)
    }

    #[tokio::test]
    async fn test_handshake() {
        let (mut client, mut server) = duplex(4096);

        let client_side = async {
            let mut handshake = Handshake::new(&mut client, 1, Duration::from_secs(1));
            handshake.initiate_handshake(headers("1.1.1.1:1", "client")).await.unwrap();
            let remote = handshake.await_handshake_reply().await.unwrap();
            assert_eq!(handshake.state(), ConnectionState::Ready);
            remote
        };
        let server_side = async {
            let mut handshake = Handshake::new(&mut server, 0, Duration::from_secs(1));
            let remote = handshake.await_handshake(headers("2.2.2.2:2", "server")).await.unwrap();
            assert_eq!(handshake.state(), ConnectionState::Ready);
            remote
        };

        let (server_seen_by_client, client_seen_by_server) = tokio::join!(client_side, server_side);
        assert_eq!(server_seen_by_client.host_port(), Ok("2.2.2.2:2"));
        assert_eq!(server_seen_by_client.process_name(), Ok("server"));
        assert_eq!(client_seen_by_server.host_port(), Ok("1.1.1.1:1"));
    }

    #[tokio::test]
    async fn test_missing_header_in_reply() {
        let (mut client, mut server) = duplex(4096);

        let client_side = async {
            let mut handshake = Handshake::new(&mut client, 1, Duration::from_secs(1));
            handshake.initiate_handshake(headers("1.1.1.1:1", "client")).await.unwrap();
            let result = handshake.await_handshake_reply().await;
            (result, handshake.state())
        };
        let server_side = async {
            let mut handshake = Handshake::new(&mut server, 0, Duration::from_secs(1));
            handshake.await_handshake(vec![("host_port".to_string(), "2.2.2.2:2".to_string())]).await
        };

        let ((client_result, client_state), server_result) = tokio::join!(client_side, server_side);
        assert!(server_result.is_ok());
        match client_result {
            Err(TChannelError::Protocol(ProtocolError::MissingHandshakeHeader("process_name"))) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(client_state, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_unexpected_message() {
        let (mut client, mut server) = duplex(4096);
        server.write_all(&Message::PingRequest.to_frame(1).unwrap().to_bytes()).await.unwrap();

        let mut handshake = Handshake::new(&mut client, 1, Duration::from_secs(1));
        handshake.initiate_handshake(headers("1.1.1.1:1", "c")).await.unwrap();
        match handshake.await_handshake_reply().await {
            Err(TChannelError::Protocol(ProtocolError::UnexpectedHandshakeMessage(MessageType::PingRequest))) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejected_by_error_frame() {
        let (mut client, mut server) = duplex(4096);
        let error = Message::Error(ErrorMessage::new(ErrorCode::Declined, "go away"));
        server.write_all(&error.to_frame(1).unwrap().to_bytes()).await.unwrap();

        let mut handshake = Handshake::new(&mut client, 1, Duration::from_secs(1));
        handshake.initiate_handshake(headers("1.1.1.1:1", "c")).await.unwrap();
        match handshake.await_handshake_reply().await {
            Err(TChannelError::Remote { code: ErrorCode::Declined, .. }) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wrong_version() {
        let (mut client, mut server) = duplex(4096);
        let mut init = InitMessage::new(headers("1.1.1.1:1", "c"));
        init.version = 1;
        client.write_all(&Message::InitRequest(init).to_frame(1).unwrap().to_bytes()).await.unwrap();

        let mut handshake = Handshake::new(&mut server, 0, Duration::from_secs(1));
        match handshake.await_handshake(headers("2.2.2.2:2", "s")).await {
            Err(TChannelError::Protocol(ProtocolError::UnsupportedProtocolVersion(1))) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let (mut client, _server) = duplex(4096);
        let mut handshake = Handshake::new(&mut client, 1, Duration::from_secs(5));
        handshake.initiate_handshake(headers("1.1.1.1:1", "c")).await.unwrap();
        match handshake.await_handshake_reply().await {
            Err(TChannelError::Timeout(d)) => assert_eq!(d, Duration::from_secs(5)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(handshake.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_closed_during_handshake() {
        let (mut client, server) = duplex(4096);
        drop(server);
        let mut handshake = Handshake::new(&mut client, 1, Duration::from_secs(5));
        assert!(handshake.initiate_handshake(headers("1.1.1.1:1", "c")).await.is_err());
        assert!(matches!(handshake.await_handshake_reply().await, Err(TChannelError::InvalidState(ConnectionState::Closed))));
    }

    #[tokio::test]
    async fn test_reply_before_initiate() {
        let (mut client, _server) = duplex(4096);
        let mut handshake = Handshake::new(&mut client, 1, Duration::from_secs(5));
        assert!(matches!(handshake.await_handshake_reply().await, Err(TChannelError::InvalidState(ConnectionState::Init))));
    }
}
