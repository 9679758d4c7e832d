use std::sync::Weak;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use crate::connection::Connection;
use crate::error::{TChannelError, TChannelResult};
use crate::messages::Message;


/// The response slot of one request sent on a connection. It is resolved by the connection's
///  receive loop, or fails when the connection closes.
pub struct PendingResponse {
    message_id: u32,
    receiver: oneshot::Receiver<TChannelResult<Message>>,
    connection: Weak<Connection>,
}

impl PendingResponse {
    pub(crate) fn new(message_id: u32, receiver: oneshot::Receiver<TChannelResult<Message>>, connection: Weak<Connection>) -> PendingResponse {
        PendingResponse {
            message_id,
            receiver,
            connection,
        }
    }

    pub fn message_id(&self) -> u32 {
        self.message_id
    }

    /// Waits for the (reassembled) response. An ERROR frame for the request resolves to
    ///  [TChannelError::Remote].
    ///
    /// If nothing arrives within `ttl`, the response slot and any partially received response
    ///  are discarded, and a late response is dropped by the connection.
    pub async fn wait(self, ttl: Duration) -> TChannelResult<Message> {
        match tokio::time::timeout(ttl, self.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TChannelError::ConnectionClosed("connection dropped the response slot".to_string())),
            Err(_) => {
                debug!(message_id = self.message_id, ?ttl, "timed out waiting for response");
                if let Some(connection) = self.connection.upgrade() {
                    connection.forget(self.message_id).await;
                }
                Err(TChannelError::Timeout(ttl))
            }
        }
    }
}
