use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use thiserror::Error;

use crate::connection::Connection;
use crate::error::ErrorCode;
use crate::messages::call::{CallRequest, CallResponse};


/// Rejection of an inbound call, sent back to the caller as an ERROR frame
#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error("{code:?}: {description}")]
pub struct CallError {
    pub code: ErrorCode,
    pub description: String,
}

impl CallError {
    pub fn new(code: ErrorCode, description: &str) -> CallError {
        CallError {
            code,
            description: description.to_string(),
        }
    }
}

/// Dispatches complete (i.e. reassembled) inbound call requests.
///
/// Each call is handled in a task of its own. An application level failure is an `Ok` response
///  with [crate::messages::call::ResponseCode::Error]; an `Err` is sent as an ERROR frame and may
///  cause the caller to retry elsewhere, depending on its code.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle_call(&self, request: CallRequest, connection: Arc<Connection>) -> Result<CallResponse, CallError>;
}
