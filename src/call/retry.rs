use crate::error::ErrorCode;


/// Which failures of an attempt make a call retry on another peer. Sent to the callee as the
///  `re` transport header.
///
/// [RetryFlag::Default] sends no header and behaves like [RetryFlag::OnConnectionError].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default)]
pub enum RetryFlag {
    Never,
    OnConnectionError,
    OnTimeout,
    OnConnectionErrorAndTimeout,
    #[default]
    Default,
}

impl RetryFlag {
    pub fn header_value(&self) -> Option<&'static str> {
        match self {
            RetryFlag::Never => Some("n"),
            RetryFlag::OnConnectionError => Some("c"),
            RetryFlag::OnTimeout => Some("t"),
            RetryFlag::OnConnectionErrorAndTimeout => Some("tc"),
            RetryFlag::Default => None,
        }
    }

    /// Parses a `re` header value. Characters may come in any order.
    pub fn parse(value: &str) -> Option<RetryFlag> {
        match value {
            "n" => Some(RetryFlag::Never),
            "c" => Some(RetryFlag::OnConnectionError),
            "t" => Some(RetryFlag::OnTimeout),
            "tc" | "ct" => Some(RetryFlag::OnConnectionErrorAndTimeout),
            _ => None,
        }
    }

    fn on_connection_error(&self) -> bool {
        matches!(self, RetryFlag::OnConnectionError | RetryFlag::OnConnectionErrorAndTimeout | RetryFlag::Default)
    }

    fn on_timeout(&self) -> bool {
        matches!(self, RetryFlag::OnTimeout | RetryFlag::OnConnectionErrorAndTimeout)
    }
}

/// Decides whether an attempt that failed with `code` is retried on another peer
pub fn should_retry(flag: RetryFlag, code: ErrorCode) -> bool {
    if flag == RetryFlag::Never {
        return false;
    }

    match code {
        ErrorCode::BadRequest | ErrorCode::Cancelled | ErrorCode::Unhealthy => false,
        ErrorCode::Busy | ErrorCode::Declined => true,
        ErrorCode::Timeout => flag.on_timeout(),
        ErrorCode::NetworkError | ErrorCode::Fatal | ErrorCode::Unexpected => flag.on_connection_error(),
    }
}
