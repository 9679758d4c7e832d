//! An implementation of the TChannel RPC protocol on top of tokio.
//!
//! Every message is sent as one or more frames over a single bidirectional byte stream:
//!
//! ```ascii
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           size:u16            |    type:u8    |  reserved:u8  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                            id:u32                             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          reserved:u64                         |
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      payload (size - 16)                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Layers, bottom up:
//! * [frame]: frame header and frame I/O
//! * [messages], [checksum]: typed message payloads
//! * [fragment]: splitting call messages across frames, and reassembling them
//! * [connection]: handshake, request / response correlation by message id, inbound dispatch
//! * [peer], [call]: peer selection, connection reuse and retries
//! * [channel]: the local endpoint tying it all together

pub mod call;
pub mod channel;
pub mod checksum;
pub mod config;
pub mod connection;
pub mod error;
pub mod fragment;
pub mod frame;
pub mod messages;
pub mod peer;
pub mod test_util;
pub mod util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .with_test_writer()
            .try_init()
            .ok();
    }
}
