use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;

use crate::call::RetryFlag;
use crate::checksum::ChecksumType;
use crate::frame::MAX_PAYLOAD_SIZE;


pub struct ChannelConfig {
    /// Announced to remote endpoints as the `process_name` handshake header
    pub process_name: String,

    /// Address the channel's listener binds to. `None` for a channel that only makes outgoing
    ///  calls; it then announces the ephemeral host_port `0.0.0.0:0`.
    pub listen_addr: Option<SocketAddr>,

    /// Upper bound for waiting on the remote side's part of the handshake, on both the
    ///  connecting and the accepting side
    pub handshake_timeout: Duration,

    /// Per-attempt TTL of calls that do not specify their own. Also bounds the lifetime of a
    ///  partially received message that carries no TTL of its own (i.e. a response).
    pub default_ttl: Duration,

    /// Total number of attempts for a call, including the first one
    pub attempt_times: usize,
    pub retry_delay: Duration,
    pub retry_flag: RetryFlag,

    /// Checksum type for outgoing call messages. Farm32 is not supported.
    pub checksum_type: ChecksumType,

    /// Payload budget per frame. Call messages with bigger args are fragmented. Lowering this
    ///  below the protocol maximum is mostly useful for testing fragmentation.
    pub max_frame_payload: usize,

    /// Peers with a score at or below this threshold are not chosen for calls without an
    ///  explicit host_port
    pub score_threshold: f64,
}

impl ChannelConfig {
    pub fn new(process_name: &str) -> ChannelConfig {
        ChannelConfig {
            process_name: process_name.to_string(),
            listen_addr: None,
            handshake_timeout: Duration::from_secs(5),
            default_ttl: Duration::from_secs(1),
            attempt_times: 3,
            retry_delay: Duration::from_millis(100),
            retry_flag: RetryFlag::Default,
            checksum_type: ChecksumType::Crc32,
            max_frame_payload: MAX_PAYLOAD_SIZE,
            score_threshold: 0.0,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.process_name.is_empty() {
            bail!("process name must not be empty");
        }
        if self.process_name.len() > u16::MAX as usize {
            bail!("process name is too long for the handshake header");
        }
        if self.handshake_timeout.is_zero() {
            bail!("handshake timeout must be positive");
        }
        if self.default_ttl.is_zero() || self.default_ttl.as_millis() > u32::MAX as u128 {
            bail!("default TTL must be between 1ms and u32::MAX ms");
        }
        if self.attempt_times == 0 {
            bail!("attempt_times must be at least 1");
        }
        if self.checksum_type == ChecksumType::Farm32 {
            bail!("farm32 checksums are not supported");
        }
        // room for the fixed fields of a call request with a reasonably sized service name and headers
        if self.max_frame_payload < 1024 || self.max_frame_payload > MAX_PAYLOAD_SIZE {
            bail!("max frame payload must be between 1024 and {} bytes", MAX_PAYLOAD_SIZE);
        }
        if !(0.0..1.0).contains(&self.score_threshold) {
            bail!("score threshold must be in [0.0, 1.0)");
        }
        Ok(())
    }
}
