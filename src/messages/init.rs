use bytes::{BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::messages::codec::{put_headers2, PayloadReader};
use crate::messages::Headers;


pub const PROTOCOL_VERSION: u16 = 0x02;

pub const HEADER_HOST_PORT: &str = "host_port";
pub const HEADER_PROCESS_NAME: &str = "process_name";

/// host_port announced by an endpoint that does not listen for incoming connections
pub const EPHEMERAL_HOST_PORT: &str = "0.0.0.0:0";

/// Payload of both INIT_REQ and INIT_RES:
///
/// ```ascii
/// version:2 nh:2 (key~2 value~2){nh}
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct InitMessage {
    pub version: u16,
    pub headers: Headers,
}

impl InitMessage {
    pub fn new(headers: Headers) -> InitMessage {
        InitMessage {
            version: PROTOCOL_VERSION,
            headers,
        }
    }

    pub fn handshake_headers(host_port: &str, process_name: &str) -> Headers {
        vec![
            (HEADER_HOST_PORT.to_string(), host_port.to_string()),
            (HEADER_PROCESS_NAME.to_string(), process_name.to_string()),
        ]
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn required_header(&self, key: &'static str) -> Result<&str, ProtocolError> {
        self.header(key)
            .ok_or(ProtocolError::MissingHandshakeHeader(key))
    }

    pub fn host_port(&self) -> Result<&str, ProtocolError> {
        self.required_header(HEADER_HOST_PORT)
    }

    pub fn process_name(&self) -> Result<&str, ProtocolError> {
        self.required_header(HEADER_PROCESS_NAME)
    }

    /// Checks that both headers required for a handshake are present
    pub fn validate(&self) -> Result<(), ProtocolError> {
        self.host_port()?;
        self.process_name()?;
        Ok(())
    }

    pub fn ser(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u16(self.version);
        put_headers2(buf, &self.headers)
    }

    pub fn deser(reader: &mut PayloadReader) -> Result<InitMessage, ProtocolError> {
        let version = reader.u16()?;
        let headers = reader.headers2()?;
        Ok(InitMessage { version, headers })
    }
}
