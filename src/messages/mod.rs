//! The closed set of TChannel messages and their payload layouts. A message is encoded into (and
//!  decoded from) the payload of a single [Frame]; the frame header carries its type and id.

pub mod call;
pub mod codec;
pub mod control;
pub mod init;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::checksum::Checksum;
use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::messages::call::{CallContinue, CallRequest, CallResponse};
use crate::messages::codec::PayloadReader;
use crate::messages::control::{CancelMessage, ClaimMessage, ErrorMessage};
use crate::messages::init::InitMessage;
use crate::util::random::Random;


/// Ordered key / value pairs. Keys are unique, which is checked when decoding.
pub type Headers = Vec<(String, String)>;

/// Set on every frame of a call except the last one
pub const FLAG_FRAGMENT: u8 = 0x01;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
    InitRequest = 0x01,
    InitResponse = 0x02,
    CallRequest = 0x03,
    CallResponse = 0x04,
    CallRequestContinue = 0x13,
    CallResponseContinue = 0x14,
    Cancel = 0xC0,
    Claim = 0xC1,
    PingRequest = 0xD0,
    PingResponse = 0xD1,
    Error = 0xFF,
}

impl MessageType {
    pub fn is_call_family(&self) -> bool {
        matches!(self, MessageType::CallRequest | MessageType::CallResponse | MessageType::CallRequestContinue | MessageType::CallResponseContinue)
    }
}

/// ```ascii
/// span_id:8 parent_id:8 trace_id:8 traceflags:1
/// ```
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash)]
pub struct Tracing {
    pub span_id: u64,
    pub parent_id: u64,
    pub trace_id: u64,
    pub traceflags: u8,
}

impl Tracing {
    pub const SERIALIZED_LEN: usize = 25;

    /// A new span with random ids, as a child of `parent` if there is one
    pub fn new_span<R: Random>(parent: Option<&Tracing>) -> Tracing {
        let span_id = R::next_u64();
        match parent {
            Some(parent) => Tracing {
                span_id,
                parent_id: parent.span_id,
                trace_id: parent.trace_id,
                traceflags: parent.traceflags,
            },
            None => Tracing {
                span_id,
                parent_id: 0,
                trace_id: span_id,
                traceflags: 0,
            },
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.span_id);
        buf.put_u64(self.parent_id);
        buf.put_u64(self.trace_id);
        buf.put_u8(self.traceflags);
    }

    pub fn deser(reader: &mut PayloadReader) -> Result<Tracing, ProtocolError> {
        Ok(Tracing {
            span_id: reader.u64()?,
            parent_id: reader.u64()?,
            trace_id: reader.u64()?,
            traceflags: reader.u8()?,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Message {
    InitRequest(InitMessage),
    InitResponse(InitMessage),
    CallRequest(CallRequest),
    CallResponse(CallResponse),
    CallRequestContinue(CallContinue),
    CallResponseContinue(CallContinue),
    Cancel(CancelMessage),
    Claim(ClaimMessage),
    PingRequest,
    PingResponse,
    Error(ErrorMessage),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::InitRequest(_) => MessageType::InitRequest,
            Message::InitResponse(_) => MessageType::InitResponse,
            Message::CallRequest(_) => MessageType::CallRequest,
            Message::CallResponse(_) => MessageType::CallResponse,
            Message::CallRequestContinue(_) => MessageType::CallRequestContinue,
            Message::CallResponseContinue(_) => MessageType::CallResponseContinue,
            Message::Cancel(_) => MessageType::Cancel,
            Message::Claim(_) => MessageType::Claim,
            Message::PingRequest => MessageType::PingRequest,
            Message::PingResponse => MessageType::PingResponse,
            Message::Error(_) => MessageType::Error,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        match self {
            Message::InitRequest(m) | Message::InitResponse(m) => m.ser(buf),
            Message::CallRequest(m) => m.ser(buf),
            Message::CallResponse(m) => m.ser(buf),
            Message::CallRequestContinue(m) | Message::CallResponseContinue(m) => m.ser(buf),
            Message::Cancel(m) => m.ser(buf),
            Message::Claim(m) => {
                m.ser(buf);
                Ok(())
            }
            Message::PingRequest | Message::PingResponse => Ok(()),
            Message::Error(m) => m.ser(buf),
        }
    }

    /// Decodes a frame payload. The whole payload must be consumed by the message's layout.
    pub fn deser(message_type: u8, payload: Bytes) -> Result<Message, ProtocolError> {
        let message_type = MessageType::try_from(message_type)
            .map_err(|_| ProtocolError::UnknownMessageType(message_type))?;

        let mut reader = PayloadReader::new(payload, message_type);
        let message = match message_type {
            MessageType::InitRequest => Message::InitRequest(InitMessage::deser(&mut reader)?),
            MessageType::InitResponse => Message::InitResponse(InitMessage::deser(&mut reader)?),
            MessageType::CallRequest => Message::CallRequest(CallRequest::deser(&mut reader)?),
            MessageType::CallResponse => Message::CallResponse(CallResponse::deser(&mut reader)?),
            MessageType::CallRequestContinue => Message::CallRequestContinue(CallContinue::deser(&mut reader)?),
            MessageType::CallResponseContinue => Message::CallResponseContinue(CallContinue::deser(&mut reader)?),
            MessageType::Cancel => Message::Cancel(CancelMessage::deser(&mut reader)?),
            MessageType::Claim => Message::Claim(ClaimMessage::deser(&mut reader)?),
            MessageType::PingRequest => Message::PingRequest,
            MessageType::PingResponse => Message::PingResponse,
            MessageType::Error => Message::Error(ErrorMessage::deser(&mut reader)?),
        };
        reader.finish()?;
        Ok(message)
    }

    pub fn to_frame(&self, message_id: u32) -> Result<Frame, ProtocolError> {
        let mut buf = BytesMut::new();
        self.ser(&mut buf)?;
        Frame::new(self.message_type().into(), message_id, buf.freeze())
    }

    pub fn from_frame(frame: &Frame) -> Result<Message, ProtocolError> {
        Message::deser(frame.header.message_type, frame.payload.clone())
    }

    pub fn checksum_and_args(&self) -> Option<(&Checksum, &[Bytes])> {
        match self {
            Message::CallRequest(m) => Some((&m.checksum, &m.args)),
            Message::CallResponse(m) => Some((&m.checksum, &m.args)),
            Message::CallRequestContinue(m) | Message::CallResponseContinue(m) => Some((&m.checksum, &m.args)),
            _ => None,
        }
    }

    pub fn checksum_and_args_mut(&mut self) -> Option<(&mut Checksum, &mut Vec<Bytes>)> {
        match self {
            Message::CallRequest(m) => Some((&mut m.checksum, &mut m.args)),
            Message::CallResponse(m) => Some((&mut m.checksum, &mut m.args)),
            Message::CallRequestContinue(m) | Message::CallResponseContinue(m) => Some((&mut m.checksum, &mut m.args)),
            _ => None,
        }
    }

    pub fn flags(&self) -> Option<u8> {
        match self {
            Message::CallRequest(m) => Some(m.flags),
            Message::CallResponse(m) => Some(m.flags),
            Message::CallRequestContinue(m) | Message::CallResponseContinue(m) => Some(m.flags),
            _ => None,
        }
    }

    /// `true` if more frames of the same logical message follow
    pub fn is_fragment(&self) -> bool {
        self.flags().is_some_and(|f| f & FLAG_FRAGMENT != 0)
    }

    /// Size of the encoded payload without any args, for call-family messages
    pub fn len_without_args(&self) -> Option<usize> {
        match self {
            Message::CallRequest(m) => Some(m.len_without_args()),
            Message::CallResponse(m) => Some(m.len_without_args()),
            Message::CallRequestContinue(m) | Message::CallResponseContinue(m) => Some(m.len_without_args()),
            _ => None,
        }
    }
}

/// Reads and decodes all messages in a buffer of concatenated frames, returning them with their
///  message ids
pub fn deser_all(buf: &mut impl Buf) -> Result<Vec<(u32, Message)>, ProtocolError> {
    let mut result = Vec::new();
    while let Some(frame) = Frame::try_deser(buf)? {
        result.push((frame.header.message_id, Message::from_frame(&frame)?));
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use crate::checksum::{compute_and_set, ChecksumType};
    use crate::error::ErrorCode;
    use crate::messages::call::ResponseCode;
    use crate::util::random::{MockRandom, MOCK_RANDOM_MUTEX};
    use super::*;

    fn tracing() -> Tracing {
        Tracing { span_id: 1, parent_id: 2, trace_id: 3, traceflags: 1 }
    }

    fn args() -> Vec<Bytes> {
        vec![Bytes::from_static(b"echo"), Bytes::new(), Bytes::from_static(b"hello world")]
    }

    fn call_request() -> Message {
        let mut req = CallRequest::new("svc", 1500, vec![("as".to_string(), "raw".to_string())], args());
        req.tracing = tracing();
        let mut msg = Message::CallRequest(req);
        compute_and_set(&mut msg).unwrap();
        msg
    }

    fn call_response() -> Message {
        let mut res = CallResponse::new(ResponseCode::Error, vec![], args());
        res.tracing = tracing();
        Message::CallResponse(res)
    }

    #[rstest]
    #[case::init_req(Message::InitRequest(InitMessage::new(vec![("host_port".to_string(), "1.2.3.4:5".to_string()), ("process_name".to_string(), "p".to_string())])))]
    #[case::init_res(Message::InitResponse(InitMessage::new(vec![])))]
    #[case::call_req(call_request())]
    #[case::call_res(call_response())]
    #[case::call_req_continue(Message::CallRequestContinue(CallContinue::new(FLAG_FRAGMENT, Checksum::Crc32(5), args())))]
    #[case::call_res_continue(Message::CallResponseContinue(CallContinue::new(0, Checksum::None, vec![Bytes::new()])))]
    #[case::cancel(Message::Cancel(CancelMessage { ttl: 10, tracing: tracing(), why: "gone".to_string() }))]
    #[case::claim(Message::Claim(ClaimMessage { ttl: 10, tracing: tracing() }))]
    #[case::ping_req(Message::PingRequest)]
    #[case::ping_res(Message::PingResponse)]
    #[case::error(Message::Error(ErrorMessage::new(ErrorCode::Busy, "too busy")))]
    fn test_ser_deser(#[case] message: Message) {
        let frame = message.to_frame(17).unwrap();
        assert_eq!(frame.header.message_type, u8::from(message.message_type()));
        assert_eq!(Message::from_frame(&frame), Ok(message));
    }

    /// `num_headers` headers with keys and values of `str_len` bytes, and an arg3 of `arg_len` bytes
    fn sized_call_request(num_headers: usize, str_len: usize, arg_len: usize) -> Message {
        let headers = (0..num_headers)
            .map(|i| (format!("{:0>width$}", i, width = str_len), "v".repeat(str_len)))
            .collect();
        Message::CallRequest(CallRequest::new("svc", 1000, headers, vec![Bytes::new(), Bytes::new(), Bytes::from(vec![b'x'; arg_len])]))
    }

    #[rstest]
    #[case::empty(0, 0, 0)]
    #[case::one_byte(1, 1, 1)]
    #[case::max_str1(1, 255, 255)]
    #[case::max_headers(255, 3, 0)]
    #[case::max_arg(0, 0, 65535)]
    fn test_call_request_length_prefix_limits(#[case] num_headers: usize, #[case] str_len: usize, #[case] arg_len: usize) {
        let message = sized_call_request(num_headers, str_len, arg_len);
        let mut buf = BytesMut::new();
        message.ser(&mut buf).unwrap();

        assert_eq!(message.len_without_args(), Some(buf.len() - 3 * 2 - arg_len));
        assert_eq!(Message::deser(u8::from(MessageType::CallRequest), buf.freeze()), Ok(message));
    }

    #[rstest]
    #[case::header_key(1, 256, 0, "header key")]
    #[case::num_headers(256, 3, 0, "headers")]
    #[case::arg(0, 0, 65536, "arg")]
    fn test_call_request_beyond_length_prefix(#[case] num_headers: usize, #[case] str_len: usize, #[case] arg_len: usize, #[case] expected_field: &str) {
        let mut buf = BytesMut::new();
        match sized_call_request(num_headers, str_len, arg_len).ser(&mut buf) {
            Err(ProtocolError::FieldTooLong { field, .. }) => assert_eq!(field, expected_field),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[rstest]
    #[case::empty(0, Ok(()))]
    #[case::beyond_str1(256, Ok(()))]
    #[case::max_str2(65535, Ok(()))]
    #[case::beyond_str2(65536, Err("header value"))]
    fn test_init_header_length_prefix(#[case] value_len: usize, #[case] expected: Result<(), &str>) {
        let message = Message::InitRequest(InitMessage::new(vec![("host_port".to_string(), "v".repeat(value_len))]));
        let mut buf = BytesMut::new();
        match (message.ser(&mut buf), expected) {
            (Ok(()), Ok(())) => assert_eq!(Message::deser(u8::from(MessageType::InitRequest), buf.freeze()), Ok(message)),
            (Err(ProtocolError::FieldTooLong { field, .. }), Err(expected_field)) => assert_eq!(field, expected_field),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_call_request_layout() {
        let mut buf = BytesMut::new();
        call_request().ser(&mut buf).unwrap();

        let mut expected = BytesMut::new();
        expected.put_u8(0);
        expected.put_u32(1500);
        tracing().ser(&mut expected);
        expected.put_slice(b"\x03svc");
        expected.put_slice(b"\x01\x02as\x03raw");
        expected.put_u8(ChecksumType::Crc32.into());
        let crc = call_request().checksum_and_args().unwrap().0.value().unwrap();
        expected.put_u32(crc);
        expected.put_slice(b"\0\x04echo\0\0\0\x0bhello world");

        assert_eq!(buf, expected);
    }

    #[test]
    fn test_unknown_message_type() {
        assert_eq!(Message::deser(0x42, Bytes::new()), Err(ProtocolError::UnknownMessageType(0x42)));
    }

    #[rstest]
    #[case::ping_with_body(0xd0, b"x", MessageType::PingRequest)]
    #[case::short_error(0xff, b"\x03\0\0", MessageType::Error)]
    #[case::trailing_bytes_after_init(0x01, b"\0\x02\0\0\x99", MessageType::InitRequest)]
    fn test_truncated_payload(#[case] message_type: u8, #[case] payload: &'static [u8], #[case] expected: MessageType) {
        assert_eq!(
            Message::deser(message_type, Bytes::from_static(payload)),
            Err(ProtocolError::TruncatedPayload { message_type: expected })
        );
    }

    #[test]
    fn test_len_without_args() {
        let msg = call_request();
        let mut buf = BytesMut::new();
        msg.ser(&mut buf).unwrap();
        let args_len: usize = args().iter().map(|a| 2 + a.len()).sum();
        assert_eq!(msg.len_without_args(), Some(buf.len() - args_len));
        assert_eq!(Message::PingRequest.len_without_args(), None);
    }

    #[test]
    fn test_deser_all() {
        let mut buf = BytesMut::new();
        Message::PingRequest.to_frame(1).unwrap().ser(&mut buf);
        call_response().to_frame(2).unwrap().ser(&mut buf);

        let decoded = deser_all(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, vec![(1, Message::PingRequest), (2, call_response())]);
    }

    #[rstest]
    #[case::root(None, Tracing { span_id: 99, parent_id: 0, trace_id: 99, traceflags: 0 })]
    #[case::child(Some(tracing()), Tracing { span_id: 99, parent_id: 1, trace_id: 3, traceflags: 1 })]
    fn test_new_span(#[case] parent: Option<Tracing>, #[case] expected: Tracing) {
        let _lock = MOCK_RANDOM_MUTEX.lock().unwrap();
        let ctx = MockRandom::next_u64_context();
        ctx.expect().return_const(99u64);

        assert_eq!(Tracing::new_span::<MockRandom>(parent.as_ref()), expected);
    }
}
