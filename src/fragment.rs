//! Splitting of call messages across frames, and reassembly of the frames received for a message
//!  id back into one logical call message.
//!
//! A call's three args are packed greedily into the first frame (a CALL_REQ / CALL_RES) and as many
//!  continuation frames as needed. Each chunk carries its own 2-byte length prefix; the first chunk
//!  of a continuation extends the arg that was last in the previous frame, every further chunk
//!  starts the next arg. When an arg ends so close to the end of a frame that the next arg's length
//!  prefix does not fit, the next frame starts with an empty chunk that closes the arg explicitly.
//!
//! ```ascii
//!  CALL_REQ  [fragment] | arg1 | arg2 (first part)  |
//!  CONTINUE  [fragment] | arg2 (cont.)  | arg3 (first part) |
//!  CONTINUE  []         | arg3 (rest) |
//! ```
//!
//! [Fragmenter] splits a message whose args are complete. [StreamingFragmenter] produces the same
//!  layout for args that arrive chunk by chunk, emitting frames before the last chunk is known.

use std::iter::FusedIterator;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::checksum::{compute, crc32, ensure_valid, Checksum, ChecksumType};
use crate::error::ProtocolError;
use crate::frame::MAX_PAYLOAD_SIZE;
use crate::messages::call::{continue_type, CallContinue};
use crate::messages::{Message, MessageType, FLAG_FRAGMENT};


const NUM_ARGS: usize = 3;

fn streaming_error(msg: impl Into<String>) -> ProtocolError {
    ProtocolError::StreamingProtocolError(msg.into())
}

/// Fixed sizes and per-frame settings shared by all frames of one call message
struct FrameLayout {
    continue_type: MessageType,
    /// farm32 is rejected up front, so this is either crc32 or no checksum
    with_crc32: bool,
    head_len: usize,
    continue_len: usize,
    max_payload: usize,
}

impl FrameLayout {
    /// `min_room` is what every frame must have left for chunks after its fixed fields
    fn of(message: &Message, max_payload: usize, min_room: usize) -> Result<FrameLayout, ProtocolError> {
        let message_type = message.message_type();
        if !matches!(message_type, MessageType::CallRequest | MessageType::CallResponse) {
            return Err(streaming_error(format!("only call requests and responses can be fragmented, not {:?}", message_type)));
        }
        let continue_type = continue_type(message_type)
            .ok_or_else(|| streaming_error(format!("no continuation type for {:?}", message_type)))?;

        let checksum_type = match message.checksum_and_args() {
            Some((checksum, _)) => checksum.checksum_type(),
            None => return Err(streaming_error("call message without args")),
        };
        if checksum_type == ChecksumType::Farm32 {
            return Err(ProtocolError::UnsupportedChecksumType(checksum_type));
        }

        let max_payload = max_payload.min(MAX_PAYLOAD_SIZE);
        let head_len = message.len_without_args().unwrap_or_default();
        let continue_len = CallContinue::new(0, Checksum::empty(checksum_type), vec![]).len_without_args();
        if max_payload <= head_len.max(continue_len) + min_room {
            return Err(streaming_error(format!("payload budget of {} bytes leaves no room for args after {} bytes of fixed fields", max_payload, head_len)));
        }

        Ok(FrameLayout {
            continue_type,
            with_crc32: checksum_type == ChecksumType::Crc32,
            head_len,
            continue_len,
            max_payload,
        })
    }

    /// Builds a frame's message: the initial message if `head` is given, a continuation otherwise
    fn frame(&self, head: Option<Message>, more: bool, chunks: Vec<Bytes>) -> Message {
        let checksum = if self.with_crc32 {
            Checksum::Crc32(crc32(&chunks))
        }
        else {
            Checksum::None
        };
        let flags = |original: u8| if more { original | FLAG_FRAGMENT } else { original & !FLAG_FRAGMENT };

        match head {
            Some(mut head) => {
                match &mut head {
                    Message::CallRequest(m) => { m.flags = flags(m.flags); m.checksum = checksum; m.args = chunks; }
                    Message::CallResponse(m) => { m.flags = flags(m.flags); m.checksum = checksum; m.args = chunks; }
                    _ => {}
                }
                head
            }
            None => {
                let cont = CallContinue::new(flags(0), checksum, chunks);
                match self.continue_type {
                    MessageType::CallRequestContinue => Message::CallRequestContinue(cont),
                    _ => Message::CallResponseContinue(cont),
                }
            }
        }
    }
}

/// Lazily splits a call message into the messages to be sent as frames, each with its own
///  checksum over the args it carries.
pub struct Fragmenter {
    /// the initial message with its args taken out, `None` after the first frame was produced
    head: Option<Message>,
    layout: FrameLayout,
    args: [Bytes; NUM_ARGS],
    cur_arg: usize,
    done: bool,
}

impl Fragmenter {
    pub fn new(mut message: Message, max_payload: usize) -> Result<Fragmenter, ProtocolError> {
        // every frame must have room for a length prefix and at least one byte of content
        let layout = FrameLayout::of(&message, max_payload, 2)?;

        let args = match message.checksum_and_args_mut() {
            Some((_, args)) => std::mem::take(args),
            None => vec![],
        };
        let args: [Bytes; NUM_ARGS] = args.try_into()
            .map_err(|args: Vec<Bytes>| streaming_error(format!("a call message must have exactly three args, got {}", args.len())))?;

        Ok(Fragmenter {
            head: Some(message),
            layout,
            args,
            cur_arg: 0,
            done: false,
        })
    }

    /// Packs the next frame's chunks into `space` bytes
    fn next_chunks(&mut self, mut space: usize) -> Vec<Bytes> {
        let mut chunks = Vec::with_capacity(NUM_ARGS);
        loop {
            if space < 2 {
                break;
            }
            space -= 2;

            let remaining = &mut self.args[self.cur_arg];
            let n = space.min(remaining.len());
            chunks.push(remaining.split_to(n));
            space -= n;

            if !remaining.is_empty() {
                break;
            }
            if self.cur_arg == NUM_ARGS - 1 {
                self.done = true;
                break;
            }
            if space <= 2 {
                // the next frame starts with an empty chunk closing this arg
                break;
            }
            self.cur_arg += 1;
        }
        chunks
    }
}

impl Iterator for Fragmenter {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        if self.done {
            return None;
        }

        let fixed_len = if self.head.is_some() { self.layout.head_len } else { self.layout.continue_len };
        let chunks = self.next_chunks(self.layout.max_payload - fixed_len);
        Some(self.layout.frame(self.head.take(), !self.done, chunks))
    }
}

impl FusedIterator for Fragmenter {}

/// Convenience for fragmenting a message completely
pub fn fragment(message: Message, max_payload: usize) -> Result<Vec<Message>, ProtocolError> {
    Ok(Fragmenter::new(message, max_payload)?
        .collect())
}


/// Splits a call message whose args are pushed incrementally, in order.
///
/// Frames are returned as soon as they are full. [StreamingFragmenter::flush] returns the frame
///  under construction early, which a sender does before waiting for more data so the receiver
///  is not held back by a slow producer.
pub struct StreamingFragmenter {
    head: Option<Message>,
    layout: FrameLayout,
    /// chunks of the frame under construction, the last one belonging to the current arg
    chunks: Vec<BytesMut>,
    space: usize,
    /// whether the frame under construction holds anything that was not sent yet
    dirty: bool,
    cur_arg: usize,
}

impl StreamingFragmenter {
    /// `head` is the call request or response without args
    pub fn new(head: Message, max_payload: usize) -> Result<StreamingFragmenter, ProtocolError> {
        // a continuation may need a closing empty chunk and the next arg's prefix before content
        let layout = FrameLayout::of(&head, max_payload, 4)?;
        if head.checksum_and_args().is_some_and(|(_, args)| !args.is_empty()) {
            return Err(streaming_error("the args of a streamed call message must be pushed separately"));
        }

        let space = layout.max_payload - layout.head_len - 2;
        Ok(StreamingFragmenter {
            head: Some(head),
            layout,
            chunks: vec![BytesMut::new()],
            space,
            dirty: true,
            cur_arg: 0,
        })
    }

    /// Appends data to the current arg, returning the frames that were filled up
    pub fn push(&mut self, mut data: Bytes) -> Vec<Message> {
        let mut frames = Vec::new();
        loop {
            let n = self.space.min(data.len());
            if n > 0 {
                if let Some(current) = self.chunks.last_mut() {
                    current.extend_from_slice(&data.split_to(n));
                }
                self.space -= n;
                self.dirty = true;
            }
            if data.is_empty() {
                return frames;
            }
            frames.push(self.emit(true));
        }
    }

    /// Completes the current arg and starts the next one
    pub fn end_arg(&mut self) -> Result<Vec<Message>, ProtocolError> {
        if self.cur_arg + 1 >= NUM_ARGS {
            return Err(ProtocolError::TooManyArgs(NUM_ARGS + 1));
        }
        self.cur_arg += 1;

        let mut frames = Vec::new();
        if self.space <= 2 {
            // the next frame starts with an empty chunk closing this arg
            frames.push(self.emit(true));
        }
        self.chunks.push(BytesMut::new());
        self.space -= 2;
        self.dirty = true;
        Ok(frames)
    }

    /// Returns the frame under construction if it holds anything not sent yet
    pub fn flush(&mut self) -> Option<Message> {
        if !self.dirty {
            return None;
        }
        Some(self.emit(true))
    }

    /// Returns the last frame of the message, which must be in its third arg by now
    pub fn finish(mut self) -> Result<Message, ProtocolError> {
        check_num_args(self.cur_arg + 1)?;
        Ok(self.emit(false))
    }

    fn emit(&mut self, more: bool) -> Message {
        let chunks = std::mem::replace(&mut self.chunks, vec![BytesMut::new()])
            .into_iter()
            .map(BytesMut::freeze)
            .collect::<Vec<_>>();
        self.space = self.layout.max_payload - self.layout.continue_len - 2;
        self.dirty = false;
        self.layout.frame(self.head.take(), more, chunks)
    }
}

struct PartialMessage {
    /// the initial frame's message with its args taken out
    head: Message,
    args: Vec<BytesMut>,
    deadline: Instant,
}

/// Reassembles call messages from their frames, keyed by message id. Requests and responses have
///  independent id spaces, so a connection uses one reassembler for each direction.
pub struct Reassembler {
    buffers: FxHashMap<u32, PartialMessage>,
    default_timeout: Duration,
}

impl Reassembler {
    /// `default_timeout` bounds the lifetime of a partial message if neither its first frame nor
    ///  the caller provides a TTL
    pub fn new(default_timeout: Duration) -> Reassembler {
        Reassembler {
            buffers: FxHashMap::default(),
            default_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Drops the partial message for an id, returning `true` if there was one
    pub fn purge(&mut self, message_id: u32) -> bool {
        self.buffers.remove(&message_id).is_some()
    }

    /// Drops all partial messages whose deadline has passed, returning their ids
    pub fn evict_expired(&mut self, now: Instant) -> Vec<u32> {
        let expired = self.buffers.iter()
            .filter(|(_, partial)| partial.deadline <= now)
            .map(|(&id, _)| id)
            .collect::<Vec<_>>();
        for id in &expired {
            warn!(message_id = id, "evicting incomplete message after its deadline passed");
            self.buffers.remove(id);
        }
        expired
    }

    /// Feeds a received call-family message. Returns the complete logical message once its last
    ///  frame arrived, `None` while more frames are expected.
    ///
    /// Any error discards the partial message for the id.
    pub fn on_message(&mut self, message_id: u32, message: Message, now: Instant) -> Result<Option<Message>, ProtocolError> {
        self.feed(message_id, message, now, None)
    }

    /// Like [Reassembler::on_message], but a partial message opened by `message` lives for `ttl`
    ///  instead of the TTL its first frame carries. Responses carry no TTL of their own, they are
    ///  bounded by the TTL of the request they answer.
    pub fn on_message_with_ttl(&mut self, message_id: u32, message: Message, now: Instant, ttl: Duration) -> Result<Option<Message>, ProtocolError> {
        self.feed(message_id, message, now, Some(ttl))
    }

    fn feed(&mut self, message_id: u32, message: Message, now: Instant, ttl: Option<Duration>) -> Result<Option<Message>, ProtocolError> {
        self.evict_expired(now);

        let result = self.do_on_message(message_id, message, now, ttl);
        if result.is_err() {
            self.purge(message_id);
        }
        result
    }

    fn do_on_message(&mut self, message_id: u32, message: Message, now: Instant, ttl: Option<Duration>) -> Result<Option<Message>, ProtocolError> {
        ensure_valid(&message)?;

        match message {
            Message::CallRequest(_) | Message::CallResponse(_) => {
                if self.buffers.contains_key(&message_id) {
                    return Err(streaming_error(format!("received a second call message for id {} while its previous message is incomplete", message_id)));
                }
                self.on_initial(message_id, message, now, ttl)
            }
            Message::CallRequestContinue(cont) | Message::CallResponseContinue(cont) => {
                self.on_continue(message_id, cont)
            }
            other => Err(streaming_error(format!("{:?} message is not part of a call", other.message_type()))),
        }
    }

    fn on_initial(&mut self, message_id: u32, mut message: Message, now: Instant, ttl: Option<Duration>) -> Result<Option<Message>, ProtocolError> {
        if !message.is_fragment() {
            check_num_args(message.checksum_and_args().map(|(_, args)| args.len()).unwrap_or_default())?;
            return Ok(Some(message));
        }

        let timeout = match (ttl, &message) {
            (Some(ttl), _) => ttl,
            (None, Message::CallRequest(req)) if req.ttl > 0 => Duration::from_millis(req.ttl as u64),
            _ => self.default_timeout,
        };
        let args = match message.checksum_and_args_mut() {
            Some((_, args)) => std::mem::take(args),
            None => vec![],
        };

        trace!(message_id, num_args = args.len(), "opening reassembly buffer");
        self.buffers.insert(message_id, PartialMessage {
            head: message,
            args: args.into_iter().map(|a| BytesMut::from(a.as_ref())).collect(),
            deadline: now + timeout,
        });
        Ok(None)
    }

    fn on_continue(&mut self, message_id: u32, cont: CallContinue) -> Result<Option<Message>, ProtocolError> {
        let partial = self.buffers.get_mut(&message_id)
            .ok_or_else(|| streaming_error("missing call message after receiving continue message"))?;

        let mut chunks = cont.args.into_iter();
        if let Some(first) = chunks.next() {
            match partial.args.last_mut() {
                Some(last) => last.extend_from_slice(&first),
                None => partial.args.push(BytesMut::from(first.as_ref())),
            }
        }
        for chunk in chunks {
            partial.args.push(BytesMut::from(chunk.as_ref()));
        }
        if partial.args.len() > NUM_ARGS {
            return Err(ProtocolError::TooManyArgs(partial.args.len()));
        }

        if cont.flags & FLAG_FRAGMENT != 0 {
            return Ok(None);
        }

        let partial = self.buffers.remove(&message_id)
            .ok_or_else(|| streaming_error("missing call message after receiving continue message"))?;
        check_num_args(partial.args.len())?;

        let mut message = partial.head;
        let args = partial.args.into_iter().map(|a| a.freeze()).collect::<Vec<_>>();
        match &mut message {
            Message::CallRequest(m) => m.flags &= !FLAG_FRAGMENT,
            Message::CallResponse(m) => m.flags &= !FLAG_FRAGMENT,
            _ => {}
        }
        if let Some((checksum, message_args)) = message.checksum_and_args_mut() {
            *checksum = compute(checksum.checksum_type(), &args)?;
            *message_args = args;
        }
        debug!(message_id, "reassembled fragmented message");
        Ok(Some(message))
    }
}

fn check_num_args(num_args: usize) -> Result<(), ProtocolError> {
    if num_args != NUM_ARGS {
        return Err(streaming_error(format!("a complete call message must have exactly three args, got {}", num_args)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use crate::checksum::compute_and_set;
    use crate::messages::call::{CallRequest, CallResponse, ResponseCode};
    use crate::messages::Tracing;
    use super::*;

    fn request(arg1: &[u8], arg2: &[u8], arg3: &[u8], checksum_type: ChecksumType) -> Message {
        let mut req = CallRequest::new("svc", 1000, vec![("as".to_string(), "raw".to_string())], vec![
            Bytes::copy_from_slice(arg1),
            Bytes::copy_from_slice(arg2),
            Bytes::copy_from_slice(arg3),
        ]);
        req.tracing = Tracing { span_id: 5, parent_id: 0, trace_id: 5, traceflags: 0 };
        req.checksum = Checksum::empty(checksum_type);
        Message::CallRequest(req)
    }

    fn response(arg1: &[u8], arg2: &[u8], arg3: &[u8]) -> Message {
        Message::CallResponse(CallResponse::new(ResponseCode::Ok, vec![], vec![
            Bytes::copy_from_slice(arg1),
            Bytes::copy_from_slice(arg2),
            Bytes::copy_from_slice(arg3),
        ]))
    }

    fn args_of(message: &Message) -> Vec<Bytes> {
        message.checksum_and_args().unwrap().1.to_vec()
    }

    /// sends every fragment through the wire codec and the reassembler
    fn round_trip(message: Message, max_payload: usize) -> (usize, Message) {
        let fragments = fragment(message, max_payload).unwrap();
        let num_fragments = fragments.len();
        let mut reassembler = Reassembler::new(Duration::from_secs(1));
        let now = Instant::now();

        let mut result = None;
        for (i, f) in fragments.into_iter().enumerate() {
            let frame = f.to_frame(9).unwrap();
            assert!(frame.payload.len() <= max_payload);
            assert_eq!(f.is_fragment(), i + 1 < num_fragments);

            let decoded = Message::from_frame(&frame).unwrap();
            let r = reassembler.on_message(9, decoded, now).unwrap();
            if i + 1 < num_fragments {
                assert!(r.is_none());
            }
            else {
                result = r;
            }
        }
        assert!(reassembler.is_empty());
        (num_fragments, result.unwrap())
    }

    #[rstest]
    #[case::empty(0)]
    #[case::one(1)]
    #[case::max_minus_one(MAX_PAYLOAD_SIZE - 1)]
    #[case::max(MAX_PAYLOAD_SIZE)]
    #[case::max_plus_one(MAX_PAYLOAD_SIZE + 1)]
    #[case::three_times_max(3 * MAX_PAYLOAD_SIZE)]
    fn test_round_trip_arg3_len(#[case] len: usize) {
        let arg3 = (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        let original = request(b"echo", b"headers", &arg3, ChecksumType::Crc32);

        let (_, reassembled) = round_trip(original.clone(), MAX_PAYLOAD_SIZE);

        let mut expected = original;
        compute_and_set(&mut expected).unwrap();
        assert_eq!(reassembled, expected);
    }

    #[rstest]
    #[case::all_small(b"a", b"b", b"c", 1)]
    #[case::arg3_spills(b"a", b"", &[7u8; 100], 3)]
    #[case::arg1_spills(&[1u8; 60], b"x", b"y", 2)]
    fn test_round_trip_small_frames(#[case] arg1: &[u8], #[case] arg2: &[u8], #[case] arg3: &[u8], #[case] expected_fragments: usize) {
        let original = response(arg1, arg2, arg3);
        // fixed response fields are 29 bytes, leaving 40 bytes for args in the first frame
        let (num_fragments, reassembled) = round_trip(original.clone(), 69);
        assert_eq!(num_fragments, expected_fragments);
        assert_eq!(args_of(&reassembled), args_of(&original));
    }

    #[test]
    fn test_boundary_sentinel() {
        // fixed fields 29, payload budget 39: arg1 fills the first frame up to 2 bytes
        let fragments = fragment(response(b"abcdef", b"xy", b"z"), 39).unwrap();
        assert_eq!(fragments.len(), 2);

        assert!(fragments[0].is_fragment());
        assert_eq!(args_of(&fragments[0]), vec![Bytes::from_static(b"abcdef")]);

        match &fragments[1] {
            Message::CallResponseContinue(cont) => {
                assert_eq!(cont.flags, 0);
                assert_eq!(cont.args, vec![Bytes::new(), Bytes::from_static(b"xy"), Bytes::from_static(b"z")]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_fragments_carry_per_frame_checksums() {
        let fragments = fragment(request(b"a", b"b", &[3u8; 70_000], ChecksumType::Crc32), MAX_PAYLOAD_SIZE).unwrap();
        assert_eq!(fragments.len(), 2);
        for f in &fragments {
            let (checksum, args) = f.checksum_and_args().unwrap();
            assert_eq!(*checksum, compute(ChecksumType::Crc32, args).unwrap());
        }
    }

    #[test]
    fn test_fused() {
        let mut fragmenter = Fragmenter::new(request(b"a", b"b", b"c", ChecksumType::None), MAX_PAYLOAD_SIZE).unwrap();
        assert!(fragmenter.next().is_some());
        assert!(fragmenter.next().is_none());
        assert!(fragmenter.next().is_none());
    }

    #[rstest]
    #[case::ping(Message::PingRequest, MAX_PAYLOAD_SIZE)]
    #[case::two_args(Message::CallResponse(CallResponse::new(ResponseCode::Ok, vec![], vec![Bytes::new(), Bytes::new()])), MAX_PAYLOAD_SIZE)]
    #[case::no_space(response(b"", b"", b""), 31)]
    fn test_fragmenter_rejects(#[case] message: Message, #[case] max_payload: usize) {
        assert!(matches!(Fragmenter::new(message, max_payload), Err(ProtocolError::StreamingProtocolError(_))));
    }

    #[test]
    fn test_fragmenter_rejects_farm32() {
        assert!(matches!(
            Fragmenter::new(request(b"", b"", b"", ChecksumType::Farm32), MAX_PAYLOAD_SIZE),
            Err(ProtocolError::UnsupportedChecksumType(ChecksumType::Farm32))
        ));
    }

    fn cont(flags: u8, args: Vec<&'static [u8]>) -> Message {
        Message::CallRequestContinue(CallContinue::new(flags, Checksum::None, args.into_iter().map(Bytes::from_static).collect()))
    }

    fn initial(flags: u8, args: Vec<&'static [u8]>) -> Message {
        let mut req = CallRequest::new("svc", 100, vec![], args.into_iter().map(Bytes::from_static).collect());
        req.flags = flags;
        Message::CallRequest(req)
    }

    #[test]
    fn test_continue_without_call() {
        let mut reassembler = Reassembler::new(Duration::from_secs(1));
        assert_eq!(
            reassembler.on_message(3, cont(0, vec![b"x"]), Instant::now()),
            Err(ProtocolError::StreamingProtocolError("missing call message after receiving continue message".to_string()))
        );
    }

    #[test]
    fn test_duplicate_call_message() {
        let mut reassembler = Reassembler::new(Duration::from_secs(1));
        let now = Instant::now();
        assert_eq!(reassembler.on_message(3, initial(FLAG_FRAGMENT, vec![b"a"]), now), Ok(None));
        assert!(matches!(reassembler.on_message(3, initial(FLAG_FRAGMENT, vec![b"a"]), now), Err(ProtocolError::StreamingProtocolError(_))));
        assert!(reassembler.is_empty());
    }

    #[test]
    fn test_too_many_args() {
        let mut reassembler = Reassembler::new(Duration::from_secs(1));
        let now = Instant::now();
        reassembler.on_message(3, initial(FLAG_FRAGMENT, vec![b"a", b"b"]), now).unwrap();
        assert_eq!(reassembler.on_message(3, cont(0, vec![b"", b"c", b"d"]), now), Err(ProtocolError::TooManyArgs(4)));
        assert!(reassembler.is_empty());
    }

    #[rstest]
    #[case::single_frame(vec![initial(0, vec![b"a", b"b"])])]
    #[case::continued(vec![initial(FLAG_FRAGMENT, vec![b"a"]), cont(0, vec![b"", b"b"])])]
    fn test_too_few_args(#[case] messages: Vec<Message>) {
        let mut reassembler = Reassembler::new(Duration::from_secs(1));
        let now = Instant::now();
        let mut last = Ok(None);
        for m in messages {
            last = reassembler.on_message(3, m, now);
        }
        assert!(matches!(last, Err(ProtocolError::StreamingProtocolError(_))));
    }

    #[test]
    fn test_bad_checksum_purges() {
        let mut reassembler = Reassembler::new(Duration::from_secs(1));
        let now = Instant::now();
        reassembler.on_message(3, initial(FLAG_FRAGMENT, vec![b"a"]), now).unwrap();

        let bad = Message::CallRequestContinue(CallContinue::new(0, Checksum::Crc32(1), vec![Bytes::from_static(b"x")]));
        assert!(matches!(reassembler.on_message(3, bad, now), Err(ProtocolError::InvalidChecksum { .. })));
        assert!(reassembler.is_empty());
    }

    #[test]
    fn test_continuation_extends_rightmost_arg() {
        let mut reassembler = Reassembler::new(Duration::from_secs(1));
        let now = Instant::now();
        reassembler.on_message(3, initial(FLAG_FRAGMENT, vec![b"ab", b"c"]), now).unwrap();
        reassembler.on_message(3, cont(FLAG_FRAGMENT, vec![b"d"]), now).unwrap();
        let result = reassembler.on_message(3, cont(0, vec![b"e", b"fg"]), now).unwrap().unwrap();

        assert_eq!(args_of(&result), vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cde"), Bytes::from_static(b"fg")]);
        assert!(!result.is_fragment());
    }

    #[test]
    fn test_independent_ids() {
        let mut reassembler = Reassembler::new(Duration::from_secs(1));
        let now = Instant::now();
        reassembler.on_message(1, initial(FLAG_FRAGMENT, vec![b"a"]), now).unwrap();
        reassembler.on_message(2, initial(FLAG_FRAGMENT, vec![b"x"]), now).unwrap();
        assert_eq!(reassembler.len(), 2);

        let second = reassembler.on_message(2, cont(0, vec![b"", b"y", b"z"]), now).unwrap().unwrap();
        assert_eq!(args_of(&second)[0].as_ref(), b"x");
        assert_eq!(reassembler.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_expired() {
        let mut reassembler = Reassembler::new(Duration::from_secs(1));
        // the request's ttl is 100ms
        reassembler.on_message(1, initial(FLAG_FRAGMENT, vec![b"a"]), Instant::now()).unwrap();

        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(reassembler.evict_expired(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(reassembler.evict_expired(Instant::now()), vec![1]);
        assert!(reassembler.is_empty());
    }

    #[rstest]
    #[case::default_timeout(None, true)]
    #[case::request_ttl(Some(Duration::from_secs(5)), false)]
    fn test_response_buffer_lifetime(#[case] ttl: Option<Duration>, #[case] expect_evicted: bool) {
        let mut reassembler = Reassembler::new(Duration::from_secs(1));
        let start = Instant::now();
        let first = Message::CallResponse(CallResponse { flags: FLAG_FRAGMENT, ..CallResponse::new(ResponseCode::Ok, vec![], vec![Bytes::from_static(b"a")]) });
        let result = match ttl {
            Some(ttl) => reassembler.on_message_with_ttl(4, first, start, ttl),
            None => reassembler.on_message(4, first, start),
        };
        assert_eq!(result, Ok(None));

        let later = start + Duration::from_millis(1500);
        assert_eq!(reassembler.evict_expired(later).is_empty(), !expect_evicted);

        let last = Message::CallResponseContinue(CallContinue::new(0, Checksum::None, vec![Bytes::new(), Bytes::from_static(b"b"), Bytes::from_static(b"c")]));
        match reassembler.on_message(4, last, later) {
            Ok(Some(response)) => {
                assert!(!expect_evicted);
                assert_eq!(args_of(&response), vec![Bytes::from_static(b"a"), Bytes::from_static(b"b"), Bytes::from_static(b"c")]);
            }
            Err(ProtocolError::StreamingProtocolError(_)) => assert!(expect_evicted),
            other => panic!("unexpected {:?}", other),
        }
        assert!(reassembler.is_empty());
    }

    /// pushes args chunk by chunk, flushing after every chunk like a sender waiting for its producer
    fn stream(head: Message, args: [&[&str]; 3], max_payload: usize) -> Vec<Message> {
        let mut fragmenter = StreamingFragmenter::new(head, max_payload).unwrap();
        let mut frames = Vec::new();
        for (i, chunks) in args.iter().enumerate() {
            for chunk in chunks.iter() {
                frames.extend(fragmenter.push(Bytes::copy_from_slice(chunk.as_bytes())));
                frames.extend(fragmenter.flush());
            }
            if i + 1 < args.len() {
                frames.extend(fragmenter.end_arg().unwrap());
            }
        }
        frames.push(fragmenter.finish().unwrap());
        frames
    }

    fn response_head() -> Message {
        Message::CallResponse(CallResponse::new(ResponseCode::Ok, vec![], vec![]))
    }

    #[rstest]
    #[case::one_chunk_each(&["ab"], &["cd"], &["ef"])]
    #[case::empty_args(&[], &[""], &[])]
    #[case::many_chunks(&["a", "b"], &["xy", "", "z"], &["end"])]
    #[case::arg1_fills_first_frame(&["abcdef"], &["xy"], &["z"])]
    #[case::chunk_larger_than_frame(&["a"], &["0123456789012345678901234567890123456789", "0123456789"], &["tail"])]
    fn test_streamed_frames_reassemble(#[case] arg1: &[&str], #[case] arg2: &[&str], #[case] arg3: &[&str]) {
        // fixed response fields are 29 bytes
        let frames = stream(response_head(), [arg1, arg2, arg3], 39);

        let mut reassembler = Reassembler::new(Duration::from_secs(1));
        let now = Instant::now();
        let mut result = None;
        for (i, f) in frames.iter().enumerate() {
            let frame = f.to_frame(9).unwrap();
            assert!(frame.payload.len() <= 39);
            assert_eq!(f.is_fragment(), i + 1 < frames.len());

            let decoded = Message::from_frame(&frame).unwrap();
            result = reassembler.on_message(9, decoded, now).unwrap();
        }

        let expected = [arg1, arg2, arg3].iter()
            .map(|chunks| Bytes::from(chunks.concat()))
            .collect::<Vec<_>>();
        assert_eq!(args_of(&result.unwrap()), expected);
        assert!(reassembler.is_empty());
    }

    #[test]
    fn test_streamed_first_frame_precedes_last_chunk() {
        let head = request(b"", b"", b"", ChecksumType::Crc32);
        let head = match head {
            Message::CallRequest(req) => Message::CallRequest(CallRequest { args: vec![], ..req }),
            other => other,
        };
        let mut fragmenter = StreamingFragmenter::new(head, MAX_PAYLOAD_SIZE).unwrap();
        assert!(fragmenter.push(Bytes::from_static(b"echo")).is_empty());
        assert!(fragmenter.end_arg().unwrap().is_empty());
        assert!(fragmenter.push(Bytes::from_static(b"part")).is_empty());

        let first = fragmenter.flush().unwrap();
        assert!(first.is_fragment());
        assert_eq!(args_of(&first), vec![Bytes::from_static(b"echo"), Bytes::from_static(b"part")]);
        assert_eq!(first.checksum_and_args().unwrap().0, &compute(ChecksumType::Crc32, &args_of(&first)).unwrap());
        // nothing new since the last flush
        assert!(fragmenter.flush().is_none());
    }

    #[test]
    fn test_streaming_fragmenter_rejects() {
        assert!(matches!(StreamingFragmenter::new(response(b"a", b"b", b"c"), MAX_PAYLOAD_SIZE), Err(ProtocolError::StreamingProtocolError(_))));
        assert!(matches!(StreamingFragmenter::new(response_head(), 33), Err(ProtocolError::StreamingProtocolError(_))));

        let mut fragmenter = StreamingFragmenter::new(response_head(), MAX_PAYLOAD_SIZE).unwrap();
        fragmenter.end_arg().unwrap();
        assert!(matches!(fragmenter.finish(), Err(ProtocolError::StreamingProtocolError(_))));

        let mut fragmenter = StreamingFragmenter::new(response_head(), MAX_PAYLOAD_SIZE).unwrap();
        fragmenter.end_arg().unwrap();
        fragmenter.end_arg().unwrap();
        assert_eq!(fragmenter.end_arg().err(), Some(ProtocolError::TooManyArgs(4)));
    }

    #[test]
    fn test_purge() {
        let mut reassembler = Reassembler::new(Duration::from_secs(1));
        reassembler.on_message(1, initial(FLAG_FRAGMENT, vec![b"a"]), Instant::now()).unwrap();
        assert!(reassembler.purge(1));
        assert!(!reassembler.purge(1));
    }
}
