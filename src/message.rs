//! Accumulates frames into messages: fragmentation, control-frame
//! interleaving, size enforcement and the static/large buffer handoff.
//!
//! [`MessageReader`] is deliberately transport-agnostic: `fill` takes any
//! [`std::io::Read`], so the same reader serves both the blocking worker
//! (where a read either returns data or blocks) and the nonblocking worker
//! (where a read on a socket in non-blocking mode returns `WouldBlock` once
//! drained).

use std::io::{self, ErrorKind, Read};
use std::sync::Arc;

use crate::buffer::{BorrowedBuffer, BufferProvider};
use crate::error::Error;
use crate::frame::{self, FrameHeader, OpCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

/// A fully assembled data message (text or binary), UTF-8 checked at this
/// point if it's text.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn text(s: impl Into<String>) -> Self {
        Message { kind: MessageKind::Text, payload: s.into().into_bytes() }
    }

    pub fn binary(b: impl Into<Vec<u8>>) -> Self {
        Message { kind: MessageKind::Binary, payload: b.into() }
    }

    pub fn opcode(&self) -> OpCode {
        match self.kind {
            MessageKind::Text => OpCode::Text,
            MessageKind::Binary => OpCode::Binary,
        }
    }

    pub fn as_text(&self) -> Result<&str, Error> {
        std::str::from_utf8(&self.payload).map_err(|_| {
            // unwrap: from_utf8 just told us this is invalid, so from_utf8 on
            // the owned clone is guaranteed to produce the matching error.
            Error::InvalidUtf8(String::from_utf8(self.payload.clone()).unwrap_err())
        })
    }

    pub fn into_text(self) -> Result<String, Error> {
        String::from_utf8(self.payload).map_err(Error::InvalidUtf8)
    }
}

/// A control frame delivered alongside data messages, never reordered ahead
/// of the data stream it was interleaved with.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlFrame {
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Vec<u8>),
}

/// What `MessageReader::read` hands back: either a completed data message or
/// a control frame, delivered in on-wire order.
#[derive(Debug)]
pub enum ReadEvent {
    Message(Message),
    Control(ControlFrame),
}

/// Where the in-progress message's bytes live: inline until they'd overflow
/// the static buffer, then promoted to a pooled/heap large buffer.
enum Accumulator {
    Inline(Vec<u8>),
    Large(BorrowedBuffer),
}

impl Accumulator {
    fn len(&self) -> usize {
        match self {
            Accumulator::Inline(v) => v.len(),
            Accumulator::Large(b) => b.buf.len(),
        }
    }

    fn extend(&mut self, bytes: &[u8]) {
        match self {
            Accumulator::Inline(v) => v.extend_from_slice(bytes),
            Accumulator::Large(b) => b.buf.extend_from_slice(bytes),
        }
    }

    fn into_vec(self, provider: &BufferProvider) -> Vec<u8> {
        match self {
            Accumulator::Inline(v) => v,
            Accumulator::Large(b) => {
                let v = b.buf.to_vec();
                provider.release(b);
                v
            }
        }
    }
}

/// Tracks how much of the *current* frame's payload has been drained off the
/// wire, distinct from `Accumulator::len`, which is the whole message so far.
struct FrameProgress {
    mask: Option<[u8; 4]>,
    remaining: usize,
    consumed: usize,
    fin: bool,
}

struct Pending {
    kind: MessageKind,
    acc: Accumulator,
    frame: Option<FrameProgress>,
}

enum FrameOutcome {
    NeedMore,
    FragmentBoundary,
    Control(ControlFrame),
    Message(Message),
}

/// Owns the per-connection static buffer and assembles frames read out of it
/// into messages, per §4.3: idle / fragmented-text / fragmented-binary state
/// machine, control-frame interleaving, and large-buffer promotion when a
/// message would overflow the static buffer.
pub struct MessageReader {
    recv: Vec<u8>,
    pos: usize,
    static_capacity: usize,
    max_message_size: usize,
    provider: Arc<BufferProvider>,
    pending: Option<Pending>,
}

impl MessageReader {
    pub fn new(static_capacity: usize, max_message_size: usize, provider: Arc<BufferProvider>) -> Self {
        MessageReader {
            recv: Vec::with_capacity(static_capacity),
            pos: 0,
            static_capacity,
            max_message_size,
            provider,
            pending: None,
        }
    }

    /// Reads as much as the stream currently has into the static buffer's
    /// writable region. A blocking stream returns once some bytes (or EOF)
    /// arrive; a nonblocking stream stops cleanly at `WouldBlock`.
    pub fn fill<S: Read>(&mut self, stream: &mut S) -> Result<usize, Error> {
        self.compact();
        let mut total = 0usize;
        loop {
            let room = self.static_capacity.saturating_sub(self.recv.len());
            if room == 0 {
                break;
            }
            let want = room.min(16 * 1024);
            let mut chunk = vec![0u8; want];
            match stream.read(&mut chunk) {
                Ok(0) => {
                    if total == 0 {
                        return Err(Error::Io(io::Error::new(ErrorKind::UnexpectedEof, "peer closed the connection")));
                    }
                    break;
                }
                Ok(n) => {
                    self.recv.extend_from_slice(&chunk[..n]);
                    total += n;
                    if n < want {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(total)
    }

    /// Parses as many complete frames as the buffered bytes allow, returning
    /// the first assembled message/control frame. `has_more` tells the caller
    /// whether another complete item may already be sitting in the buffer.
    pub fn read(&mut self) -> Result<(bool, Option<ReadEvent>), Error> {
        loop {
            match self.step()? {
                FrameOutcome::NeedMore => return Ok((false, None)),
                FrameOutcome::FragmentBoundary => continue,
                FrameOutcome::Control(c) => return Ok((self.has_buffered(), Some(ReadEvent::Control(c)))),
                FrameOutcome::Message(m) => return Ok((self.has_buffered(), Some(ReadEvent::Message(m)))),
            }
        }
    }

    /// Caller signals the last delivered item has been consumed: release any
    /// outstanding large buffer (already done at assembly time, see below)
    /// and compact leftover bytes to the front of the static buffer.
    pub fn done(&mut self) {
        self.compact();
    }

    fn has_buffered(&self) -> bool {
        self.pos < self.recv.len()
    }

    fn compact(&mut self) {
        if self.pos > 0 {
            self.recv.drain(0..self.pos);
            self.pos = 0;
        }
    }

    fn step(&mut self) -> Result<FrameOutcome, Error> {
        if let Some(p) = &self.pending {
            if p.frame.is_some() {
                return self.drain_current_frame();
            }
        }
        self.begin_next_frame()
    }

    fn drain_current_frame(&mut self) -> Result<FrameOutcome, Error> {
        let avail = self.recv.len() - self.pos;
        if avail == 0 {
            return Ok(FrameOutcome::NeedMore);
        }

        let pending = self.pending.as_mut().expect("drain_current_frame called without pending state");
        let fp = pending.frame.as_mut().expect("drain_current_frame called without an active frame");
        let take = avail.min(fp.remaining);
        let start = self.pos;
        let mut chunk = self.recv[start..start + take].to_vec();
        if let Some(mask) = fp.mask {
            for (i, b) in chunk.iter_mut().enumerate() {
                *b ^= mask[(fp.consumed + i) % 4];
            }
        }
        pending.acc.extend(&chunk);
        fp.consumed += take;
        fp.remaining -= take;
        self.pos += take;

        if fp.remaining > 0 {
            return Ok(FrameOutcome::NeedMore);
        }
        let fin = fp.fin;
        pending.frame = None;

        if fin {
            let Pending { kind, acc, .. } = self.pending.take().unwrap();
            let payload = acc.into_vec(&self.provider);
            if kind == MessageKind::Text {
                // Validated once, at assembly time, regardless of how many
                // frames contributed: a split multi-byte codepoint is fine
                // as long as the reassembled bytes are valid UTF-8.
                String::from_utf8(payload.clone()).map_err(Error::InvalidUtf8)?;
            }
            Ok(FrameOutcome::Message(Message { kind, payload }))
        } else {
            Ok(FrameOutcome::FragmentBoundary)
        }
    }

    fn begin_next_frame(&mut self) -> Result<FrameOutcome, Error> {
        let header = match frame::parse_header(&self.recv[self.pos..])? {
            Some(h) => h,
            None => return Ok(FrameOutcome::NeedMore),
        };

        if header.opcode.is_control() {
            return self.take_control_frame(header);
        }

        match header.opcode {
            OpCode::Continuation if self.pending.is_none() => return Err(Error::InvalidFragmentation),
            OpCode::Text | OpCode::Binary if self.pending.is_some() => return Err(Error::InvalidFragmentation),
            _ => {}
        }

        let payload_len = header.payload_len as usize;
        let already = self.pending.as_ref().map(|p| p.acc.len()).unwrap_or(0);
        if already.saturating_add(payload_len) > self.max_message_size {
            return Err(Error::MessageTooLarge);
        }

        if self.pending.is_none() {
            let kind = if header.opcode == OpCode::Text { MessageKind::Text } else { MessageKind::Binary };
            self.pending = Some(Pending { kind, acc: Accumulator::Inline(Vec::new()), frame: None });
        }

        let needs_redirect = {
            let pending = self.pending.as_ref().unwrap();
            !matches!(pending.acc, Accumulator::Large(_)) && already + payload_len > self.static_capacity
        };
        if needs_redirect {
            let target = (already + payload_len).min(self.max_message_size);
            let mut large = self.provider.acquire(target)?;
            let pending = self.pending.as_mut().unwrap();
            if let Accumulator::Inline(v) = &pending.acc {
                large.buf.extend_from_slice(v);
            }
            pending.acc = Accumulator::Large(large);
        }

        self.pos += header.header_len;
        let pending = self.pending.as_mut().unwrap();
        pending.frame = Some(FrameProgress { mask: header.mask, remaining: payload_len, consumed: 0, fin: header.fin });

        self.drain_current_frame()
    }

    fn take_control_frame(&mut self, header: FrameHeader) -> Result<FrameOutcome, Error> {
        let payload_len = header.payload_len as usize;
        let total = header.header_len + payload_len;
        if self.recv.len() - self.pos < total {
            return Ok(FrameOutcome::NeedMore);
        }
        let payload_start = self.pos + header.header_len;
        let mut payload = self.recv[payload_start..payload_start + payload_len].to_vec();
        if let Some(mask) = header.mask {
            frame::apply_mask(&mut payload, mask);
        }
        self.pos += total;
        Ok(FrameOutcome::Control(match header.opcode {
            OpCode::Ping => ControlFrame::Ping(payload),
            OpCode::Pong => ControlFrame::Pong(payload),
            OpCode::Close => ControlFrame::Close(payload),
            _ => unreachable!("take_control_frame only called for control opcodes"),
        }))
    }
}

impl Drop for MessageReader {
    fn drop(&mut self) {
        if let Some(p) = self.pending.take() {
            if let Accumulator::Large(b) = p.acc {
                self.provider.release(b);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferProvider, BufferProviderConfig};
    use crate::frame::Frame;
    use std::io::Cursor;

    fn reader(static_capacity: usize, max_message_size: usize) -> MessageReader {
        let provider = Arc::new(BufferProvider::new(BufferProviderConfig {
            large_buffer_size: max_message_size,
            large_buffer_count: 2,
            max_message_size,
        }));
        MessageReader::new(static_capacity, max_message_size, provider)
    }

    #[test]
    fn two_concatenated_text_frames_in_one_read() {
        let mut r = reader(4096, 65536);
        let mut wire = Frame::new(true, OpCode::Text, b"abc".to_vec()).encode(None);
        wire.extend(Frame::new(true, OpCode::Text, b"xyz".to_vec()).encode(None));
        r.fill(&mut Cursor::new(wire)).unwrap();

        let (has_more, ev) = r.read().unwrap();
        assert!(has_more);
        assert_eq!(matches!(ev, Some(ReadEvent::Message(ref m)) if m.payload == b"abc"), true);
        r.done();

        let (has_more, ev) = r.read().unwrap();
        assert!(!has_more);
        assert_eq!(matches!(ev, Some(ReadEvent::Message(ref m)) if m.payload == b"xyz"), true);
    }

    #[test]
    fn split_utf8_codepoint_validates_once_assembled() {
        let mut r = reader(4096, 65536);
        let full = "héllo".as_bytes().to_vec();
        let (first, second) = full.split_at(3); // splits the 2-byte 'é' across frames
        assert!(std::str::from_utf8(first).is_err());

        let mut wire = Frame::new(false, OpCode::Text, first.to_vec()).encode(None);
        wire.extend(Frame::new(true, OpCode::Continuation, second.to_vec()).encode(None));
        r.fill(&mut Cursor::new(wire)).unwrap();

        let (_, ev) = r.read().unwrap();
        match ev {
            Some(ReadEvent::Message(m)) => assert_eq!(m.payload, full),
            other => panic!("expected assembled message, got {other:?}"),
        }
    }

    #[test]
    fn oversize_ping_is_rejected_as_large_control() {
        let mut r = reader(4096, 65536);
        let wire = Frame::new(true, OpCode::Ping, vec![0u8; 126]).encode(None);
        r.fill(&mut Cursor::new(wire)).unwrap();
        assert!(matches!(r.read(), Err(Error::LargeControl)));
    }

    #[test]
    fn continuation_without_fragment_in_progress_is_rejected() {
        let mut r = reader(4096, 65536);
        let wire = Frame::new(true, OpCode::Continuation, b"oops".to_vec()).encode(None);
        r.fill(&mut Cursor::new(wire)).unwrap();
        assert!(matches!(r.read(), Err(Error::InvalidFragmentation)));
    }

    #[test]
    fn text_frame_while_fragment_in_progress_is_rejected() {
        let mut r = reader(4096, 65536);
        let mut wire = Frame::new(false, OpCode::Text, b"abc".to_vec()).encode(None);
        wire.extend(Frame::new(true, OpCode::Text, b"xyz".to_vec()).encode(None));
        r.fill(&mut Cursor::new(wire)).unwrap();
        assert!(matches!(r.read(), Err(Error::InvalidFragmentation)));
    }

    #[test]
    fn message_over_max_size_is_rejected_before_accumulating() {
        let mut r = reader(4096, 16);
        let wire = Frame::new(true, OpCode::Binary, vec![0u8; 32]).encode(None);
        r.fill(&mut Cursor::new(wire)).unwrap();
        assert!(matches!(r.read(), Err(Error::MessageTooLarge)));
    }

    #[test]
    fn message_larger_than_static_buffer_promotes_to_large_buffer_and_releases_it() {
        let provider = Arc::new(BufferProvider::new(BufferProviderConfig {
            large_buffer_size: 65536,
            large_buffer_count: 2,
            max_message_size: 65536,
        }));
        let mut r = MessageReader::new(64, 65536, provider.clone());
        assert_eq!(provider.free_count(), 2);

        let payload = vec![42u8; 2000]; // exceeds the 64-byte static buffer
        let wire = Frame::new(true, OpCode::Binary, payload.clone()).encode(None);
        let mut stream = Cursor::new(wire);

        // The static buffer (64 bytes) can only relay the payload in chunks,
        // so fill/read has to loop until the message is fully drained off
        // the wire, same as a real blocking socket loop would.
        let mut delivered = None;
        for _ in 0..64 {
            r.fill(&mut stream).unwrap();
            if let (_, Some(ReadEvent::Message(m))) = r.read().unwrap() {
                delivered = Some(m);
                break;
            }
        }
        let m = delivered.expect("message never completed");
        assert_eq!(m.payload, payload);
        // the large buffer is released back to the pool once the message completes
        assert_eq!(provider.free_count(), 2);
    }

    #[test]
    fn client_masked_frame_is_unmasked_on_read() {
        let mut r = reader(4096, 65536);
        let wire = Frame::new(true, OpCode::Text, b"secret".to_vec()).encode(Some([1, 2, 3, 4]));
        r.fill(&mut Cursor::new(wire)).unwrap();
        let (_, ev) = r.read().unwrap();
        match ev {
            Some(ReadEvent::Message(m)) => assert_eq!(m.payload, b"secret"),
            other => panic!("expected assembled message, got {other:?}"),
        }
    }

    #[test]
    fn ping_is_interleaved_without_disturbing_fragment_in_progress() {
        let mut r = reader(4096, 65536);
        let mut wire = Frame::new(false, OpCode::Text, b"abc".to_vec()).encode(None);
        wire.extend(Frame::new(true, OpCode::Ping, b"hi".to_vec()).encode(None));
        wire.extend(Frame::new(true, OpCode::Continuation, b"def".to_vec()).encode(None));
        r.fill(&mut Cursor::new(wire)).unwrap();

        let (_, ev) = r.read().unwrap();
        assert!(matches!(ev, Some(ReadEvent::Control(ControlFrame::Ping(ref p))) if p == b"hi"));

        let (_, ev) = r.read().unwrap();
        match ev {
            Some(ReadEvent::Message(m)) => assert_eq!(m.payload, b"abcdef"),
            other => panic!("expected assembled message, got {other:?}"),
        }
    }
}
