//! Length-prefixed message framing.
//!
//! Every message travels as a 5-byte prefix (one compressed-flag byte and a
//! big-endian u32 length) followed by the payload. The [`MessageDeframer`]
//! turns an inbound byte stream back into whole messages, gated by delivery
//! permits so the application controls how many messages it is willing to
//! receive.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::Status;

/// Bytes in the message prefix.
pub const HEADER_LENGTH: usize = 5;

/// Default cap on a single inbound message (4 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

const COMPRESSED_FLAG: u8 = 0x01;

/// Frames one message payload for the wire.
pub fn frame_message(payload: &[u8], compressed: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LENGTH + payload.len());
    buf.put_u8(if compressed { COMPRESSED_FLAG } else { 0 });
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// One deframing step's output.
#[derive(Debug)]
pub enum Deframed {
    /// A complete message; `wire_size` counts the prefix too, for
    /// flow-control credit.
    Message { payload: Bytes, wire_size: usize },
    /// The peer half-closed and every buffered byte has been delivered.
    EndOfStream,
}

/// Accumulates inbound bytes and yields whole messages in receive order.
pub struct MessageDeframer {
    buf: BytesMut,
    permits: u32,
    max_message_size: usize,
    end_of_stream: bool,
    finished: bool,
}

impl MessageDeframer {
    pub fn new(max_message_size: usize) -> MessageDeframer {
        MessageDeframer {
            buf: BytesMut::new(),
            permits: 0,
            max_message_size,
            end_of_stream: false,
            finished: false,
        }
    }

    /// Allows up to `count` additional messages to be delivered.
    pub fn request(&mut self, count: u32) {
        self.permits = self.permits.saturating_add(count);
    }

    /// Feeds inbound bytes. `end_of_stream` marks the peer's half-close.
    pub fn feed(&mut self, data: Bytes, end_of_stream: bool) {
        debug_assert!(!self.end_of_stream, "bytes after end of stream");
        self.buf.extend_from_slice(&data);
        if end_of_stream {
            self.end_of_stream = true;
        }
    }

    /// Next deliverable item, or `None` when more bytes or permits are
    /// needed. Call in a loop after `feed` or `request`.
    pub fn next(&mut self) -> Result<Option<Deframed>, Status> {
        if self.finished {
            return Ok(None);
        }
        if self.buf.len() >= HEADER_LENGTH {
            let flags = self.buf[0];
            if flags & !COMPRESSED_FLAG != 0 {
                return Err(Status::internal(
                    "gRPC frame header malformed: reserved bits are not zero",
                ));
            }
            let length =
                u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
            if length > self.max_message_size {
                return Err(Status::resource_exhausted(format!(
                    "gRPC message exceeds maximum size {}: {}",
                    self.max_message_size, length
                )));
            }
            if self.buf.len() < HEADER_LENGTH + length {
                if self.end_of_stream {
                    return Err(Status::internal("encountered end of stream mid-frame"));
                }
                return Ok(None);
            }
            if self.permits == 0 {
                return Ok(None);
            }
            if flags & COMPRESSED_FLAG != 0 {
                return Err(Status::internal(
                    "compressed gRPC message received but no decompression is configured",
                ));
            }
            self.buf.advance(HEADER_LENGTH);
            let payload = self.buf.split_to(length).freeze();
            self.permits -= 1;
            return Ok(Some(Deframed::Message {
                payload,
                wire_size: HEADER_LENGTH + length,
            }));
        }
        if self.end_of_stream {
            if self.buf.is_empty() {
                self.finished = true;
                return Ok(Some(Deframed::EndOfStream));
            }
            return Err(Status::internal("encountered end of stream mid-frame"));
        }
        Ok(None)
    }

    /// True once [`Deframed::EndOfStream`] has been delivered.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(deframer: &mut MessageDeframer) -> (Vec<Bytes>, bool) {
        let mut messages = Vec::new();
        let mut eos = false;
        while let Some(item) = deframer.next().expect("deframe") {
            match item {
                Deframed::Message { payload, .. } => messages.push(payload),
                Deframed::EndOfStream => eos = true,
            }
        }
        (messages, eos)
    }

    #[test]
    fn reassembles_messages_split_across_feeds() {
        let mut deframer = MessageDeframer::new(DEFAULT_MAX_MESSAGE_SIZE);
        deframer.request(10);
        let framed = frame_message(b"hello world", false);
        deframer.feed(framed.slice(..3), false);
        assert!(deframer.next().unwrap().is_none());
        deframer.feed(framed.slice(3..7), false);
        deframer.feed(framed.slice(7..), false);
        let (messages, eos) = drain(&mut deframer);
        assert_eq!(messages, vec![Bytes::from_static(b"hello world")]);
        assert!(!eos);
    }

    #[test]
    fn permits_gate_delivery() {
        let mut deframer = MessageDeframer::new(DEFAULT_MAX_MESSAGE_SIZE);
        let mut wire = BytesMut::new();
        for msg in [b"one".as_slice(), b"two", b"three"] {
            wire.extend_from_slice(&frame_message(msg, false));
        }
        deframer.feed(wire.freeze(), false);

        assert!(deframer.next().unwrap().is_none());
        deframer.request(2);
        let (messages, _) = drain(&mut deframer);
        assert_eq!(messages.len(), 2);
        deframer.request(1);
        let (messages, _) = drain(&mut deframer);
        assert_eq!(messages[0], Bytes::from_static(b"three"));
    }

    #[test]
    fn end_of_stream_is_delivered_after_the_last_message() {
        let mut deframer = MessageDeframer::new(DEFAULT_MAX_MESSAGE_SIZE);
        deframer.request(1);
        deframer.feed(frame_message(b"bye", false), true);
        let (messages, eos) = drain(&mut deframer);
        assert_eq!(messages.len(), 1);
        assert!(eos);
        assert!(deframer.is_finished());
        assert!(deframer.next().unwrap().is_none());
    }

    #[test]
    fn truncated_frame_at_end_of_stream_is_an_error() {
        let mut deframer = MessageDeframer::new(DEFAULT_MAX_MESSAGE_SIZE);
        deframer.request(1);
        let framed = frame_message(b"payload", false);
        deframer.feed(framed.slice(..4), true);
        let err = deframer.next().unwrap_err();
        assert_eq!(err.code(), crate::Code::Internal);
    }

    #[test]
    fn oversized_message_is_resource_exhausted() {
        let mut deframer = MessageDeframer::new(8);
        deframer.request(1);
        deframer.feed(frame_message(&[0u8; 32], false), false);
        let err = deframer.next().unwrap_err();
        assert_eq!(err.code(), crate::Code::ResourceExhausted);
    }

    #[test]
    fn compressed_flag_without_decompressor_is_internal() {
        let mut deframer = MessageDeframer::new(DEFAULT_MAX_MESSAGE_SIZE);
        deframer.request(1);
        deframer.feed(frame_message(b"x", true), false);
        let err = deframer.next().unwrap_err();
        assert_eq!(err.code(), crate::Code::Internal);
    }
}
