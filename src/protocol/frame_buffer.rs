//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for buffer management. Bytes arrive from the
//! transport in arbitrary chunks; the buffer extracts every complete frame
//! and keeps the remainder for the next push.
//!
//! The link has no checksums, so the buffer also resynchronises after damage:
//! - Bytes that cannot start a frame (unknown kind) are discarded as one run.
//! - A frame is only taken when it ends at the buffer end or right before
//!   another well-terminated frame. If what follows is still arriving, the
//!   buffer waits for it.
//! - Otherwise the declared length is treated as inflated when a
//!   well-terminated frame starts inside the declared extent. The prefix up
//!   to that inner frame is discarded and reported as
//!   [`FramingError::SizeMismatch`].
//! - A frame that never completes is rejected by [`FrameBuffer::expire`],
//!   which the receive loop calls once the stream has been quiet for the
//!   frame assembly timeout.
//!
//! # Example
//!
//! ```
//! use gebug_link::protocol::{wrap, FrameBuffer, FrameKind};
//!
//! let mut buffer = FrameBuffer::new();
//! let bytes = wrap(FrameKind::Text, b"hello").unwrap();
//!
//! assert!(buffer.push(&bytes[..3]).frames.is_empty());
//! let batch = buffer.push(&bytes[3..]);
//! assert_eq!(batch.frames.len(), 1);
//! assert!(buffer.is_empty());
//! ```

use bytes::BytesMut;

use super::wire_format::{FrameKind, Header, HEADER_SIZE};
use super::TransportFrame;
use crate::config::DEFAULT_MAX_FRAME_PAYLOAD;
use crate::error::FramingError;

/// Frames and framing errors produced by one push.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FrameBatch {
    pub frames: Vec<TransportFrame>,
    pub errors: Vec<FramingError>,
}

impl FrameBatch {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.errors.is_empty()
    }

    fn push(&mut self, step: Step) {
        match step {
            Step::Frame(frame) => self.frames.push(frame),
            Step::Rejected(err) => self.errors.push(err),
            Step::NeedMore => {}
        }
    }

    fn extend(&mut self, other: FrameBatch) {
        self.frames.extend(other.frames);
        self.errors.extend(other.errors);
    }
}

/// Outcome of one extraction attempt.
enum Step {
    Frame(TransportFrame),
    Rejected(FramingError),
    NeedMore,
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from transport reads.
    buffer: BytesMut,
    /// Maximum allowed payload size.
    max_payload_size: usize,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_FRAME_PAYLOAD)
    }

    /// Create a new frame buffer with custom max payload size.
    pub fn with_max_payload(max_payload_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(16 * 1024),
            max_payload_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    pub fn push(&mut self, data: &[u8]) -> FrameBatch {
        self.buffer.extend_from_slice(data);
        self.drain()
    }

    /// Give up on a frame that is still incomplete.
    ///
    /// A frame that was held back because the bytes after it looked like an
    /// unfinished frame is settled now: it is taken, or cut at an inner
    /// frame if its length was inflated. A pending frame that lacks only its
    /// pad byte is accepted. Anything else pending is rejected as a size
    /// mismatch (or truncation, if not even a header arrived), the damaged
    /// prefix is dropped, and the rest of the buffer is scanned again.
    pub fn expire(&mut self) -> FrameBatch {
        let mut batch = FrameBatch::default();
        while !self.buffer.is_empty() {
            match self.settle_front() {
                Step::NeedMore => break,
                step => batch.push(step),
            }
            batch.extend(self.drain());
        }
        batch
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Check if a partial frame is waiting for more bytes.
    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Clear the buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    fn drain(&mut self) -> FrameBatch {
        let mut batch = FrameBatch::default();
        loop {
            match self.try_extract_one(false) {
                Step::NeedMore => return batch,
                step => batch.push(step),
            }
        }
    }

    /// Extract the frame at the front of the buffer.
    ///
    /// With `settle` unset, a frame followed by bytes that look like an
    /// unfinished frame is held back until those bytes complete.
    fn try_extract_one(&mut self, settle: bool) -> Step {
        let Some(&kind_byte) = self.buffer.first() else {
            return Step::NeedMore;
        };

        if FrameKind::from_byte(kind_byte).is_none() {
            let skip = (1..self.buffer.len())
                .find(|&i| FrameKind::from_byte(self.buffer[i]).is_some())
                .unwrap_or(self.buffer.len());
            let _ = self.buffer.split_to(skip);
            return Step::Rejected(FramingError::UnknownKind(kind_byte));
        }

        let Some(header) = Header::decode(&self.buffer) else {
            return Step::NeedMore;
        };

        if let Err(err) = header.validate(self.max_payload_size) {
            let _ = self.buffer.split_to(1);
            return Step::Rejected(err);
        }

        let wire = header.wire_length();
        if self.buffer.len() < wire {
            return Step::NeedMore;
        }

        if self.buffer.len() == wire || self.well_terminated_frame_at(wire) {
            return self.take_frame(&header, wire);
        }

        if !settle && self.incomplete_frame_at(wire) {
            return Step::NeedMore;
        }

        if let Some(inner) = self.find_frame_start_before(HEADER_SIZE, wire) {
            let _ = self.buffer.split_to(inner);
            return Step::Rejected(FramingError::SizeMismatch {
                declared: header.payload_length,
                available: inner - HEADER_SIZE,
            });
        }

        self.take_frame(&header, wire)
    }

    /// Resolve whatever sits at the front once no more bytes are coming.
    fn settle_front(&mut self) -> Step {
        let Some(header) = Header::decode(&self.buffer) else {
            let available = self.buffer.len();
            self.buffer.clear();
            return Step::Rejected(FramingError::Truncated {
                available,
                needed: HEADER_SIZE,
            });
        };

        let available = self.buffer.len();
        if available >= header.wire_length() {
            return self.try_extract_one(true);
        }
        if available >= HEADER_SIZE + header.payload_length {
            // Only the pad byte is missing.
            return self.take_frame(&header, available);
        }

        let skip = self.find_frame_start(1).unwrap_or(available);
        let _ = self.buffer.split_to(skip);
        Step::Rejected(FramingError::SizeMismatch {
            declared: header.payload_length,
            available: available - HEADER_SIZE,
        })
    }

    /// Split `consume` bytes off the front and decode the frame they hold.
    fn take_frame(&mut self, header: &Header, consume: usize) -> Step {
        let mut raw = self.buffer.split_to(consume);
        let _ = raw.split_to(HEADER_SIZE);
        raw.truncate(header.payload_length);
        let payload = raw.freeze();

        let Some(kind) = header.frame_kind() else {
            return Step::Rejected(FramingError::UnknownKind(header.kind));
        };
        match TransportFrame::from_payload(kind, payload) {
            Ok(frame) => Step::Frame(frame),
            Err(err) => Step::Rejected(err),
        }
    }

    /// Whether `pos` could start a frame header.
    fn plausible_header_at(&self, pos: usize) -> bool {
        let Some(&kind) = self.buffer.get(pos) else {
            return false;
        };
        if FrameKind::from_byte(kind).is_none() {
            return false;
        }
        match Header::decode(&self.buffer[pos..]) {
            Some(header) => header.payload_length <= self.max_payload_size,
            None => true,
        }
    }

    /// Whether `pos` starts a frame that has not fully arrived yet.
    fn incomplete_frame_at(&self, pos: usize) -> bool {
        let Some(&kind) = self.buffer.get(pos) else {
            return false;
        };
        if FrameKind::from_byte(kind).is_none() {
            return false;
        }
        match Header::decode(&self.buffer[pos..]) {
            Some(header) => {
                header.validate(self.max_payload_size).is_ok()
                    && pos + header.wire_length() > self.buffer.len()
            }
            None => true,
        }
    }

    /// Whether a complete frame starts at `pos` and ends at the buffer end or
    /// right before another plausible header.
    fn well_terminated_frame_at(&self, pos: usize) -> bool {
        let Some(header) = Header::decode(&self.buffer[pos..]) else {
            return false;
        };
        if header.validate(self.max_payload_size).is_err() {
            return false;
        }
        let end = pos + header.wire_length();
        end == self.buffer.len() || (end < self.buffer.len() && self.plausible_header_at(end))
    }

    fn find_frame_start_before(&self, from: usize, until: usize) -> Option<usize> {
        (from..until.min(self.buffer.len())).find(|&p| self.well_terminated_frame_at(p))
    }

    fn find_frame_start(&self, from: usize) -> Option<usize> {
        self.find_frame_start_before(from, self.buffer.len())
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wrap;
    use bytes::Bytes;

    fn text(s: &str) -> Vec<u8> {
        wrap(FrameKind::Text, s.as_bytes()).unwrap()
    }

    fn inflate(mut frame: Vec<u8>, by: usize) -> Vec<u8> {
        let header = Header::decode(&frame).unwrap();
        let bigger = Header {
            kind: header.kind,
            payload_length: header.payload_length + by,
        };
        frame[..HEADER_SIZE].copy_from_slice(&bigger.encode());
        frame
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        let batch = buffer.push(&text("hello"));

        assert_eq!(batch.frames, vec![TransportFrame::Text("hello".into())]);
        assert!(batch.errors.is_empty());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();
        let mut combined = text("first");
        combined.extend(wrap(FrameKind::Binary, &[1, 2, 3, 4]).unwrap());
        combined.extend(text("third!"));

        let batch = buffer.push(&combined);

        assert_eq!(batch.frames.len(), 3);
        assert_eq!(batch.frames[1], TransportFrame::Binary(Bytes::from_static(&[1, 2, 3, 4])));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let mut frames = Vec::new();
        for byte in text("hi there") {
            let batch = buffer.push(&[byte]);
            assert!(batch.errors.is_empty());
            frames.extend(batch.frames);
        }
        assert_eq!(frames, vec![TransportFrame::Text("hi there".into())]);
    }

    #[test]
    fn test_waits_for_pad_byte() {
        let mut buffer = FrameBuffer::new();
        let bytes = text("odd");
        assert!(buffer.push(&bytes[..bytes.len() - 1]).frames.is_empty());
        assert!(buffer.has_pending());
        assert_eq!(buffer.push(&bytes[bytes.len() - 1..]).frames.len(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_expire_accepts_frame_missing_only_pad() {
        let mut buffer = FrameBuffer::new();
        let bytes = text("odd");
        buffer.push(&bytes[..bytes.len() - 1]);

        let batch = buffer.expire();
        assert_eq!(batch.frames, vec![TransportFrame::Text("odd".into())]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_unknown_kind_run_discarded_once() {
        let mut buffer = FrameBuffer::new();
        let mut data = b"garbage".to_vec();
        data.extend(text("ok"));

        let batch = buffer.push(&data);

        assert_eq!(batch.errors, vec![FramingError::UnknownKind(b'g')]);
        assert_eq!(batch.frames, vec![TransportFrame::Text("ok".into())]);
    }

    #[test]
    fn test_inflated_length_followed_by_valid_frame() {
        let mut buffer = FrameBuffer::new();
        let bad = inflate(text("ABCDEFGHIJ"), 10);
        let good = text("KLMNOPQRSTUVWXYZ");
        let mut data = bad.clone();
        data.extend(&good);

        let batch = buffer.push(&data);

        assert_eq!(batch.frames, vec![TransportFrame::Text("KLMNOPQRSTUVWXYZ".into())]);
        assert_eq!(
            batch.errors,
            vec![FramingError::SizeMismatch {
                declared: 20,
                available: 10
            }]
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_inflated_length_resolved_across_pushes() {
        let mut buffer = FrameBuffer::new();
        let bad = inflate(text("ABCDEFGHIJ"), 10);

        let batch = buffer.push(&bad);
        assert!(batch.is_empty());
        assert!(buffer.has_pending());

        let batch = buffer.push(&text("KLMNOPQRSTUVWXYZ"));
        assert_eq!(batch.frames.len(), 1);
        assert_eq!(batch.errors.len(), 1);
    }

    #[test]
    fn test_inflated_length_ending_inside_next_frame() {
        for stage_id in [1u8, 2, 5, 7] {
            let mut buffer = FrameBuffer::new();
            let payload = [0x19, 0x0A, 0, 0, 0x01, 0xF4, stage_id];
            let mut data = inflate(text("ABCDEFGHIJ"), 10);
            data.extend(wrap(FrameKind::Binary, &payload).unwrap());

            let mut batch = buffer.push(&data);
            batch.extend(buffer.expire());

            assert_eq!(
                batch.frames,
                vec![TransportFrame::Binary(Bytes::copy_from_slice(&payload))],
                "stage {stage_id}"
            );
            assert_eq!(
                batch.errors,
                vec![FramingError::SizeMismatch {
                    declared: 20,
                    available: 10
                }],
                "stage {stage_id}"
            );
            assert!(buffer.is_empty());
        }
    }

    #[test]
    fn test_frame_waits_for_partial_successor() {
        let mut buffer = FrameBuffer::new();
        let first = text("one");
        let second = text("second");
        let mut data = first.clone();
        data.extend(&second[..6]);

        let batch = buffer.push(&data);
        assert!(batch.is_empty());
        assert!(buffer.has_pending());

        let batch = buffer.push(&second[6..]);
        assert_eq!(
            batch.frames,
            vec![
                TransportFrame::Text("one".into()),
                TransportFrame::Text("second".into())
            ]
        );
        assert!(batch.errors.is_empty());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_expire_releases_frame_held_for_successor() {
        let mut buffer = FrameBuffer::new();
        let mut data = text("one");
        data.extend(&text("second")[..6]);
        buffer.push(&data);

        let batch = buffer.expire();
        assert_eq!(batch.frames, vec![TransportFrame::Text("one".into())]);
        assert_eq!(
            batch.errors,
            vec![FramingError::SizeMismatch {
                declared: 6,
                available: 2
            }]
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_expire_rejects_stalled_frame() {
        let mut buffer = FrameBuffer::new();
        buffer.push(&inflate(text("ABCDEF"), 10));

        let batch = buffer.expire();
        assert!(batch.frames.is_empty());
        assert_eq!(
            batch.errors,
            vec![FramingError::SizeMismatch {
                declared: 16,
                available: 6
            }]
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_expire_recovers_frame_behind_truncated_header() {
        let mut buffer = FrameBuffer::new();
        let mut data = vec![2u8, 0];
        data.extend(text("abcd"));

        // [2, 0, 1, 0] reads as a 256-byte binary frame and stalls.
        assert!(buffer.push(&data).frames.is_empty());

        let batch = buffer.expire();
        assert_eq!(batch.frames, vec![TransportFrame::Text("abcd".into())]);
        assert_eq!(batch.errors.len(), 1);
    }

    #[test]
    fn test_expire_sub_header_fragment() {
        let mut buffer = FrameBuffer::new();
        buffer.push(&[2, 0]);
        let batch = buffer.expire();
        assert_eq!(
            batch.errors,
            vec![FramingError::Truncated {
                available: 2,
                needed: HEADER_SIZE
            }]
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_trailing_garbage_keeps_frame() {
        let mut buffer = FrameBuffer::new();
        let mut data = text("keep");
        data.extend(b"zzzz");

        let batch = buffer.push(&data);

        assert_eq!(batch.frames, vec![TransportFrame::Text("keep".into())]);
        assert_eq!(batch.errors, vec![FramingError::UnknownKind(b'z')]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_max_payload_validation() {
        let mut buffer = FrameBuffer::with_max_payload(100);
        let mut data = Header::new(FrameKind::Binary, 1000).encode().to_vec();
        data.extend(text("next"));

        let batch = buffer.push(&data);

        assert!(matches!(
            batch.errors[0],
            FramingError::PayloadTooLarge { size: 1000, max: 100 }
        ));
        assert_eq!(batch.frames, vec![TransportFrame::Text("next".into())]);
    }

    #[test]
    fn test_malformed_heartbeat_does_not_desync() {
        let mut buffer = FrameBuffer::new();
        let mut data = wrap(FrameKind::Heartbeat, &[0, 1]).unwrap();
        data.extend(text("after"));

        let batch = buffer.push(&data);

        assert_eq!(batch.errors.len(), 1);
        assert_eq!(batch.frames, vec![TransportFrame::Text("after".into())]);
    }

    #[test]
    fn test_clear() {
        let mut buffer = FrameBuffer::new();
        buffer.push(&text("partial")[..5]);
        assert!(!buffer.is_empty());
        buffer.clear();
        assert!(buffer.is_empty());
        assert!(!buffer.has_pending());
    }
}
