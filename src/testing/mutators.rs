//! Frame damage helpers.
//!
//! The free functions rewrite one encoded frame. [`on_write`] turns any of
//! them into a [`LoopbackTransport::with_mutator`] hook that damages a single
//! write and passes every other write through.
//!
//! [`LoopbackTransport::with_mutator`]: crate::transport::LoopbackTransport::with_mutator

use crate::protocol::{Header, HEADER_SIZE, MAX_FRAME_PAYLOAD};

/// Add `by` to the declared payload length of `frame`.
///
/// The result is capped at the 24-bit maximum. Input shorter than a header
/// is returned unchanged.
pub fn inflate_length(frame: &[u8], by: usize) -> Vec<u8> {
    let mut out = frame.to_vec();
    if let Some(header) = Header::decode(frame) {
        let inflated = Header {
            kind: header.kind,
            payload_length: (header.payload_length + by).min(MAX_FRAME_PAYLOAD),
        };
        out[..HEADER_SIZE].copy_from_slice(&inflated.encode());
    }
    out
}

/// Keep only the first `len` bytes.
pub fn truncate(frame: &[u8], len: usize) -> Vec<u8> {
    frame[..len.min(frame.len())].to_vec()
}

/// Append `garbage` after the frame.
pub fn append_garbage(frame: &[u8], garbage: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.len() + garbage.len());
    out.extend_from_slice(frame);
    out.extend_from_slice(garbage);
    out
}

/// XOR the byte at `offset` with `mask`. Out of range offsets are ignored.
pub fn flip_byte(frame: &[u8], offset: usize, mask: u8) -> Vec<u8> {
    let mut out = frame.to_vec();
    if let Some(byte) = out.get_mut(offset) {
        *byte ^= mask;
    }
    out
}

/// Apply `damage` to the `index`-th write (zero based) only.
pub fn on_write<F>(index: usize, mut damage: F) -> impl FnMut(&[u8]) -> Vec<u8> + Send + 'static
where
    F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
{
    let mut seen = 0;
    move |data| {
        let current = seen;
        seen += 1;
        if current == index {
            damage(data)
        } else {
            data.to_vec()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{wrap, FrameKind};

    #[test]
    fn test_inflate_length() {
        let frame = wrap(FrameKind::Text, b"abcd").unwrap();
        let inflated = inflate_length(&frame, 10);

        assert_eq!(Header::decode(&inflated).unwrap().payload_length, 14);
        assert_eq!(&inflated[HEADER_SIZE..], b"abcd");
    }

    #[test]
    fn test_inflate_short_input_unchanged() {
        assert_eq!(inflate_length(&[1, 0], 10), vec![1, 0]);
    }

    #[test]
    fn test_truncate_and_garbage() {
        let frame = wrap(FrameKind::Text, b"abcd").unwrap();
        assert_eq!(truncate(&frame, 3), frame[..3].to_vec());
        assert_eq!(truncate(&frame, 100), frame);
        assert_eq!(append_garbage(&frame, b"zz").len(), frame.len() + 2);
    }

    #[test]
    fn test_flip_byte() {
        assert_eq!(flip_byte(&[0, 0, 0], 1, 0xFF), vec![0, 0xFF, 0]);
        assert_eq!(flip_byte(&[7], 5, 0xFF), vec![7]);
    }

    #[test]
    fn test_on_write_damages_one_write() {
        let mut hook = on_write(1, |data| truncate(data, 1));
        assert_eq!(hook(b"first"), b"first".to_vec());
        assert_eq!(hook(b"second"), b"s".to_vec());
        assert_eq!(hook(b"third"), b"third".to_vec());
    }
}
