//! Gebug packet header, splitting and reassembly.
//!
//! ```text
//! ┌──────────┬─────────┬───────────┬────────────┬────────────┬─────────────────┬──────┐
//! │ Category │ Command │ Flags     │ Message ID │ Reply To   │ Total │ Number  │ Body │
//! │ 1 byte   │ 1 byte  │ 2 bytes BE│ 2 bytes BE │ 2 bytes BE │ 2 BE  │ 2 BE    │      │
//! │          │         │           │            │ if REPLY   │ if MULTI_PACKET │      │
//! └──────────┴─────────┴───────────┴────────────┴────────────┴─────────────────┴──────┘
//! ```
//!
//! A packet never exceeds [`MAX_PACKET_SIZE`] bytes. Longer bodies are split
//! across packets that share one message id and carry 1-based numbering.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes};

use super::Category;
use crate::error::ProtocolError;

/// Largest packet, header included.
pub const MAX_PACKET_SIZE: usize = 1024;

/// Category, command, flags and message id.
pub const BASE_HEADER_SIZE: usize = 6;

/// Header flag bits.
pub mod flags {
    /// Packet is one of several carrying the same message.
    pub const MULTI_PACKET: u16 = 0x0001;
    /// Packet answers an earlier message; the reply-to field is present.
    pub const REPLY: u16 = 0x0002;
}

/// Position of a packet within a multi-packet message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketSequence {
    pub total: u16,
    /// 1-based.
    pub number: u16,
}

/// One Gebug packet, as carried by a binary transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GebugPacket {
    pub category: Category,
    pub command: u8,
    pub message_id: u16,
    pub reply_to: Option<u16>,
    pub sequence: Option<PacketSequence>,
    pub body: Bytes,
}

impl GebugPacket {
    /// Header flags implied by the optional fields.
    pub fn flags(&self) -> u16 {
        let mut bits = 0;
        if self.sequence.is_some() {
            bits |= flags::MULTI_PACKET;
        }
        if self.reply_to.is_some() {
            bits |= flags::REPLY;
        }
        bits
    }

    /// Header size for this packet.
    pub fn header_len(&self) -> usize {
        header_len(self.reply_to.is_some(), self.sequence.is_some())
    }

    pub fn is_reply(&self) -> bool {
        self.reply_to.is_some()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header_len() + self.body.len());
        out.put_u8(self.category.as_byte());
        out.put_u8(self.command);
        out.put_u16(self.flags());
        out.put_u16(self.message_id);
        if let Some(reply_to) = self.reply_to {
            out.put_u16(reply_to);
        }
        if let Some(seq) = self.sequence {
            out.put_u16(seq.total);
            out.put_u16(seq.number);
        }
        out.put_slice(&self.body);
        out
    }

    /// Parse a packet from a binary frame payload.
    ///
    /// Unknown flag bits are ignored.
    pub fn parse(data: &Bytes) -> Result<Self, ProtocolError> {
        if data.len() < BASE_HEADER_SIZE {
            return Err(ProtocolError::TruncatedHeader {
                available: data.len(),
                needed: BASE_HEADER_SIZE,
            });
        }
        let mut input = &data[..];
        let category = Category::from_byte(input.get_u8());
        let command = input.get_u8();
        let bits = input.get_u16();
        let message_id = input.get_u16();
        let reply = bits & flags::REPLY != 0;
        let multi = bits & flags::MULTI_PACKET != 0;

        let needed = header_len(reply, multi);
        if data.len() < needed {
            return Err(ProtocolError::TruncatedHeader {
                available: data.len(),
                needed,
            });
        }

        let reply_to = reply.then(|| input.get_u16());
        let sequence = if multi {
            let total = input.get_u16();
            let number = input.get_u16();
            if number == 0 || number > total {
                return Err(ProtocolError::BadSequence {
                    message_id,
                    reason: format!("packet {number} of {total}"),
                });
            }
            Some(PacketSequence { total, number })
        } else {
            None
        };

        Ok(Self {
            category,
            command,
            message_id,
            reply_to,
            sequence,
            body: data.slice(needed..),
        })
    }
}

fn header_len(reply: bool, multi: bool) -> usize {
    BASE_HEADER_SIZE + if reply { 2 } else { 0 } + if multi { 4 } else { 0 }
}

/// A complete message body with its header fields.
///
/// This is what the assembler produces and what unknown messages are
/// delivered as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub category: Category,
    pub command: u8,
    pub message_id: u16,
    pub reply_to: Option<u16>,
    pub body: Bytes,
}

impl RawMessage {
    /// Split into packets no larger than [`MAX_PACKET_SIZE`].
    pub fn split(&self) -> Result<Vec<GebugPacket>, ProtocolError> {
        let packet = |sequence: Option<PacketSequence>, body: Bytes| GebugPacket {
            category: self.category,
            command: self.command,
            message_id: self.message_id,
            reply_to: self.reply_to,
            sequence,
            body,
        };

        let single = header_len(self.reply_to.is_some(), false);
        if single + self.body.len() <= MAX_PACKET_SIZE {
            return Ok(vec![packet(None, self.body.clone())]);
        }

        let capacity = MAX_PACKET_SIZE - header_len(self.reply_to.is_some(), true);
        let count = self.body.len().div_ceil(capacity);
        let total = u16::try_from(count).map_err(|_| ProtocolError::ValueTooLarge {
            name: "total_packets",
            value: count as u64,
        })?;

        Ok((0..total)
            .map(|i| {
                let start = i as usize * capacity;
                let end = (start + capacity).min(self.body.len());
                packet(
                    Some(PacketSequence {
                        total,
                        number: i + 1,
                    }),
                    self.body.slice(start..end),
                )
            })
            .collect())
    }
}

struct PartialMessage {
    category: Category,
    command: u8,
    reply_to: Option<u16>,
    parts: Vec<Option<Bytes>>,
    received: usize,
    started: Instant,
}

/// Reassembles multi-packet messages by message id.
///
/// A packet that contradicts the assembly in progress (duplicate number,
/// different total, different category or command) is rejected and the whole
/// assembly is dropped.
pub struct PacketAssembler {
    partial: HashMap<u16, PartialMessage>,
    stale_after: Duration,
}

impl PacketAssembler {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            partial: HashMap::new(),
            stale_after,
        }
    }

    /// Feed one packet. Returns the message once all of its packets arrived.
    pub fn push(&mut self, packet: GebugPacket) -> Result<Option<RawMessage>, ProtocolError> {
        let Some(seq) = packet.sequence else {
            return Ok(Some(RawMessage {
                category: packet.category,
                command: packet.command,
                message_id: packet.message_id,
                reply_to: packet.reply_to,
                body: packet.body,
            }));
        };

        let id = packet.message_id;
        if seq.number == 0 || seq.number > seq.total {
            return Err(ProtocolError::BadSequence {
                message_id: id,
                reason: format!("packet {} of {}", seq.number, seq.total),
            });
        }

        let entry = self.partial.entry(id).or_insert_with(|| PartialMessage {
            category: packet.category,
            command: packet.command,
            reply_to: packet.reply_to,
            parts: vec![None; seq.total as usize],
            received: 0,
            started: Instant::now(),
        });

        let conflict = if entry.parts.len() != seq.total as usize {
            Some(format!(
                "total changed from {} to {}",
                entry.parts.len(),
                seq.total
            ))
        } else if entry.category != packet.category || entry.command != packet.command {
            Some("command changed mid-message".to_string())
        } else if entry.parts[seq.number as usize - 1].is_some() {
            Some(format!("duplicate packet {}", seq.number))
        } else {
            None
        };
        if let Some(reason) = conflict {
            self.partial.remove(&id);
            return Err(ProtocolError::BadSequence {
                message_id: id,
                reason,
            });
        }

        entry.parts[seq.number as usize - 1] = Some(packet.body);
        entry.received += 1;
        if entry.received < entry.parts.len() {
            return Ok(None);
        }

        let Some(done) = self.partial.remove(&id) else {
            return Ok(None);
        };
        let mut body = Vec::new();
        for part in done.parts.into_iter().flatten() {
            body.extend_from_slice(&part);
        }
        Ok(Some(RawMessage {
            category: done.category,
            command: done.command,
            message_id: id,
            reply_to: done.reply_to,
            body: Bytes::from(body),
        }))
    }

    /// Drop assemblies started more than the stale age before `now`.
    ///
    /// Returns the message ids that were dropped.
    pub fn expire_stale(&mut self, now: Instant) -> Vec<u16> {
        let stale_after = self.stale_after;
        let mut dropped = Vec::new();
        self.partial.retain(|&id, partial| {
            let keep = now.saturating_duration_since(partial.started) < stale_after;
            if !keep {
                dropped.push(id);
            }
            keep
        });
        dropped
    }

    /// Number of messages waiting for more packets.
    pub fn pending(&self) -> usize {
        self.partial.len()
    }

    pub fn clear(&mut self) {
        self.partial.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(len: usize, reply_to: Option<u16>) -> RawMessage {
        RawMessage {
            category: Category::Video,
            command: 10,
            message_id: 7,
            reply_to,
            body: Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>()),
        }
    }

    #[test]
    fn test_header_layout() {
        let packet = GebugPacket {
            category: Category::Meta,
            command: 1,
            message_id: 0x0102,
            reply_to: Some(0x0304),
            sequence: None,
            body: Bytes::from_static(&[0xAA]),
        };
        assert_eq!(
            packet.encode(),
            vec![10, 1, 0x00, 0x02, 0x01, 0x02, 0x03, 0x04, 0xAA]
        );
    }

    #[test]
    fn test_parse_roundtrip_with_all_fields() {
        let packet = GebugPacket {
            category: Category::Other(99),
            command: 3,
            message_id: 40_000,
            reply_to: Some(12),
            sequence: Some(PacketSequence { total: 3, number: 2 }),
            body: Bytes::from_static(b"body"),
        };
        let parsed = GebugPacket::parse(&Bytes::from(packet.encode())).unwrap();
        assert_eq!(parsed, packet);
        assert_eq!(parsed.header_len(), 12);
    }

    #[test]
    fn test_parse_truncated() {
        assert!(matches!(
            GebugPacket::parse(&Bytes::from_static(&[10, 1, 0])),
            Err(ProtocolError::TruncatedHeader { needed: 6, .. })
        ));
        // Reply flag set but no reply-to field.
        assert!(matches!(
            GebugPacket::parse(&Bytes::from_static(&[10, 1, 0, 2, 0, 1])),
            Err(ProtocolError::TruncatedHeader { needed: 8, .. })
        ));
    }

    #[test]
    fn test_parse_rejects_packet_number_out_of_range() {
        let bytes = Bytes::from_static(&[10, 1, 0, 1, 0, 5, 0, 2, 0, 3]);
        assert!(matches!(
            GebugPacket::parse(&bytes),
            Err(ProtocolError::BadSequence { message_id: 5, .. })
        ));
    }

    #[test]
    fn test_small_body_single_packet() {
        let packets = raw(MAX_PACKET_SIZE - BASE_HEADER_SIZE, None).split().unwrap();
        assert_eq!(packets.len(), 1);
        assert!(packets[0].sequence.is_none());
        assert_eq!(packets[0].encode().len(), MAX_PACKET_SIZE);
    }

    #[test]
    fn test_split_respects_max_packet_size() {
        let message = raw(5000, Some(3));
        let packets = message.split().unwrap();

        assert!(packets.len() > 1);
        for (i, packet) in packets.iter().enumerate() {
            assert!(packet.encode().len() <= MAX_PACKET_SIZE);
            assert_eq!(packet.message_id, 7);
            assert_eq!(packet.reply_to, Some(3));
            let seq = packet.sequence.unwrap();
            assert_eq!(seq.number as usize, i + 1);
            assert_eq!(seq.total as usize, packets.len());
        }
    }

    #[test]
    fn test_reassembly_out_of_order() {
        let message = raw(5000, None);
        let mut packets = message.split().unwrap();
        packets.reverse();

        let mut assembler = PacketAssembler::new(Duration::from_secs(5));
        let mut result = None;
        for packet in packets {
            let wire = Bytes::from(packet.encode());
            if let Some(done) = assembler.push(GebugPacket::parse(&wire).unwrap()).unwrap() {
                result = Some(done);
            }
        }
        assert_eq!(result, Some(message));
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_single_packet_passes_through() {
        let mut assembler = PacketAssembler::new(Duration::from_secs(5));
        let message = raw(10, Some(1));
        let packet = message.split().unwrap().remove(0);
        assert_eq!(assembler.push(packet).unwrap(), Some(message));
    }

    #[test]
    fn test_duplicate_packet_rejected() {
        let mut assembler = PacketAssembler::new(Duration::from_secs(5));
        let packets = raw(3000, None).split().unwrap();

        assert_eq!(assembler.push(packets[0].clone()).unwrap(), None);
        assert!(matches!(
            assembler.push(packets[0].clone()),
            Err(ProtocolError::BadSequence { message_id: 7, .. })
        ));
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_changed_total_rejected() {
        let mut assembler = PacketAssembler::new(Duration::from_secs(5));
        let packets = raw(3000, None).split().unwrap();
        assembler.push(packets[0].clone()).unwrap();

        let mut other = packets[1].clone();
        other.sequence = Some(PacketSequence { total: 9, number: 2 });
        assert!(assembler.push(other).is_err());
    }

    #[test]
    fn test_stale_assembly_dropped() {
        let mut assembler = PacketAssembler::new(Duration::from_millis(100));
        let packets = raw(3000, None).split().unwrap();
        assembler.push(packets[0].clone()).unwrap();

        assert!(assembler.expire_stale(Instant::now()).is_empty());
        let dropped = assembler.expire_stale(Instant::now() + Duration::from_secs(1));
        assert_eq!(dropped, vec![7]);
        assert_eq!(assembler.pending(), 0);
    }
}
