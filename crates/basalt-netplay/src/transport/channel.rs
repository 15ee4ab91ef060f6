//! Per-peer channel state machines, kept free of socket I/O so delivery
//! logic is testable under loss, duplication, and reordering.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::TransportError;

use super::wire::{build_datagram, PacketKind, FLAG_FRAGMENT, FRAGMENT_PAYLOAD};

/// Logical channels carried by the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Channel {
    /// Reliable, ordered: session management and chat.
    Control = 0,
    /// Unreliable, sequenced: rollback engine traffic.
    Gameplay = 1,
}

impl Channel {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Control),
            1 => Some(Self::Gameplay),
            _ => None,
        }
    }
}

/// Retransmission timeout for unacked reliable fragments.
pub const RELIABLE_RTO: Duration = Duration::from_millis(100);

/// Retransmissions of one fragment before the peer is considered lost.
pub const RELIABLE_RETRIES: u32 = 40;

struct Pending {
    datagram: Vec<u8>,
    last_sent: Instant,
    retries: u32,
}

/// Reliable-ordered channel: every fragment is acked and retransmitted on
/// a fixed timeout; receive side delivers messages in sequence order and
/// reassembles fragmented messages.
pub struct ReliableChannel {
    next_out: u32,
    in_flight: BTreeMap<u32, Pending>,
    expected_in: u32,
    out_of_order: BTreeMap<u32, (u8, Vec<u8>)>,
    reassembly: Vec<u8>,
}

impl ReliableChannel {
    pub fn new() -> Self {
        Self {
            next_out: 0,
            in_flight: BTreeMap::new(),
            expected_in: 0,
            out_of_order: BTreeMap::new(),
            reassembly: Vec::new(),
        }
    }

    /// Split `payload` into fragments and return the datagrams to send.
    /// Each fragment stays queued until its ack arrives.
    pub fn send(&mut self, payload: &[u8], now: Instant) -> Result<Vec<Vec<u8>>, TransportError> {
        let mut datagrams = Vec::new();
        let mut chunks = payload.chunks(FRAGMENT_PAYLOAD).peekable();
        // A zero-length message still occupies one sequence slot.
        if payload.is_empty() {
            datagrams.push(self.push_fragment(&[], 0, now)?);
            return Ok(datagrams);
        }
        while let Some(chunk) = chunks.next() {
            let flags = if chunks.peek().is_some() {
                FLAG_FRAGMENT
            } else {
                0
            };
            datagrams.push(self.push_fragment(chunk, flags, now)?);
        }
        Ok(datagrams)
    }

    fn push_fragment(
        &mut self,
        chunk: &[u8],
        flags: u8,
        now: Instant,
    ) -> Result<Vec<u8>, TransportError> {
        let seq = self.next_out;
        self.next_out = self.next_out.wrapping_add(1);
        let datagram = build_datagram(PacketKind::Payload, flags, Channel::Control as u8, seq, chunk)?;
        self.in_flight.insert(
            seq,
            Pending {
                datagram: datagram.clone(),
                last_sent: now,
                retries: 0,
            },
        );
        Ok(datagram)
    }

    pub fn on_ack(&mut self, seq: u32) {
        self.in_flight.remove(&seq);
    }

    /// Ingest one payload fragment. Returns the complete messages this
    /// fragment unlocked, in order. Duplicates deliver nothing but still
    /// deserve an ack (the caller always acks).
    pub fn on_payload(&mut self, seq: u32, flags: u8, payload: &[u8]) -> Vec<Bytes> {
        if sequence_less_than(seq, self.expected_in) {
            return Vec::new();
        }
        if seq != self.expected_in {
            self.out_of_order.insert(seq, (flags, payload.to_vec()));
            return Vec::new();
        }

        let mut delivered = Vec::new();
        self.ingest_in_order(flags, payload, &mut delivered);
        while let Some((flags, payload)) = self.out_of_order.remove(&self.expected_in) {
            self.ingest_in_order(flags, &payload, &mut delivered);
        }
        delivered
    }

    fn ingest_in_order(&mut self, flags: u8, payload: &[u8], delivered: &mut Vec<Bytes>) {
        self.expected_in = self.expected_in.wrapping_add(1);
        self.reassembly.extend_from_slice(payload);
        if flags & FLAG_FRAGMENT == 0 {
            delivered.push(Bytes::from(std::mem::take(&mut self.reassembly)));
        }
    }

    /// Collect datagrams due for retransmission. `Err(())` means a
    /// fragment ran out of retries and the peer should be declared lost.
    pub fn retransmits(&mut self, now: Instant) -> Result<Vec<Vec<u8>>, ()> {
        let mut due = Vec::new();
        for pending in self.in_flight.values_mut() {
            if now.duration_since(pending.last_sent) >= RELIABLE_RTO {
                if pending.retries >= RELIABLE_RETRIES {
                    return Err(());
                }
                pending.retries += 1;
                pending.last_sent = now;
                due.push(pending.datagram.clone());
            }
        }
        Ok(due)
    }

    pub fn has_unacked(&self) -> bool {
        !self.in_flight.is_empty()
    }
}

/// Unreliable-sequenced channel: datagrams older than the newest seen are
/// dropped, nothing is retransmitted.
pub struct UnreliableChannel {
    next_out: u32,
    last_in: Option<u32>,
}

impl UnreliableChannel {
    pub fn new() -> Self {
        Self {
            next_out: 0,
            last_in: None,
        }
    }

    pub fn send(&mut self, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        let seq = self.next_out;
        self.next_out = self.next_out.wrapping_add(1);
        build_datagram(PacketKind::Payload, 0, Channel::Gameplay as u8, seq, payload)
    }

    /// `true` if the datagram is fresh and should be delivered.
    pub fn on_payload(&mut self, seq: u32) -> bool {
        match self.last_in {
            Some(last) if !sequence_greater_than(seq, last) => false,
            _ => {
                self.last_in = Some(seq);
                true
            }
        }
    }
}

/// Wrapping sequence comparison over u32.
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= u32::MAX / 2)) || ((s1 < s2) && (s2 - s1 > u32::MAX / 2))
}

fn sequence_less_than(s1: u32, s2: u32) -> bool {
    s1 != s2 && !sequence_greater_than(s1, s2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::wire::PacketHeader;

    fn payload_of(datagram: &[u8]) -> (u32, u8, Vec<u8>) {
        let (header, payload) = PacketHeader::decode(datagram).unwrap();
        (header.seq, header.flags, payload.to_vec())
    }

    #[test]
    fn in_order_delivery() {
        let now = Instant::now();
        let mut tx = ReliableChannel::new();
        let mut rx = ReliableChannel::new();

        for text in [b"one".as_slice(), b"two", b"three"] {
            let datagrams = tx.send(text, now).unwrap();
            assert_eq!(datagrams.len(), 1);
            let (seq, flags, payload) = payload_of(&datagrams[0]);
            let delivered = rx.on_payload(seq, flags, &payload);
            assert_eq!(delivered, vec![Bytes::copy_from_slice(text)]);
        }
    }

    #[test]
    fn reordered_fragments_reassemble_in_order() {
        let now = Instant::now();
        let mut tx = ReliableChannel::new();
        let mut rx = ReliableChannel::new();

        let big = vec![7u8; FRAGMENT_PAYLOAD * 2 + 100];
        let datagrams = tx.send(&big, now).unwrap();
        assert_eq!(datagrams.len(), 3);

        // Deliver the fragments back-to-front; nothing completes until the
        // first fragment arrives.
        let (s2, f2, p2) = payload_of(&datagrams[2]);
        let (s1, f1, p1) = payload_of(&datagrams[1]);
        let (s0, f0, p0) = payload_of(&datagrams[0]);
        assert!(rx.on_payload(s2, f2, &p2).is_empty());
        assert!(rx.on_payload(s1, f1, &p1).is_empty());
        let delivered = rx.on_payload(s0, f0, &p0);
        assert_eq!(delivered, vec![Bytes::from(big)]);
    }

    #[test]
    fn duplicates_are_ignored() {
        let now = Instant::now();
        let mut tx = ReliableChannel::new();
        let mut rx = ReliableChannel::new();

        let datagrams = tx.send(b"once", now).unwrap();
        let (seq, flags, payload) = payload_of(&datagrams[0]);
        assert_eq!(rx.on_payload(seq, flags, &payload).len(), 1);
        assert!(rx.on_payload(seq, flags, &payload).is_empty());
    }

    #[test]
    fn retransmit_until_acked_then_dead() {
        let mut now = Instant::now();
        let mut tx = ReliableChannel::new();

        let datagrams = tx.send(b"fragile", now).unwrap();
        let (seq, _, _) = payload_of(&datagrams[0]);

        now += RELIABLE_RTO;
        assert_eq!(tx.retransmits(now).unwrap().len(), 1);

        tx.on_ack(seq);
        now += RELIABLE_RTO;
        assert!(tx.retransmits(now).unwrap().is_empty());
        assert!(!tx.has_unacked());

        // A message that never gets acked eventually kills the channel.
        tx.send(b"doomed", now).unwrap();
        for _ in 0..RELIABLE_RETRIES {
            now += RELIABLE_RTO;
            assert!(tx.retransmits(now).is_ok());
        }
        now += RELIABLE_RTO;
        assert!(tx.retransmits(now).is_err());
    }

    #[test]
    fn unreliable_drops_stale_sequences() {
        let mut rx = UnreliableChannel::new();
        assert!(rx.on_payload(0));
        assert!(rx.on_payload(5));
        assert!(!rx.on_payload(3));
        assert!(!rx.on_payload(5));
        assert!(rx.on_payload(6));
    }

    #[test]
    fn sequence_compare_wraps() {
        assert!(sequence_greater_than(1, u32::MAX));
        assert!(!sequence_greater_than(u32::MAX, 1));
        assert!(sequence_greater_than(100, 99));
    }
}
