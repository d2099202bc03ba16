//! Send and receive buffering for sequenced tunnels
//!
//! The send buffer keeps a bounded window of unacknowledged packets so a
//! resumed or migrated tunnel can retransmit; the receive buffer reorders
//! out-of-order arrivals into contiguous delivery. Scheduling of actual
//! retransmits is a policy decision left to the caller, the buffer only
//! does the bookkeeping.

use bytes::Bytes;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::time::{Duration, Instant};

/// Default maximum number of buffered outbound packets
const DEFAULT_MAX_PACKETS: usize = 1000;
/// Default maximum aggregate payload held in the send window (10 MiB)
const DEFAULT_MAX_BYTES: usize = 10 * 1024 * 1024;
/// Default age after which an unconfirmed packet is eligible for resend
const DEFAULT_RESEND_TIMEOUT: Duration = Duration::from_secs(3);
/// Default maximum number of out-of-order packets held for reordering
const DEFAULT_MAX_OUT_OF_ORDER: usize = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// The send window is out of room
    #[error("send buffer full: {0}")]
    BufferFull(&'static str),
    /// The reorder buffer is out of room
    #[error("too many out of order packets")]
    TooManyOutOfOrder,
}

/// One outbound packet held until it is acknowledged
#[derive(Debug, Clone)]
pub struct BufferedPacket {
    pub seq: u32,
    pub data: Bytes,
    pub sent_at: Instant,
    pub retry_count: u32,
}

/// Bounded window of sent-but-unconfirmed packets
pub struct SendBuffer {
    /// Sequence number the next packet will be assigned
    next_seq: u32,
    /// Highest sequence number confirmed contiguously
    confirmed_seq: u32,
    /// Buffered packets ordered by sequence number
    packets: BTreeMap<u32, BufferedPacket>,
    /// Aggregate payload bytes currently buffered
    buffered_bytes: usize,
    max_packets: usize,
    max_bytes: usize,
    resend_timeout: Duration,
}

impl Default for SendBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKETS, DEFAULT_MAX_BYTES, DEFAULT_RESEND_TIMEOUT)
    }
}

impl SendBuffer {
    pub fn new(max_packets: usize, max_bytes: usize, resend_timeout: Duration) -> Self {
        Self {
            next_seq: 1,
            confirmed_seq: 0,
            packets: BTreeMap::new(),
            buffered_bytes: 0,
            max_packets,
            max_bytes,
            resend_timeout,
        }
    }

    /// Assigns the next sequence number to `data` and buffers it for
    /// possible retransmission
    pub fn send(&mut self, data: Bytes) -> Result<u32, BufferError> {
        if self.packets.len() >= self.max_packets {
            return Err(BufferError::BufferFull("packet window exceeded"));
        }
        if self.buffered_bytes + data.len() > self.max_bytes {
            return Err(BufferError::BufferFull("byte window exceeded"));
        }

        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.buffered_bytes += data.len();
        self.packets.insert(
            seq,
            BufferedPacket {
                seq,
                data,
                sent_at: Instant::now(),
                retry_count: 0,
            },
        );
        Ok(seq)
    }

    /// Handles a cumulative ack: everything below `ack` is confirmed
    pub fn confirm_up_to(&mut self, ack: u32) {
        let confirmed: Vec<u32> = self
            .packets
            .range(..ack)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in confirmed {
            if let Some(packet) = self.packets.remove(&seq) {
                self.buffered_bytes -= packet.data.len();
            }
        }
        if ack > 0 && ack - 1 > self.confirmed_seq {
            self.confirmed_seq = ack - 1;
        }
    }

    /// Handles a selective ack for a single packet, advancing the
    /// contiguous confirmation point across already-acked successors
    pub fn confirm_packet(&mut self, seq: u32) {
        if let Some(packet) = self.packets.remove(&seq) {
            self.buffered_bytes -= packet.data.len();
        }

        if seq == self.confirmed_seq + 1 {
            // Everything assigned but no longer buffered has been acked
            while self.confirmed_seq + 1 < self.next_seq
                && !self.packets.contains_key(&(self.confirmed_seq + 1))
            {
                self.confirmed_seq += 1;
            }
        }
    }

    /// Returns the packets old enough to be retransmitted
    ///
    /// The core never schedules retransmits itself; drivers poll this and
    /// pair it with [Self::mark_resent]
    pub fn unconfirmed_packets(&self) -> Vec<BufferedPacket> {
        let now = Instant::now();
        self.packets
            .values()
            .filter(|packet| now.duration_since(packet.sent_at) >= self.resend_timeout)
            .cloned()
            .collect()
    }

    /// Refreshes the send timestamp of a retransmitted packet
    pub fn mark_resent(&mut self, seq: u32) {
        if let Some(packet) = self.packets.get_mut(&seq) {
            packet.sent_at = Instant::now();
            packet.retry_count += 1;
        }
    }

    /// Drops buffered payloads but keeps the sequence counters, used when
    /// a reconnecting peer will replay from its own snapshot
    pub fn reset(&mut self) {
        self.packets.clear();
        self.buffered_bytes = 0;
    }

    /// Resets the buffer to its initial state including counters
    pub fn clear(&mut self) {
        self.reset();
        self.next_seq = 1;
        self.confirmed_seq = 0;
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    pub fn confirmed_seq(&self) -> u32 {
        self.confirmed_seq
    }

    pub fn buffered_len(&self) -> usize {
        self.packets.len()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    /// Snapshot of the buffered packets for durable state capture
    pub fn buffered_packets(&self) -> Vec<BufferedPacket> {
        self.packets.values().cloned().collect()
    }
}

/// Counters exposed by the receive buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveStats {
    pub total_received: u64,
    pub out_of_order: u64,
    pub reordered: u64,
    pub next_expected: u32,
}

/// Reorders sequenced arrivals into contiguous delivery
pub struct ReceiveBuffer {
    /// Sequence number the next delivered packet must carry
    next_expected: u32,
    /// Out-of-order arrivals waiting for their predecessors
    pending: BTreeMap<u32, Bytes>,
    max_out_of_order: usize,
    total_received: u64,
    out_of_order: u64,
    reordered: u64,
}

impl Default for ReceiveBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OUT_OF_ORDER)
    }
}

impl ReceiveBuffer {
    pub fn new(max_out_of_order: usize) -> Self {
        Self {
            next_expected: 1,
            pending: BTreeMap::new(),
            max_out_of_order,
            total_received: 0,
            out_of_order: 0,
            reordered: 0,
        }
    }

    /// Accepts one arrival, returning the payloads that became deliverable
    /// in sequence order
    ///
    /// Duplicates (below the expected sequence or already pending) are
    /// dropped silently and deliver nothing.
    pub fn receive(&mut self, seq: u32, data: Bytes) -> Result<Vec<Bytes>, BufferError> {
        self.total_received += 1;

        if seq < self.next_expected {
            return Ok(Vec::new());
        }

        if seq > self.next_expected {
            if self.pending.contains_key(&seq) {
                return Ok(Vec::new());
            }
            if self.pending.len() >= self.max_out_of_order {
                return Err(BufferError::TooManyOutOfOrder);
            }
            self.pending.insert(seq, data);
            self.out_of_order += 1;
            return Ok(Vec::new());
        }

        let mut delivered = vec![data];
        self.next_expected = self.next_expected.wrapping_add(1);

        // Drain any contiguous successors that arrived early
        while let Some(data) = self.pending.remove(&self.next_expected) {
            delivered.push(data);
            self.reordered += 1;
            self.next_expected = self.next_expected.wrapping_add(1);
        }

        Ok(delivered)
    }

    pub fn next_expected(&self) -> u32 {
        self.next_expected
    }

    /// Restores the expected sequence from a durable snapshot
    pub fn restore_next_expected(&mut self, next_expected: u32) {
        self.next_expected = next_expected;
        self.pending.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> ReceiveStats {
        ReceiveStats {
            total_received: self.total_received,
            out_of_order: self.out_of_order,
            reordered: self.reordered,
            next_expected: self.next_expected,
        }
    }
}
