//! Framed packet layer for the control channel
//!
//! Every client-facing transport delivers the same packet shape: a fixed
//! 10 byte header followed by the payload. Payloads above the raw tunnel
//! data types are JSON.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt::Debug, io};
use tokio_util::codec::{Decoder, Encoder};

/// The different types of packets on the control channel
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Connection handshake carrying auth details (0x01)
    Handshake = 0x01,
    /// Server reply to a handshake (0x02)
    HandshakeResp = 0x02,
    /// JSON command envelope (0x03)
    JsonCommand = 0x03,
    /// JSON command response envelope (0x04)
    CommandResp = 0x04,
    /// Single byte liveness probe, echoed by the server (0x05)
    Heartbeat = 0x05,
    /// Request to open / bind a tunnel (0x06)
    TunnelOpen = 0x06,
    /// Server acknowledgement that the tunnel data path may start (0x07)
    TunnelOpenAck = 0x07,
    /// Raw tunnel payload bytes, optionally sequenced (0x08)
    TunnelData = 0x08,
    /// Cumulative acknowledgement for sequenced tunnel data (0x09)
    TunnelAck = 0x09,
    /// Graceful end of a sequenced tunnel direction (0x0A)
    TunnelClose = 0x0A,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x01 => Self::Handshake,
            0x02 => Self::HandshakeResp,
            0x03 => Self::JsonCommand,
            0x04 => Self::CommandResp,
            0x05 => Self::Heartbeat,
            0x06 => Self::TunnelOpen,
            0x07 => Self::TunnelOpenAck,
            0x08 => Self::TunnelData,
            0x09 => Self::TunnelAck,
            0x0A => Self::TunnelClose,
            _ => return None,
        })
    }
}

/// Packet flag bits
pub mod flags {
    /// The header sequence number field is meaningful
    pub const SEQUENCED: u8 = 0x01;
}

/// Fixed size header preceding every packet payload
///
/// ```text
/// | type (1B) | flags (1B) | seq (4B) | payload_len (4B) |
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    /// The type of this packet
    pub ty: PacketType,
    /// Flag bits for this packet
    pub flags: u8,
    /// Sequence number, meaningful when [flags::SEQUENCED] is set
    pub seq: u32,
}

/// Size of the encoded packet header in bytes
pub const HEADER_SIZE: usize = 10;

/// Largest accepted payload; anything bigger aborts the connection
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

impl PacketHeader {
    /// Creates a plain unsequenced header
    pub const fn new(ty: PacketType) -> Self {
        Self { ty, flags: 0, seq: 0 }
    }

    /// Creates a header carrying a sequence number
    pub const fn sequenced(ty: PacketType, seq: u32) -> Self {
        Self {
            ty,
            flags: flags::SEQUENCED,
            seq,
        }
    }

    pub const fn is_sequenced(&self) -> bool {
        self.flags & flags::SEQUENCED != 0
    }

    /// Encodes the contents of this header appending to the
    /// output source
    ///
    /// `dst`    The dst to append the bytes to
    /// `length` The length of the payload after the header
    pub fn write(&self, dst: &mut BytesMut, length: usize) {
        dst.put_u8(self.ty as u8);
        dst.put_u8(self.flags);
        dst.put_u32(self.seq);
        dst.put_u32(length as u32);
    }

    /// Attempts to read the packet header from the provided source bytes
    /// returning [None] if there aren't enough bytes
    pub fn read(src: &mut BytesMut) -> io::Result<Option<(PacketHeader, usize)>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let ty = src.get_u8();
        let flags = src.get_u8();
        let seq = src.get_u32();
        let length = src.get_u32() as usize;

        let ty = PacketType::from_u8(ty).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown packet type: {:#04x}", ty),
            )
        })?;

        if length > MAX_PACKET_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("packet payload too large: {} bytes", length),
            ));
        }

        Ok(Some((PacketHeader { ty, flags, seq }, length)))
    }
}

/// Packet on the control channel
///
/// Packets can be cloned with little memory usage increase because
/// the payload is stored as [Bytes]
#[derive(Debug, Clone)]
pub struct Packet {
    /// The packet header
    pub header: PacketHeader,
    /// The packet payload bytes
    pub payload: Bytes,
}

impl Packet {
    pub const fn new(header: PacketHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Creates a packet of the provided type with an empty payload
    #[inline]
    pub const fn empty(ty: PacketType) -> Self {
        Self::new(PacketHeader::new(ty), Bytes::new())
    }

    /// Creates a packet of the provided type with a JSON payload
    pub fn json<V>(ty: PacketType, value: &V) -> serde_json::Result<Packet>
    where
        V: Serialize,
    {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(PacketHeader::new(ty), Bytes::from(payload)))
    }

    /// Creates a heartbeat packet (single zero byte payload)
    pub fn heartbeat() -> Packet {
        Self::new(PacketHeader::new(PacketType::Heartbeat), Bytes::from_static(&[0]))
    }

    /// Creates an unsequenced tunnel data packet
    pub fn tunnel_data(payload: Bytes) -> Packet {
        Self::new(PacketHeader::new(PacketType::TunnelData), payload)
    }

    /// Creates a sequenced tunnel data packet
    pub fn tunnel_data_seq(seq: u32, payload: Bytes) -> Packet {
        Self::new(
            PacketHeader::sequenced(PacketType::TunnelData, seq),
            payload,
        )
    }

    /// Creates a cumulative tunnel ack packet
    pub fn tunnel_ack(ack: u32) -> Packet {
        Self::new(
            PacketHeader::sequenced(PacketType::TunnelAck, ack),
            Bytes::new(),
        )
    }

    /// Attempts to deserialize the packet payload as JSON of the
    /// provided type
    pub fn deserialize<V>(&self) -> serde_json::Result<V>
    where
        V: DeserializeOwned,
    {
        serde_json::from_slice(&self.payload)
    }

    pub fn read(src: &mut BytesMut) -> io::Result<Option<Self>> {
        let mut read_src = src.clone();
        let (header, length) = match PacketHeader::read(&mut read_src)? {
            Some(value) => value,
            None => return Ok(None),
        };

        if read_src.len() < length {
            return Ok(None);
        }

        let payload = read_src.split_to(length);
        *src = read_src;

        Ok(Some(Self {
            header,
            payload: payload.freeze(),
        }))
    }

    pub fn write(&self, dst: &mut BytesMut) {
        self.header.write(dst, self.payload.len());
        dst.extend_from_slice(&self.payload);
    }
}

/// Tokio codec for encoding and decoding packets
#[derive(Default)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Error = io::Error;
    type Item = Packet;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Packet::read(src)
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.write(dst);
        Ok(())
    }
}

/// Wrapper over a packet to provide debug logging with the payload
/// rendered when it is JSON
pub struct PacketDebug<'a> {
    /// Reference to the packet itself
    pub packet: &'a Packet,
}

impl Debug for PacketDebug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let header = &self.packet.header;

        writeln!(f, "Type: {:?}", header.ty)?;
        if header.is_sequenced() {
            writeln!(f, "Seq: {}", header.seq)?;
        }

        match header.ty {
            // Raw payloads are only described by length
            PacketType::TunnelData | PacketType::Heartbeat => {
                write!(f, "Payload: {} bytes", self.packet.payload.len())
            }
            _ => match std::str::from_utf8(&self.packet.payload) {
                Ok(text) => write!(f, "Payload: {}", text),
                Err(_) => write!(f, "Payload: {:?}", &self.packet.payload),
            },
        }
    }
}
