//! Binary frame protocol for inter-node TCP connections
//!
//! Frame layout (21 byte header + variable payload):
//! ```text
//! | tunnel_id (16B) | frame_type (1B) | payload_len (4B BE) | payload (NB) |
//! ```
//!
//! A zero tunnel id marks control frames that are not bound to a tunnel.
//! There is no version byte; the frame type space is the negotiated
//! contract between nodes.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Size of the encoded frame header in bytes
pub const HEADER_SIZE: usize = 21;

/// Largest payload a single frame may carry (64 KiB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Types of frames on a cross-node connection
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Tunnel payload bytes
    Data = 1,
    /// The target side of a tunnel is attached on the sending node
    TargetReady = 2,
    /// Graceful end of a tunnel direction
    Close = 3,
    /// Reserved acknowledgement frame
    Ack = 4,
    /// HTTP proxy request relayed to the client-owning node
    HttpProxy = 5,
    /// Response to a relayed HTTP proxy request
    HttpResponse = 6,
    /// DNS query relayed to the client-owning node
    DnsQuery = 7,
    /// Response to a relayed DNS query
    DnsResponse = 8,
    /// Reserved command frame
    Command = 9,
    /// Reserved command response frame
    CommandResponse = 10,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Data,
            2 => Self::TargetReady,
            3 => Self::Close,
            4 => Self::Ack,
            5 => Self::HttpProxy,
            6 => Self::HttpResponse,
            7 => Self::DnsQuery,
            8 => Self::DnsResponse,
            9 => Self::Command,
            10 => Self::CommandResponse,
            _ => return None,
        })
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unknown frame type: {0:#04x}")]
    UnknownType(u8),
    #[error("frame payload of {0} bytes exceeds the limit")]
    TooLarge(usize),
    #[error("frame type {0:?} is not routed on this connection")]
    UnsupportedFrame(FrameType),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A single frame on a cross-node connection
#[derive(Debug, Clone)]
pub struct Frame {
    pub tunnel_id: Uuid,
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(tunnel_id: Uuid, frame_type: FrameType, payload: impl Into<Bytes>) -> Self {
        Self {
            tunnel_id,
            frame_type,
            payload: payload.into(),
        }
    }

    /// Control frame not bound to a tunnel (zero tunnel id)
    pub fn control(frame_type: FrameType, payload: impl Into<Bytes>) -> Self {
        Self::new(Uuid::nil(), frame_type, payload)
    }

    /// Encodes the frame into a single buffer
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_slice(self.tunnel_id.as_bytes());
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Reads one frame, [None] on a clean close at a frame boundary
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];

    // A close before the first header byte is a clean end of stream,
    // anything partial is an error
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Io(io::ErrorKind::UnexpectedEof.into()));
        }
        filled += n;
    }

    let tunnel_id = Uuid::from_slice(&header[..16])
        .map_err(|_| FrameError::Io(io::ErrorKind::InvalidData.into()))?;
    let frame_type = FrameType::from_u8(header[16]).ok_or(FrameError::UnknownType(header[16]))?;

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&header[17..21]);
    let length = u32::from_be_bytes(len_bytes) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(Some(Frame {
        tunnel_id,
        frame_type,
        payload: Bytes::from(payload),
    }))
}

/// Writes one frame as a single buffer write
///
/// Callers serialise access to the writer; the single `write_all` keeps
/// header and payload contiguous on the wire.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if frame.payload.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(frame.payload.len()));
    }
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}
