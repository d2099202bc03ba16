//! Per-tunnel byte stream views over a shared cross-node connection
//!
//! A frame stream is the remote half of a tunnel bridge: writes become
//! `Data` frames carrying this tunnel's id, reads filter inbound frames to
//! this tunnel and surface `Close` as EOF. Closing a frame stream sends a
//! single `Close` frame; the owning bridge decides whether the underlying
//! connection goes back to its pool or gets dropped.

use super::{
    conn::CrossNodeConn,
    frame::{Frame, FrameError, FrameType, MAX_FRAME_SIZE},
};
use crate::utils::types::TunnelId;
use bytes::Bytes;
use log::debug;
use std::{io, sync::Arc};

fn frame_to_io(err: FrameError) -> io::Error {
    match err {
        FrameError::Io(err) => err,
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

/// Creates the reader and writer halves of a tunnel's view over `conn`
pub fn frame_stream(
    conn: Arc<CrossNodeConn>,
    tunnel_id: TunnelId,
) -> (FrameStreamReader, FrameStreamWriter) {
    (
        FrameStreamReader {
            conn: conn.clone(),
            tunnel_id,
            leftover: Bytes::new(),
            eof: false,
        },
        FrameStreamWriter {
            conn,
            tunnel_id,
            closed: false,
        },
    )
}

/// Read half: drains `Data` frames for one tunnel
pub struct FrameStreamReader {
    conn: Arc<CrossNodeConn>,
    tunnel_id: TunnelId,
    /// Payload accepted from a frame but not yet consumed by the caller
    leftover: Bytes,
    eof: bool,
}

impl FrameStreamReader {
    /// Reads payload bytes, `Ok(0)` once the peer sent `Close` or the
    /// connection ended
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.eof || buf.is_empty() {
            return Ok(0);
        }

        loop {
            if !self.leftover.is_empty() {
                let take = self.leftover.len().min(buf.len());
                buf[..take].copy_from_slice(&self.leftover[..take]);
                self.leftover = self.leftover.slice(take..);
                return Ok(take);
            }

            let frame = match self.conn.read_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    self.eof = true;
                    return Ok(0);
                }
                // The connection is already marked broken
                Err(err) => return Err(frame_to_io(err)),
            };

            if frame.tunnel_id != self.tunnel_id {
                // Frames for other tunnels sharing this connection are
                // not ours to consume
                debug!(
                    "dropping frame for tunnel {} on stream for {}",
                    frame.tunnel_id.simple(),
                    self.tunnel_id.simple()
                );
                continue;
            }

            match frame.frame_type {
                FrameType::Data => {
                    self.leftover = frame.payload;
                }
                FrameType::Close => {
                    self.eof = true;
                    return Ok(0);
                }
                other => {
                    debug!(
                        "dropping {:?} frame on data stream for tunnel {}",
                        other,
                        self.tunnel_id.simple()
                    );
                }
            }
        }
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }
}

/// Write half: wraps payloads into `Data` frames
pub struct FrameStreamWriter {
    conn: Arc<CrossNodeConn>,
    tunnel_id: TunnelId,
    closed: bool,
}

impl FrameStreamWriter {
    /// Writes the full payload, fragmenting anything beyond the frame
    /// size limit into consecutive `Data` frames
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        if self.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }

        for chunk in data.chunks(MAX_FRAME_SIZE) {
            let frame = Frame::new(
                self.tunnel_id,
                FrameType::Data,
                Bytes::copy_from_slice(chunk),
            );
            self.conn.write_frame(&frame).await.map_err(frame_to_io)?;
        }
        Ok(())
    }

    /// Sends a single `Close` frame, leaving the underlying connection
    /// open for its other tunnels
    pub async fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let frame = Frame::new(self.tunnel_id, FrameType::Close, Bytes::new());
        self.conn.write_frame(&frame).await.map_err(frame_to_io)
    }
}

#[cfg(test)]
mod test {
    use super::{frame_stream, CrossNodeConn};
    use crate::cross_node::frame::{Frame, FrameType, MAX_FRAME_SIZE};
    use bytes::Bytes;
    use std::sync::Arc;
    use tokio::net::{TcpListener, TcpStream};
    use uuid::Uuid;

    async fn conn_pair() -> (Arc<CrossNodeConn>, Arc<CrossNodeConn>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr);
        let server = listener.accept();
        let (client, server) = tokio::join!(client, server);

        (
            CrossNodeConn::new("a".to_string(), client.unwrap()),
            CrossNodeConn::new("b".to_string(), server.unwrap().0),
        )
    }

    /// Bytes written on one side arrive in order on the other, across
    /// frame fragmentation
    #[tokio::test]
    async fn test_ordered_delivery_with_fragmentation() {
        let (a, b) = conn_pair().await;
        let tunnel_id = Uuid::new_v4();

        let (_reader_a, mut writer_a) = frame_stream(a, tunnel_id);
        let (mut reader_b, _writer_b) = frame_stream(b, tunnel_id);

        // Payload larger than one frame
        let payload: Vec<u8> = (0..(MAX_FRAME_SIZE + 1000))
            .map(|i| (i % 251) as u8)
            .collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            writer_a.write_all(&payload).await.unwrap();
            writer_a.close().await.unwrap();
        });

        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = reader_b.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }

        writer.await.unwrap();
        assert_eq!(received, expected);
        assert!(reader_b.is_eof());
    }

    /// Frames for other tunnels on the shared connection are skipped
    #[tokio::test]
    async fn test_foreign_tunnel_frames_dropped() {
        let (a, b) = conn_pair().await;
        let ours = Uuid::new_v4();
        let other = Uuid::new_v4();

        a.write_frame(&Frame::new(other, FrameType::Data, Bytes::from_static(b"x")))
            .await
            .unwrap();
        a.write_frame(&Frame::new(ours, FrameType::Data, Bytes::from_static(b"mine")))
            .await
            .unwrap();

        let (mut reader, _writer) = frame_stream(b, ours);
        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"mine");
    }

    /// Close only ends the tunnel stream, not the shared connection
    #[tokio::test]
    async fn test_close_leaves_connection_usable() {
        let (a, b) = conn_pair().await;
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        let (_r, mut first_writer) = frame_stream(a.clone(), first);
        first_writer.close().await.unwrap();

        let (mut first_reader, _w) = frame_stream(b.clone(), first);
        let mut buf = [0u8; 8];
        assert_eq!(first_reader.read(&mut buf).await.unwrap(), 0);

        // The shared connection still carries the second tunnel
        let (_r2, mut second_writer) = frame_stream(a, second);
        second_writer.write_all(b"still here").await.unwrap();

        let (mut second_reader, _w2) = frame_stream(b, second);
        let mut buf = [0u8; 32];
        let n = second_reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"still here");
    }
}
