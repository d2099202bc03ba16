//! Full-duplex pairing of a tunnel's two ends
//!
//! A bridge holds a source side (listen client) and a target side (target
//! client or a frame stream to the node that has it), pumps bytes both
//! ways and coordinates half-close: when one direction finishes its writer
//! is shut down while the other direction keeps flowing, and everything is
//! torn down once both directions are done.

use super::{
    buffers::SendBuffer,
    packet::{Packet, PacketType},
    socket::{PacketTx, TransportBackend},
};
use crate::{
    cross_node::{
        conn::CrossNodeConn,
        stream::{frame_stream, FrameStreamReader, FrameStreamWriter},
    },
    utils::types::{MappingId, TunnelId},
};
use bytes::{Buf, Bytes, BytesMut};
use log::debug;
use parking_lot::Mutex;
use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::watch,
};

/// Read buffer size for the data pumps
const PUMP_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge is missing a paired side")]
    NotPaired,
    #[error("timed out waiting for the target side")]
    TargetTimeout,
}

/// Read end of one bridge side
pub enum ForwardReader {
    /// Raw transport half with any bytes read past the packet phase
    Io {
        io: ReadHalf<TransportBackend>,
        buffered: BytesMut,
    },
    /// Remote side reached through a shared cross-node connection
    Frame(FrameStreamReader),
}

impl ForwardReader {
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ForwardReader::Io { io, buffered } => {
                if !buffered.is_empty() {
                    let take = buffered.len().min(buf.len());
                    buf[..take].copy_from_slice(&buffered[..take]);
                    buffered.advance(take);
                    return Ok(take);
                }
                io.read(buf).await
            }
            ForwardReader::Frame(reader) => reader.read(buf).await,
        }
    }
}

/// Write end of one bridge side
pub enum ForwardWriter {
    /// Raw transport half
    Io(WriteHalf<TransportBackend>),
    /// Remote side reached through a shared cross-node connection
    Frame(FrameStreamWriter),
    /// Connection that stays in packet mode (sequenced tunnels): writes
    /// become tunnel data packets, sequenced when a send buffer is set
    Packet {
        stream: PacketTx,
        send_buffer: Option<Arc<Mutex<SendBuffer>>>,
    },
}

impl ForwardWriter {
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            ForwardWriter::Io(io) => io.write_all(data).await,
            ForwardWriter::Frame(writer) => writer.write_all(data).await,
            ForwardWriter::Packet {
                stream,
                send_buffer,
            } => {
                let payload = Bytes::copy_from_slice(data);
                let packet = match send_buffer {
                    Some(buffer) => {
                        let seq = buffer
                            .lock()
                            .send(payload.clone())
                            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
                        Packet::tunnel_data_seq(seq, payload)
                    }
                    None => Packet::tunnel_data(payload),
                };
                if !stream.send(packet) {
                    return Err(io::ErrorKind::BrokenPipe.into());
                }
                Ok(())
            }
        }
    }

    /// Signals "no more data in this direction" while leaving the
    /// opposite direction open
    pub async fn close_write(&mut self) -> io::Result<()> {
        match self {
            ForwardWriter::Io(io) => io.shutdown().await,
            ForwardWriter::Frame(writer) => writer.close().await,
            ForwardWriter::Packet { stream, .. } => {
                stream.send(Packet::empty(PacketType::TunnelClose));
                Ok(())
            }
        }
    }
}

/// One end of a bridge: a writer, and a reader when the bridge drives
/// this direction itself (packet-mode sides are fed by the session layer
/// instead)
pub struct BridgeSide {
    pub reader: Option<ForwardReader>,
    pub writer: ForwardWriter,
}

impl BridgeSide {
    /// Side backed by a raw transport, with any bytes already read past
    /// the packet phase
    pub fn from_io(backend: TransportBackend, buffered: BytesMut) -> Self {
        let (reader, writer) = tokio::io::split(backend);
        Self {
            reader: Some(ForwardReader::Io {
                io: reader,
                buffered,
            }),
            writer: ForwardWriter::Io(writer),
        }
    }

    /// Side backed by a frame stream over a shared cross-node connection
    pub fn from_frame(conn: Arc<CrossNodeConn>, tunnel_id: TunnelId) -> Self {
        let (reader, writer) = frame_stream(conn, tunnel_id);
        Self {
            reader: Some(ForwardReader::Frame(reader)),
            writer: ForwardWriter::Frame(writer),
        }
    }

    /// Side that stays in packet mode; inbound data is routed by the
    /// session layer, outbound data leaves as tunnel data packets
    pub fn packet(stream: PacketTx, send_buffer: Option<Arc<Mutex<SendBuffer>>>) -> Self {
        Self {
            reader: None,
            writer: ForwardWriter::Packet {
                stream,
                send_buffer,
            },
        }
    }
}

/// In-memory pipe for one tunnel
pub struct TunnelBridge {
    tunnel_id: TunnelId,
    mapping_id: MappingId,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    source: Mutex<Option<BridgeSide>>,
    target: Mutex<Option<BridgeSide>>,
    /// Writers retained for directions the session layer feeds directly
    push_to_source: tokio::sync::Mutex<Option<ForwardWriter>>,
    push_to_target: tokio::sync::Mutex<Option<ForwardWriter>>,
    /// Cross-node connection loaned to this bridge, if any
    cross_conn: Mutex<Option<Arc<CrossNodeConn>>>,
    bytes_to_target: AtomicU64,
    bytes_to_source: AtomicU64,
    closed: AtomicBool,
}

impl TunnelBridge {
    pub fn new(tunnel_id: TunnelId, mapping_id: MappingId) -> Arc<Self> {
        let (ready_tx, ready_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = watch::channel(false);
        Arc::new(Self {
            tunnel_id,
            mapping_id,
            ready_tx,
            ready_rx,
            closed_tx,
            closed_rx,
            source: Mutex::new(None),
            target: Mutex::new(None),
            push_to_source: tokio::sync::Mutex::new(None),
            push_to_target: tokio::sync::Mutex::new(None),
            cross_conn: Mutex::new(None),
            bytes_to_target: AtomicU64::new(0),
            bytes_to_source: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn tunnel_id(&self) -> &TunnelId {
        &self.tunnel_id
    }

    pub fn mapping_id(&self) -> &MappingId {
        &self.mapping_id
    }

    pub fn set_source_side(&self, side: BridgeSide) {
        *self.source.lock() = Some(side);
    }

    /// Installs the target side and opens the ready gate
    pub fn set_target_side(&self, side: BridgeSide) {
        *self.target.lock() = Some(side);
        self.notify_target_ready();
    }

    /// Opens the ready gate without installing a local target, used when
    /// the target lives behind a frame stream owned elsewhere. Idempotent.
    pub fn notify_target_ready(&self) {
        let _ = self.ready_tx.send(true);
    }

    /// Waits until the target side is attached or `timeout` elapses
    pub async fn wait_for_target(&self, timeout: Duration) -> Result<(), BridgeError> {
        let mut ready_rx = self.ready_rx.clone();
        let result = match tokio::time::timeout(timeout, ready_rx.wait_for(|ready| *ready)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) | Err(_) => Err(BridgeError::TargetTimeout),
        };
        result
    }

    /// Loans a cross-node connection to this bridge
    pub fn set_cross_conn(&self, conn: Arc<CrossNodeConn>) {
        *self.cross_conn.lock() = Some(conn);
    }

    /// Releases the loaned connection back to the caller, which decides
    /// between returning it to the pool and dropping it
    pub fn take_cross_conn(&self) -> Option<Arc<CrossNodeConn>> {
        self.cross_conn.lock().take()
    }

    pub fn bytes_to_target(&self) -> u64 {
        self.bytes_to_target.load(Ordering::Relaxed)
    }

    pub fn bytes_to_source(&self) -> u64 {
        self.bytes_to_source.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Waits until the bridge has been closed
    pub async fn wait_closed(&self) {
        let mut closed_rx = self.closed_rx.clone();
        let _ = closed_rx.wait_for(|closed| *closed).await;
    }

    /// Runs the data pumps until both directions finish
    ///
    /// Directions whose side has no reader (packet-mode connections) are
    /// not pumped; their writer is retained for [Self::write_to_source] /
    /// [Self::write_to_target] and the pumps that do exist still drive
    /// half-close for their own direction.
    pub async fn run_bidirectional(self: &Arc<Self>) -> Result<(), BridgeError> {
        let source = self.source.lock().take().ok_or(BridgeError::NotPaired)?;
        let target = self.target.lock().take().ok_or(BridgeError::NotPaired)?;

        let mut pumps = Vec::new();

        match source.reader {
            Some(reader) => {
                let counter = self.clone();
                let writer = target.writer;
                pumps.push(tokio::spawn(async move {
                    pump(reader, writer, |n| {
                        counter.bytes_to_target.fetch_add(n, Ordering::Relaxed);
                    })
                    .await
                }));
            }
            None => {
                *self.push_to_target.lock().await = Some(target.writer);
            }
        }

        match target.reader {
            Some(reader) => {
                let counter = self.clone();
                let writer = source.writer;
                pumps.push(tokio::spawn(async move {
                    pump(reader, writer, |n| {
                        counter.bytes_to_source.fetch_add(n, Ordering::Relaxed);
                    })
                    .await
                }));
            }
            None => {
                *self.push_to_source.lock().await = Some(source.writer);
            }
        }

        if pumps.is_empty() {
            // Both sides are packet mode; the session layer drives both
            // directions and closes the bridge itself
            return Ok(());
        }

        for pump in pumps {
            let _ = pump.await;
        }

        self.close().await;
        Ok(())
    }

    /// Feeds data toward the target side (packet-mode source)
    pub async fn write_to_target(&self, data: &[u8]) -> io::Result<()> {
        let mut writer = self.push_to_target.lock().await;
        match writer.as_mut() {
            Some(writer) => {
                writer.write_all(data).await?;
                self.bytes_to_target
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                Ok(())
            }
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Feeds data toward the source side (packet-mode target)
    pub async fn write_to_source(&self, data: &[u8]) -> io::Result<()> {
        let mut writer = self.push_to_source.lock().await;
        match writer.as_mut() {
            Some(writer) => {
                writer.write_all(data).await?;
                self.bytes_to_source
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                Ok(())
            }
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Half-closes a session-fed direction
    pub async fn close_push_writers(&self) {
        if let Some(writer) = self.push_to_target.lock().await.as_mut() {
            let _ = writer.close_write().await;
        }
        if let Some(writer) = self.push_to_source.lock().await.as_mut() {
            let _ = writer.close_write().await;
        }
    }

    /// Marks the bridge closed and drops any retained writers. Safe to
    /// call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(mut writer) = self.push_to_target.lock().await.take() {
            let _ = writer.close_write().await;
        }
        if let Some(mut writer) = self.push_to_source.lock().await.take() {
            let _ = writer.close_write().await;
        }
        let _ = self.closed_tx.send(true);

        debug!(
            "bridge for tunnel {} closed ({}B to target, {}B to source)",
            self.tunnel_id.simple(),
            self.bytes_to_target(),
            self.bytes_to_source()
        );
    }
}

/// Copies one direction until EOF or error, then half-closes the writer
///
/// EOF is the normal end of a direction and is never surfaced as an
/// error; read or write failures just end the direction early.
async fn pump<F>(mut reader: ForwardReader, mut writer: ForwardWriter, count: F) -> u64
where
    F: Fn(u64),
{
    let mut copied = 0u64;
    let mut buf = vec![0u8; PUMP_BUFFER_SIZE];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(err) = writer.write_all(&buf[..n]).await {
                    debug!("tunnel pump write ended: {}", err);
                    break;
                }
                copied += n as u64;
                count(n as u64);
            }
            Err(err) => {
                debug!("tunnel pump read ended: {}", err);
                break;
            }
        }
    }

    if let Err(err) = writer.close_write().await {
        debug!("tunnel pump close ended: {}", err);
    }
    copied
}

#[cfg(test)]
mod test {
    use super::{BridgeError, BridgeSide, TunnelBridge};
    use crate::session::socket::TransportBackend;
    use bytes::BytesMut;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use uuid::Uuid;

    fn io_side(stream: tokio::io::DuplexStream) -> BridgeSide {
        BridgeSide::from_io(TransportBackend::Framed(Box::new(stream)), BytesMut::new())
    }

    /// Bytes cross the bridge in both directions and the byte counters
    /// track each direction
    #[tokio::test]
    async fn test_bidirectional_forward() {
        let (source_peer, source_inner) = tokio::io::duplex(4096);
        let (target_peer, target_inner) = tokio::io::duplex(4096);

        let bridge = TunnelBridge::new(Uuid::new_v4(), "m1".to_string());
        bridge.set_source_side(io_side(source_inner));
        bridge.set_target_side(io_side(target_inner));

        let runner = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.run_bidirectional().await })
        };

        let (mut source_peer_r, mut source_peer_w) = tokio::io::split(source_peer);
        let (mut target_peer_r, mut target_peer_w) = tokio::io::split(target_peer);

        source_peer_w.write_all(b"to-target").await.unwrap();
        let mut buf = [0u8; 9];
        target_peer_r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to-target");

        target_peer_w.write_all(b"to-source!").await.unwrap();
        let mut buf = [0u8; 10];
        source_peer_r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to-source!");

        // Closing both peers ends both pumps
        source_peer_w.shutdown().await.unwrap();
        target_peer_w.shutdown().await.unwrap();
        runner.await.unwrap().unwrap();

        assert_eq!(bridge.bytes_to_target(), 9);
        assert_eq!(bridge.bytes_to_source(), 10);
        assert!(bridge.is_closed());
    }

    /// Buffered bytes captured before the handoff are delivered ahead of
    /// fresh transport reads
    #[tokio::test]
    async fn test_buffered_bytes_flushed_first() {
        let (source_peer, source_inner) = tokio::io::duplex(4096);
        let (target_peer, target_inner) = tokio::io::duplex(4096);

        let bridge = TunnelBridge::new(Uuid::new_v4(), "m1".to_string());
        bridge.set_source_side(BridgeSide::from_io(
            TransportBackend::Framed(Box::new(source_inner)),
            BytesMut::from(&b"early-"[..]),
        ));
        bridge.set_target_side(io_side(target_inner));

        let runner = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.run_bidirectional().await })
        };

        let (_source_peer_r, mut source_peer_w) = tokio::io::split(source_peer);
        let (mut target_peer_r, mut target_peer_w) = tokio::io::split(target_peer);

        source_peer_w.write_all(b"late").await.unwrap();

        let mut buf = [0u8; 10];
        target_peer_r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early-late");

        source_peer_w.shutdown().await.unwrap();
        target_peer_w.shutdown().await.unwrap();
        let _ = runner.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_target_timeout() {
        let bridge = TunnelBridge::new(Uuid::new_v4(), "m1".to_string());
        let result = bridge.wait_for_target(Duration::from_secs(5)).await;
        assert!(matches!(result, Err(BridgeError::TargetTimeout)));
    }

    #[tokio::test]
    async fn test_ready_gate_is_idempotent() {
        let bridge = TunnelBridge::new(Uuid::new_v4(), "m1".to_string());
        bridge.notify_target_ready();
        bridge.notify_target_ready();
        bridge
            .wait_for_target(Duration::from_millis(50))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_without_sides_fails() {
        let bridge = TunnelBridge::new(Uuid::new_v4(), "m1".to_string());
        assert!(matches!(
            bridge.run_bidirectional().await,
            Err(BridgeError::NotPaired)
        ));
    }
}
