//! Transport plumbing between raw byte streams and the packet layer
//!
//! Transports are an explicit sum type rather than trait probing: every
//! backend is a byte stream, and the packet layer sits on top through
//! [PacketSocket]. HTTP long-polling is adapted into a byte stream by
//! [PollingAdapter], which buffers undelivered bytes and surfaces EOF when
//! the poll channel closes.

use super::packet::{Packet, PacketCodec};
use bytes::{Buf, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
    sync::{mpsc, watch},
};
use tokio_util::codec::Framed;

/// Byte stream trait object bound for generic framed transports
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> AsyncIo for T {}

/// The transports a connection can arrive over
pub enum TransportBackend {
    /// Plain TCP stream
    RawTcp(TcpStream),
    /// Any already-framed byte stream (WebSocket bridge, QUIC stream,
    /// in-memory pipe in tests)
    Framed(Box<dyn AsyncIo>),
    /// HTTP long-polling adapted into a byte stream
    HttpPoll(PollingAdapter),
}

impl TransportBackend {
    /// Protocol tag recorded in registries and presence records
    pub fn protocol(&self) -> &'static str {
        match self {
            TransportBackend::RawTcp(_) => "tcp",
            TransportBackend::Framed(_) => "framed",
            TransportBackend::HttpPoll(_) => "http-poll",
        }
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        match self {
            TransportBackend::RawTcp(stream) => stream.peer_addr().ok(),
            _ => None,
        }
    }
}

impl AsyncRead for TransportBackend {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TransportBackend::RawTcp(stream) => Pin::new(stream).poll_read(cx, buf),
            TransportBackend::Framed(stream) => Pin::new(stream).poll_read(cx, buf),
            TransportBackend::HttpPoll(adapter) => Pin::new(adapter).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TransportBackend {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            TransportBackend::RawTcp(stream) => Pin::new(stream).poll_write(cx, buf),
            TransportBackend::Framed(stream) => Pin::new(stream).poll_write(cx, buf),
            TransportBackend::HttpPoll(adapter) => Pin::new(adapter).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TransportBackend::RawTcp(stream) => Pin::new(stream).poll_flush(cx),
            TransportBackend::Framed(stream) => Pin::new(stream).poll_flush(cx),
            TransportBackend::HttpPoll(adapter) => Pin::new(adapter).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TransportBackend::RawTcp(stream) => Pin::new(stream).poll_shutdown(cx),
            TransportBackend::Framed(stream) => Pin::new(stream).poll_shutdown(cx),
            TransportBackend::HttpPoll(adapter) => Pin::new(adapter).poll_shutdown(cx),
        }
    }
}

/// Handle held by the HTTP layer driving a long-polling connection
pub struct PollingHandle {
    /// Bytes received from the client are pushed here
    pub push_tx: mpsc::UnboundedSender<Bytes>,
    /// Bytes for the client are pulled from here
    pub pull_rx: mpsc::UnboundedReceiver<Bytes>,
}

/// Byte stream over a push/pull long-polling exchange
///
/// Pushed chunks are buffered until the reader consumes them; a closed push
/// channel is a clean EOF rather than a zero-length read loop.
pub struct PollingAdapter {
    incoming: mpsc::UnboundedReceiver<Bytes>,
    outgoing: mpsc::UnboundedSender<Bytes>,
    /// Bytes accepted from the channel but not yet read by the caller
    leftover: BytesMut,
    write_closed: bool,
}

impl PollingAdapter {
    pub fn new() -> (PollingAdapter, PollingHandle) {
        let (push_tx, incoming) = mpsc::unbounded_channel();
        let (outgoing, pull_rx) = mpsc::unbounded_channel();
        (
            PollingAdapter {
                incoming,
                outgoing,
                leftover: BytesMut::new(),
                write_closed: false,
            },
            PollingHandle { push_tx, pull_rx },
        )
    }
}

impl AsyncRead for PollingAdapter {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.leftover.is_empty() {
            match ready!(this.incoming.poll_recv(cx)) {
                Some(bytes) => this.leftover.extend_from_slice(&bytes),
                // Push side closed: clean EOF
                None => return Poll::Ready(Ok(())),
            }
        }

        let take = this.leftover.len().min(buf.remaining());
        buf.put_slice(&this.leftover[..take]);
        this.leftover.advance(take);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for PollingAdapter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if this.outgoing.send(Bytes::copy_from_slice(buf)).is_err() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().write_closed = true;
        Poll::Ready(Ok(()))
    }
}

/// Packet-framed view over a transport
pub struct PacketSocket {
    io: Framed<TransportBackend, PacketCodec>,
}

impl PacketSocket {
    pub fn new(backend: TransportBackend) -> Self {
        Self {
            io: Framed::new(backend, PacketCodec),
        }
    }

    /// Reads the next packet, [None] when the transport closed cleanly
    pub async fn read_packet(&mut self) -> io::Result<Option<Packet>> {
        match self.io.next().await {
            Some(result) => result.map(Some),
            None => Ok(None),
        }
    }

    pub async fn write_packet(&mut self, packet: Packet) -> io::Result<()> {
        self.io.send(packet).await
    }

    /// Tears the socket down into its transport and any bytes that were
    /// read past the last decoded packet
    pub fn into_parts(self) -> (TransportBackend, BytesMut) {
        let parts = self.io.into_parts();
        (parts.io, parts.read_buf)
    }

    /// Converts the socket into a channelled task: inbound packets arrive
    /// on the returned receiver, outbound packets are queued through the
    /// [PacketTx]. The task ends when the transport closes, the handle is
    /// closed, or every sender is dropped.
    pub fn into_channelled(self) -> (SocketTask, mpsc::UnboundedReceiver<Packet>, PacketTx) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(false);

        let task = SocketTask {
            io: self.io,
            inbound_tx,
            outbound_rx,
            close_rx,
        };

        let handle = PacketTx {
            tx: outbound_tx,
            close: Arc::new(close_tx),
        };

        (task, inbound_rx, handle)
    }
}

/// Cloneable writer handle to a channelled socket
#[derive(Clone)]
pub struct PacketTx {
    tx: mpsc::UnboundedSender<Packet>,
    close: Arc<watch::Sender<bool>>,
}

impl PacketTx {
    /// Queues a packet for writing, false when the socket has gone away
    pub fn send(&self, packet: Packet) -> bool {
        self.tx.send(packet).is_ok()
    }

    /// Asks the socket task to flush and close the transport
    pub fn close(&self) {
        let _ = self.close.send(true);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Driver task for a channelled socket
pub struct SocketTask {
    io: Framed<TransportBackend, PacketCodec>,
    inbound_tx: mpsc::UnboundedSender<Packet>,
    outbound_rx: mpsc::UnboundedReceiver<Packet>,
    close_rx: watch::Receiver<bool>,
}

/// Event resolved by one iteration of the socket loop
enum SocketEvent {
    Inbound(Option<io::Result<Packet>>),
    Outbound(Option<Packet>),
    Close,
}

impl SocketTask {
    pub async fn run(mut self) -> io::Result<()> {
        loop {
            let event = tokio::select! {
                result = self.io.next() => SocketEvent::Inbound(result),
                outbound = self.outbound_rx.recv() => SocketEvent::Outbound(outbound),
                result = self.close_rx.changed() => {
                    if result.is_err() || *self.close_rx.borrow() {
                        SocketEvent::Close
                    } else {
                        continue;
                    }
                }
            };

            match event {
                SocketEvent::Inbound(Some(Ok(packet))) => {
                    if self.inbound_tx.send(packet).is_err() {
                        // Receiver dropped, the session is gone
                        break;
                    }
                }
                SocketEvent::Inbound(Some(Err(err))) => return Err(err),
                // Transport closed
                SocketEvent::Inbound(None) => break,
                SocketEvent::Outbound(Some(packet)) => self.io.send(packet).await?,
                // All writer handles dropped
                SocketEvent::Outbound(None) => break,
                SocketEvent::Close => {
                    // Flush anything queued before the close was requested
                    while let Ok(packet) = self.outbound_rx.try_recv() {
                        self.io.send(packet).await?;
                    }
                    break;
                }
            }
        }

        self.io.close().await
    }
}
