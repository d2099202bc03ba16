//! Pooled TCP connections between gateway nodes
//!
//! A [CrossNodeConn] wraps one TCP connection to a peer node with
//! single-reader / single-writer locking so several frame streams can
//! share it. [NodeConnectionPool] bounds how many such connections exist
//! per peer and recycles idle ones.

use super::frame::{read_frame, write_frame, Frame, FrameError};
use crate::utils::types::NodeId;
use log::{debug, warn};
use parking_lot::Mutex;
use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::mpsc,
    time::Instant,
};

/// Tunables for the per-peer connection pools
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    /// Connections kept alive through idle cleanup
    pub min_conns: usize,
    /// Hard cap on concurrent connections per peer
    pub max_conns: usize,
    /// Time allowed for a dial (and for waiting on a free connection)
    pub dial_timeout: Duration,
    /// Idle age after which a pooled connection is dropped
    pub idle_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_conns: 2,
            max_conns: 10,
            dial_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("refusing to dial own node {0}")]
    SelfDial(NodeId),
    #[error("timed out waiting for a connection to node {0}")]
    Timeout(NodeId),
    #[error("connection pool for node {0} is closed")]
    Closed(NodeId),
    #[error("failed to dial node {0}: {1}")]
    Dial(NodeId, io::Error),
}

/// One TCP connection to a peer node
///
/// Reads and writes are independently serialised; whichever task drives a
/// frame exchange owns the respective half for the duration of one frame.
pub struct CrossNodeConn {
    node_id: NodeId,
    reader: tokio::sync::Mutex<OwnedReadHalf>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    broken: AtomicBool,
    in_use: AtomicBool,
    last_used: Mutex<Instant>,
}

impl CrossNodeConn {
    pub fn new(node_id: NodeId, stream: TcpStream) -> Arc<Self> {
        let (reader, writer) = stream.into_split();
        Arc::new(Self {
            node_id,
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            broken: AtomicBool::new(false),
            in_use: AtomicBool::new(false),
            last_used: Mutex::new(Instant::now()),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Writes one frame, header and payload atomically with respect to
    /// other writers on this connection
    pub async fn write_frame(&self, frame: &Frame) -> Result<(), FrameError> {
        let mut writer = self.writer.lock().await;
        match write_frame(&mut *writer, frame).await {
            Ok(()) => {
                self.touch();
                Ok(())
            }
            Err(err) => {
                self.mark_broken();
                Err(err)
            }
        }
    }

    /// Reads one frame; exactly one task may be draining frames at a time
    pub async fn read_frame(&self) -> Result<Option<Frame>, FrameError> {
        let mut reader = self.reader.lock().await;
        match read_frame(&mut *reader).await {
            Ok(frame) => {
                self.touch();
                Ok(frame)
            }
            Err(err) => {
                self.mark_broken();
                Err(err)
            }
        }
    }

    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub fn is_healthy(&self) -> bool {
        !self.broken.load(Ordering::SeqCst)
    }

    pub fn set_in_use(&self, in_use: bool) {
        self.in_use.store(in_use, Ordering::SeqCst);
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }
}

struct PoolState {
    /// Connections currently alive (idle or handed out)
    active: usize,
    closed: bool,
}

/// Bounded pool of [CrossNodeConn]s to a single peer node
pub struct NodeConnectionPool {
    node_id: NodeId,
    node_addr: String,
    options: PoolOptions,
    idle_tx: mpsc::Sender<Arc<CrossNodeConn>>,
    idle_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<CrossNodeConn>>>,
    state: Mutex<PoolState>,
}

impl NodeConnectionPool {
    /// Attempts to pop a healthy idle connection before dialing
    const IDLE_POP_ATTEMPTS: usize = 3;

    pub fn new(node_id: NodeId, node_addr: String, options: PoolOptions) -> Self {
        let (idle_tx, idle_rx) = mpsc::channel(options.max_conns.max(1));
        Self {
            node_id,
            node_addr,
            options,
            idle_tx,
            idle_rx: tokio::sync::Mutex::new(idle_rx),
            state: Mutex::new(PoolState {
                active: 0,
                closed: false,
            }),
        }
    }

    /// Obtains a connection: a pooled one when available, a fresh dial
    /// when under the cap, otherwise blocks until one is released or the
    /// dial timeout elapses
    pub async fn get(&self) -> Result<Arc<CrossNodeConn>, PoolError> {
        {
            let mut idle_rx = self.idle_rx.lock().await;
            for _ in 0..Self::IDLE_POP_ATTEMPTS {
                match idle_rx.try_recv() {
                    Ok(conn) => {
                        if conn.is_healthy() {
                            conn.set_in_use(true);
                            return Ok(conn);
                        }
                        // Unhealthy entries just drain out of the pool
                        self.drop_active();
                    }
                    Err(_) => break,
                }
            }
        }

        let may_dial = {
            let state = &mut *self.state.lock();
            if state.closed {
                return Err(PoolError::Closed(self.node_id.clone()));
            }
            if state.active < self.options.max_conns {
                state.active += 1;
                true
            } else {
                false
            }
        };

        if may_dial {
            return match self.dial().await {
                Ok(conn) => Ok(conn),
                Err(err) => {
                    self.drop_active();
                    Err(err)
                }
            };
        }

        // At the cap: wait for a connection to come back
        let mut idle_rx = self.idle_rx.lock().await;
        match tokio::time::timeout(self.options.dial_timeout, idle_rx.recv()).await {
            Ok(Some(conn)) => {
                if conn.is_healthy() {
                    conn.set_in_use(true);
                    Ok(conn)
                } else {
                    self.drop_active();
                    Err(PoolError::Timeout(self.node_id.clone()))
                }
            }
            Ok(None) => Err(PoolError::Closed(self.node_id.clone())),
            Err(_) => Err(PoolError::Timeout(self.node_id.clone())),
        }
    }

    async fn dial(&self) -> Result<Arc<CrossNodeConn>, PoolError> {
        let stream = match tokio::time::timeout(
            self.options.dial_timeout,
            TcpStream::connect(&self.node_addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(PoolError::Dial(self.node_id.clone(), err)),
            Err(_) => return Err(PoolError::Timeout(self.node_id.clone())),
        };

        debug!(
            "dialed cross-node connection to {} at {}",
            self.node_id, self.node_addr
        );
        let conn = CrossNodeConn::new(self.node_id.clone(), stream);
        conn.set_in_use(true);
        Ok(conn)
    }

    /// Returns a connection to the pool, closing it when it is broken,
    /// the pool is closed, or the idle queue is full
    pub fn put(&self, conn: Arc<CrossNodeConn>) {
        conn.set_in_use(false);

        let closed = self.state.lock().closed;
        if closed || !conn.is_healthy() {
            self.drop_active();
            return;
        }

        if self.idle_tx.try_send(conn).is_err() {
            // Idle queue full
            self.drop_active();
        }
    }

    /// Drops a connection from the pool entirely (broken or superfluous)
    pub fn remove(&self, conn: Arc<CrossNodeConn>) {
        conn.mark_broken();
        drop(conn);
        self.drop_active();
    }

    fn drop_active(&self) {
        let state = &mut *self.state.lock();
        state.active = state.active.saturating_sub(1);
    }

    pub fn active(&self) -> usize {
        self.state.lock().active
    }

    /// Drops idle connections past the idle timeout while staying above
    /// the configured minimum, stopping at the first fresh entry
    pub async fn cleanup_idle(&self) {
        let mut survivors = Vec::new();
        {
            let mut idle_rx = self.idle_rx.lock().await;
            loop {
                let conn = match idle_rx.try_recv() {
                    Ok(conn) => conn,
                    Err(_) => break,
                };

                let stale = conn.idle_for() > self.options.idle_timeout;
                if stale && self.active() > self.options.min_conns {
                    debug!("dropping idle cross-node connection to {}", self.node_id);
                    self.drop_active();
                    continue;
                }

                // First non-stale entry ends the scan
                survivors.push(conn);
                if !stale {
                    break;
                }
            }
        }

        for conn in survivors {
            if self.idle_tx.try_send(conn).is_err() {
                self.drop_active();
            }
        }
    }

    /// Closes the pool, draining the idle queue
    pub async fn close(&self) {
        self.state.lock().closed = true;

        let mut idle_rx = self.idle_rx.lock().await;
        while idle_rx.try_recv().is_ok() {
            self.drop_active();
        }
    }
}

impl Drop for NodeConnectionPool {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.active > 0 && !state.closed {
            warn!(
                "connection pool for {} dropped with {} active connections",
                self.node_id, state.active
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::{NodeConnectionPool, PoolError, PoolOptions};
    use std::{sync::Arc, time::Duration};
    use tokio::net::TcpListener;

    /// Starts a listener that accepts and holds connections open
    async fn echo_listener() -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        (addr, handle)
    }

    fn options(max_conns: usize) -> PoolOptions {
        PoolOptions {
            min_conns: 1,
            max_conns,
            dial_timeout: Duration::from_millis(500),
            idle_timeout: Duration::from_secs(300),
        }
    }

    #[tokio::test]
    async fn test_get_put_reuses_connection() {
        let (addr, _listener) = echo_listener().await;
        let pool = NodeConnectionPool::new("peer".to_string(), addr, options(4));

        let conn = pool.get().await.unwrap();
        assert_eq!(pool.active(), 1);
        assert!(conn.is_in_use());

        pool.put(conn);
        assert_eq!(pool.active(), 1);

        let again = pool.get().await.unwrap();
        assert_eq!(pool.active(), 1);
        pool.put(again);
    }

    /// Concurrent getters never open more than `max_conns` connections
    #[tokio::test]
    async fn test_concurrent_gets_respect_cap() {
        let (addr, _listener) = echo_listener().await;
        let pool = Arc::new(NodeConnectionPool::new(
            "peer".to_string(),
            addr,
            options(3),
        ));

        let mut tasks = Vec::new();
        for _ in 0..12 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                match pool.get().await {
                    Ok(conn) => {
                        // Hold briefly, then release
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        pool.put(conn);
                        true
                    }
                    Err(PoolError::Timeout(_)) => false,
                    Err(err) => panic!("unexpected pool error: {err}"),
                }
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
        assert!(pool.active() <= 3);
    }

    #[tokio::test]
    async fn test_broken_connection_not_reused() {
        let (addr, _listener) = echo_listener().await;
        let pool = NodeConnectionPool::new("peer".to_string(), addr, options(2));

        let conn = pool.get().await.unwrap();
        conn.mark_broken();
        pool.put(conn);
        assert_eq!(pool.active(), 0);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_get() {
        let (addr, _listener) = echo_listener().await;
        let pool = NodeConnectionPool::new("peer".to_string(), addr, options(2));
        pool.close().await;

        assert!(matches!(pool.get().await, Err(PoolError::Closed(_))));
    }

    #[tokio::test]
    async fn test_cleanup_idle_respects_min() {
        let (addr, _listener) = echo_listener().await;
        let pool = NodeConnectionPool::new(
            "peer".to_string(),
            addr,
            PoolOptions {
                min_conns: 1,
                max_conns: 4,
                dial_timeout: Duration::from_secs(1),
                idle_timeout: Duration::from_millis(50),
            },
        );

        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        pool.put(a);
        pool.put(b);
        assert_eq!(pool.active(), 2);

        tokio::time::sleep(Duration::from_millis(120)).await;
        pool.cleanup_idle().await;

        // One stale connection dropped, the minimum retained
        assert_eq!(pool.active(), 1);
    }
}
