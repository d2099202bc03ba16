//! Session manager: owns the registries, bridges, pools and waiter maps
//! and routes every packet that arrives on a client-facing connection.

use super::{
    bridge::{BridgeError, BridgeSide, TunnelBridge},
    buffers::{BufferError, ReceiveBuffer, SendBuffer},
    commands,
    models::{
        CommandPacket, CommandType, ConnectionType, HandshakeRequest, HandshakeResponse,
        HttpProxyResponseBody, NotifyAckResponse, ServerShutdownBody, TunnelInviteBody,
        TunnelOpenAck, TunnelOpenRequest,
    },
    packet::{Packet, PacketDebug, PacketType},
    registry::{
        ClientRegistry, ControlConnection, RegistryError, TunnelConnection, TunnelRegistry,
    },
    socket::{PacketSocket, PacketTx, TransportBackend},
    state_store::{ConnType, ConnectionStateInfo, ConnectionStateStore, StateError, TunnelWaitingState},
    tunnel_state::{
        ReconnectTokens, TunnelMigrationManager, TunnelState, TunnelStateError, TunnelStateManager,
    },
    waiters::{ResponseWaiters, WaitError},
};
use crate::{
    cloud::{CloudControl, CloudError, PortMapping},
    cross_node::{
        conn::{CrossNodeConn, PoolError, PoolOptions},
        frame::{Frame, FrameType},
        CrossNodePool,
    },
    storage::Storage,
    utils::{
        random::ConnIdGenerator,
        signing::SigningKey,
        types::{ClientId, ConnId, NodeId, TunnelId},
    },
};
use bytes::Bytes;
use hashbrown::HashMap;
use log::{debug, error, log_enabled, warn, Level};
use parking_lot::Mutex;
use std::{
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{net::TcpStream, sync::mpsc, sync::watch, time::Instant};
use uuid::Uuid;

/// How long a handshake may take before the connection is dropped
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a target waits for the waiting-tunnel routing record
const WAITING_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a target waits for a local bridge to materialise
const LOCAL_BRIDGE_TIMEOUT: Duration = Duration::from_secs(5);
/// Poll interval for both of the waits above
const LOOKUP_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long a listen-side bridge waits for its target before giving up
const TARGET_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default wait for a relayed HTTP proxy response
pub const HTTP_PROXY_TIMEOUT: Duration = Duration::from_secs(30);
/// Default wait for a relayed DNS response
pub const DNS_TIMEOUT: Duration = Duration::from_secs(5);
/// Interval between retransmit sweeps on a sequenced tunnel
const RESEND_CHECK_INTERVAL: Duration = Duration::from_secs(1);
/// Drain pause after a shutdown broadcast
const SHUTDOWN_DRAIN: Duration = Duration::from_millis(500);
/// Poll interval while waiting for tunnels to finish
const TUNNEL_DRAIN_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid packet: {0}")]
    InvalidPacket(String),
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("connection limit reached")]
    QuotaExceeded,
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("cancelled by shutdown")]
    Cancelled,
    #[error(transparent)]
    Network(#[from] io::Error),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    TunnelState(#[from] TunnelStateError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error(transparent)]
    Cloud(#[from] CloudError),
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<WaitError> for SessionError {
    fn from(err: WaitError) -> Self {
        match err {
            WaitError::Timeout => SessionError::Timeout("response wait".to_string()),
            WaitError::Cancelled => SessionError::Cancelled,
            WaitError::Closed => SessionError::Cancelled,
        }
    }
}

/// Tunables for the session manager
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub node_id: NodeId,
    /// Cap on concurrent connections of any kind
    pub max_connections: Option<usize>,
    /// Cap on concurrent control connections
    pub max_control_connections: Option<usize>,
    /// Inactivity span after which a control connection is stale
    pub heartbeat_timeout: Duration,
    /// Interval of the stale-connection sweep
    pub cleanup_interval: Duration,
    /// TTL for presence records in the shared store
    pub state_ttl: Duration,
    /// TTL for waiting-tunnel routing records
    pub waiting_ttl: Duration,
    pub pool: PoolOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            max_connections: None,
            max_control_connections: None,
            heartbeat_timeout: Duration::from_secs(90),
            cleanup_interval: Duration::from_secs(30),
            state_ttl: Duration::from_secs(5 * 60),
            waiting_ttl: Duration::from_secs(10),
            pool: PoolOptions::default(),
        }
    }
}

/// Identity of the control connection a packet arrived on
#[derive(Clone)]
pub struct ControlContext {
    pub conn_id: ConnId,
    pub client_id: ClientId,
    pub stream: PacketTx,
}

/// Which bridge direction a packet-mode tunnel connection feeds
#[derive(Copy, Clone, PartialEq, Eq)]
enum TunnelRole {
    Source,
    Target,
}

pub struct SessionManager {
    options: SessionOptions,
    id_generator: ConnIdGenerator,
    storage: Arc<dyn Storage>,
    cloud: Arc<dyn CloudControl>,
    pub(crate) clients: ClientRegistry,
    pub(crate) tunnels: TunnelRegistry,
    state_store: Arc<ConnectionStateStore>,
    cross_pool: Arc<CrossNodePool>,
    bridges: Mutex<HashMap<TunnelId, Arc<TunnelBridge>>>,
    tunnel_states: Arc<TunnelStateManager>,
    migrations: TunnelMigrationManager,
    reconnect_tokens: Option<ReconnectTokens>,
    /// Response waiters, one map per response kind
    pub(crate) http_proxy_waiters: ResponseWaiters<HttpProxyResponseBody>,
    pub(crate) dns_resolve_waiters: ResponseWaiters<super::models::DnsResolveResponse>,
    pub(crate) dns_query_waiters: ResponseWaiters<super::models::DnsQueryResponse>,
    pub(crate) notify_waiters: ResponseWaiters<NotifyAckResponse>,
    pub(crate) tunnel_open_waiters: ResponseWaiters<TunnelOpenAck>,
    /// Connections currently alive, of any kind
    connection_count: AtomicUsize,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SessionManager {
    pub fn new(
        options: SessionOptions,
        storage: Arc<dyn Storage>,
        cloud: Arc<dyn CloudControl>,
        signing_secret: &str,
    ) -> Arc<Self> {
        let state_store = Arc::new(ConnectionStateStore::new(
            storage.clone(),
            options.node_id.clone(),
            options.state_ttl,
        ));
        let cross_pool = Arc::new(CrossNodePool::new(
            options.node_id.clone(),
            state_store.clone(),
            options.pool,
        ));
        let tunnel_states = Arc::new(TunnelStateManager::new(
            storage.clone(),
            SigningKey::from_secret(signing_secret),
        ));
        let migrations = TunnelMigrationManager::new(tunnel_states.clone());
        let reconnect_tokens = Some(ReconnectTokens::new(SigningKey::from_secret(signing_secret)));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Arc::new(Self {
            clients: ClientRegistry::new(options.max_control_connections),
            tunnels: TunnelRegistry::default(),
            id_generator: ConnIdGenerator,
            storage,
            cloud,
            state_store,
            cross_pool,
            bridges: Mutex::new(HashMap::new()),
            tunnel_states,
            migrations,
            reconnect_tokens,
            http_proxy_waiters: ResponseWaiters::default(),
            dns_resolve_waiters: ResponseWaiters::default(),
            dns_query_waiters: ResponseWaiters::default(),
            notify_waiters: ResponseWaiters::default(),
            tunnel_open_waiters: ResponseWaiters::default(),
            connection_count: AtomicUsize::new(0),
            shutdown_tx,
            shutdown_rx,
            options,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.options.node_id
    }

    pub fn state_store(&self) -> &Arc<ConnectionStateStore> {
        &self.state_store
    }

    pub fn tunnel_states(&self) -> &Arc<TunnelStateManager> {
        &self.tunnel_states
    }

    pub fn migrations(&self) -> &TunnelMigrationManager {
        &self.migrations
    }

    pub fn cross_pool(&self) -> &Arc<CrossNodePool> {
        &self.cross_pool
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn next_conn_id(&self) -> ConnId {
        self.id_generator.next_id()
    }

    pub fn get_active_tunnel_count(&self) -> usize {
        self.tunnels.count()
    }

    /// Waits until a target binds the provided tunnel, used by
    /// port-mapping front-ends that hold the user socket open until the
    /// data path is up
    pub async fn wait_for_tunnel_open(
        &self,
        tunnel_id: &TunnelId,
        timeout: Duration,
    ) -> Result<TunnelOpenAck, SessionError> {
        let key = tunnel_id.simple().to_string();
        let rx = self.tunnel_open_waiters.register(&key);
        self.tunnel_open_waiters
            .wait_for_response(&key, rx, timeout, self.shutdown_rx.clone())
            .await
            .map_err(SessionError::from)
    }

    /// Resolves any waiter parked on the tunnel becoming ready
    fn resolve_tunnel_open(&self, tunnel_id: &TunnelId, sequenced: bool) {
        let key = tunnel_id.simple().to_string();
        if !self.tunnel_open_waiters.has_waiter(&key) {
            return;
        }
        self.tunnel_open_waiters.handle_response(
            &key,
            TunnelOpenAck {
                tunnel_id: *tunnel_id,
                success: true,
                sequenced,
                error: None,
            },
        );
    }

    pub fn get_bridge(&self, tunnel_id: &TunnelId) -> Option<Arc<TunnelBridge>> {
        self.bridges.lock().get(tunnel_id).cloned()
    }

    fn insert_bridge(&self, bridge: Arc<TunnelBridge>) {
        self.bridges.lock().insert(*bridge.tunnel_id(), bridge);
    }

    fn remove_bridge(&self, tunnel_id: &TunnelId) -> Option<Arc<TunnelBridge>> {
        self.bridges.lock().remove(tunnel_id)
    }

    fn debug_log_packet(&self, action: &'static str, conn_id: &str, packet: &Packet) {
        if !log_enabled!(Level::Debug) {
            return;
        }
        // Heartbeats are too frequent to be worth logging
        if packet.header.ty == PacketType::Heartbeat {
            return;
        }
        debug!(
            "{} packet on {}\n{:?}",
            action,
            conn_id,
            PacketDebug { packet }
        );
    }

    /// Accepts a new client-facing connection and drives it for its whole
    /// lifetime. The task calling this owns the connection.
    pub async fn accept_connection(
        self: &Arc<Self>,
        backend: TransportBackend,
    ) -> Result<(), SessionError> {
        self.accept_connection_with_id(backend, None).await
    }

    /// As [Self::accept_connection], reusing a transport-provided
    /// connection id when one exists
    pub async fn accept_connection_with_id(
        self: &Arc<Self>,
        backend: TransportBackend,
        conn_id: Option<ConnId>,
    ) -> Result<(), SessionError> {
        if let Some(limit) = self.options.max_connections {
            if self.connection_count.load(Ordering::SeqCst) >= limit {
                return Err(SessionError::QuotaExceeded);
            }
        }
        self.connection_count.fetch_add(1, Ordering::SeqCst);

        let conn_id = conn_id.unwrap_or_else(|| self.next_conn_id());
        let result = self.drive_connection(backend, conn_id.clone()).await;

        self.connection_count.fetch_sub(1, Ordering::SeqCst);
        self.close_connection(&conn_id).await;
        result
    }

    async fn drive_connection(
        self: &Arc<Self>,
        backend: TransportBackend,
        conn_id: ConnId,
    ) -> Result<(), SessionError> {
        let protocol = backend.protocol();
        let remote_addr = backend.remote_addr();
        let mut socket = PacketSocket::new(backend);

        // The first packet must be a handshake
        let packet = tokio::time::timeout(HANDSHAKE_TIMEOUT, socket.read_packet())
            .await
            .map_err(|_| SessionError::Timeout("handshake".to_string()))??
            .ok_or_else(|| SessionError::InvalidPacket("closed before handshake".to_string()))?;

        if packet.header.ty != PacketType::Handshake {
            return Err(SessionError::InvalidPacket(format!(
                "expected handshake, got {:?}",
                packet.header.ty
            )));
        }

        let request: HandshakeRequest = packet
            .deserialize()
            .map_err(|err| SessionError::InvalidPacket(err.to_string()))?;

        match request.connection_type {
            ConnectionType::Control => {
                self.run_control_connection(socket, conn_id, protocol, remote_addr, request)
                    .await
            }
            ConnectionType::Tunnel => {
                self.run_tunnel_connection(socket, conn_id, protocol, remote_addr, request)
                    .await
            }
        }
    }

    async fn reject_handshake(
        &self,
        socket: &mut PacketSocket,
        conn_id: &str,
        error: &str,
    ) -> Result<(), SessionError> {
        let response = HandshakeResponse {
            success: false,
            conn_id: conn_id.to_string(),
            error: Some(error.to_string()),
        };
        socket
            .write_packet(Packet::json(PacketType::HandshakeResp, &response)?)
            .await?;
        Err(SessionError::AuthFailed(error.to_string()))
    }

    // ---- control connections -------------------------------------------

    async fn run_control_connection(
        self: &Arc<Self>,
        mut socket: PacketSocket,
        conn_id: ConnId,
        protocol: &'static str,
        remote_addr: Option<std::net::SocketAddr>,
        request: HandshakeRequest,
    ) -> Result<(), SessionError> {
        // Token verification is owned by the auth layer; the session core
        // requires a client identity and a credential to be present
        let client_id = match (request.client_id, &request.token) {
            (Some(client_id), Some(token)) if client_id > 0 && !token.is_empty() => client_id,
            _ => {
                return self
                    .reject_handshake(&mut socket, &conn_id, "missing client credentials")
                    .await
            }
        };
        let user_id = request.user_id.unwrap_or_default();

        socket
            .write_packet(Packet::json(
                PacketType::HandshakeResp,
                &HandshakeResponse {
                    success: true,
                    conn_id: conn_id.clone(),
                    error: None,
                },
            )?)
            .await?;

        let (task, mut inbound_rx, stream) = socket.into_channelled();
        let socket_task = tokio::spawn(task.run());

        // A client logging in twice replaces its previous session
        let kicked = self.clients.kick_old_connection(client_id, &conn_id, |old| {
            commands::send_kick(
                old,
                super::models::kick_codes::DUPLICATE_LOGIN,
                "logged in from another connection",
            );
        });
        if kicked {
            debug!("kicked previous connection of client {}", client_id);
        }

        let mut row = ControlConnection::new(conn_id.clone(), protocol, remote_addr);
        row.client_id = client_id;
        row.user_id = user_id;
        row.authenticated = true;
        row.stream = Some(stream.clone());
        self.clients.register(row)?;

        if let Err(err) = self
            .state_store
            .register_connection(ConnectionStateInfo {
                connection_id: conn_id.clone(),
                client_id,
                node_id: String::new(),
                protocol: protocol.to_string(),
                conn_type: ConnType::Control,
                mapping_id: None,
                created_at: chrono::Utc::now(),
                expires_at: chrono::Utc::now(),
            })
            .await
        {
            warn!("failed to publish presence for {}: {}", conn_id, err);
        }

        debug!(
            "control connection {} established for client {} over {}",
            conn_id, client_id, protocol
        );

        let ctx = ControlContext {
            conn_id: conn_id.clone(),
            client_id,
            stream,
        };

        // Packet loop: ends when the transport closes or the registry
        // kicks this connection (closing its stream handle)
        while let Some(packet) = inbound_rx.recv().await {
            self.debug_log_packet("read", &conn_id, &packet);
            if let Err(err) = self.handle_control_packet(&ctx, packet).await {
                warn!("error handling packet on {}: {}", conn_id, err);
            }
        }

        socket_task.abort();
        Ok(())
    }

    async fn handle_control_packet(
        self: &Arc<Self>,
        ctx: &ControlContext,
        packet: Packet,
    ) -> Result<(), SessionError> {
        match packet.header.ty {
            PacketType::Heartbeat => self.handle_heartbeat(ctx).await,
            PacketType::JsonCommand => {
                let command: CommandPacket = packet
                    .deserialize()
                    .map_err(|err| SessionError::InvalidPacket(err.to_string()))?;
                if let Some(response) = commands::execute_command(self, ctx, command).await {
                    ctx.stream
                        .send(Packet::json(PacketType::CommandResp, &response)?);
                }
                Ok(())
            }
            PacketType::CommandResp => {
                let command: CommandPacket = packet
                    .deserialize()
                    .map_err(|err| SessionError::InvalidPacket(err.to_string()))?;
                commands::handle_command_response(self, command);
                Ok(())
            }
            other => Err(SessionError::InvalidPacket(format!(
                "unexpected {:?} on control connection",
                other
            ))),
        }
    }

    async fn handle_heartbeat(&self, ctx: &ControlContext) -> Result<(), SessionError> {
        self.clients.touch(&ctx.conn_id);
        if let Err(err) = self.state_store.refresh_connection(&ctx.conn_id).await {
            debug!("presence refresh for {} failed: {}", ctx.conn_id, err);
        }
        ctx.stream.send(Packet::heartbeat());
        Ok(())
    }

    // ---- tunnel connections --------------------------------------------

    async fn run_tunnel_connection(
        self: &Arc<Self>,
        mut socket: PacketSocket,
        conn_id: ConnId,
        protocol: &'static str,
        remote_addr: Option<std::net::SocketAddr>,
        request: HandshakeRequest,
    ) -> Result<(), SessionError> {
        let mapping_id = match request.mapping_id {
            Some(value) if !value.is_empty() => value,
            _ => {
                return self
                    .reject_handshake(&mut socket, &conn_id, "missing mapping id")
                    .await
            }
        };
        let mapping = match self.cloud.get_mapping(&mapping_id).await {
            Ok(value) => value,
            Err(err) => {
                return self
                    .reject_handshake(&mut socket, &conn_id, &err.to_string())
                    .await
            }
        };

        // Tunnel connections authenticate with the mapping secret
        if request.secret_key.as_deref() != Some(mapping.secret_key.as_str()) {
            return self
                .reject_handshake(&mut socket, &conn_id, "invalid mapping secret")
                .await;
        }

        socket
            .write_packet(Packet::json(
                PacketType::HandshakeResp,
                &HandshakeResponse {
                    success: true,
                    conn_id: conn_id.clone(),
                    error: None,
                },
            )?)
            .await?;

        // Next packet binds the connection to a tunnel
        let packet = tokio::time::timeout(HANDSHAKE_TIMEOUT, socket.read_packet())
            .await
            .map_err(|_| SessionError::Timeout("tunnel open".to_string()))??
            .ok_or_else(|| SessionError::InvalidPacket("closed before tunnel open".to_string()))?;

        if packet.header.ty != PacketType::TunnelOpen {
            return Err(SessionError::InvalidPacket(format!(
                "expected tunnel open, got {:?}",
                packet.header.ty
            )));
        }
        let open: TunnelOpenRequest = packet
            .deserialize()
            .map_err(|err| SessionError::InvalidPacket(err.to_string()))?;

        if open.secret_key != mapping.secret_key {
            return Err(SessionError::AuthFailed("invalid mapping secret".to_string()));
        }

        match (open.tunnel_id, &open.resume_token) {
            // Listen side: a fresh tunnel is allocated
            (None, _) => {
                self.open_listen_tunnel(socket, conn_id, protocol, remote_addr, mapping, None)
                    .await
            }
            // Resume of a snapshotted tunnel
            (Some(tunnel_id), Some(token)) => {
                let state = self.tunnel_states.validate_resume_token(token).await?;
                if state.tunnel_id != tunnel_id {
                    return Err(SessionError::AuthFailed(
                        "resume token names a different tunnel".to_string(),
                    ));
                }
                self.open_listen_tunnel(
                    socket,
                    conn_id,
                    protocol,
                    remote_addr,
                    mapping,
                    Some(state),
                )
                .await
            }
            // Target side binding to an invited tunnel
            (Some(tunnel_id), None) => {
                self.bind_target_tunnel(socket, conn_id, protocol, remote_addr, mapping, tunnel_id)
                    .await
            }
        }
    }

    /// Listen-side open: allocate the tunnel, publish routing state and
    /// wait for the target to attach
    async fn open_listen_tunnel(
        self: &Arc<Self>,
        mut socket: PacketSocket,
        conn_id: ConnId,
        protocol: &'static str,
        remote_addr: Option<std::net::SocketAddr>,
        mapping: PortMapping,
        resumed: Option<TunnelState>,
    ) -> Result<(), SessionError> {
        let tunnel_id = resumed
            .as_ref()
            .map(|state| state.tunnel_id)
            .unwrap_or_else(Uuid::new_v4);

        let bridge = TunnelBridge::new(tunnel_id, mapping.mapping_id.clone());

        let mut row = TunnelConnection::new(
            conn_id.clone(),
            tunnel_id,
            mapping.mapping_id.clone(),
            protocol,
            remote_addr,
        );
        row.authenticated = true;

        let ack = Packet::json(
            PacketType::TunnelOpenAck,
            &TunnelOpenAck {
                tunnel_id,
                success: true,
                sequenced: mapping.sequenced,
                error: None,
            },
        )?;
        socket.write_packet(ack).await?;

        let result = if mapping.sequenced {
            let send_buffer = Arc::new(Mutex::new(SendBuffer::default()));
            let receive_buffer = Arc::new(Mutex::new(ReceiveBuffer::default()));
            if let Some(state) = &resumed {
                receive_buffer
                    .lock()
                    .restore_next_expected(state.next_expected_seq);
            }

            let (task, inbound_rx, stream) = socket.into_channelled();
            let socket_task = tokio::spawn(task.run());

            row.stream = Some(stream.clone());
            row.send_buffer = Some(send_buffer.clone());
            row.receive_buffer = Some(receive_buffer.clone());

            // Source side goes in before the bridge is discoverable so a
            // racing target always finds a paired bridge
            bridge.set_source_side(BridgeSide::packet(stream, Some(send_buffer.clone())));
            self.insert_bridge(bridge.clone());

            self.tunnels.register(row)?;
            self.publish_tunnel_presence(&conn_id, &mapping, protocol).await;
            self.publish_waiting_state(tunnel_id, &mapping).await?;
            self.invite_target(tunnel_id, &mapping).await;
            self.spawn_target_watchdog(tunnel_id);

            self.run_sequenced_tunnel(
                inbound_rx,
                &conn_id,
                bridge.clone(),
                TunnelRole::Source,
                send_buffer,
                receive_buffer,
            )
            .await;
            socket_task.abort();
            Ok(())
        } else {
            let (backend, buffered) = socket.into_parts();
            bridge.set_source_side(BridgeSide::from_io(backend, buffered));
            self.insert_bridge(bridge.clone());

            self.tunnels.register(row)?;
            self.publish_tunnel_presence(&conn_id, &mapping, protocol).await;
            self.publish_waiting_state(tunnel_id, &mapping).await?;
            self.invite_target(tunnel_id, &mapping).await;

            // The task that attaches the target drives the pumps; this
            // task enforces the pairing deadline, then stays alive until
            // the tunnel finishes so connection teardown stays accurate
            match bridge.wait_for_target(TARGET_WAIT_TIMEOUT).await {
                Ok(()) => {
                    bridge.wait_closed().await;
                    Ok(())
                }
                Err(err) => {
                    warn!(
                        "tunnel {} never paired with a target",
                        tunnel_id.simple()
                    );
                    Err(err.into())
                }
            }
        };

        // Whichever way the tunnel ended, tear the routing state down
        let _ = self.state_store.remove_waiting_tunnel(&tunnel_id).await;
        if result.is_err() {
            if let Some(bridge) = self.remove_bridge(&tunnel_id) {
                bridge.close().await;
            }
        }
        result
    }

    /// Target-side bind: find the bridge here or on a peer node
    async fn bind_target_tunnel(
        self: &Arc<Self>,
        socket: PacketSocket,
        conn_id: ConnId,
        protocol: &'static str,
        remote_addr: Option<std::net::SocketAddr>,
        mapping: PortMapping,
        tunnel_id: TunnelId,
    ) -> Result<(), SessionError> {
        let mut row = TunnelConnection::new(
            conn_id.clone(),
            tunnel_id,
            mapping.mapping_id.clone(),
            protocol,
            remote_addr,
        );
        row.authenticated = true;

        // Local bridge first; the common case on a single node
        if let Some(bridge) = self.get_bridge(&tunnel_id) {
            return self
                .attach_local_target(socket, row, mapping, bridge)
                .await;
        }

        // Ask the mesh who owns the listen side
        let waiting = self.lookup_waiting_state(&tunnel_id).await?;

        if waiting.source_node_id == self.options.node_id {
            // The record says the bridge is here; give a racing listen
            // open a moment to materialise it
            let deadline = Instant::now() + LOCAL_BRIDGE_TIMEOUT;
            loop {
                if let Some(bridge) = self.get_bridge(&tunnel_id) {
                    return self
                        .attach_local_target(socket, row, mapping, bridge)
                        .await;
                }
                if Instant::now() >= deadline {
                    return Err(SessionError::Timeout(format!(
                        "bridge for tunnel {} never appeared locally",
                        tunnel_id.simple()
                    )));
                }
                tokio::time::sleep(LOOKUP_POLL_INTERVAL).await;
            }
        }

        // The listen side lives on another node
        self.forward_target_cross_node(socket, row, mapping, waiting)
            .await
    }

    async fn lookup_waiting_state(
        &self,
        tunnel_id: &TunnelId,
    ) -> Result<TunnelWaitingState, SessionError> {
        let deadline = Instant::now() + WAITING_LOOKUP_TIMEOUT;
        loop {
            if let Some(state) = self.state_store.get_waiting_tunnel(tunnel_id).await? {
                return Ok(state);
            }
            if Instant::now() >= deadline {
                return Err(SessionError::Timeout(format!(
                    "no routing record for tunnel {}",
                    tunnel_id.simple()
                )));
            }
            tokio::time::sleep(LOOKUP_POLL_INTERVAL).await;
        }
    }

    /// Attaches a local target connection to a local bridge and drives
    /// the data pumps to completion
    async fn attach_local_target(
        self: &Arc<Self>,
        mut socket: PacketSocket,
        mut row: TunnelConnection,
        mapping: PortMapping,
        bridge: Arc<TunnelBridge>,
    ) -> Result<(), SessionError> {
        let tunnel_id = row.tunnel_id;
        let conn_id = row.conn_id.clone();

        socket
            .write_packet(Packet::json(
                PacketType::TunnelOpenAck,
                &TunnelOpenAck {
                    tunnel_id,
                    success: true,
                    sequenced: mapping.sequenced,
                    error: None,
                },
            )?)
            .await?;

        let _ = self.state_store.remove_waiting_tunnel(&tunnel_id).await;
        self.resolve_tunnel_open(&tunnel_id, mapping.sequenced);

        if mapping.sequenced {
            let send_buffer = Arc::new(Mutex::new(SendBuffer::default()));
            let receive_buffer = Arc::new(Mutex::new(ReceiveBuffer::default()));

            let (task, inbound_rx, stream) = socket.into_channelled();
            let socket_task = tokio::spawn(task.run());

            row.stream = Some(stream.clone());
            row.send_buffer = Some(send_buffer.clone());
            row.receive_buffer = Some(receive_buffer.clone());
            self.tunnels.register(row)?;
            self.publish_tunnel_presence(&conn_id, &mapping, "tcp").await;

            bridge.set_target_side(BridgeSide::packet(stream, Some(send_buffer.clone())));

            let runner = {
                let bridge = bridge.clone();
                tokio::spawn(async move { bridge.run_bidirectional().await })
            };

            self.run_sequenced_tunnel(
                inbound_rx,
                &conn_id,
                bridge.clone(),
                TunnelRole::Target,
                send_buffer,
                receive_buffer,
            )
            .await;

            socket_task.abort();
            let _ = runner.await;
        } else {
            self.tunnels.register(row)?;
            self.publish_tunnel_presence(&conn_id, &mapping, "tcp").await;

            let (backend, buffered) = socket.into_parts();
            bridge.set_target_side(BridgeSide::from_io(backend, buffered));
            bridge.run_bidirectional().await?;
        }

        self.finish_tunnel(&tunnel_id).await;
        Ok(())
    }

    /// Target landed on this node but the listen side is elsewhere:
    /// bridge the local target to the source node over the pool
    async fn forward_target_cross_node(
        self: &Arc<Self>,
        mut socket: PacketSocket,
        row: TunnelConnection,
        mapping: PortMapping,
        waiting: TunnelWaitingState,
    ) -> Result<(), SessionError> {
        let tunnel_id = row.tunnel_id;
        let conn_id = row.conn_id.clone();
        let protocol = row.protocol;

        // Ack the local target before the cross-node dial so it can start
        // streaming as soon as the fabric is up
        socket
            .write_packet(Packet::json(
                PacketType::TunnelOpenAck,
                &TunnelOpenAck {
                    tunnel_id,
                    success: true,
                    sequenced: mapping.sequenced,
                    error: None,
                },
            )?)
            .await?;

        let cross_conn = self.cross_pool.get(&waiting.source_node_id).await?;

        let ready = Frame::new(
            tunnel_id,
            FrameType::TargetReady,
            Bytes::from(self.options.node_id.clone().into_bytes()),
        );
        if let Err(err) = cross_conn.write_frame(&ready).await {
            self.cross_pool.discard(cross_conn);
            return Err(SessionError::Network(io::Error::new(
                io::ErrorKind::Other,
                err.to_string(),
            )));
        }

        self.tunnels.register(row)?;
        self.publish_tunnel_presence(&conn_id, &mapping, protocol).await;

        // A local bridge pairs the target transport with the frame
        // stream toward the source node
        let bridge = TunnelBridge::new(tunnel_id, mapping.mapping_id.clone());
        bridge.set_cross_conn(cross_conn.clone());

        let (backend, buffered) = socket.into_parts();
        bridge.set_source_side(BridgeSide::from_frame(cross_conn.clone(), tunnel_id));
        bridge.set_target_side(BridgeSide::from_io(backend, buffered));
        self.insert_bridge(bridge.clone());

        let result = bridge.run_bidirectional().await;

        // Loaned connection goes back to its pool unless it broke
        if let Some(conn) = bridge.take_cross_conn() {
            if conn.is_healthy() {
                self.cross_pool.release(conn);
            } else {
                self.cross_pool.discard(conn);
            }
        }

        self.finish_tunnel(&tunnel_id).await;
        result.map_err(SessionError::from)
    }

    /// Called by the cross-node listener when a peer announces the target
    /// for one of our waiting bridges
    pub async fn attach_cross_node_target(
        self: &Arc<Self>,
        tunnel_id: TunnelId,
        peer_node: NodeId,
        stream: TcpStream,
    ) -> Result<(), SessionError> {
        let bridge = self
            .get_bridge(&tunnel_id)
            .ok_or_else(|| SessionError::NotFound(format!("bridge {}", tunnel_id.simple())))?;

        let conn = CrossNodeConn::new(peer_node, stream);
        bridge.set_target_side(BridgeSide::from_frame(conn, tunnel_id));
        self.resolve_tunnel_open(&tunnel_id, false);

        bridge.run_bidirectional().await?;
        self.finish_tunnel(&tunnel_id).await;
        Ok(())
    }

    /// Packet loop for a sequenced tunnel connection: reorders inbound
    /// data, acknowledges delivery and feeds the bridge
    async fn run_sequenced_tunnel(
        self: &Arc<Self>,
        mut inbound_rx: mpsc::UnboundedReceiver<Packet>,
        conn_id: &str,
        bridge: Arc<TunnelBridge>,
        role: TunnelRole,
        send_buffer: Arc<Mutex<SendBuffer>>,
        receive_buffer: Arc<Mutex<ReceiveBuffer>>,
    ) {
        let mut resend_interval = tokio::time::interval(RESEND_CHECK_INTERVAL);
        resend_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let packet = tokio::select! {
                packet = inbound_rx.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
                _ = resend_interval.tick() => {
                    self.resend_unconfirmed(conn_id, &send_buffer);
                    continue;
                }
            };

            match packet.header.ty {
                PacketType::TunnelData => {
                    let chunks = if packet.header.is_sequenced() {
                        match receive_buffer
                            .lock()
                            .receive(packet.header.seq, packet.payload)
                        {
                            Ok(chunks) => chunks,
                            Err(err) => {
                                warn!("receive buffer on {} rejected packet: {}", conn_id, err);
                                break;
                            }
                        }
                    } else {
                        vec![packet.payload]
                    };

                    for chunk in chunks {
                        let result = match role {
                            TunnelRole::Source => bridge.write_to_target(&chunk).await,
                            TunnelRole::Target => bridge.write_to_source(&chunk).await,
                        };
                        if let Err(err) = result {
                            debug!("bridge write on {} failed: {}", conn_id, err);
                            break;
                        }
                    }

                    // Cumulative ack for everything delivered so far
                    if packet.header.is_sequenced() {
                        let ack = receive_buffer.lock().next_expected();
                        if let Some(row) = self.tunnels.get_by_conn_id(conn_id) {
                            if let Some(stream) = &row.stream {
                                stream.send(Packet::tunnel_ack(ack));
                            }
                        }
                    }
                    self.tunnels.touch(conn_id);
                }
                PacketType::TunnelAck => {
                    send_buffer.lock().confirm_up_to(packet.header.seq);
                }
                PacketType::TunnelClose => {
                    debug!("tunnel connection {} sent close", conn_id);
                    break;
                }
                PacketType::Heartbeat => {
                    self.tunnels.touch(conn_id);
                    if let Some(row) = self.tunnels.get_by_conn_id(conn_id) {
                        if let Some(stream) = &row.stream {
                            stream.send(Packet::heartbeat());
                        }
                    }
                }
                other => {
                    warn!("unexpected {:?} on tunnel connection {}", other, conn_id);
                }
            }
        }

        bridge.close().await;
    }

    /// Retransmits packets that outlived the send buffer's resend
    /// timeout without an acknowledgement
    fn resend_unconfirmed(&self, conn_id: &str, send_buffer: &Arc<Mutex<SendBuffer>>) {
        let stale = send_buffer.lock().unconfirmed_packets();
        if stale.is_empty() {
            return;
        }

        let row = match self.tunnels.get_by_conn_id(conn_id) {
            Some(value) => value,
            None => return,
        };
        let stream = match row.stream {
            Some(value) => value,
            None => return,
        };

        let count = stale.len();
        let buffer = &mut *send_buffer.lock();
        for packet in stale {
            if stream.send(Packet::tunnel_data_seq(packet.seq, packet.data.clone())) {
                buffer.mark_resent(packet.seq);
            }
        }
        debug!("retransmitted {} packets on {}", count, conn_id);
    }

    /// Removes the bridge and routing state of a finished tunnel
    async fn finish_tunnel(&self, tunnel_id: &TunnelId) {
        if let Some(bridge) = self.remove_bridge(tunnel_id) {
            bridge.close().await;
        }
        let _ = self.state_store.remove_waiting_tunnel(tunnel_id).await;
    }

    async fn publish_waiting_state(
        &self,
        tunnel_id: TunnelId,
        mapping: &PortMapping,
    ) -> Result<(), SessionError> {
        self.state_store
            .publish_waiting_tunnel(
                TunnelWaitingState {
                    tunnel_id,
                    mapping_id: mapping.mapping_id.clone(),
                    secret_key: mapping.secret_key.clone(),
                    source_node_id: self.options.node_id.clone(),
                    source_client_id: mapping.listen_client_id,
                    target_client_id: mapping.target_client_id,
                    target_host: mapping.target_host.clone(),
                    target_port: mapping.target_port,
                    expires_at: chrono::Utc::now(),
                },
                self.options.waiting_ttl,
            )
            .await?;
        Ok(())
    }

    async fn publish_tunnel_presence(
        &self,
        conn_id: &str,
        mapping: &PortMapping,
        protocol: &str,
    ) {
        if let Err(err) = self
            .state_store
            .register_connection(ConnectionStateInfo {
                connection_id: conn_id.to_string(),
                client_id: 0,
                node_id: String::new(),
                protocol: protocol.to_string(),
                conn_type: ConnType::Tunnel,
                mapping_id: Some(mapping.mapping_id.clone()),
                created_at: chrono::Utc::now(),
                expires_at: chrono::Utc::now(),
            })
            .await
        {
            debug!("failed to publish tunnel presence for {}: {}", conn_id, err);
        }
    }

    /// Pushes a tunnel invitation to the target client when it is
    /// connected to this node; targets on other nodes find the waiting
    /// record through their own gateway
    async fn invite_target(&self, tunnel_id: TunnelId, mapping: &PortMapping) {
        let target = match self.clients.get_by_client_id(mapping.target_client_id) {
            Some(value) => value,
            None => {
                debug!(
                    "target client {} for tunnel {} is not local",
                    mapping.target_client_id,
                    tunnel_id.simple()
                );
                return;
            }
        };

        let invite = TunnelInviteBody {
            tunnel_id,
            mapping_id: mapping.mapping_id.clone(),
            target_host: mapping.target_host.clone(),
            target_port: mapping.target_port,
        };
        let command = CommandPacket {
            command_type: CommandType::TunnelOpenRequestCmd,
            command_id: self.next_conn_id(),
            sender_id: self.options.node_id.clone(),
            receiver_id: mapping.target_client_id.to_string(),
            token: String::new(),
            command_body: match serde_json::to_string(&invite) {
                Ok(value) => value,
                Err(err) => {
                    error!("failed to encode tunnel invite: {}", err);
                    return;
                }
            },
        };

        if let Some(stream) = &target.stream {
            match Packet::json(PacketType::JsonCommand, &command) {
                Ok(packet) => {
                    stream.send(packet);
                }
                Err(err) => error!("failed to encode tunnel invite packet: {}", err),
            }
        }
    }

    /// Watchdog dropping a listen-side bridge whose target never arrives
    fn spawn_target_watchdog(self: &Arc<Self>, tunnel_id: TunnelId) {
        let manager = self.clone();
        tokio::spawn(async move {
            let bridge = match manager.get_bridge(&tunnel_id) {
                Some(value) => value,
                None => return,
            };
            if bridge.wait_for_target(TARGET_WAIT_TIMEOUT).await.is_err() {
                warn!(
                    "dropping tunnel {}: no target within {:?}",
                    tunnel_id.simple(),
                    TARGET_WAIT_TIMEOUT
                );
                manager.finish_tunnel(&tunnel_id).await;
            }
        });
    }

    // ---- teardown sink -------------------------------------------------

    /// Single teardown path for any connection: registries, presence and
    /// bridge state all release here
    pub async fn close_connection(&self, conn_id: &str) {
        if let Some(row) = self.clients.remove(conn_id) {
            debug!(
                "closed control connection {} (client {})",
                conn_id, row.client_id
            );
        }
        if let Some(row) = self.tunnels.remove(conn_id) {
            self.finish_tunnel(&row.tunnel_id).await;
            debug!("closed tunnel connection {}", conn_id);
        }
        if let Err(err) = self.state_store.unregister_connection(conn_id).await {
            debug!("presence cleanup for {} failed: {}", conn_id, err);
        }
    }

    // ---- cross-node RPC ------------------------------------------------

    /// Sends a command to a client's control stream wherever it is in the
    /// mesh, then waits for the correlated response
    ///
    /// `frame_type` is the cross-node carrier used when the client is on
    /// a peer node (`HttpProxy` or `DnsQuery`).
    pub(crate) async fn relay_command_to_client(
        self: &Arc<Self>,
        client_id: ClientId,
        command: CommandPacket,
        frame_type: FrameType,
        timeout: Duration,
    ) -> Result<CommandPacket, SessionError> {
        let (node_id, conn_id) = self.state_store.find_client_node(client_id).await?;

        if node_id == self.options.node_id {
            // Local client: push the command and wait on the local waiter
            let row = self
                .clients
                .get_by_conn_id(&conn_id)
                .or_else(|| self.clients.get_by_client_id(client_id))
                .ok_or_else(|| SessionError::NotFound(format!("client {}", client_id)))?;
            let stream = row
                .stream
                .ok_or_else(|| SessionError::NotFound(format!("stream for {}", conn_id)))?;

            return self
                .send_and_await_response(&stream, command, timeout)
                .await;
        }

        // Remote client: carry the command over the fabric and read the
        // single response frame on the same pooled connection
        let conn = self.cross_pool.get(&node_id).await?;
        let payload = serde_json::to_vec(&command)?;
        let frame = Frame::control(frame_type, payload);

        let result = async {
            conn.write_frame(&frame).await.map_err(|err| {
                SessionError::Network(io::Error::new(io::ErrorKind::Other, err.to_string()))
            })?;

            let response = tokio::time::timeout(timeout, conn.read_frame())
                .await
                .map_err(|_| SessionError::Timeout("cross-node response".to_string()))?
                .map_err(|err| {
                    SessionError::Network(io::Error::new(io::ErrorKind::Other, err.to_string()))
                })?
                .ok_or_else(|| {
                    SessionError::Network(io::ErrorKind::UnexpectedEof.into())
                })?;

            let command: CommandPacket = serde_json::from_slice(&response.payload)?;
            Ok(command)
        }
        .await;

        if result.is_err() {
            conn.mark_broken();
            self.cross_pool.discard(conn);
        } else {
            self.cross_pool.release(conn);
        }
        result
    }

    /// Local-delivery half of [Self::relay_command_to_client]
    pub(crate) async fn send_and_await_response(
        self: &Arc<Self>,
        stream: &PacketTx,
        command: CommandPacket,
        timeout: Duration,
    ) -> Result<CommandPacket, SessionError> {
        let command_id = command.command_id.clone();
        let command_type = command.command_type;

        // Register the waiter before the send so the response can never
        // race past it
        let rx = match command_type {
            CommandType::HttpProxyRequest => {
                WaiterSlot::HttpProxy(self.http_proxy_waiters.register(&command_id))
            }
            CommandType::DnsResolve => {
                WaiterSlot::DnsResolve(self.dns_resolve_waiters.register(&command_id))
            }
            CommandType::DnsQuery => {
                WaiterSlot::DnsQuery(self.dns_query_waiters.register(&command_id))
            }
            CommandType::NotifyClient => {
                WaiterSlot::Notify(self.notify_waiters.register(&command_id))
            }
            other => {
                return Err(SessionError::InvalidParam(format!(
                    "command type {:?} has no response channel",
                    other
                )))
            }
        };

        if !stream.send(Packet::json(PacketType::JsonCommand, &command)?) {
            self.unregister_waiter(&command_id, command_type);
            return Err(SessionError::Network(io::ErrorKind::BrokenPipe.into()));
        }

        let cancel = self.shutdown_rx.clone();
        let response_body = match rx {
            WaiterSlot::HttpProxy(rx) => self
                .http_proxy_waiters
                .wait_for_response(&command_id, rx, timeout, cancel)
                .await
                .map(|body| serde_json::to_string(&body))?,
            WaiterSlot::DnsResolve(rx) => self
                .dns_resolve_waiters
                .wait_for_response(&command_id, rx, timeout, cancel)
                .await
                .map(|body| serde_json::to_string(&body))?,
            WaiterSlot::DnsQuery(rx) => self
                .dns_query_waiters
                .wait_for_response(&command_id, rx, timeout, cancel)
                .await
                .map(|body| serde_json::to_string(&body))?,
            WaiterSlot::Notify(rx) => self
                .notify_waiters
                .wait_for_response(&command_id, rx, timeout, cancel)
                .await
                .map(|body| serde_json::to_string(&body))?,
        };

        let response_type = match command_type {
            CommandType::HttpProxyRequest => CommandType::HttpProxyResponse,
            other => other,
        };

        Ok(CommandPacket {
            command_type: response_type,
            command_id,
            sender_id: String::new(),
            receiver_id: String::new(),
            token: String::new(),
            command_body: response_body?,
        })
    }

    fn unregister_waiter(&self, command_id: &str, command_type: CommandType) {
        match command_type {
            CommandType::HttpProxyRequest => self.http_proxy_waiters.unregister(command_id),
            CommandType::DnsResolve => self.dns_resolve_waiters.unregister(command_id),
            CommandType::DnsQuery => self.dns_query_waiters.unregister(command_id),
            CommandType::NotifyClient => self.notify_waiters.unregister(command_id),
            _ => {}
        }
    }

    /// Entry point for commands relayed in from a peer node's listener
    pub async fn relay_inbound_command(self: &Arc<Self>, command: CommandPacket) -> CommandPacket {
        let command_id = command.command_id.clone();
        let timeout = match command.command_type {
            CommandType::HttpProxyRequest => HTTP_PROXY_TIMEOUT,
            _ => DNS_TIMEOUT,
        };

        let client_id: ClientId = match command.receiver_id.parse() {
            Ok(value) => value,
            Err(_) => {
                return commands::error_response(
                    &command_id,
                    command.command_type,
                    "invalid receiver id",
                )
            }
        };

        let row = match self.clients.get_by_client_id(client_id) {
            Some(value) => value,
            None => {
                return commands::error_response(
                    &command_id,
                    command.command_type,
                    "client is not connected here",
                )
            }
        };
        let stream = match row.stream {
            Some(value) => value,
            None => {
                return commands::error_response(
                    &command_id,
                    command.command_type,
                    "client stream unavailable",
                )
            }
        };

        match self
            .send_and_await_response(&stream, command.clone(), timeout)
            .await
        {
            Ok(response) => response,
            Err(err) => commands::error_response(&command_id, command.command_type, &err.to_string()),
        }
    }

    // ---- background tasks ----------------------------------------------

    /// Periodic sweep closing control connections that missed their
    /// heartbeats
    pub async fn run_cleanup(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.options.cleanup_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let manager = self.clone();
            let removed = self
                .clients
                .cleanup_stale(self.options.heartbeat_timeout, move |conn_id| {
                    let manager = manager.clone();
                    let conn_id = conn_id.to_string();
                    tokio::spawn(async move {
                        let _ = manager.state_store.unregister_connection(&conn_id).await;
                    });
                });

            if removed > 0 {
                debug!("stale cleanup removed {} control connections", removed);
            }
        }
    }

    // ---- graceful shutdown ---------------------------------------------

    /// Notifies every control connection of the impending shutdown,
    /// minting a reconnect token per client. Returns (notified, failed).
    pub async fn broadcast_shutdown(
        &self,
        reason: &str,
        grace_period_seconds: u64,
        recommend_reconnect: bool,
        message: &str,
    ) -> (usize, usize) {
        let mut notified = 0;
        let mut failed = 0;

        for row in self.clients.snapshot() {
            if !row.authenticated {
                continue;
            }

            let reconnect_token = self
                .reconnect_tokens
                .as_ref()
                .map(|tokens| tokens.create_token(row.client_id));

            let body = ServerShutdownBody {
                reason: reason.to_string(),
                grace_period_seconds,
                recommend_reconnect,
                message: message.to_string(),
                reconnect_token,
            };

            let command = CommandPacket {
                command_type: CommandType::ServerShutdown,
                command_id: self.next_conn_id(),
                sender_id: self.options.node_id.clone(),
                receiver_id: row.client_id.to_string(),
                token: String::new(),
                command_body: match serde_json::to_string(&body) {
                    Ok(value) => value,
                    Err(_) => {
                        failed += 1;
                        continue;
                    }
                },
            };

            let sent = row
                .stream
                .as_ref()
                .and_then(|stream| {
                    Packet::json(PacketType::JsonCommand, &command)
                        .ok()
                        .map(|packet| stream.send(packet))
                })
                .unwrap_or(false);

            if sent {
                notified += 1;
            } else {
                failed += 1;
            }
        }

        // Give the socket tasks a moment to flush the notices
        tokio::time::sleep(SHUTDOWN_DRAIN).await;
        (notified, failed)
    }

    /// Polls the tunnel registry until it drains or the deadline passes
    pub async fn wait_for_tunnels_to_complete(&self, timeout_secs: u64) -> bool {
        let deadline = Instant::now() + Duration::from_secs(timeout_secs);
        loop {
            if self.tunnels.count() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(TUNNEL_DRAIN_POLL).await;
        }
    }

    /// Snapshots every authenticated sequenced tunnel ahead of a
    /// voluntary shutdown, returning how many were saved
    pub async fn save_active_tunnel_states(&self) -> usize {
        let mut saved = 0;

        for row in self.tunnels.snapshot() {
            if !row.authenticated {
                continue;
            }
            let (send_buffer, receive_buffer) = match (&row.send_buffer, &row.receive_buffer) {
                (Some(send), Some(receive)) => (send, receive),
                // Raw tunnels have no replayable state
                _ => continue,
            };

            let mapping = match self.cloud.get_mapping(&row.mapping_id).await {
                Ok(value) => value,
                Err(err) => {
                    warn!(
                        "cannot snapshot tunnel {}: mapping lookup failed: {}",
                        row.tunnel_id.simple(),
                        err
                    );
                    continue;
                }
            };

            let mut state = TunnelState::new(
                row.tunnel_id,
                row.mapping_id.clone(),
                mapping.listen_client_id,
                mapping.target_client_id,
            );
            {
                let send = send_buffer.lock();
                state.last_seq_num = send.next_seq().saturating_sub(1);
                state.last_ack_num = send.confirmed_seq();
                state.buffered_packets = send
                    .buffered_packets()
                    .iter()
                    .map(super::tunnel_state::StoredPacket::from_buffered)
                    .collect();
            }
            state.next_expected_seq = receive_buffer.lock().next_expected();

            match self.tunnel_states.save_state(state).await {
                Ok(_) => saved += 1,
                Err(err) => warn!(
                    "failed to snapshot tunnel {}: {}",
                    row.tunnel_id.simple(),
                    err
                ),
            }
        }

        saved
    }

    /// Full graceful shutdown: snapshot, notify, drain, tear down.
    /// Teardown order: listener (via the shutdown signal) then bridges,
    /// registries, pools and finally presence records.
    pub async fn shutdown(
        self: &Arc<Self>,
        reason: &str,
        grace_period_seconds: u64,
        message: &str,
    ) {
        let saved = self.save_active_tunnel_states().await;
        debug!("saved {} tunnel snapshots ahead of shutdown", saved);

        let (notified, failed) = self
            .broadcast_shutdown(reason, grace_period_seconds, true, message)
            .await;
        debug!("shutdown broadcast: {} notified, {} failed", notified, failed);

        let drained = self.wait_for_tunnels_to_complete(grace_period_seconds).await;
        if !drained {
            warn!(
                "{} tunnels still active at the end of the grace period",
                self.tunnels.count()
            );
        }

        // Stops the cross-node listener, scrubbers and waiters
        let _ = self.shutdown_tx.send(true);

        let bridges: Vec<Arc<TunnelBridge>> = self.bridges.lock().drain().map(|(_, b)| b).collect();
        for bridge in bridges {
            bridge.close().await;
        }

        for row in self.clients.snapshot() {
            self.close_connection(&row.conn_id).await;
        }
        for row in self.tunnels.snapshot() {
            self.close_connection(&row.conn_id).await;
        }

        self.cross_pool.close_all().await;
    }

    // ---- config plane ---------------------------------------------------

    /// Reads a config entry from the shared store
    pub async fn config_get(&self, key: &str) -> Option<serde_json::Value> {
        let storage_key = format!("tunnox:config:{}", key);
        match self.storage.get(&storage_key).await {
            Ok(Some(value)) => value.decode().ok(),
            _ => None,
        }
    }

    /// Writes a config entry to the shared store
    pub async fn config_set(&self, key: &str, value: serde_json::Value) -> bool {
        let storage_key = format!("tunnox:config:{}", key);
        self.storage
            .set(
                &storage_key,
                crate::storage::StorageValue::Json(value),
                self.options.state_ttl,
            )
            .await
            .is_ok()
    }

    /// Kicks a client by id with the provided reason
    pub fn kick_client(&self, client_id: ClientId, reason: &str) -> bool {
        if let Some(row) = self.clients.get_by_client_id(client_id) {
            commands::send_kick(&row, super::models::kick_codes::ADMIN_KICK, reason);
            self.clients.remove(&row.conn_id);
            return true;
        }
        false
    }
}

/// Typed receiver for one pending response, matching the waiter map it
/// was registered in
enum WaiterSlot {
    HttpProxy(mpsc::Receiver<HttpProxyResponseBody>),
    DnsResolve(mpsc::Receiver<super::models::DnsResolveResponse>),
    DnsQuery(mpsc::Receiver<super::models::DnsQueryResponse>),
    Notify(mpsc::Receiver<NotifyAckResponse>),
}

#[cfg(test)]
mod test {
    use super::{SessionManager, SessionOptions};
    use crate::{
        cloud::{PortMapping, StorageCloudControl},
        cross_node::listener::run_listener,
        session::{
            models::{
                CommandPacket, CommandType, ConnectionType, HandshakeRequest, HandshakeResponse,
                KickClientBody, ServerShutdownBody, TunnelOpenAck, TunnelOpenRequest,
            },
            packet::{Packet, PacketType},
            registry::TunnelConnection,
            socket::{PacketSocket, TransportBackend},
        },
        storage::{MemoryStorage, Storage, StorageValue},
    };
    use std::{sync::Arc, time::Duration};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        time::Instant,
    };
    use uuid::Uuid;

    fn manager_on(node_id: &str, storage: Arc<MemoryStorage>) -> Arc<SessionManager> {
        let cloud = Arc::new(StorageCloudControl::new(storage.clone()));
        SessionManager::new(
            SessionOptions {
                node_id: node_id.to_string(),
                ..Default::default()
            },
            storage,
            cloud,
            "test-secret",
        )
    }

    async fn put_mapping(storage: &Arc<MemoryStorage>, mapping: &PortMapping) {
        storage
            .set(
                &format!("tunnox:mapping:{}", mapping.mapping_id),
                StorageValue::encode(mapping).unwrap(),
                Duration::from_secs(300),
            )
            .await
            .unwrap();
    }

    fn test_mapping(sequenced: bool) -> PortMapping {
        PortMapping {
            mapping_id: "m1".to_string(),
            secret_key: "s3cret".to_string(),
            listen_client_id: 1,
            target_client_id: 2,
            target_host: "127.0.0.1".to_string(),
            target_port: 8080,
            sequenced,
        }
    }

    async fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cond()
    }

    /// Opens a control connection as client `client_id`, returning the
    /// client end after a successful handshake
    async fn control_handshake(
        manager: &Arc<SessionManager>,
        client_id: i64,
        conn_id: &str,
    ) -> PacketSocket {
        let (client_io, server_io) = tokio::io::duplex(16384);

        let server = manager.clone();
        let server_conn_id = conn_id.to_string();
        tokio::spawn(async move {
            let _ = server
                .accept_connection_with_id(
                    TransportBackend::Framed(Box::new(server_io)),
                    Some(server_conn_id),
                )
                .await;
        });

        let mut socket = PacketSocket::new(TransportBackend::Framed(Box::new(client_io)));
        let handshake = HandshakeRequest {
            connection_type: ConnectionType::Control,
            client_id: Some(client_id),
            user_id: None,
            token: Some("token".to_string()),
            mapping_id: None,
            secret_key: None,
            resume_token: None,
        };
        socket
            .write_packet(Packet::json(PacketType::Handshake, &handshake).unwrap())
            .await
            .unwrap();

        let response: HandshakeResponse = socket
            .read_packet()
            .await
            .unwrap()
            .unwrap()
            .deserialize()
            .unwrap();
        assert!(response.success);
        socket
    }

    /// Opens a tunnel connection for `mapping`, sending the provided
    /// open request after the handshake, returning the client end and
    /// the acknowledgement
    async fn tunnel_handshake(
        manager: &Arc<SessionManager>,
        mapping: &PortMapping,
        open: TunnelOpenRequest,
    ) -> (PacketSocket, TunnelOpenAck) {
        let (client_io, server_io) = tokio::io::duplex(16384);

        let server = manager.clone();
        tokio::spawn(async move {
            let _ = server
                .accept_connection(TransportBackend::Framed(Box::new(server_io)))
                .await;
        });

        let mut socket = PacketSocket::new(TransportBackend::Framed(Box::new(client_io)));
        let handshake = HandshakeRequest {
            connection_type: ConnectionType::Tunnel,
            client_id: None,
            user_id: None,
            token: None,
            mapping_id: Some(mapping.mapping_id.clone()),
            secret_key: Some(mapping.secret_key.clone()),
            resume_token: None,
        };
        socket
            .write_packet(Packet::json(PacketType::Handshake, &handshake).unwrap())
            .await
            .unwrap();
        let response: HandshakeResponse = socket
            .read_packet()
            .await
            .unwrap()
            .unwrap()
            .deserialize()
            .unwrap();
        assert!(response.success);

        socket
            .write_packet(Packet::json(PacketType::TunnelOpen, &open).unwrap())
            .await
            .unwrap();
        let ack: TunnelOpenAck = socket
            .read_packet()
            .await
            .unwrap()
            .unwrap()
            .deserialize()
            .unwrap();
        assert!(ack.success);

        (socket, ack)
    }

    fn open_request(mapping: &PortMapping, tunnel_id: Option<Uuid>) -> TunnelOpenRequest {
        TunnelOpenRequest {
            tunnel_id,
            mapping_id: mapping.mapping_id.clone(),
            secret_key: mapping.secret_key.clone(),
            resume_token: None,
        }
    }

    /// A second login for the same client kicks the first connection
    /// with a duplicate-login notice
    #[tokio::test]
    async fn test_duplicate_login_kicks_old_session() {
        let storage = Arc::new(MemoryStorage::default());
        let manager = manager_on("node-a", storage);

        let mut first = control_handshake(&manager, 42, "c1").await;
        let _second = control_handshake(&manager, 42, "c2").await;

        assert!(
            wait_until(
                || {
                    manager.clients.count() == 1
                        && manager
                            .clients
                            .get_by_client_id(42)
                            .is_some_and(|row| row.conn_id == "c2")
                },
                Duration::from_secs(2)
            )
            .await
        );

        // The old connection sees exactly one kick notice, then EOF
        let packet = first.read_packet().await.unwrap().unwrap();
        assert_eq!(packet.header.ty, PacketType::JsonCommand);
        let command: CommandPacket = packet.deserialize().unwrap();
        assert_eq!(command.command_type, CommandType::KickClient);
        let body: KickClientBody = command.body().unwrap();
        assert_eq!(body.code, "DUPLICATE_LOGIN");

        assert!(first.read_packet().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_echo() {
        let storage = Arc::new(MemoryStorage::default());
        let manager = manager_on("node-a", storage);

        let mut client = control_handshake(&manager, 7, "c1").await;
        client.write_packet(Packet::heartbeat()).await.unwrap();

        let echoed = client.read_packet().await.unwrap().unwrap();
        assert_eq!(echoed.header.ty, PacketType::Heartbeat);
    }

    /// Listen and target both on one node: bytes cross the bridge in
    /// both directions and the tunnel drains on close
    #[tokio::test]
    async fn test_local_tunnel_pairing() {
        let storage = Arc::new(MemoryStorage::default());
        let manager = manager_on("node-a", storage.clone());
        let mapping = test_mapping(false);
        put_mapping(&storage, &mapping).await;

        let (listen_socket, ack) = tunnel_handshake(&manager, &mapping, open_request(&mapping, None)).await;
        let tunnel_id = ack.tunnel_id;

        let (target_socket, _ack) =
            tunnel_handshake(&manager, &mapping, open_request(&mapping, Some(tunnel_id))).await;

        // After the ack both ends speak raw bytes
        let (listen_io, _) = listen_socket.into_parts();
        let (target_io, _) = target_socket.into_parts();
        let (mut listen_read, mut listen_write) = tokio::io::split(listen_io);
        let (mut target_read, mut target_write) = tokio::io::split(target_io);

        listen_write.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        target_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        target_write.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        listen_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        // Closing both ends drains the tunnel completely
        listen_write.shutdown().await.unwrap();
        target_write.shutdown().await.unwrap();
        assert!(
            wait_until(
                || manager.get_active_tunnel_count() == 0,
                Duration::from_secs(2)
            )
            .await
        );
        assert!(manager.get_bridge(&tunnel_id).is_none());
    }

    /// Sequenced mappings keep both ends in packet mode: data is
    /// re-sequenced, forwarded and acknowledged
    #[tokio::test]
    async fn test_sequenced_tunnel_data_flow() {
        let storage = Arc::new(MemoryStorage::default());
        let manager = manager_on("node-a", storage.clone());
        let mapping = test_mapping(true);
        put_mapping(&storage, &mapping).await;

        let (mut listen_socket, ack) =
            tunnel_handshake(&manager, &mapping, open_request(&mapping, None)).await;
        assert!(ack.sequenced);

        let (mut target_socket, _ack) =
            tunnel_handshake(&manager, &mapping, open_request(&mapping, Some(ack.tunnel_id))).await;

        // Out of order delivery: 2 then 1; the target must see 1, 2
        listen_socket
            .write_packet(Packet::tunnel_data_seq(2, bytes::Bytes::from_static(b"second")))
            .await
            .unwrap();
        listen_socket
            .write_packet(Packet::tunnel_data_seq(1, bytes::Bytes::from_static(b"first")))
            .await
            .unwrap();

        let mut received = Vec::new();
        while received.len() < 2 {
            let packet = target_socket.read_packet().await.unwrap().unwrap();
            if packet.header.ty == PacketType::TunnelData {
                received.push(packet.payload.clone());
            }
        }
        assert_eq!(received[0], bytes::Bytes::from_static(b"first"));
        assert_eq!(received[1], bytes::Bytes::from_static(b"second"));

        // The listen side gets a cumulative ack past both packets
        let mut acked = 0;
        for _ in 0..8 {
            let packet = listen_socket.read_packet().await.unwrap().unwrap();
            if packet.header.ty == PacketType::TunnelAck {
                acked = packet.header.seq;
                if acked >= 3 {
                    break;
                }
            }
        }
        assert_eq!(acked, 3);
    }

    /// Listen client on node A, target client on node B: pairing runs
    /// over the cross-node fabric and bytes arrive in order
    #[tokio::test]
    async fn test_cross_node_tunnel_pairing() {
        let storage = Arc::new(MemoryStorage::default());
        let node_a = manager_on("node-a", storage.clone());
        let node_b = manager_on("node-b", storage.clone());

        // Node A's cross-node listener on a real socket
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        node_a
            .state_store()
            .register_node_address(&addr.to_string())
            .await
            .unwrap();
        tokio::spawn(run_listener(
            listener,
            Arc::downgrade(&node_a),
            node_a.shutdown_signal(),
        ));

        let mapping = test_mapping(false);
        put_mapping(&storage, &mapping).await;

        let (listen_socket, ack) =
            tunnel_handshake(&node_a, &mapping, open_request(&mapping, None)).await;
        let tunnel_id = ack.tunnel_id;

        // The routing record names node A as the listen owner (published
        // just after the ack, so poll briefly)
        let mut waiting = None;
        for _ in 0..100 {
            if let Some(state) = node_a
                .state_store()
                .get_waiting_tunnel(&tunnel_id)
                .await
                .unwrap()
            {
                waiting = Some(state);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let waiting = waiting.expect("waiting-tunnel record never appeared");
        assert_eq!(waiting.source_node_id, "node-a");

        let (target_socket, _ack) =
            tunnel_handshake(&node_b, &mapping, open_request(&mapping, Some(tunnel_id))).await;

        let (listen_io, _) = listen_socket.into_parts();
        let (target_io, _) = target_socket.into_parts();
        let (mut listen_read, mut listen_write) = tokio::io::split(listen_io);
        let (mut target_read, mut target_write) = tokio::io::split(target_io);

        // Multiple writes must arrive in order across the fabric
        listen_write.write_all(b"alpha-").await.unwrap();
        listen_write.write_all(b"beta").await.unwrap();
        let mut buf = [0u8; 10];
        target_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"alpha-beta");

        target_write.write_all(b"reply").await.unwrap();
        let mut buf = [0u8; 5];
        listen_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");

        // Listen close reaches the target as EOF through a Close frame
        listen_write.shutdown().await.unwrap();
        let mut rest = Vec::new();
        target_read.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        target_write.shutdown().await.unwrap();
        assert!(
            wait_until(
                || node_a.get_active_tunnel_count() == 0 && node_b.get_active_tunnel_count() == 0,
                Duration::from_secs(3)
            )
            .await
        );
    }

    /// Shutdown broadcast reaches every client with a distinct reconnect
    /// token, and tunnel draining honors its deadline
    #[tokio::test]
    async fn test_graceful_shutdown_broadcast() {
        let storage = Arc::new(MemoryStorage::default());
        let manager = manager_on("node-a", storage);

        let mut clients = Vec::new();
        for client_id in 1..=3 {
            let socket =
                control_handshake(&manager, client_id, &format!("c{}", client_id)).await;
            clients.push(socket);
        }

        let (notified, failed) = manager
            .broadcast_shutdown("Maintenance", 5, true, "bye")
            .await;
        assert_eq!(notified, 3);
        assert_eq!(failed, 0);

        let mut tokens = Vec::new();
        for client in &mut clients {
            let packet = client.read_packet().await.unwrap().unwrap();
            let command: CommandPacket = packet.deserialize().unwrap();
            assert_eq!(command.command_type, CommandType::ServerShutdown);
            let body: ServerShutdownBody = command.body().unwrap();
            assert_eq!(body.grace_period_seconds, 5);
            assert!(body.recommend_reconnect);
            assert_eq!(body.message, "bye");
            tokens.push(body.reconnect_token.unwrap());
        }
        tokens.sort();
        tokens.dedup();
        assert_eq!(tokens.len(), 3);
    }

    /// Draining returns false while a tunnel outlives the grace period
    #[tokio::test]
    async fn test_wait_for_tunnels_deadline() {
        let storage = Arc::new(MemoryStorage::default());
        let manager = manager_on("node-a", storage);

        for index in 0..3 {
            manager
                .tunnels
                .register(TunnelConnection::new(
                    format!("t{}", index),
                    Uuid::new_v4(),
                    "m1".to_string(),
                    "tcp",
                    None,
                ))
                .unwrap();
        }

        // Two tunnels close shortly, the third persists
        {
            let manager = manager.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                manager.tunnels.remove("t0");
                manager.tunnels.remove("t1");
            });
        }

        assert!(!manager.wait_for_tunnels_to_complete(1).await);
        assert_eq!(manager.get_active_tunnel_count(), 1);
    }

    /// The connection quota rejects accepts beyond the limit
    #[tokio::test]
    async fn test_connection_quota() {
        let storage = Arc::new(MemoryStorage::default());
        let cloud = Arc::new(crate::cloud::StorageCloudControl::new(storage.clone()));
        let manager = SessionManager::new(
            SessionOptions {
                node_id: "node-a".to_string(),
                max_connections: Some(1),
                ..Default::default()
            },
            storage,
            cloud,
            "test-secret",
        );

        let _first = control_handshake(&manager, 1, "c1").await;

        let (_client_io, server_io) = tokio::io::duplex(4096);
        let result = manager
            .accept_connection(TransportBackend::Framed(Box::new(server_io)))
            .await;
        assert!(matches!(result, Err(super::SessionError::QuotaExceeded)));
    }

    /// A saved sequenced tunnel can be resumed with its token, keeping
    /// the tunnel id and the receive position
    #[tokio::test]
    async fn test_resume_token_reopens_tunnel() {
        let storage = Arc::new(MemoryStorage::default());
        let manager = manager_on("node-a", storage.clone());
        let mapping = test_mapping(true);
        put_mapping(&storage, &mapping).await;

        let (mut listen_socket, ack) =
            tunnel_handshake(&manager, &mapping, open_request(&mapping, None)).await;
        let tunnel_id = ack.tunnel_id;

        // Deliver one sequenced packet so the snapshot has progress
        listen_socket
            .write_packet(Packet::tunnel_data_seq(1, bytes::Bytes::from_static(b"x")))
            .await
            .unwrap();
        assert!(
            wait_until(
                || {
                    manager
                        .tunnels
                        .snapshot()
                        .iter()
                        .any(|row| row
                            .receive_buffer
                            .as_ref()
                            .is_some_and(|buffer| buffer.lock().next_expected() == 2))
                },
                Duration::from_secs(2)
            )
            .await
        );

        assert_eq!(manager.save_active_tunnel_states().await, 1);
        let token = manager
            .tunnel_states()
            .generate_resume_token(&tunnel_id)
            .await
            .unwrap();

        // Reconnect with the token: same tunnel id comes back
        let (_resumed_socket, resumed_ack) = tunnel_handshake(
            &manager,
            &mapping,
            TunnelOpenRequest {
                tunnel_id: Some(tunnel_id),
                mapping_id: mapping.mapping_id.clone(),
                secret_key: mapping.secret_key.clone(),
                resume_token: Some(token),
            },
        )
        .await;
        assert_eq!(resumed_ack.tunnel_id, tunnel_id);
        assert!(resumed_ack.sequenced);
    }

    /// A long-polling transport speaks the same packet protocol
    #[tokio::test]
    async fn test_control_handshake_over_polling_transport() {
        use crate::session::{
            packet::PacketCodec,
            socket::{PollingAdapter, TransportBackend},
        };
        use bytes::BytesMut;
        use tokio_util::codec::{Decoder, Encoder};

        let storage = Arc::new(MemoryStorage::default());
        let manager = manager_on("node-a", storage);

        let (adapter, mut handle) = PollingAdapter::new();
        {
            let manager = manager.clone();
            tokio::spawn(async move {
                let _ = manager
                    .accept_connection(TransportBackend::HttpPoll(adapter))
                    .await;
            });
        }

        // Push an encoded handshake the way an HTTP front-end would
        let handshake = HandshakeRequest {
            connection_type: ConnectionType::Control,
            client_id: Some(9),
            user_id: None,
            token: Some("token".to_string()),
            mapping_id: None,
            secret_key: None,
            resume_token: None,
        };
        let mut encoded = BytesMut::new();
        PacketCodec
            .encode(
                Packet::json(PacketType::Handshake, &handshake).unwrap(),
                &mut encoded,
            )
            .unwrap();
        handle.push_tx.send(encoded.freeze()).unwrap();

        // Pull the handshake response back out
        let mut buffer = BytesMut::new();
        let response = loop {
            let chunk = handle.pull_rx.recv().await.unwrap();
            buffer.extend_from_slice(&chunk);
            if let Some(packet) = PacketCodec.decode(&mut buffer).unwrap() {
                break packet;
            }
        };
        let response: HandshakeResponse = response.deserialize().unwrap();
        assert!(response.success);

        assert!(
            wait_until(
                || manager.clients.get_by_client_id(9).is_some(),
                Duration::from_secs(2)
            )
            .await
        );
    }

    /// A tunnel handshake with the wrong mapping secret is rejected
    #[tokio::test]
    async fn test_tunnel_handshake_rejects_bad_secret() {
        let storage = Arc::new(MemoryStorage::default());
        let manager = manager_on("node-a", storage.clone());
        put_mapping(&storage, &test_mapping(false)).await;

        let (client_io, server_io) = tokio::io::duplex(4096);
        let server = manager.clone();
        tokio::spawn(async move {
            let _ = server
                .accept_connection(TransportBackend::Framed(Box::new(server_io)))
                .await;
        });

        let mut socket = PacketSocket::new(TransportBackend::Framed(Box::new(client_io)));
        socket
            .write_packet(
                Packet::json(
                    PacketType::Handshake,
                    &HandshakeRequest {
                        connection_type: ConnectionType::Tunnel,
                        client_id: None,
                        user_id: None,
                        token: None,
                        mapping_id: Some("m1".to_string()),
                        secret_key: Some("wrong".to_string()),
                        resume_token: None,
                    },
                )
                .unwrap(),
            )
            .await
            .unwrap();

        let response: HandshakeResponse = socket
            .read_packet()
            .await
            .unwrap()
            .unwrap()
            .deserialize()
            .unwrap();
        assert!(!response.success);
        assert!(response.error.is_some());
    }
}
