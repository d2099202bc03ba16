//! In-process connection registries
//!
//! [ClientRegistry] tracks control connections by connection id and, once
//! authenticated, by client id. [TunnelRegistry] tracks tunnel connections
//! by connection id and tunnel id. Locks are never held across I/O:
//! eviction, kicks and stale cleanup collect rows under the lock and act on
//! them after releasing it.

use super::{
    buffers::{ReceiveBuffer, SendBuffer},
    socket::PacketTx,
};
use crate::utils::types::{ClientId, ConnId, MappingId, TunnelId, UserId};
use hashbrown::HashMap;
use log::warn;
use parking_lot::{Mutex, RwLock};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection id must not be empty")]
    EmptyConnId,
    #[error("connection limit of {0} reached")]
    LimitReached(usize),
}

/// Row describing one long-lived control connection
#[derive(Clone)]
pub struct ControlConnection {
    pub conn_id: ConnId,
    /// Positive once the connection authenticated
    pub client_id: ClientId,
    pub user_id: UserId,
    pub protocol: &'static str,
    pub remote_addr: Option<SocketAddr>,
    /// Writer handle for the connection's socket task
    pub stream: Option<PacketTx>,
    pub created_at: Instant,
    pub last_active_at: Instant,
    pub authenticated: bool,
}

impl ControlConnection {
    pub fn new(conn_id: ConnId, protocol: &'static str, remote_addr: Option<SocketAddr>) -> Self {
        let now = Instant::now();
        Self {
            conn_id,
            client_id: 0,
            user_id: 0,
            protocol,
            remote_addr,
            stream: None,
            created_at: now,
            last_active_at: now,
            authenticated: false,
        }
    }

    fn close_stream(&self) {
        if let Some(stream) = &self.stream {
            stream.close();
        }
    }
}

#[derive(Default)]
struct ClientTable {
    by_conn: HashMap<ConnId, ControlConnection>,
    by_client: HashMap<ClientId, ConnId>,
}

impl ClientTable {
    /// Removes a row from both indices without touching its stream
    fn take(&mut self, conn_id: &str) -> Option<ControlConnection> {
        let row = self.by_conn.remove(conn_id)?;
        if row.authenticated && row.client_id > 0 {
            // Only unbind the client index if it still points at this row
            if self
                .by_client
                .get(&row.client_id)
                .is_some_and(|bound| bound == conn_id)
            {
                self.by_client.remove(&row.client_id);
            }
        }
        Some(row)
    }

    /// Conn id of the oldest row by creation time
    fn oldest(&self) -> Option<ConnId> {
        self.by_conn
            .values()
            .min_by_key(|row| row.created_at)
            .map(|row| row.conn_id.clone())
    }
}

/// Registry of control connections on this node
#[derive(Default)]
pub struct ClientRegistry {
    table: RwLock<ClientTable>,
    /// Optional cap on concurrent control connections
    max_connections: Option<usize>,
}

impl ClientRegistry {
    pub fn new(max_connections: Option<usize>) -> Self {
        Self {
            table: Default::default(),
            max_connections,
        }
    }

    /// Registers a control connection row
    ///
    /// A row already present for the connection id is replaced. When the
    /// connection limit is reached the oldest row is evicted to make room.
    pub fn register(&self, conn: ControlConnection) -> Result<(), RegistryError> {
        if conn.conn_id.is_empty() {
            return Err(RegistryError::EmptyConnId);
        }

        let evicted = {
            let table = &mut *self.table.write();
            let mut evicted = Vec::new();

            if let Some(old) = table.take(&conn.conn_id) {
                evicted.push(old);
            }

            if let Some(limit) = self.max_connections {
                if table.by_conn.len() >= limit {
                    match table.oldest() {
                        Some(oldest_id) => {
                            warn!(
                                "control connection limit {} reached, evicting oldest connection {}",
                                limit, oldest_id
                            );
                            if let Some(old) = table.take(&oldest_id) {
                                evicted.push(old);
                            }
                        }
                        None => return Err(RegistryError::LimitReached(limit)),
                    }
                }
            }

            if conn.authenticated && conn.client_id > 0 {
                table.by_client.insert(conn.client_id, conn.conn_id.clone());
            }
            table.by_conn.insert(conn.conn_id.clone(), conn);

            evicted
        };

        for old in evicted {
            old.close_stream();
        }

        Ok(())
    }

    /// Marks a connection as authenticated and binds its client id index
    pub fn update_auth(&self, conn_id: &str, client_id: ClientId, user_id: UserId) -> bool {
        let table = &mut *self.table.write();
        let row = match table.by_conn.get_mut(conn_id) {
            Some(value) => value,
            None => return false,
        };

        row.client_id = client_id;
        row.user_id = user_id;
        row.authenticated = true;
        table.by_client.insert(client_id, conn_id.to_string());
        true
    }

    /// Removes a connection and closes its stream
    pub fn remove(&self, conn_id: &str) -> Option<ControlConnection> {
        let row = self.table.write().take(conn_id)?;
        row.close_stream();
        Some(row)
    }

    /// Removes a connection without closing its stream, used when
    /// ownership of the underlying transport moves elsewhere
    pub fn unregister(&self, conn_id: &str) -> Option<ControlConnection> {
        self.table.write().take(conn_id)
    }

    /// Kicks any previous connection bound to `client_id` other than
    /// `new_conn_id`
    ///
    /// The kick notice is sent and the stream closed after the lock is
    /// released. Returns whether a connection was kicked.
    pub fn kick_old_connection<F>(&self, client_id: ClientId, new_conn_id: &str, send_kick: F) -> bool
    where
        F: FnOnce(&ControlConnection),
    {
        let old = {
            let table = &mut *self.table.write();
            match table.by_client.get(&client_id) {
                Some(conn_id) if conn_id != new_conn_id => {
                    let conn_id = conn_id.clone();
                    table.take(&conn_id)
                }
                _ => None,
            }
        };

        match old {
            Some(old) => {
                send_kick(&old);
                old.close_stream();
                true
            }
            None => false,
        }
    }

    /// Removes every connection idle for longer than `timeout`
    ///
    /// `close_fn` is called once per removed connection after the lock is
    /// released, before the row's stream is closed. Returns the number of
    /// removed connections.
    pub fn cleanup_stale<F>(&self, timeout: Duration, mut close_fn: F) -> usize
    where
        F: FnMut(&str),
    {
        let now = Instant::now();
        let stale = {
            let table = &mut *self.table.write();
            let stale_ids: Vec<ConnId> = table
                .by_conn
                .values()
                .filter(|row| now.duration_since(row.last_active_at) > timeout)
                .map(|row| row.conn_id.clone())
                .collect();

            stale_ids
                .into_iter()
                .filter_map(|conn_id| table.take(&conn_id))
                .collect::<Vec<_>>()
        };

        let count = stale.len();
        for row in stale {
            close_fn(&row.conn_id);
            row.close_stream();
        }
        count
    }

    /// Refreshes the activity timestamp for a connection
    pub fn touch(&self, conn_id: &str) {
        if let Some(row) = self.table.write().by_conn.get_mut(conn_id) {
            row.last_active_at = Instant::now();
        }
    }

    pub fn get_by_conn_id(&self, conn_id: &str) -> Option<ControlConnection> {
        self.table.read().by_conn.get(conn_id).cloned()
    }

    pub fn get_by_client_id(&self, client_id: ClientId) -> Option<ControlConnection> {
        let table = self.table.read();
        let conn_id = table.by_client.get(&client_id)?;
        table.by_conn.get(conn_id).cloned()
    }

    pub fn count(&self) -> usize {
        self.table.read().by_conn.len()
    }

    /// Cloned row list for iteration without holding the lock
    pub fn snapshot(&self) -> Vec<ControlConnection> {
        self.table.read().by_conn.values().cloned().collect()
    }
}

/// Row describing one tunnel data connection
#[derive(Clone)]
pub struct TunnelConnection {
    pub conn_id: ConnId,
    pub tunnel_id: TunnelId,
    pub mapping_id: MappingId,
    pub protocol: &'static str,
    pub remote_addr: Option<SocketAddr>,
    /// Writer handle, present while the connection carries sequenced
    /// packets (raw tunnels hand their transport to the bridge instead)
    pub stream: Option<PacketTx>,
    pub created_at: Instant,
    pub last_active_at: Instant,
    /// Authenticated against the mapping secret
    pub authenticated: bool,
    /// Sequencing buffers, present when the mapping is sequenced
    pub send_buffer: Option<Arc<Mutex<SendBuffer>>>,
    pub receive_buffer: Option<Arc<Mutex<ReceiveBuffer>>>,
}

impl TunnelConnection {
    pub fn new(
        conn_id: ConnId,
        tunnel_id: TunnelId,
        mapping_id: MappingId,
        protocol: &'static str,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        let now = Instant::now();
        Self {
            conn_id,
            tunnel_id,
            mapping_id,
            protocol,
            remote_addr,
            stream: None,
            created_at: now,
            last_active_at: now,
            authenticated: false,
            send_buffer: None,
            receive_buffer: None,
        }
    }

    fn close_stream(&self) {
        if let Some(stream) = &self.stream {
            stream.close();
        }
    }
}

#[derive(Default)]
struct TunnelTable {
    by_conn: HashMap<ConnId, TunnelConnection>,
    by_tunnel: HashMap<TunnelId, ConnId>,
}

impl TunnelTable {
    fn take(&mut self, conn_id: &str) -> Option<TunnelConnection> {
        let row = self.by_conn.remove(conn_id)?;
        if self
            .by_tunnel
            .get(&row.tunnel_id)
            .is_some_and(|bound| bound == conn_id)
        {
            self.by_tunnel.remove(&row.tunnel_id);
        }
        Some(row)
    }
}

/// Registry of tunnel connections on this node
#[derive(Default)]
pub struct TunnelRegistry {
    table: RwLock<TunnelTable>,
}

impl TunnelRegistry {
    /// Registers a tunnel connection row, replacing any row already
    /// present for the connection id
    pub fn register(&self, conn: TunnelConnection) -> Result<(), RegistryError> {
        if conn.conn_id.is_empty() {
            return Err(RegistryError::EmptyConnId);
        }

        let evicted = {
            let table = &mut *self.table.write();
            let evicted = table.take(&conn.conn_id);
            table.by_tunnel.insert(conn.tunnel_id, conn.conn_id.clone());
            table.by_conn.insert(conn.conn_id.clone(), conn);
            evicted
        };

        if let Some(old) = evicted {
            old.close_stream();
        }
        Ok(())
    }

    pub fn remove(&self, conn_id: &str) -> Option<TunnelConnection> {
        let row = self.table.write().take(conn_id)?;
        row.close_stream();
        Some(row)
    }

    pub fn unregister(&self, conn_id: &str) -> Option<TunnelConnection> {
        self.table.write().take(conn_id)
    }

    pub fn get_by_conn_id(&self, conn_id: &str) -> Option<TunnelConnection> {
        self.table.read().by_conn.get(conn_id).cloned()
    }

    pub fn get_by_tunnel_id(&self, tunnel_id: &TunnelId) -> Option<TunnelConnection> {
        let table = self.table.read();
        let conn_id = table.by_tunnel.get(tunnel_id)?;
        table.by_conn.get(conn_id).cloned()
    }

    pub fn touch(&self, conn_id: &str) {
        if let Some(row) = self.table.write().by_conn.get_mut(conn_id) {
            row.last_active_at = Instant::now();
        }
    }

    pub fn count(&self) -> usize {
        self.table.read().by_conn.len()
    }

    pub fn snapshot(&self) -> Vec<TunnelConnection> {
        self.table.read().by_conn.values().cloned().collect()
    }
}
