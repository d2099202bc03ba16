//! Distributed presence and routing records
//!
//! Answers "which node owns connection X / client Y" across the mesh by
//! keeping TTL-bound records in the shared store. Records are refreshed by
//! heartbeats and expire on their own when a node dies, so the view is
//! eventually consistent rather than strong.

use crate::{
    storage::{Storage, StorageError, StorageValue},
    utils::types::{ClientId, ConnId, MappingId, NodeId, TunnelId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use thiserror::Error;

/// Key prefix for per-connection presence records
const CONN_STATE_PREFIX: &str = "tunnox:conn_state:";
/// Key prefix for the client id -> connection id index
const CLIENT_CONN_PREFIX: &str = "tunnox:client_conn:";
/// Key prefix for pending tunnel routing records
const WAITING_TUNNEL_PREFIX: &str = "waiting_tunnel:";

/// Key under which a node publishes its cross-node listener address
fn node_addr_key(node_id: &str) -> String {
    format!("tunnox:node:{}:addr", node_id)
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("no state record for connection {0}")]
    NotFound(String),
    #[error("state record for connection {0} has expired")]
    ConnectionExpired(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Class of connection a presence record describes
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnType {
    Control,
    Tunnel,
}

/// Presence record for one connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStateInfo {
    #[serde(rename = "connectionID")]
    pub connection_id: ConnId,
    #[serde(rename = "clientID", default)]
    pub client_id: ClientId,
    #[serde(rename = "nodeID", default)]
    pub node_id: NodeId,
    pub protocol: String,
    #[serde(rename = "connType")]
    pub conn_type: ConnType,
    #[serde(rename = "mappingID", default, skip_serializing_if = "Option::is_none")]
    pub mapping_id: Option<MappingId>,
    #[serde(rename = "createdAt", default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "expiresAt", default = "Utc::now")]
    pub expires_at: DateTime<Utc>,
}

/// Routing record published by the listen side while its bridge waits
/// for the target client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelWaitingState {
    #[serde(rename = "tunnelID")]
    pub tunnel_id: TunnelId,
    #[serde(rename = "mappingID")]
    pub mapping_id: MappingId,
    #[serde(rename = "secretKey")]
    pub secret_key: String,
    #[serde(rename = "sourceNodeID")]
    pub source_node_id: NodeId,
    #[serde(rename = "sourceClientID")]
    pub source_client_id: ClientId,
    #[serde(rename = "targetClientID")]
    pub target_client_id: ClientId,
    #[serde(rename = "targetHost")]
    pub target_host: String,
    #[serde(rename = "targetPort")]
    pub target_port: u16,
    #[serde(rename = "expiresAt", default = "Utc::now")]
    pub expires_at: DateTime<Utc>,
}

/// Store-backed view of connection ownership across the mesh
pub struct ConnectionStateStore {
    storage: Arc<dyn Storage>,
    node_id: NodeId,
    ttl: Duration,
}

impl ConnectionStateStore {
    pub fn new(storage: Arc<dyn Storage>, node_id: NodeId, ttl: Duration) -> Self {
        Self {
            storage,
            node_id,
            ttl,
        }
    }

    pub fn own_node_id(&self) -> &str {
        &self.node_id
    }

    /// Publishes a presence record for a connection on this node
    ///
    /// Control connections additionally get a client id index entry so
    /// peers can route by client.
    pub async fn register_connection(
        &self,
        mut state: ConnectionStateInfo,
    ) -> Result<(), StateError> {
        state.node_id = self.node_id.clone();
        state.created_at = Utc::now();
        state.expires_at = Utc::now()
            + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::minutes(5));

        let key = format!("{}{}", CONN_STATE_PREFIX, state.connection_id);
        self.storage
            .set(&key, StorageValue::encode(&state)?, self.ttl)
            .await?;

        if state.conn_type == ConnType::Control && state.client_id > 0 {
            let index_key = format!("{}{}", CLIENT_CONN_PREFIX, state.client_id);
            self.storage
                .set(
                    &index_key,
                    StorageValue::Json(serde_json::Value::String(state.connection_id.clone())),
                    self.ttl,
                )
                .await?;
        }

        Ok(())
    }

    /// Loads a record without the expiry check
    async fn load_raw(&self, conn_id: &str) -> Result<ConnectionStateInfo, StateError> {
        let key = format!("{}{}", CONN_STATE_PREFIX, conn_id);
        let value = self
            .storage
            .get(&key)
            .await?
            .ok_or_else(|| StateError::NotFound(conn_id.to_string()))?;
        Ok(value.decode()?)
    }

    /// Loads the presence record for a connection
    ///
    /// Records past their recorded expiry are surfaced as expired and
    /// best-effort deleted.
    pub async fn get_connection_state(
        &self,
        conn_id: &str,
    ) -> Result<ConnectionStateInfo, StateError> {
        let state = self.load_raw(conn_id).await?;

        if Utc::now() > state.expires_at {
            let key = format!("{}{}", CONN_STATE_PREFIX, conn_id);
            let _ = self.storage.delete(&key).await;
            return Err(StateError::ConnectionExpired(conn_id.to_string()));
        }

        Ok(state)
    }

    /// Node that currently owns a connection
    pub async fn find_connection_node(&self, conn_id: &str) -> Result<NodeId, StateError> {
        Ok(self.get_connection_state(conn_id).await?.node_id)
    }

    /// Node and connection id of a client's control connection
    pub async fn find_client_node(
        &self,
        client_id: ClientId,
    ) -> Result<(NodeId, ConnId), StateError> {
        let index_key = format!("{}{}", CLIENT_CONN_PREFIX, client_id);
        let value = self
            .storage
            .get(&index_key)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("client {}", client_id)))?;
        let conn_id: ConnId = value.decode()?;

        let state = self.get_connection_state(&conn_id).await?;
        Ok((state.node_id, conn_id))
    }

    /// Re-writes a record with a fresh expiry, driven by heartbeats
    pub async fn refresh_connection(&self, conn_id: &str) -> Result<(), StateError> {
        let mut state = self.load_raw(conn_id).await?;
        state.expires_at = Utc::now()
            + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::minutes(5));

        let key = format!("{}{}", CONN_STATE_PREFIX, conn_id);
        self.storage
            .set(&key, StorageValue::encode(&state)?, self.ttl)
            .await?;

        if state.conn_type == ConnType::Control && state.client_id > 0 {
            let index_key = format!("{}{}", CLIENT_CONN_PREFIX, state.client_id);
            self.storage
                .set(
                    &index_key,
                    StorageValue::Json(serde_json::Value::String(state.connection_id.clone())),
                    self.ttl,
                )
                .await?;
        }

        Ok(())
    }

    /// Removes the presence record (and client index) for a connection
    pub async fn unregister_connection(&self, conn_id: &str) -> Result<(), StateError> {
        if let Ok(state) = self.load_raw(conn_id).await {
            if state.conn_type == ConnType::Control && state.client_id > 0 {
                let index_key = format!("{}{}", CLIENT_CONN_PREFIX, state.client_id);
                // Only drop the index while it still points at this
                // connection; a replacement login may have rebound it
                let still_ours = match self.storage.get(&index_key).await {
                    Ok(Some(value)) => value
                        .decode::<ConnId>()
                        .map(|bound| bound == conn_id)
                        .unwrap_or(false),
                    _ => false,
                };
                if still_ours {
                    let _ = self.storage.delete(&index_key).await;
                }
            }
        }

        let key = format!("{}{}", CONN_STATE_PREFIX, conn_id);
        self.storage.delete(&key).await?;
        Ok(())
    }

    pub async fn is_connection_local(&self, conn_id: &str) -> bool {
        matches!(
            self.find_connection_node(conn_id).await,
            Ok(node_id) if node_id == self.node_id
        )
    }

    /// Publishes this node's cross-node listener address
    pub async fn register_node_address(&self, addr: &str) -> Result<(), StateError> {
        self.storage
            .set(
                &node_addr_key(&self.node_id),
                StorageValue::Json(serde_json::Value::String(addr.to_string())),
                self.ttl,
            )
            .await?;
        Ok(())
    }

    /// Looks up the cross-node listener address of a peer node
    pub async fn node_address(&self, node_id: &str) -> Result<Option<String>, StateError> {
        let value = match self.storage.get(&node_addr_key(node_id)).await? {
            Some(value) => value,
            None => return Ok(None),
        };
        Ok(Some(value.decode()?))
    }

    /// Publishes a waiting-tunnel routing record
    pub async fn publish_waiting_tunnel(
        &self,
        mut state: TunnelWaitingState,
        ttl: Duration,
    ) -> Result<(), StateError> {
        state.expires_at =
            Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(10));
        let key = format!("{}{}", WAITING_TUNNEL_PREFIX, state.tunnel_id.simple());
        self.storage
            .set(&key, StorageValue::encode(&state)?, ttl)
            .await?;
        Ok(())
    }

    /// Loads a waiting-tunnel routing record if one is pending
    pub async fn get_waiting_tunnel(
        &self,
        tunnel_id: &TunnelId,
    ) -> Result<Option<TunnelWaitingState>, StateError> {
        let key = format!("{}{}", WAITING_TUNNEL_PREFIX, tunnel_id.simple());
        let value = match self.storage.get(&key).await? {
            Some(value) => value,
            None => return Ok(None),
        };
        let state: TunnelWaitingState = value.decode()?;

        if Utc::now() > state.expires_at {
            let _ = self.storage.delete(&key).await;
            return Ok(None);
        }
        Ok(Some(state))
    }

    /// Removes a waiting-tunnel record after pairing or failure
    pub async fn remove_waiting_tunnel(&self, tunnel_id: &TunnelId) -> Result<(), StateError> {
        let key = format!("{}{}", WAITING_TUNNEL_PREFIX, tunnel_id.simple());
        self.storage.delete(&key).await?;
        Ok(())
    }
}
