//! Durable tunnel snapshots, resume tokens and migration
//!
//! Snapshots let a tunnel survive a graceful shutdown or move between
//! nodes: sequence state and unacknowledged payload are written to the
//! shared store under an HMAC signature, and any reload whose recomputed
//! signature differs is rejected outright.

use super::buffers::BufferedPacket;
use crate::{
    storage::{Storage, StorageError, StorageValue},
    utils::{
        signing::SigningKey,
        types::{ClientId, MappingId, NodeId, TunnelId},
    },
};
use base64ct::{Base64UrlUnpadded, Encoding};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use log::debug;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use thiserror::Error;

/// Key prefix for tunnel snapshots in the shared store
const STATE_KEY_PREFIX: &str = "tunnel:state:";
/// Lifetime of a stored snapshot
const STATE_TTL: Duration = Duration::from_secs(5 * 60);
/// Maximum age of a resume token
const RESUME_TOKEN_VALIDITY: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum TunnelStateError {
    #[error("no stored state for tunnel {0}")]
    NotFound(TunnelId),
    #[error("stored state for tunnel {0} failed signature verification")]
    TamperedState(TunnelId),
    #[error("resume token signature does not match stored state")]
    SignatureMismatch,
    #[error("resume token has expired")]
    Expired,
    #[error("malformed resume token: {0}")]
    MalformedToken(serde_json::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// One buffered packet captured into a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPacket {
    #[serde(rename = "seqNum")]
    pub seq_num: u32,
    /// Payload bytes, base64 encoded
    pub data: String,
    #[serde(rename = "retryCount", default)]
    pub retry_count: u32,
}

impl StoredPacket {
    pub fn from_buffered(packet: &BufferedPacket) -> Self {
        Self {
            seq_num: packet.seq,
            data: Base64UrlUnpadded::encode_string(&packet.data),
            retry_count: packet.retry_count,
        }
    }

    pub fn payload(&self) -> Option<Bytes> {
        Base64UrlUnpadded::decode_vec(&self.data)
            .ok()
            .map(Bytes::from)
    }
}

/// Durable snapshot of one tunnel's sequencing state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelState {
    #[serde(rename = "tunnelID")]
    pub tunnel_id: TunnelId,
    #[serde(rename = "mappingID")]
    pub mapping_id: MappingId,
    #[serde(rename = "listenClientID")]
    pub listen_client_id: ClientId,
    #[serde(rename = "targetClientID")]
    pub target_client_id: ClientId,
    #[serde(rename = "lastSeqNum")]
    pub last_seq_num: u32,
    #[serde(rename = "lastAckNum")]
    pub last_ack_num: u32,
    #[serde(rename = "nextExpectedSeq")]
    pub next_expected_seq: u32,
    #[serde(rename = "bufferedPackets", default)]
    pub buffered_packets: Vec<StoredPacket>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    /// HMAC over the canonical field string, filled in on save
    #[serde(default)]
    pub signature: String,
}

impl TunnelState {
    pub fn new(
        tunnel_id: TunnelId,
        mapping_id: MappingId,
        listen_client_id: ClientId,
        target_client_id: ClientId,
    ) -> Self {
        let now = Utc::now();
        Self {
            tunnel_id,
            mapping_id,
            listen_client_id,
            target_client_id,
            last_seq_num: 0,
            last_ack_num: 0,
            next_expected_seq: 1,
            buffered_packets: Vec::new(),
            created_at: now,
            updated_at: now,
            signature: String::new(),
        }
    }

    /// Canonical string the signature covers: every field except the
    /// signature itself, in a fixed order
    fn canonical_string(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.tunnel_id.simple(),
            self.mapping_id,
            self.listen_client_id,
            self.target_client_id,
            self.last_seq_num,
            self.last_ack_num,
            self.next_expected_seq,
            self.created_at.timestamp(),
            self.updated_at.timestamp(),
        )
    }
}

/// A signed grant allowing a reconnecting client to resume a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeToken {
    #[serde(rename = "tunnelID")]
    pub tunnel_id: TunnelId,
    pub signature: String,
    #[serde(rename = "issuedAt")]
    pub issued_at: DateTime<Utc>,
}

/// Signed snapshot store for tunnel state
pub struct TunnelStateManager {
    storage: Arc<dyn Storage>,
    key: SigningKey,
}

impl TunnelStateManager {
    pub fn new(storage: Arc<dyn Storage>, key: SigningKey) -> Self {
        Self { storage, key }
    }

    fn sign(&self, state: &TunnelState) -> String {
        let tag = self.key.sign(state.canonical_string().as_bytes());
        Base64UrlUnpadded::encode_string(tag.as_ref())
    }

    /// Stamps, signs and stores a snapshot
    pub async fn save_state(&self, mut state: TunnelState) -> Result<TunnelState, TunnelStateError> {
        state.updated_at = Utc::now();
        state.signature = self.sign(&state);

        let key = format!("{}{}", STATE_KEY_PREFIX, state.tunnel_id.simple());
        self.storage
            .set(&key, StorageValue::encode(&state)?, STATE_TTL)
            .await?;

        debug!("saved tunnel state for {}", state.tunnel_id.simple());
        Ok(state)
    }

    /// Loads a snapshot without checking its signature
    async fn load_raw(&self, tunnel_id: &TunnelId) -> Result<TunnelState, TunnelStateError> {
        let key = format!("{}{}", STATE_KEY_PREFIX, tunnel_id.simple());
        let value = self
            .storage
            .get(&key)
            .await?
            .ok_or(TunnelStateError::NotFound(*tunnel_id))?;
        Ok(value.decode()?)
    }

    /// Loads a snapshot, rejecting any whose signature does not verify
    pub async fn load_state(&self, tunnel_id: &TunnelId) -> Result<TunnelState, TunnelStateError> {
        let state = self.load_raw(tunnel_id).await?;

        if self.sign(&state) != state.signature {
            return Err(TunnelStateError::TamperedState(*tunnel_id));
        }

        Ok(state)
    }

    pub async fn delete_state(&self, tunnel_id: &TunnelId) -> Result<(), TunnelStateError> {
        let key = format!("{}{}", STATE_KEY_PREFIX, tunnel_id.simple());
        self.storage.delete(&key).await?;
        Ok(())
    }

    /// Mints a resume token for the currently stored snapshot
    pub async fn generate_resume_token(
        &self,
        tunnel_id: &TunnelId,
    ) -> Result<String, TunnelStateError> {
        let state = self.load_state(tunnel_id).await?;
        let token = ResumeToken {
            tunnel_id: *tunnel_id,
            signature: state.signature,
            issued_at: Utc::now(),
        };
        serde_json::to_string(&token).map_err(TunnelStateError::MalformedToken)
    }

    /// Validates a resume token against the stored snapshot, returning
    /// the snapshot on success
    pub async fn validate_resume_token(
        &self,
        token: &str,
    ) -> Result<TunnelState, TunnelStateError> {
        let token: ResumeToken =
            serde_json::from_str(token).map_err(TunnelStateError::MalformedToken)?;

        let age = Utc::now().signed_duration_since(token.issued_at);
        if age > chrono::Duration::from_std(RESUME_TOKEN_VALIDITY).unwrap_or_else(|_| chrono::Duration::minutes(5)) {
            return Err(TunnelStateError::Expired);
        }

        // A key that disagrees with the stored signature cannot vouch for
        // the token, and neither can a token naming a stale signature
        let state = self.load_raw(&token.tunnel_id).await?;
        if self.sign(&state) != state.signature {
            return Err(TunnelStateError::SignatureMismatch);
        }
        if state.signature != token.signature {
            return Err(TunnelStateError::SignatureMismatch);
        }

        Ok(state)
    }
}

/// Progress of a tunnel migration on this node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationStatus {
    InProgress,
    Completed,
    Failed(String),
}

/// Coordinates moving a tunnel snapshot between nodes
pub struct TunnelMigrationManager {
    states: Arc<TunnelStateManager>,
    statuses: RwLock<HashMap<TunnelId, MigrationStatus>>,
}

impl TunnelMigrationManager {
    pub fn new(states: Arc<TunnelStateManager>) -> Self {
        Self {
            states,
            statuses: Default::default(),
        }
    }

    /// Source side: stores the snapshot and marks the migration started,
    /// returning the signature the target must present
    pub async fn initiate_migration(
        &self,
        tunnel_id: TunnelId,
        target_node_id: &NodeId,
        state: TunnelState,
    ) -> Result<String, TunnelStateError> {
        let saved = self.states.save_state(state).await?;
        self.statuses
            .write()
            .insert(tunnel_id, MigrationStatus::InProgress);

        debug!(
            "initiated migration of tunnel {} to node {}",
            tunnel_id.simple(),
            target_node_id
        );
        Ok(saved.signature)
    }

    /// Target side: loads the snapshot and checks it is the one the
    /// source handed over
    pub async fn accept_migration(
        &self,
        tunnel_id: &TunnelId,
        state_signature: &str,
    ) -> Result<TunnelState, TunnelStateError> {
        let state = self.states.load_state(tunnel_id).await?;
        if state.signature != state_signature {
            self.statuses.write().insert(
                *tunnel_id,
                MigrationStatus::Failed("signature mismatch".to_string()),
            );
            return Err(TunnelStateError::SignatureMismatch);
        }

        self.statuses
            .write()
            .insert(*tunnel_id, MigrationStatus::InProgress);
        Ok(state)
    }

    /// Either side: the tunnel is live on its new node, drop the record
    pub async fn complete_migration(&self, tunnel_id: &TunnelId) -> Result<(), TunnelStateError> {
        self.states.delete_state(tunnel_id).await?;
        self.statuses
            .write()
            .insert(*tunnel_id, MigrationStatus::Completed);
        Ok(())
    }

    /// Terminal error path for a migration
    pub fn fail_migration(&self, tunnel_id: &TunnelId, reason: impl Into<String>) {
        self.statuses
            .write()
            .insert(*tunnel_id, MigrationStatus::Failed(reason.into()));
    }

    pub fn migration_status(&self, tunnel_id: &TunnelId) -> Option<MigrationStatus> {
        self.statuses.read().get(tunnel_id).cloned()
    }
}

/// Mints and verifies the reconnect tokens handed out before a graceful
/// shutdown
pub struct ReconnectTokens {
    key: SigningKey,
}

impl ReconnectTokens {
    /// How long a reconnect token remains usable
    const VALIDITY: Duration = Duration::from_secs(60 * 60);

    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    pub fn create_token(&self, client_id: ClientId) -> String {
        let exp = (Utc::now()
            + chrono::Duration::from_std(Self::VALIDITY).unwrap_or_else(|_| chrono::Duration::zero()))
        .timestamp() as u64;

        let mut data = [0u8; 16];
        data[..8].copy_from_slice(&client_id.to_be_bytes());
        data[8..].copy_from_slice(&exp.to_be_bytes());

        let msg = Base64UrlUnpadded::encode_string(&data);
        let sig = self.key.sign(&data);
        let sig = Base64UrlUnpadded::encode_string(sig.as_ref());

        [msg, sig].join(".")
    }

    pub fn verify_token(&self, token: &str) -> Result<ClientId, TunnelStateError> {
        let (msg_raw, sig_raw) = token
            .split_once('.')
            .ok_or(TunnelStateError::SignatureMismatch)?;

        let mut msg = [0u8; 16];
        Base64UrlUnpadded::decode(msg_raw, &mut msg)
            .map_err(|_| TunnelStateError::SignatureMismatch)?;

        let mut sig = [0u8; 32];
        Base64UrlUnpadded::decode(sig_raw, &mut sig)
            .map_err(|_| TunnelStateError::SignatureMismatch)?;

        if !self.key.verify(&msg, &sig) {
            return Err(TunnelStateError::SignatureMismatch);
        }

        let mut id = [0u8; 8];
        id.copy_from_slice(&msg[..8]);
        let client_id = ClientId::from_be_bytes(id);

        let mut exp = [0u8; 8];
        exp.copy_from_slice(&msg[8..]);
        let exp = u64::from_be_bytes(exp);

        if (exp as i64) < Utc::now().timestamp() {
            return Err(TunnelStateError::Expired);
        }

        Ok(client_id)
    }
}

#[cfg(test)]
mod test {
    use super::{
        ReconnectTokens, ResumeToken, TunnelState, TunnelStateError, TunnelStateManager,
    };
    use crate::{
        storage::{MemoryStorage, Storage},
        utils::signing::SigningKey,
    };
    use chrono::Utc;
    use std::sync::Arc;
    use uuid::Uuid;

    fn manager(secret: &str) -> (TunnelStateManager, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::default());
        (
            TunnelStateManager::new(storage.clone(), SigningKey::from_secret(secret)),
            storage,
        )
    }

    fn shared_manager(storage: Arc<MemoryStorage>, secret: &str) -> TunnelStateManager {
        TunnelStateManager::new(storage, SigningKey::from_secret(secret))
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let (manager, _) = manager("k");
        let tunnel_id = Uuid::new_v4();
        let mut state = TunnelState::new(tunnel_id, "m1".to_string(), 1, 2);
        state.last_seq_num = 10;
        state.next_expected_seq = 4;

        let saved = manager.save_state(state).await.unwrap();
        let loaded = manager.load_state(&tunnel_id).await.unwrap();

        assert_eq!(loaded.signature, saved.signature);
        assert_eq!(loaded.last_seq_num, 10);
        assert_eq!(loaded.next_expected_seq, 4);
        assert_eq!(loaded.listen_client_id, 1);
        assert_eq!(loaded.target_client_id, 2);
    }

    /// Any change to a covered field must fail the reload
    #[tokio::test]
    async fn test_tampered_state_rejected() {
        let storage = Arc::new(MemoryStorage::default());
        let manager = shared_manager(storage.clone(), "k");
        let tunnel_id = Uuid::new_v4();
        let state = TunnelState::new(tunnel_id, "m1".to_string(), 1, 2);
        let mut saved = manager.save_state(state).await.unwrap();

        // Rewrite the stored record with a modified sequence number but
        // the original signature
        saved.last_seq_num += 1;
        let key = format!("tunnel:state:{}", tunnel_id.simple());
        storage
            .set(
                &key,
                crate::storage::StorageValue::encode(&saved).unwrap(),
                std::time::Duration::from_secs(60),
            )
            .await
            .unwrap();

        assert!(matches!(
            manager.load_state(&tunnel_id).await,
            Err(TunnelStateError::TamperedState(_))
        ));
    }

    #[tokio::test]
    async fn test_resume_token_roundtrip() {
        let storage = Arc::new(MemoryStorage::default());
        let manager = shared_manager(storage.clone(), "k");
        let tunnel_id = Uuid::new_v4();
        manager
            .save_state(TunnelState::new(tunnel_id, "m".to_string(), 1, 2))
            .await
            .unwrap();

        let token = manager.generate_resume_token(&tunnel_id).await.unwrap();

        // Same secret on another node accepts the token
        let peer = shared_manager(storage.clone(), "k");
        let state = peer.validate_resume_token(&token).await.unwrap();
        assert_eq!(state.tunnel_id, tunnel_id);

        // A different secret must reject it as a signature mismatch
        let wrong = shared_manager(storage, "k2");
        assert!(matches!(
            wrong.validate_resume_token(&token).await,
            Err(TunnelStateError::SignatureMismatch)
        ));
    }

    #[tokio::test]
    async fn test_resume_token_expiry() {
        let storage = Arc::new(MemoryStorage::default());
        let manager = shared_manager(storage, "k");
        let tunnel_id = Uuid::new_v4();
        let saved = manager
            .save_state(TunnelState::new(tunnel_id, "m".to_string(), 1, 2))
            .await
            .unwrap();

        // Token issued six minutes ago
        let token = ResumeToken {
            tunnel_id,
            signature: saved.signature,
            issued_at: Utc::now() - chrono::Duration::minutes(6),
        };
        let token = serde_json::to_string(&token).unwrap();

        assert!(matches!(
            manager.validate_resume_token(&token).await,
            Err(TunnelStateError::Expired)
        ));
    }

    #[tokio::test]
    async fn test_migration_accept_and_complete() {
        use super::{MigrationStatus, TunnelMigrationManager};

        let storage = Arc::new(MemoryStorage::default());
        let source = Arc::new(shared_manager(storage.clone(), "k"));
        let target = Arc::new(shared_manager(storage, "k"));

        let source_migrations = TunnelMigrationManager::new(source);
        let target_migrations = TunnelMigrationManager::new(target);

        let tunnel_id = Uuid::new_v4();
        let mut state = TunnelState::new(tunnel_id, "m".to_string(), 1, 2);
        state.last_seq_num = 9;

        let signature = source_migrations
            .initiate_migration(tunnel_id, &"node-b".to_string(), state)
            .await
            .unwrap();
        assert_eq!(
            source_migrations.migration_status(&tunnel_id),
            Some(MigrationStatus::InProgress)
        );

        let accepted = target_migrations
            .accept_migration(&tunnel_id, &signature)
            .await
            .unwrap();
        assert_eq!(accepted.last_seq_num, 9);

        target_migrations.complete_migration(&tunnel_id).await.unwrap();
        assert_eq!(
            target_migrations.migration_status(&tunnel_id),
            Some(MigrationStatus::Completed)
        );

        // The snapshot is gone once the migration completed
        assert!(matches!(
            target_migrations.accept_migration(&tunnel_id, &signature).await,
            Err(TunnelStateError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_migration_rejects_wrong_signature() {
        use super::{MigrationStatus, TunnelMigrationManager};

        let storage = Arc::new(MemoryStorage::default());
        let manager = Arc::new(shared_manager(storage, "k"));
        let migrations = TunnelMigrationManager::new(manager);

        let tunnel_id = Uuid::new_v4();
        migrations
            .initiate_migration(
                tunnel_id,
                &"node-b".to_string(),
                TunnelState::new(tunnel_id, "m".to_string(), 1, 2),
            )
            .await
            .unwrap();

        assert!(matches!(
            migrations.accept_migration(&tunnel_id, "bogus").await,
            Err(TunnelStateError::SignatureMismatch)
        ));
        assert!(matches!(
            migrations.migration_status(&tunnel_id),
            Some(MigrationStatus::Failed(_))
        ));
    }

    #[test]
    fn test_reconnect_token_roundtrip() {
        let (key, _) = SigningKey::generate();
        let tokens = ReconnectTokens::new(key);

        let token = tokens.create_token(42);
        assert_eq!(tokens.verify_token(&token).unwrap(), 42);

        let (other_key, _) = SigningKey::generate();
        let other = ReconnectTokens::new(other_key);
        assert!(other.verify_token(&token).is_err());
    }
}
