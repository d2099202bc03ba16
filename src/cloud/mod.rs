//! Port-mapping metadata lookups
//!
//! Mapping configuration is owned by an external service; the session core
//! only needs to resolve a mapping id into its secret and endpoints when a
//! tunnel handshake arrives.

use crate::{
    storage::{Storage, StorageError},
    utils::types::{ClientId, MappingId},
};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Key prefix for mapping records in the shared store
const MAPPING_KEY_PREFIX: &str = "tunnox:mapping:";

/// Metadata describing one configured port mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    #[serde(rename = "mappingID")]
    pub mapping_id: MappingId,
    #[serde(rename = "secretKey")]
    pub secret_key: String,
    #[serde(rename = "listenClientID")]
    pub listen_client_id: ClientId,
    #[serde(rename = "targetClientID")]
    pub target_client_id: ClientId,
    #[serde(rename = "targetHost")]
    pub target_host: String,
    #[serde(rename = "targetPort")]
    pub target_port: u16,
    /// Whether tunnel payload for this mapping is carried as sequenced
    /// packets rather than a raw byte stream
    #[serde(default)]
    pub sequenced: bool,
}

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("mapping {0} not found")]
    MappingNotFound(MappingId),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Lookup surface for mapping metadata
pub trait CloudControl: Send + Sync + 'static {
    fn get_mapping<'a>(
        &'a self,
        mapping_id: &'a str,
    ) -> BoxFuture<'a, Result<PortMapping, CloudError>>;
}

/// Cloud control backed by the shared store
pub struct StorageCloudControl {
    storage: Arc<dyn Storage>,
}

impl StorageCloudControl {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

impl CloudControl for StorageCloudControl {
    fn get_mapping<'a>(
        &'a self,
        mapping_id: &'a str,
    ) -> BoxFuture<'a, Result<PortMapping, CloudError>> {
        Box::pin(async move {
            let key = format!("{}{}", MAPPING_KEY_PREFIX, mapping_id);
            let value = self
                .storage
                .get(&key)
                .await?
                .ok_or_else(|| CloudError::MappingNotFound(mapping_id.to_string()))?;
            Ok(value.decode()?)
        })
    }
}
