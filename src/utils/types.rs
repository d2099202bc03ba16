//! Shared id types used across the session core

use uuid::Uuid;

/// Opaque transport-level connection id
pub type ConnId = String;

/// Id of an authenticated client agent (positive once authenticated)
pub type ClientId = i64;

/// Id of the user owning a client agent
pub type UserId = i64;

/// Id of a port mapping
pub type MappingId = String;

/// Id of a single tunnel session, canonical hex form of a 16 byte uuid
pub type TunnelId = Uuid;

/// Id of a gateway node within the mesh
pub type NodeId = String;
