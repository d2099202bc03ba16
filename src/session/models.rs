//! JSON payload models for control-channel packets
//!
//! Field names follow the wire contract of the client agents, hence the
//! explicit renames on id-suffixed fields.

use crate::utils::types::{ClientId, MappingId, NodeId, TunnelId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Role a connection declares during its handshake
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Control,
    Tunnel,
}

/// Payload of a [PacketType::Handshake](super::packet::PacketType) packet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    #[serde(rename = "ConnectionType")]
    pub connection_type: ConnectionType,
    /// Client id for control connections
    #[serde(rename = "clientID", default)]
    pub client_id: Option<ClientId>,
    /// User id the client agent belongs to
    #[serde(rename = "userID", default)]
    pub user_id: Option<UserId>,
    /// Auth token for control connections
    #[serde(default)]
    pub token: Option<String>,
    /// Mapping the tunnel connection belongs to
    #[serde(rename = "mappingID", default)]
    pub mapping_id: Option<MappingId>,
    /// Mapping secret authenticating a tunnel connection
    #[serde(rename = "secretKey", default)]
    pub secret_key: Option<String>,
    /// Resume token from a previous graceful shutdown
    #[serde(rename = "resumeToken", default)]
    pub resume_token: Option<String>,
}

/// Payload of a handshake response packet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub success: bool,
    #[serde(rename = "connID")]
    pub conn_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload of a tunnel open packet
///
/// A listen-side open omits the tunnel id (the gateway allocates one), a
/// target-side bind names the tunnel it was invited to, and a resume names
/// the tunnel alongside its resume token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelOpenRequest {
    #[serde(rename = "tunnelID", default)]
    pub tunnel_id: Option<TunnelId>,
    #[serde(rename = "mappingID")]
    pub mapping_id: MappingId,
    #[serde(rename = "secretKey")]
    pub secret_key: String,
    #[serde(rename = "resumeToken", default)]
    pub resume_token: Option<String>,
}

/// Payload of a tunnel open acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelOpenAck {
    #[serde(rename = "tunnelID")]
    pub tunnel_id: TunnelId,
    pub success: bool,
    /// Whether payload for this tunnel is carried as sequenced packets
    #[serde(default)]
    pub sequenced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Types of commands carried in [CommandPacket]s
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandType {
    ConfigGet,
    ConfigSet,
    KickClient,
    #[serde(rename = "HTTPProxyRequest")]
    HttpProxyRequest,
    #[serde(rename = "HTTPProxyResponse")]
    HttpProxyResponse,
    #[serde(rename = "DNSResolve")]
    DnsResolve,
    #[serde(rename = "DNSQuery")]
    DnsQuery,
    NotifyClient,
    Disconnect,
    ServerShutdown,
    TunnelOpenRequestCmd,
    #[serde(rename = "SOCKS5TunnelRequestCmd")]
    Socks5TunnelRequestCmd,
    TunnelMigrate,
}

/// Envelope for commands and command responses on the control channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPacket {
    #[serde(rename = "commandType")]
    pub command_type: CommandType,
    #[serde(rename = "commandId")]
    pub command_id: String,
    #[serde(rename = "senderId", default)]
    pub sender_id: String,
    #[serde(rename = "receiverId", default)]
    pub receiver_id: String,
    #[serde(default)]
    pub token: String,
    /// Command specific payload as a JSON string
    #[serde(rename = "commandBody")]
    pub command_body: String,
}

impl CommandPacket {
    /// Deserializes the command body as the provided type
    pub fn body<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.command_body)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigGetBody {
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSetBody {
    pub key: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigValueResponse {
    pub key: String,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

/// Kick notice pushed to a client before its connection is closed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KickClientBody {
    pub reason: String,
    pub code: String,
}

/// Kick codes surfaced to clients
pub mod kick_codes {
    pub const DUPLICATE_LOGIN: &str = "DUPLICATE_LOGIN";
    pub const ADMIN_KICK: &str = "ADMIN_KICK";
}

/// Admin request to kick a client off the mesh
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KickClientRequestBody {
    #[serde(rename = "clientID")]
    pub client_id: ClientId,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpProxyRequestBody {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
    /// Per-request wait override in seconds
    #[serde(rename = "timeoutSecs", default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpProxyResponseBody {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsResolveBody {
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsResolveResponse {
    pub success: bool,
    #[serde(rename = "IPs", default)]
    pub ips: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsQueryBody {
    /// Raw DNS query message, base64 encoded
    #[serde(rename = "rawQuery")]
    pub raw_query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsQueryResponse {
    pub success: bool,
    /// Raw DNS answer message, base64 encoded
    #[serde(rename = "rawAnswer", default)]
    pub raw_answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyClientBody {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyAckResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectBody {
    #[serde(rename = "connID")]
    pub conn_id: String,
    #[serde(default)]
    pub reason: String,
}

/// Shutdown notice broadcast to every control connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerShutdownBody {
    pub reason: String,
    #[serde(rename = "gracePeriodSeconds")]
    pub grace_period_seconds: u64,
    #[serde(rename = "recommendReconnect")]
    pub recommend_reconnect: bool,
    pub message: String,
    #[serde(rename = "reconnectToken", default, skip_serializing_if = "Option::is_none")]
    pub reconnect_token: Option<String>,
}

/// Invitation for a target client to open a tunnel connection, used by
/// both the TCP and SOCKS5 request commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelInviteBody {
    #[serde(rename = "tunnelID")]
    pub tunnel_id: TunnelId,
    #[serde(rename = "mappingID")]
    pub mapping_id: MappingId,
    #[serde(rename = "targetHost")]
    pub target_host: String,
    #[serde(rename = "targetPort")]
    pub target_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelMigrateBody {
    #[serde(rename = "tunnelID")]
    pub tunnel_id: TunnelId,
    #[serde(rename = "targetNodeID")]
    pub target_node_id: NodeId,
    #[serde(rename = "stateSignature")]
    pub state_signature: String,
}

/// Generic command response body used when a handler only reports
/// success or failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResultBody {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResultBody {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}
