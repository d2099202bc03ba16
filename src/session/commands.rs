//! Command execution on the control channel
//!
//! Commands arrive as JSON envelopes on a control connection; most are
//! answered inline, the client-to-client ones (HTTP proxy, DNS, notify)
//! relay through whichever node owns the receiving client and resolve a
//! waiter when the response comes back.

use super::{
    manager::{ControlContext, SessionManager, DNS_TIMEOUT, HTTP_PROXY_TIMEOUT},
    models::{
        CommandPacket, CommandType, CommandResultBody, ConfigGetBody, ConfigSetBody,
        ConfigValueResponse, DisconnectBody, DnsQueryResponse, DnsResolveResponse,
        HttpProxyRequestBody, HttpProxyResponseBody, KickClientBody, KickClientRequestBody,
        NotifyAckResponse, ServerShutdownBody, TunnelMigrateBody,
    },
    packet::{Packet, PacketType},
    registry::ControlConnection,
};
use crate::cross_node::frame::FrameType;
use log::{debug, warn};
use serde::Serialize;
use std::{sync::Arc, time::Duration};

/// Builds a response envelope with a serialized body
fn response<T: Serialize>(command_id: &str, command_type: CommandType, body: &T) -> CommandPacket {
    CommandPacket {
        command_type,
        command_id: command_id.to_string(),
        sender_id: String::new(),
        receiver_id: String::new(),
        token: String::new(),
        command_body: serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string()),
    }
}

/// Response type a request command is answered with
fn response_type(request: CommandType) -> CommandType {
    match request {
        CommandType::HttpProxyRequest => CommandType::HttpProxyResponse,
        other => other,
    }
}

/// Builds the type-appropriate failure response for a request
pub fn error_response(command_id: &str, request: CommandType, message: &str) -> CommandPacket {
    match request {
        CommandType::HttpProxyRequest => response(
            command_id,
            CommandType::HttpProxyResponse,
            &HttpProxyResponseBody {
                status_code: 502,
                headers: Default::default(),
                body: String::new(),
                error: Some(message.to_string()),
            },
        ),
        CommandType::DnsResolve => response(
            command_id,
            CommandType::DnsResolve,
            &DnsResolveResponse {
                success: false,
                ips: Vec::new(),
                error: Some(message.to_string()),
            },
        ),
        CommandType::DnsQuery => response(
            command_id,
            CommandType::DnsQuery,
            &DnsQueryResponse {
                success: false,
                raw_answer: String::new(),
                error: Some(message.to_string()),
            },
        ),
        other => response(
            command_id,
            response_type(other),
            &CommandResultBody::failed(message),
        ),
    }
}

/// Pushes a kick notice onto a control connection's stream
///
/// Only the notice is written here; the caller owns closing the stream.
pub fn send_kick(row: &ControlConnection, code: &str, reason: &str) {
    let stream = match &row.stream {
        Some(value) => value,
        None => return,
    };

    let command = CommandPacket {
        command_type: CommandType::KickClient,
        command_id: format!("kick-{}", row.conn_id),
        sender_id: String::new(),
        receiver_id: row.client_id.to_string(),
        token: String::new(),
        command_body: serde_json::to_string(&KickClientBody {
            reason: reason.to_string(),
            code: code.to_string(),
        })
        .unwrap_or_else(|_| "{}".to_string()),
    };

    match Packet::json(PacketType::JsonCommand, &command) {
        Ok(packet) => {
            stream.send(packet);
        }
        Err(err) => warn!("failed to encode kick notice: {}", err),
    }
}

/// Executes one inbound command, returning the response to write back
/// (requests that are fire-and-forget return [None])
pub async fn execute_command(
    session: &Arc<SessionManager>,
    ctx: &ControlContext,
    command: CommandPacket,
) -> Option<CommandPacket> {
    let command_id = command.command_id.clone();

    match command.command_type {
        CommandType::ConfigGet => {
            let body: ConfigGetBody = match command.body() {
                Ok(value) => value,
                Err(err) => return Some(error_response(&command_id, command.command_type, &err.to_string())),
            };
            let value = session.config_get(&body.key).await;
            Some(response(
                &command_id,
                CommandType::ConfigGet,
                &ConfigValueResponse {
                    key: body.key,
                    value,
                },
            ))
        }

        CommandType::ConfigSet => {
            let body: ConfigSetBody = match command.body() {
                Ok(value) => value,
                Err(err) => return Some(error_response(&command_id, command.command_type, &err.to_string())),
            };
            let result = if session.config_set(&body.key, body.value).await {
                CommandResultBody::ok()
            } else {
                CommandResultBody::failed("failed to store config value")
            };
            Some(response(&command_id, CommandType::ConfigSet, &result))
        }

        CommandType::KickClient => {
            let body: KickClientRequestBody = match command.body() {
                Ok(value) => value,
                Err(err) => return Some(error_response(&command_id, command.command_type, &err.to_string())),
            };
            let kicked = session.kick_client(body.client_id, &body.reason);
            let result = if kicked {
                CommandResultBody::ok()
            } else {
                CommandResultBody::failed("client is not connected to this node")
            };
            Some(response(&command_id, CommandType::KickClient, &result))
        }

        CommandType::HttpProxyRequest => {
            // Per-request timeout override rides in the body
            let timeout = command
                .body::<HttpProxyRequestBody>()
                .ok()
                .and_then(|body| body.timeout_secs)
                .map(Duration::from_secs)
                .unwrap_or(HTTP_PROXY_TIMEOUT);

            let receiver = match command.receiver_id.parse() {
                Ok(value) => value,
                Err(_) => {
                    return Some(error_response(
                        &command_id,
                        command.command_type,
                        "invalid receiver id",
                    ))
                }
            };

            match session
                .relay_command_to_client(receiver, command.clone(), FrameType::HttpProxy, timeout)
                .await
            {
                Ok(response) => Some(response),
                Err(err) => Some(error_response(
                    &command_id,
                    command.command_type,
                    &err.to_string(),
                )),
            }
        }

        CommandType::DnsResolve | CommandType::DnsQuery => {
            let receiver = match command.receiver_id.parse() {
                Ok(value) => value,
                Err(_) => {
                    return Some(error_response(
                        &command_id,
                        command.command_type,
                        "invalid receiver id",
                    ))
                }
            };

            match session
                .relay_command_to_client(receiver, command.clone(), FrameType::DnsQuery, DNS_TIMEOUT)
                .await
            {
                Ok(response) => Some(response),
                Err(err) => Some(error_response(
                    &command_id,
                    command.command_type,
                    &err.to_string(),
                )),
            }
        }

        CommandType::NotifyClient => {
            // Notifications only reach clients on this node; there is no
            // cross-node carrier for them
            let receiver: i64 = match command.receiver_id.parse() {
                Ok(value) => value,
                Err(_) => {
                    return Some(error_response(
                        &command_id,
                        command.command_type,
                        "invalid receiver id",
                    ))
                }
            };

            let row = match session.clients.get_by_client_id(receiver) {
                Some(value) => value,
                None => {
                    return Some(error_response(
                        &command_id,
                        command.command_type,
                        "client is not connected to this node",
                    ))
                }
            };
            let stream = match row.stream {
                Some(value) => value,
                None => {
                    return Some(error_response(
                        &command_id,
                        command.command_type,
                        "client stream unavailable",
                    ))
                }
            };

            match session
                .send_and_await_response(&stream, command.clone(), DNS_TIMEOUT)
                .await
            {
                Ok(response) => Some(response),
                Err(err) => Some(error_response(
                    &command_id,
                    command.command_type,
                    &err.to_string(),
                )),
            }
        }

        CommandType::Disconnect => {
            let body: DisconnectBody = match command.body() {
                Ok(value) => value,
                Err(err) => return Some(error_response(&command_id, command.command_type, &err.to_string())),
            };
            session.close_connection(&body.conn_id).await;
            Some(response(
                &command_id,
                CommandType::Disconnect,
                &CommandResultBody::ok(),
            ))
        }

        CommandType::ServerShutdown => {
            let body: ServerShutdownBody = match command.body() {
                Ok(value) => value,
                Err(err) => return Some(error_response(&command_id, command.command_type, &err.to_string())),
            };

            let session = session.clone();
            tokio::spawn(async move {
                session
                    .broadcast_shutdown(
                        &body.reason,
                        body.grace_period_seconds,
                        body.recommend_reconnect,
                        &body.message,
                    )
                    .await;
            });

            Some(response(
                &command_id,
                CommandType::ServerShutdown,
                &CommandResultBody::ok(),
            ))
        }

        CommandType::TunnelOpenRequestCmd | CommandType::Socks5TunnelRequestCmd => {
            // Tunnel invitations are forwarded to the target client's
            // control stream untouched
            let receiver: i64 = match command.receiver_id.parse() {
                Ok(value) => value,
                Err(_) => {
                    return Some(error_response(
                        &command_id,
                        command.command_type,
                        "invalid receiver id",
                    ))
                }
            };

            let delivered = session
                .clients
                .get_by_client_id(receiver)
                .and_then(|row| row.stream)
                .map(|stream| {
                    Packet::json(PacketType::JsonCommand, &command)
                        .map(|packet| stream.send(packet))
                        .unwrap_or(false)
                })
                .unwrap_or(false);

            let result = if delivered {
                CommandResultBody::ok()
            } else {
                CommandResultBody::failed("target client is not connected to this node")
            };
            Some(response(&command_id, command.command_type, &result))
        }

        CommandType::TunnelMigrate => {
            let body: TunnelMigrateBody = match command.body() {
                Ok(value) => value,
                Err(err) => return Some(error_response(&command_id, command.command_type, &err.to_string())),
            };

            let result = match session
                .migrations()
                .accept_migration(&body.tunnel_id, &body.state_signature)
                .await
            {
                Ok(_) => CommandResultBody::ok(),
                Err(err) => CommandResultBody::failed(err.to_string()),
            };
            Some(response(&command_id, CommandType::TunnelMigrate, &result))
        }

        // Response types never originate a request; resolve any that
        // arrive mislabelled and stay silent
        CommandType::HttpProxyResponse => {
            handle_command_response(session, command);
            None
        }
    }
    .map(|mut reply| {
        reply.sender_id = session.node_id().to_string();
        reply.receiver_id = ctx.client_id.to_string();
        reply
    })
}

/// Routes a command response to the waiter registered for its id
pub fn handle_command_response(session: &Arc<SessionManager>, command: CommandPacket) {
    let command_id = command.command_id.clone();

    match command.command_type {
        CommandType::HttpProxyResponse => match command.body::<HttpProxyResponseBody>() {
            Ok(body) => {
                session.http_proxy_waiters.handle_response(&command_id, body);
            }
            Err(err) => warn!("malformed http proxy response {}: {}", command_id, err),
        },
        CommandType::DnsResolve => match command.body::<DnsResolveResponse>() {
            Ok(body) => {
                session.dns_resolve_waiters.handle_response(&command_id, body);
            }
            Err(err) => warn!("malformed dns resolve response {}: {}", command_id, err),
        },
        CommandType::DnsQuery => match command.body::<DnsQueryResponse>() {
            Ok(body) => {
                session.dns_query_waiters.handle_response(&command_id, body);
            }
            Err(err) => warn!("malformed dns query response {}: {}", command_id, err),
        },
        CommandType::NotifyClient => match command.body::<NotifyAckResponse>() {
            Ok(body) => {
                session.notify_waiters.handle_response(&command_id, body);
            }
            Err(err) => warn!("malformed notify ack {}: {}", command_id, err),
        },
        other => {
            debug!("ignoring response of type {:?} for {}", other, command_id);
        }
    }
}
