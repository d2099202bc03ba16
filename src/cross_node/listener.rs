//! Inbound side of the cross-node fabric
//!
//! Accepts TCP connections from peer nodes. The first frame on a
//! connection dictates its role: `TargetReady` turns it into the remote
//! side of a tunnel bridge, `HTTPProxy` / `DNSQuery` make it a
//! request-response channel for relayed client RPCs. Unknown or reserved
//! frame types abort that one connection only.

use super::frame::{read_frame, write_frame, Frame, FrameType};
use crate::session::{manager::SessionManager, models::CommandPacket};
use log::{debug, error, warn};
use std::{net::SocketAddr, sync::Weak};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
};

/// Accept loop for the cross-node listener
///
/// The listener only ever holds a weak reference back to the session
/// manager; shutdown tears the manager down without the accept loop
/// keeping it alive.
pub async fn run_listener(
    listener: TcpListener,
    session: Weak<SessionManager>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        match accepted {
            Ok((stream, addr)) => {
                let session = session.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_peer_connection(session, stream, addr).await {
                        debug!("cross-node connection from {} ended: {}", addr, err);
                    }
                });
            }
            Err(err) => {
                error!("cross-node accept failed: {}", err);
                break;
            }
        }
    }

    debug!("cross-node listener stopped");
}

/// Drives one inbound peer connection
async fn handle_peer_connection(
    session: Weak<SessionManager>,
    mut stream: TcpStream,
    addr: SocketAddr,
) -> std::io::Result<()> {
    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(Some(frame)) => frame,
            // Peer closed between frames
            Ok(None) => return Ok(()),
            Err(err) => {
                warn!("malformed frame from peer {}: {}", addr, err);
                return Ok(());
            }
        };

        let session = match session.upgrade() {
            Some(session) => session,
            // Session manager is gone, shutting down
            None => return Ok(()),
        };

        match frame.frame_type {
            FrameType::TargetReady => {
                let peer_node = match String::from_utf8(frame.payload.to_vec()) {
                    Ok(value) => value,
                    Err(_) => {
                        warn!("target-ready frame from {} with invalid node id", addr);
                        return Ok(());
                    }
                };

                debug!(
                    "peer {} attaching target for tunnel {} from node {}",
                    addr,
                    frame.tunnel_id.simple(),
                    peer_node
                );

                // The connection becomes the remote side of the bridge
                // for the rest of its life
                if let Err(err) = session
                    .attach_cross_node_target(frame.tunnel_id, peer_node, stream)
                    .await
                {
                    warn!(
                        "failed to attach cross-node target for tunnel {}: {}",
                        frame.tunnel_id.simple(),
                        err
                    );
                }
                return Ok(());
            }

            FrameType::HttpProxy | FrameType::DnsQuery => {
                let command: CommandPacket = match serde_json::from_slice(&frame.payload) {
                    Ok(value) => value,
                    Err(err) => {
                        warn!("malformed relayed command from {}: {}", addr, err);
                        return Ok(());
                    }
                };

                let response = session.relay_inbound_command(command).await;
                let response_type = match frame.frame_type {
                    FrameType::HttpProxy => FrameType::HttpResponse,
                    _ => FrameType::DnsResponse,
                };

                let payload = match serde_json::to_vec(&response) {
                    Ok(value) => value,
                    Err(err) => {
                        error!("failed to encode relayed response: {}", err);
                        return Ok(());
                    }
                };

                if let Err(err) =
                    write_frame(&mut stream, &Frame::control(response_type, payload)).await
                {
                    debug!("failed to reply to peer {}: {}", addr, err);
                    return Ok(());
                }
                // Pooled peer connections are reused for further requests
            }

            // Reserved codes with no routed handler, and anything a peer
            // should not initiate
            other => {
                warn!(
                    "refusing {:?} frame from peer {}, closing connection",
                    other, addr
                );
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::run_listener;
    use crate::{
        cloud::StorageCloudControl,
        cross_node::frame::{read_frame, write_frame, Frame, FrameType},
        session::{
            manager::{SessionManager, SessionOptions},
            models::{
                CommandPacket, CommandType, ConnectionType, HandshakeRequest, HandshakeResponse,
                HttpProxyResponseBody,
            },
            packet::{Packet, PacketType},
            socket::{PacketSocket, TransportBackend},
        },
        storage::MemoryStorage,
    };
    use bytes::Bytes;
    use std::{sync::Arc, time::Duration};
    use tokio::net::{TcpListener, TcpStream};
    use uuid::Uuid;

    async fn listening_manager() -> (Arc<SessionManager>, std::net::SocketAddr) {
        let storage = Arc::new(MemoryStorage::default());
        let cloud = Arc::new(StorageCloudControl::new(storage.clone()));
        let manager =
            SessionManager::new(SessionOptions::default(), storage, cloud, "test-secret");

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run_listener(
            listener,
            Arc::downgrade(&manager),
            manager.shutdown_signal(),
        ));
        (manager, addr)
    }

    /// Reserved frame types as the first frame get the connection closed
    #[tokio::test]
    async fn test_reserved_first_frame_refused() {
        let (_manager, addr) = listening_manager().await;

        let mut peer = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut peer, &Frame::control(FrameType::Ack, Bytes::new()))
            .await
            .unwrap();

        // The listener drops the connection without replying
        let result = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut peer))
            .await
            .unwrap();
        assert!(matches!(result, Ok(None) | Err(_)));
    }

    /// A target-ready frame for an unknown tunnel closes the connection
    /// without taking the listener down
    #[tokio::test]
    async fn test_target_ready_for_unknown_tunnel() {
        let (_manager, addr) = listening_manager().await;

        let mut peer = TcpStream::connect(addr).await.unwrap();
        let frame = Frame::new(
            Uuid::new_v4(),
            FrameType::TargetReady,
            Bytes::from_static(b"node-x"),
        );
        write_frame(&mut peer, &frame).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut peer))
            .await
            .unwrap();
        assert!(matches!(result, Ok(None) | Err(_)));

        // The listener still accepts new connections afterwards
        let _second = TcpStream::connect(addr).await.unwrap();
    }

    /// Relayed HTTP proxy frames reach the local client and the response
    /// frame comes back on the same peer connection
    #[tokio::test]
    async fn test_http_proxy_frame_relay() {
        let (manager, addr) = listening_manager().await;

        // Local client 2 on the listening node
        let (client_io, server_io) = tokio::io::duplex(16384);
        {
            let manager = manager.clone();
            tokio::spawn(async move {
                let _ = manager
                    .accept_connection(TransportBackend::Framed(Box::new(server_io)))
                    .await;
            });
        }
        let mut client = PacketSocket::new(TransportBackend::Framed(Box::new(client_io)));
        client
            .write_packet(
                Packet::json(
                    PacketType::Handshake,
                    &HandshakeRequest {
                        connection_type: ConnectionType::Control,
                        client_id: Some(2),
                        user_id: None,
                        token: Some("token".to_string()),
                        mapping_id: None,
                        secret_key: None,
                        resume_token: None,
                    },
                )
                .unwrap(),
            )
            .await
            .unwrap();
        let response: HandshakeResponse = client
            .read_packet()
            .await
            .unwrap()
            .unwrap()
            .deserialize()
            .unwrap();
        assert!(response.success);

        // The client answers the proxied request when it arrives
        let client_task = tokio::spawn(async move {
            loop {
                let packet = client.read_packet().await.unwrap().unwrap();
                if packet.header.ty != PacketType::JsonCommand {
                    continue;
                }
                let command: CommandPacket = packet.deserialize().unwrap();
                if command.command_type != CommandType::HttpProxyRequest {
                    continue;
                }

                let reply = CommandPacket {
                    command_type: CommandType::HttpProxyResponse,
                    command_id: command.command_id,
                    sender_id: "2".to_string(),
                    receiver_id: command.sender_id,
                    token: String::new(),
                    command_body: serde_json::to_string(&HttpProxyResponseBody {
                        status_code: 204,
                        headers: Default::default(),
                        body: String::new(),
                        error: None,
                    })
                    .unwrap(),
                };
                client
                    .write_packet(Packet::json(PacketType::CommandResp, &reply).unwrap())
                    .await
                    .unwrap();
                break;
            }
        });

        // A peer node relays an HTTP proxy request for client 2
        let request = CommandPacket {
            command_type: CommandType::HttpProxyRequest,
            command_id: "relay-1".to_string(),
            sender_id: "node-b".to_string(),
            receiver_id: "2".to_string(),
            token: String::new(),
            command_body: r#"{"method":"GET","url":"http://x/","headers":{},"body":""}"#
                .to_string(),
        };

        let mut peer = TcpStream::connect(addr).await.unwrap();
        write_frame(
            &mut peer,
            &Frame::control(FrameType::HttpProxy, serde_json::to_vec(&request).unwrap()),
        )
        .await
        .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(10), read_frame(&mut peer))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(frame.frame_type, FrameType::HttpResponse);
        let response: CommandPacket = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(response.command_id, "relay-1");
        let body: HttpProxyResponseBody = response.body().unwrap();
        assert_eq!(body.status_code, 204);

        client_task.await.unwrap();
    }
}
