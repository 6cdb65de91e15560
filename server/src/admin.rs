//! Operator actions against a running server.

use crate::client::ClientSession;
use crate::registry::Registry;
use crate::room::fan_out;
use crate::supervisor::{Shutdown, ShutdownHandle};
use log::{error, info};
use relay_shared::{encode_packet, ClientId, MemberState, OutboundPacket};
use std::sync::Arc;

pub const DELETE_ROOM_MESSAGE: &str = "Deleting your room. Goodbye!";
pub const STOP_MESSAGE: &str = "Server restarting. Check back in a bit!";

/// Everything a room holds, for the `list` command.
#[derive(Debug, Clone)]
pub struct RoomDump {
    pub room_id: String,
    pub teams: Vec<String>,
    pub clients: Vec<MemberState>,
}

#[derive(Clone)]
pub struct Admin {
    registry: Arc<Registry>,
    shutdown: ShutdownHandle,
}

impl Admin {
    pub fn new(registry: Arc<Registry>, shutdown: ShutdownHandle) -> Self {
        Self { registry, shutdown }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub async fn room_count(&self) -> usize {
        self.registry.room_count().await
    }

    pub async fn online_count(&self) -> usize {
        self.registry.online_count().await
    }

    pub fn toggle_quiet(&self) -> bool {
        self.registry.toggle_quiet()
    }

    pub async fn dump(&self) -> Vec<RoomDump> {
        let mut dumps = Vec::new();
        for room in self.registry.rooms().await {
            dumps.push(RoomDump {
                room_id: room.id().to_string(),
                teams: room.team_ids().await,
                clients: room.member_states().await,
            });
        }
        dumps
    }

    /// Sends a `SERVER_MESSAGE` to one online client.
    pub async fn message_client(&self, client_id: ClientId, message: &str) -> bool {
        let Some(session) = self.registry.lookup_online(client_id).await else {
            return false;
        };
        info!("[Server] SERVER_MESSAGE packet -> {}", client_id);
        send_or_log(&session, &OutboundPacket::server_message(message)).await
    }

    pub async fn message_all(&self, message: &str) -> usize {
        info!("[Server] SERVER_MESSAGE packet -> All");
        let sessions = self.registry.online_sessions().await;
        broadcast(sessions, &OutboundPacket::server_message(message)).await
    }

    /// Sends a message and `DISABLE_ANCHOR` to one client, then drops its
    /// connection. Both packets are queued first, so they are written before
    /// the socket closes.
    pub async fn disable_client(&self, client_id: ClientId, message: &str) -> bool {
        let Some(session) = self.registry.lookup_online(client_id).await else {
            return false;
        };
        info!("[Server] DISABLE_ANCHOR packet -> {}", client_id);
        disable(&self.registry, &session, message).await;
        true
    }

    pub async fn disable_all(&self, message: &str) -> usize {
        info!("[Server] DISABLE_ANCHOR packet -> All");
        let sessions = self.registry.online_sessions().await;
        let count = sessions.len();

        for session in &sessions {
            disable(&self.registry, session, message).await;
        }
        count
    }

    /// Disables every occupant of a room and removes the room.
    pub async fn delete_room(&self, room_id: &str) -> bool {
        let Some(room) = self.registry.room(room_id).await else {
            return false;
        };

        let occupants = room.sessions().await;
        info!(
            "Deleting room {:?} with {} clients",
            room_id,
            occupants.len()
        );
        broadcast(occupants.clone(), &OutboundPacket::server_message(DELETE_ROOM_MESSAGE)).await;
        broadcast(occupants, &OutboundPacket::DisableAnchor).await;
        self.registry.remove_room(room_id).await.is_some()
    }

    /// Tells every client the server is going away and requests an operator
    /// shutdown. The snapshot flush happens in the shutdown path.
    pub async fn stop(&self) {
        self.message_all(STOP_MESSAGE).await;
        self.shutdown.trigger(Shutdown::Operator);
    }
}

async fn disable(registry: &Registry, session: &Arc<ClientSession>, message: &str) {
    send_or_log(session, &OutboundPacket::server_message(message)).await;
    send_or_log(session, &OutboundPacket::DisableAnchor).await;
    registry.force_disconnect(session).await;
}

async fn send_or_log(session: &ClientSession, packet: &OutboundPacket) -> bool {
    match session.send(packet).await {
        Ok(sent) => sent,
        Err(e) => {
            error!("Failed to send to client {}: {}", session.id(), e);
            false
        }
    }
}

async fn broadcast(sessions: Vec<Arc<ClientSession>>, packet: &OutboundPacket) -> usize {
    match encode_packet(packet) {
        Ok(frame) => fan_out(sessions, Arc::new(frame)).await,
        Err(e) => {
            error!("Failed to encode packet: {}", e);
            0
        }
    }
}
