//! Server-wide directory of online clients and rooms
//!
//! The registry is the top of the locking hierarchy. Its lock guards:
//! - the online-client map (identity → session with a live connection)
//! - the room map (room id → room)
//! - the resident map (identity → room currently holding its session)
//! - the identity counter and the games-completed counter
//!
//! Locks are always taken registry → room → session. No lock is ever held
//! across socket I/O: sending only queues a frame for the connection's
//! writer task, so a stalled peer can never hold up unrelated rooms.
//!
//! A reconnecting client is trusted to be who it claims to be as long as no
//! online session holds that identity. Any peer can therefore resume any
//! offline identity; there is no server-issued secret.

use crate::client::{ClientSession, Connection, ConnectionId};
use crate::config::ServerConfig;
use crate::room::{fan_out, Room};
use crate::stats::{self, StatsSnapshot};
use crate::utils::get_timestamp;
use log::{debug, error, info, warn};
use relay_shared::{
    encode_packet, stamp_client_state, team_id_of, ClientId, OutboundPacket, Packet, PacketKind,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// First identity handed out by a fresh server
pub const INITIAL_CLIENT_ID: ClientId = 1;

/// State guarded by the registry lock
struct RegistryState {
    /// Sessions that currently hold a connection
    online: HashMap<ClientId, Arc<ClientSession>>,
    /// Every live room by id
    rooms: HashMap<String, Arc<Room>>,
    /// Room holding each identity's session, online or retained
    residents: HashMap<ClientId, String>,
    /// Next identity the allocator will try
    next_client_id: ClientId,
    /// `GAME_COMPLETE` packets received, restored from the snapshot
    games_completed: u64,
}

impl RegistryState {
    /// Advances the counter, never yielding the reserved identity 0
    fn bump_client_id(&mut self) -> ClientId {
        loop {
            let id = self.next_client_id;
            self.next_client_id = self.next_client_id.wrapping_add(1);
            if self.next_client_id == 0 {
                self.next_client_id = INITIAL_CLIENT_ID;
            }
            if id != 0 {
                return id;
            }
        }
    }

    /// Honours a claimed identity unless it is absent, zero or currently
    /// online. Fresh identities also skip sessions still resident in a room
    /// so a newcomer never inherits someone's retained session.
    fn assign_client_id(&mut self, claimed: ClientId) -> ClientId {
        if claimed != 0 && !self.online.contains_key(&claimed) {
            return claimed;
        }
        loop {
            let id = self.bump_client_id();
            if !self.online.contains_key(&id) && !self.residents.contains_key(&id) {
                return id;
            }
        }
    }

    fn remove_online(&mut self, session: &Arc<ClientSession>) {
        if let Some(current) = self.online.get(&session.id()) {
            if Arc::ptr_eq(current, session) {
                self.online.remove(&session.id());
            }
        }
    }

    /// Empties a room that has left the room map and forgets its sessions.
    /// Returns the connections that were still open.
    async fn retire_room(&mut self, room: &Room) -> Vec<Connection> {
        let mut open = Vec::new();
        for session in room.drain().await {
            if self.residents.get(&session.id()).map(String::as_str) == Some(room.id()) {
                self.residents.remove(&session.id());
            }
            self.remove_online(&session);
            if let Some(connection) = session.force_detach().await {
                open.push(connection);
            }
        }
        open
    }

    fn unique_players(&self) -> u64 {
        self.next_client_id.saturating_sub(INITIAL_CLIENT_ID)
    }
}

/// Shared, long-lived server state handed to every task by `Arc`.
pub struct Registry {
    state: Mutex<RegistryState>,
    quiet: AtomicBool,
    inactivity_timeout: Duration,
    heartbeat_after: Duration,
    session_grace: Duration,
}

impl Registry {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                online: HashMap::new(),
                rooms: HashMap::new(),
                residents: HashMap::new(),
                next_client_id: INITIAL_CLIENT_ID,
                games_completed: 0,
            }),
            quiet: AtomicBool::new(config.quiet),
            inactivity_timeout: config.inactivity_timeout,
            heartbeat_after: config.heartbeat_after,
            session_grace: config.session_grace,
        }
    }

    /// Attaches a handshaking connection to a session
    ///
    /// Assigns (or honours) an identity, finds or creates the requested room
    /// and team, and either refreshes the identity's existing session in that
    /// room or creates a new one. A client switching rooms is removed from
    /// its previous room first. The whole resolution runs under the registry
    /// lock so concurrent handshakes can never share an identity.
    pub async fn resolve_client(&self, packet: &Packet, connection: Connection) -> Arc<ClientSession> {
        let room_id = packet.room_id();
        let mut moved_from = None;

        let session = {
            let mut state = self.state.lock().await;
            let client_id = state.assign_client_id(packet.client_id());
            let client_state = stamp_client_state(packet.client_state(), client_id);
            let team_id = team_id_of(&client_state);

            if let Some(previous) = state.residents.get(&client_id).cloned() {
                if previous != room_id {
                    if let Some(room) = state.rooms.get(&previous).cloned() {
                        room.remove_client(client_id).await;
                        moved_from = Some(room);
                    }
                }
            }

            let room = match state.rooms.get(&room_id) {
                Some(room) => Arc::clone(room),
                None => {
                    info!("Room {:?} created", room_id);
                    let room = Room::new(room_id.clone());
                    state.rooms.insert(room_id.clone(), Arc::clone(&room));
                    room
                }
            };

            let session = room.join(client_id, connection, client_state, team_id).await;
            state.residents.insert(client_id, room_id);
            state.online.insert(client_id, Arc::clone(&session));
            session
        };

        if let Some(room) = moved_from {
            room.broadcast_all_client_state().await;
        }

        session
    }

    pub async fn lookup_online(&self, client_id: ClientId) -> Option<Arc<ClientSession>> {
        self.state.lock().await.online.get(&client_id).cloned()
    }

    /// Tears down a session after its connection ended
    ///
    /// Does nothing if `connection_id` is no longer the session's connection
    /// (it was replaced by a reconnect or dropped by the server). Otherwise
    /// the client goes offline, stays resident in its room for the grace
    /// period, and the room is told about the departure.
    pub async fn disconnect(&self, session: &Arc<ClientSession>, connection_id: ConnectionId) -> bool {
        let connection = {
            let mut state = self.state.lock().await;
            let Some(connection) = session.detach(connection_id).await else {
                return false;
            };
            state.remove_online(session);
            connection
        };

        connection.close();
        if let Some(room) = session.room() {
            room.broadcast_all_client_state().await;
        }
        true
    }

    /// Drops a session's connection regardless of which connection it is.
    pub async fn force_disconnect(&self, session: &Arc<ClientSession>) -> bool {
        let connection = {
            let mut state = self.state.lock().await;
            let Some(connection) = session.force_detach().await else {
                return false;
            };
            state.remove_online(session);
            connection
        };

        connection.close();
        if let Some(room) = session.room() {
            room.broadcast_all_client_state().await;
        }
        true
    }

    /// Applies a post-handshake packet from an authenticated client
    ///
    /// Any packet carrying `clientState` replaces the client's state blob and
    /// is rebroadcast to the room. `GAME_COMPLETE` bumps the games counter.
    /// Everything else only refreshes activity.
    pub async fn handle_client_packet(&self, session: &Arc<ClientSession>, packet: &Packet) {
        session.touch().await;
        let room = session.room();
        if let Some(room) = &room {
            room.touch().await;
        }

        match packet.kind() {
            PacketKind::Handshake => {
                warn!("Client {} sent a second handshake, ignoring", session.id());
                return;
            }
            PacketKind::GameComplete => {
                let mut state = self.state.lock().await;
                state.games_completed += 1;
                info!("Game completed (total {})", state.games_completed);
            }
            PacketKind::Heartbeat | PacketKind::Stats => {}
            PacketKind::Other(kind) if packet.client_state().is_none() => {
                warn!("Unhandled packet type {:?} from client {}", kind, session.id());
            }
            PacketKind::Other(_) => {}
        }

        let (Some(raw_state), Some(room)) = (packet.client_state(), room) else {
            return;
        };
        let new_state = stamp_client_state(Some(raw_state), session.id());
        if room.update_client_state(session, new_state).await {
            room.broadcast_all_client_state().await;
        }
    }

    /// Removes rooms idle past the inactivity timeout
    ///
    /// Evicted rooms take their sessions with them: identities are released,
    /// online occupants lose their connection without notice. Surviving rooms
    /// drop members that have been offline longer than the session grace and
    /// broadcast the smaller membership. Returns the evicted room ids.
    pub async fn evict_idle_rooms(&self) -> Vec<String> {
        let mut evicted = Vec::new();
        let mut orphaned = Vec::new();
        let mut pruned_rooms = Vec::new();

        {
            let mut state = self.state.lock().await;
            let rooms: Vec<(String, Arc<Room>)> = state
                .rooms
                .iter()
                .map(|(id, room)| (id.clone(), Arc::clone(room)))
                .collect();

            for (room_id, room) in rooms {
                if room.idle_for().await > self.inactivity_timeout {
                    info!("Room {:?} has been inactive for too long, deleting it", room_id);
                    state.rooms.remove(&room_id);
                    orphaned.extend(state.retire_room(&room).await);
                    evicted.push(room_id);
                    continue;
                }

                let pruned = room.prune_offline(self.session_grace).await;
                if !pruned.is_empty() {
                    debug!("Room {:?} released offline clients {:?}", room_id, pruned);
                    for client_id in pruned {
                        state.residents.remove(&client_id);
                    }
                    pruned_rooms.push(room);
                }
            }
        }

        for connection in orphaned {
            connection.close();
        }
        for room in pruned_rooms {
            room.broadcast_all_client_state().await;
        }
        evicted
    }

    /// Removes a room immediately, dropping every occupant's connection.
    pub async fn remove_room(&self, room_id: &str) -> Option<Arc<Room>> {
        let (room, orphaned) = {
            let mut state = self.state.lock().await;
            let room = state.rooms.remove(room_id)?;
            let orphaned = state.retire_room(&room).await;
            (room, orphaned)
        };

        for connection in orphaned {
            connection.close();
        }
        Some(room)
    }

    /// Sends a quiet keep-alive to every online client that has been silent
    /// for longer than the heartbeat threshold. Returns how many were sent.
    pub async fn heartbeat(&self) -> usize {
        let (sessions, room_count) = {
            let state = self.state.lock().await;
            let sessions: Vec<Arc<ClientSession>> = state.online.values().cloned().collect();
            (sessions, state.rooms.len())
        };

        if !self.is_quiet() {
            info!("Clients online: {}, rooms: {}", sessions.len(), room_count);
        }

        let mut idle = Vec::new();
        for session in sessions {
            if session.idle_for().await > self.heartbeat_after {
                idle.push(session);
            }
        }
        if idle.is_empty() {
            return 0;
        }

        match encode_packet(&OutboundPacket::heartbeat()) {
            Ok(frame) => fan_out(idle, Arc::new(frame)).await,
            Err(e) => {
                error!("Failed to encode heartbeat: {}", e);
                0
            }
        }
    }

    pub async fn stats(&self) -> OutboundPacket {
        let state = self.state.lock().await;
        OutboundPacket::Stats {
            unique_players: state.unique_players(),
            games_completed: state.games_completed,
            online: state.online.len(),
        }
    }

    pub async fn room_count(&self) -> usize {
        self.state.lock().await.rooms.len()
    }

    pub async fn online_count(&self) -> usize {
        self.state.lock().await.online.len()
    }

    pub async fn games_completed(&self) -> u64 {
        self.state.lock().await.games_completed
    }

    pub async fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.state.lock().await.rooms.get(room_id).cloned()
    }

    /// All rooms ordered by id
    pub async fn rooms(&self) -> Vec<Arc<Room>> {
        let state = self.state.lock().await;
        let mut rooms: Vec<Arc<Room>> = state.rooms.values().cloned().collect();
        rooms.sort_by(|a, b| a.id().cmp(b.id()));
        rooms
    }

    /// All online sessions ordered by identity
    pub async fn online_sessions(&self) -> Vec<Arc<ClientSession>> {
        let state = self.state.lock().await;
        let mut sessions: Vec<Arc<ClientSession>> = state.online.values().cloned().collect();
        sessions.sort_by_key(|s| s.id());
        sessions
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet.load(Ordering::Relaxed)
    }

    /// Flips quiet mode and returns the new setting.
    pub fn toggle_quiet(&self) -> bool {
        !self.quiet.fetch_xor(true, Ordering::Relaxed)
    }

    pub async fn snapshot(&self) -> StatsSnapshot {
        let state = self.state.lock().await;
        StatsSnapshot {
            games_complete: state.games_completed,
            online_count: state.online.len(),
            last_stats_heartbeat: get_timestamp(),
            next_client_id: state.next_client_id,
        }
    }

    /// Seeds the counters. A stored identity counter of 0 is ignored.
    pub async fn apply_snapshot(&self, snapshot: &StatsSnapshot) {
        let mut state = self.state.lock().await;
        state.games_completed = snapshot.games_complete;
        if snapshot.next_client_id != 0 {
            state.next_client_id = snapshot.next_client_id;
        }
    }

    pub async fn load_snapshot(&self, path: &Path) {
        match stats::load(path).await {
            Ok(snapshot) => {
                self.apply_snapshot(&snapshot).await;
                info!(
                    "Loaded stats from {}: {} games completed, next client id {}",
                    path.display(),
                    snapshot.games_complete,
                    snapshot.next_client_id
                );
            }
            Err(e) => warn!(
                "Could not read stats from {}, starting from defaults: {}",
                path.display(),
                e
            ),
        }
    }

    pub async fn persist_snapshot(&self, path: &Path) -> bool {
        let snapshot = self.snapshot().await;
        match stats::save(path, &snapshot).await {
            Ok(()) => {
                debug!("Saved stats to {}", path.display());
                true
            }
            Err(e) => {
                warn!("Error writing stats to {}: {}", path.display(), e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{next_packet, test_connection};
    use serde_json::json;
    use tokio::time::timeout;

    fn registry() -> Registry {
        Registry::new(&ServerConfig::default())
    }

    fn handshake(client_id: ClientId, room: &str, team: &str) -> Packet {
        let body = json!({
            "type": "HANDSHAKE",
            "clientId": client_id,
            "roomId": room,
            "clientState": {"teamId": team},
        });
        Packet::decode(body.to_string().as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn test_fresh_identities_are_distinct_and_non_zero() {
        let registry = registry();
        let mut seen = Vec::new();
        for conn_id in 0..10 {
            let (connection, _reader, _closed) = test_connection(conn_id);
            let session = registry.resolve_client(&handshake(0, "r1", ""), connection).await;
            seen.push(session.id());
        }

        assert_eq!(seen, (1..=10).collect::<Vec<_>>());
        assert_eq!(registry.online_count().await, 10);
    }

    #[tokio::test]
    async fn test_allocator_skips_zero_on_wraparound() {
        let registry = registry();
        registry
            .apply_snapshot(&StatsSnapshot {
                next_client_id: u64::MAX,
                ..StatsSnapshot::default()
            })
            .await;

        let (c1, _r1, _x1) = test_connection(1);
        let (c2, _r2, _x2) = test_connection(2);
        let first = registry.resolve_client(&handshake(0, "r1", ""), c1).await;
        let second = registry.resolve_client(&handshake(0, "r1", ""), c2).await;

        assert_eq!(first.id(), u64::MAX);
        assert_eq!(second.id(), 1);
    }

    #[tokio::test]
    async fn test_online_collision_gets_fresh_identity() {
        let registry = registry();
        let (c1, _r1, _x1) = test_connection(1);
        let (c2, _r2, _x2) = test_connection(2);

        let owner = registry.resolve_client(&handshake(50, "r1", ""), c1).await;
        let intruder = registry.resolve_client(&handshake(50, "r1", ""), c2).await;

        assert_eq!(owner.id(), 50);
        assert_ne!(intruder.id(), 50);
        assert_ne!(intruder.id(), 0);
        assert!(owner.is_attached(1).await);
    }

    #[tokio::test]
    async fn test_fresh_identity_skips_retained_sessions() {
        let registry = registry();
        let (c1, _r1, _x1) = test_connection(1);
        let claimed = registry.resolve_client(&handshake(1, "r1", ""), c1).await;
        registry.disconnect(&claimed, 1).await;

        let (c2, _r2, _x2) = test_connection(2);
        let newcomer = registry.resolve_client(&handshake(0, "r1", ""), c2).await;
        assert_eq!(newcomer.id(), 2);
    }

    #[tokio::test]
    async fn test_reconnect_keeps_identity_room_and_team() {
        let registry = registry();
        let (c1, _r1, _x1) = test_connection(1);
        let original = registry.resolve_client(&handshake(0, "r1", "red"), c1).await;
        assert!(registry.disconnect(&original, 1).await);
        assert!(registry.lookup_online(original.id()).await.is_none());

        let (c2, _r2, _x2) = test_connection(2);
        let resumed = registry
            .resolve_client(&handshake(original.id(), "r1", "red"), c2)
            .await;

        assert!(Arc::ptr_eq(&original, &resumed));
        assert!(resumed.is_attached(2).await);
        assert_eq!(resumed.team_id().await, "red");
        assert_eq!(resumed.state().await["clientId"], original.id());
        assert!(registry.lookup_online(original.id()).await.is_some());
    }

    #[tokio::test]
    async fn test_room_switch_leaves_previous_room() {
        let registry = registry();
        let (c1, _r1, _x1) = test_connection(1);
        let session = registry.resolve_client(&handshake(0, "r1", ""), c1).await;
        registry.disconnect(&session, 1).await;

        let (c2, _r2, _x2) = test_connection(2);
        let moved = registry
            .resolve_client(&handshake(session.id(), "r2", ""), c2)
            .await;

        assert_eq!(moved.id(), session.id());
        assert!(!registry.room("r1").await.unwrap().contains(session.id()).await);
        assert!(registry.room("r2").await.unwrap().contains(session.id()).await);
    }

    #[tokio::test]
    async fn test_disconnect_broadcasts_departure() {
        let registry = registry();
        let (c1, mut r1, _x1) = test_connection(1);
        let (c2, _r2, _x2) = test_connection(2);
        let stayer = registry.resolve_client(&handshake(0, "r1", "red"), c1).await;
        let leaver = registry.resolve_client(&handshake(0, "r1", "blue"), c2).await;

        assert!(registry.disconnect(&leaver, 2).await);
        assert!(!registry.disconnect(&leaver, 2).await);

        match next_packet(&mut r1).await {
            OutboundPacket::AllClientState { clients, .. } => {
                assert_eq!(clients.len(), 2);
                assert_eq!(clients[0].client_id, stayer.id());
                assert!(clients[0].online);
                assert!(!clients[1].online);
            }
            other => panic!("unexpected packet {:?}", other),
        }
        assert_eq!(registry.online_count().await, 1);
    }

    #[tokio::test]
    async fn test_stale_connection_cannot_disconnect_new_one() {
        let registry = registry();
        let (c1, _r1, _x1) = test_connection(1);
        let session = registry.resolve_client(&handshake(9, "r1", ""), c1).await;
        registry.force_disconnect(&session).await;

        let (c2, _r2, _x2) = test_connection(2);
        registry.resolve_client(&handshake(9, "r1", ""), c2).await;

        assert!(!registry.disconnect(&session, 1).await);
        assert!(registry.lookup_online(9).await.is_some());
    }

    #[tokio::test]
    async fn test_state_update_rebroadcasts() {
        let registry = registry();
        let (c1, mut r1, _x1) = test_connection(1);
        let session = registry.resolve_client(&handshake(0, "r1", "red"), c1).await;

        let update = Packet::decode(
            br#"{"type":"PLAYER_STATE","clientState":{"teamId":"blue","clientId":99,"hp":5}}"#,
        )
        .unwrap();
        registry.handle_client_packet(&session, &update).await;

        match next_packet(&mut r1).await {
            OutboundPacket::AllClientState { clients, .. } => {
                assert_eq!(clients[0].team_id, "blue");
                assert_eq!(clients[0].state["clientId"], session.id());
                assert_eq!(clients[0].state["hp"], 5);
            }
            other => panic!("unexpected packet {:?}", other),
        }
        let room = registry.room("r1").await.unwrap();
        assert_eq!(room.team_members("blue").await, Some(vec![session.id()]));
        assert_eq!(room.team_members("red").await, None);
    }

    #[tokio::test]
    async fn test_game_complete_counts() {
        let registry = registry();
        let (c1, _r1, _x1) = test_connection(1);
        let session = registry.resolve_client(&handshake(0, "r1", ""), c1).await;
        let packet = Packet::decode(br#"{"type":"GAME_COMPLETE"}"#).unwrap();

        registry.handle_client_packet(&session, &packet).await;
        registry.handle_client_packet(&session, &packet).await;

        assert_eq!(registry.games_completed().await, 2);
        assert_eq!(
            registry.stats().await,
            OutboundPacket::Stats {
                unique_players: 1,
                games_completed: 2,
                online: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_rooms_are_evicted() {
        let registry = registry();
        let (c1, _r1, closed) = test_connection(1);
        let (c2, _r2, _x2) = test_connection(2);
        registry.resolve_client(&handshake(0, "idle", ""), c1).await;
        let busy = registry.resolve_client(&handshake(0, "busy", ""), c2).await;

        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        registry
            .handle_client_packet(&busy, &Packet::decode(br#"{"type":"HEARTBEAT"}"#).unwrap())
            .await;
        tokio::time::advance(Duration::from_secs(61)).await;

        assert_eq!(registry.evict_idle_rooms().await, vec!["idle".to_string()]);
        assert!(registry.room("idle").await.is_none());
        assert!(registry.room("busy").await.is_some());
        assert!(registry.lookup_online(1).await.is_none());
        assert!(closed.await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_sessions_expire_after_grace() {
        let mut config = ServerConfig::default();
        config.session_grace = Duration::from_secs(60);
        let registry = Registry::new(&config);
        let (c1, mut r1, _x1) = test_connection(1);
        let (c2, _r2, _x2) = test_connection(2);
        registry.resolve_client(&handshake(0, "r1", ""), c1).await;
        let leaver = registry.resolve_client(&handshake(0, "r1", ""), c2).await;
        registry.disconnect(&leaver, 2).await;
        next_packet(&mut r1).await;

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(registry.evict_idle_rooms().await.is_empty());

        match next_packet(&mut r1).await {
            OutboundPacket::AllClientState { clients, .. } => {
                assert_eq!(clients.len(), 1);
                assert_eq!(clients[0].client_id, 1);
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_targets_idle_clients() {
        let registry = registry();
        let (c1, mut r1, _x1) = test_connection(1);
        let (c2, _r2, _x2) = test_connection(2);
        registry.resolve_client(&handshake(0, "r1", ""), c1).await;
        let chatty = registry.resolve_client(&handshake(0, "r2", ""), c2).await;

        tokio::time::advance(Duration::from_secs(31)).await;
        chatty.touch().await;

        assert_eq!(registry.heartbeat().await, 1);
        assert_eq!(next_packet(&mut r1).await, OutboundPacket::heartbeat());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");

        let first = registry();
        first
            .apply_snapshot(&StatsSnapshot {
                games_complete: 7,
                next_client_id: 30,
                ..StatsSnapshot::default()
            })
            .await;
        assert!(first.persist_snapshot(&path).await);
        assert!(first.persist_snapshot(&path).await);

        let second = registry();
        second.load_snapshot(&path).await;
        let snapshot = second.snapshot().await;
        assert_eq!(snapshot.games_complete, 7);
        assert_eq!(snapshot.next_client_id, 30);
    }

    #[tokio::test]
    async fn test_missing_snapshot_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        registry.load_snapshot(&dir.path().join("missing.json")).await;

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.games_complete, 0);
        assert_eq!(snapshot.next_client_id, INITIAL_CLIENT_ID);
    }

    #[tokio::test]
    async fn test_stalled_peer_does_not_block_other_rooms() {
        let registry = Arc::new(registry());

        // A peer that never reads: its pipe holds a single byte
        let (server_side, _unread) = tokio::io::duplex(1);
        let (stalled, _closed) = Connection::new(1, server_side, Duration::from_secs(3));
        let session = registry.resolve_client(&handshake(0, "x", ""), stalled).await;
        for _ in 0..4 {
            session.send(&OutboundPacket::heartbeat()).await.unwrap();
        }

        let sweeper = Arc::clone(&registry);
        let sweep = tokio::spawn(async move { sweeper.evict_idle_rooms().await });

        let (c2, mut r2, _x2) = test_connection(2);
        let joined = timeout(
            Duration::from_secs(1),
            registry.resolve_client(&handshake(0, "y", ""), c2),
        )
        .await
        .expect("handshake into another room was blocked");
        assert!(registry.room("y").await.unwrap().send_room_state(&joined).await.unwrap());
        assert!(matches!(next_packet(&mut r2).await, OutboundPacket::RoomState { .. }));

        let stats = timeout(Duration::from_secs(1), registry.stats()).await.unwrap();
        assert_eq!(
            stats,
            OutboundPacket::Stats {
                unique_players: 2,
                games_completed: 0,
                online: 2
            }
        );
        assert!(timeout(Duration::from_secs(1), sweep).await.is_ok());
    }

    #[tokio::test]
    async fn test_toggle_quiet() {
        let registry = registry();
        assert!(!registry.is_quiet());
        assert!(registry.toggle_quiet());
        assert!(registry.is_quiet());
        assert!(!registry.toggle_quiet());
    }
}
