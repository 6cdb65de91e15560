//! Rooms: named groups of client sessions partitioned into teams.
//!
//! The room lock guards the member map, the teams and the activity
//! timestamp. It may be held while taking a session lock (room → session).
//! Session locks are only ever held for in-memory work and queueing, so
//! neither lock waits on a socket. Broadcasts snapshot the membership under
//! the lock and then fan out without it.

use crate::client::{ClientSession, Connection, Frame};
use crate::error::RelayError;
use crate::team::Team;
use log::{error, warn};
use relay_shared::{encode_packet, team_id_of, ClientId, MemberState, OutboundPacket};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// State guarded by the room lock
struct RoomInner {
    /// Members, online or retained, by identity
    clients: HashMap<ClientId, Arc<ClientSession>>,
    /// Non-empty teams by team id
    teams: HashMap<String, Team>,
    /// Last join, leave, state change or client packet
    last_activity: Instant,
}

impl RoomInner {
    fn find_or_create_team(&mut self, team_id: &str) -> &mut Team {
        self.teams
            .entry(team_id.to_string())
            .or_insert_with(|| Team::new(team_id))
    }

    fn leave_team(&mut self, team_id: &str, client_id: ClientId) {
        if let Some(team) = self.teams.get_mut(team_id) {
            team.remove(client_id);
            if team.is_empty() {
                self.teams.remove(team_id);
            }
        }
    }

    fn sorted_sessions(&self) -> Vec<Arc<ClientSession>> {
        let mut sessions: Vec<Arc<ClientSession>> = self.clients.values().cloned().collect();
        sessions.sort_by_key(|s| s.id());
        sessions
    }
}

/// A named room. Created by the first handshake naming it and owned by the
/// registry until it is evicted or deleted.
pub struct Room {
    /// Room id as sent in `roomId`
    id: String,
    /// Members, teams and activity, locked after the registry
    inner: Mutex<RoomInner>,
}

impl Room {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            inner: Mutex::new(RoomInner {
                clients: HashMap::new(),
                teams: HashMap::new(),
                last_activity: Instant::now(),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Adds a client to the room, or refreshes the existing session when the
    /// identity is already a member.
    ///
    /// The registry only rejoins identities that are offline. Should a member
    /// still hold a connection, that connection is dropped.
    pub async fn join(
        self: &Arc<Self>,
        client_id: ClientId,
        connection: Connection,
        state: Value,
        team_id: String,
    ) -> Arc<ClientSession> {
        let mut inner = self.inner.lock().await;
        inner.last_activity = Instant::now();

        if let Some(session) = inner.clients.get(&client_id).cloned() {
            let previous_team = session.team_id().await;
            if previous_team != team_id {
                inner.leave_team(&previous_team, client_id);
            }
            inner.find_or_create_team(&team_id).add(client_id);
            if let Some(replaced) = session.attach(connection, state, team_id).await {
                warn!("Client {} rejoined while online, dropping its old connection", client_id);
                replaced.close();
            }
            return session;
        }

        inner.find_or_create_team(&team_id).add(client_id);
        let session = Arc::new(ClientSession::new(
            client_id,
            Arc::downgrade(self),
            connection,
            state,
            team_id,
        ));
        inner.clients.insert(client_id, Arc::clone(&session));
        session
    }

    pub async fn remove_client(&self, client_id: ClientId) -> Option<Arc<ClientSession>> {
        let mut inner = self.inner.lock().await;
        let session = inner.clients.remove(&client_id)?;
        let team_id = session.team_id().await;
        inner.leave_team(&team_id, client_id);
        inner.last_activity = Instant::now();
        Some(session)
    }

    /// Stores a new state blob for a member and moves it to the team named by
    /// the blob's `teamId`. Returns false if the session is no longer a member.
    pub async fn update_client_state(&self, session: &ClientSession, state: Value) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.clients.contains_key(&session.id()) {
            return false;
        }

        let team_id = team_id_of(&state);
        let previous_team = session.replace_state(state, team_id.clone()).await;
        if previous_team != team_id {
            inner.leave_team(&previous_team, session.id());
            inner.find_or_create_team(&team_id).add(session.id());
        }
        inner.last_activity = Instant::now();
        true
    }

    /// Removes members that have been offline for longer than `grace`.
    pub async fn prune_offline(&self, grace: Duration) -> Vec<ClientId> {
        let mut inner = self.inner.lock().await;
        let mut expired = Vec::new();
        for session in inner.sorted_sessions() {
            if !session.is_online().await && session.idle_for().await > grace {
                expired.push(session.id());
                let team_id = session.team_id().await;
                inner.clients.remove(&session.id());
                inner.leave_team(&team_id, session.id());
            }
        }
        if !expired.is_empty() {
            inner.last_activity = Instant::now();
        }
        expired
    }

    /// Empties the room, handing back every session it held.
    pub async fn drain(&self) -> Vec<Arc<ClientSession>> {
        let mut inner = self.inner.lock().await;
        let sessions = inner.sorted_sessions();
        inner.clients.clear();
        inner.teams.clear();
        sessions
    }

    pub async fn touch(&self) {
        self.inner.lock().await.last_activity = Instant::now();
    }

    pub async fn idle_for(&self) -> Duration {
        self.inner.lock().await.last_activity.elapsed()
    }

    pub async fn client_count(&self) -> usize {
        self.inner.lock().await.clients.len()
    }

    pub async fn contains(&self, client_id: ClientId) -> bool {
        self.inner.lock().await.clients.contains_key(&client_id)
    }

    pub async fn sessions(&self) -> Vec<Arc<ClientSession>> {
        self.inner.lock().await.sorted_sessions()
    }

    pub async fn team_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut ids: Vec<String> = inner.teams.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn team_members(&self, team_id: &str) -> Option<Vec<ClientId>> {
        let inner = self.inner.lock().await;
        inner.teams.get(team_id).map(Team::members)
    }

    /// Membership and member states captured under a single room lock.
    async fn snapshot(&self) -> (Vec<Arc<ClientSession>>, Vec<MemberState>) {
        let inner = self.inner.lock().await;
        let sessions = inner.sorted_sessions();
        let mut states = Vec::with_capacity(sessions.len());
        for session in &sessions {
            states.push(session.member_state().await);
        }
        (sessions, states)
    }

    pub async fn member_states(&self) -> Vec<MemberState> {
        self.snapshot().await.1
    }

    /// Sends every member's state to every connected member. Returns the
    /// number of clients the packet reached.
    pub async fn broadcast_all_client_state(&self) -> usize {
        let (sessions, clients) = self.snapshot().await;
        let packet = OutboundPacket::AllClientState {
            room_id: self.id.clone(),
            clients,
        };

        match encode_packet(&packet) {
            Ok(frame) => fan_out(sessions, Arc::new(frame)).await,
            Err(e) => {
                error!("Failed to encode state for room {}: {}", self.id, e);
                0
            }
        }
    }

    /// Sends the current room state to one member only.
    pub async fn send_room_state(&self, session: &ClientSession) -> Result<bool, RelayError> {
        let clients = self.member_states().await;
        let packet = OutboundPacket::RoomState {
            room_id: self.id.clone(),
            client_id: session.id(),
            clients,
        };
        session.send(&packet).await
    }
}

/// Queues one frame on many sessions. Queueing never waits on a socket, so
/// a slow peer only delays itself. Returns how many sessions were online and
/// accepted the frame.
pub async fn fan_out(sessions: Vec<Arc<ClientSession>>, frame: Frame) -> usize {
    let mut delivered = 0;
    for session in sessions {
        match session.send_frame(Arc::clone(&frame)).await {
            Ok(true) => delivered += 1,
            Ok(false) => {}
            Err(e) => warn!("Failed to send to client {}: {}", session.id(), e),
        }
    }
    delivered
}
