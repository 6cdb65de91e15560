//! Per-client session state and the connection handle it owns.
//!
//! A `ClientSession` outlives any single TCP connection: on reconnect the
//! new socket's handle is swapped into the existing session. The session
//! lock guards the connection handle, the opaque state blob, the team id and
//! the activity timestamp. Sending through the handle only queues a frame,
//! so the lock is never held across socket I/O.

use crate::error::RelayError;
use crate::room::Room;
use log::debug;
use relay_shared::{encode_packet, ClientId, MemberState, OutboundPacket};
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::AbortHandle;
use tokio::time::{timeout, Instant};

pub type ConnectionId = u64;

/// An encoded packet, shared between every connection it is queued on
pub type Frame = Arc<Vec<u8>>;

/// Frames a peer may fall behind by before it is dropped
pub const OUTBOUND_QUEUE_SIZE: usize = 64;

/// Handle to the writer task of one accepted socket.
///
/// The writer task owns the write half. It stops when every handle is
/// dropped (after writing what was already queued), when a write fails or
/// times out, or when the queue overflows. Its exit resolves the receiver
/// handed out by [`Connection::new`], which is how the task reading the
/// other half learns that this socket is finished.
pub struct Connection {
    id: ConnectionId,
    /// Queue drained by the writer task
    sender: mpsc::Sender<Frame>,
    writer: AbortHandle,
}

impl Connection {
    pub fn new<W>(
        id: ConnectionId,
        writer: W,
        write_timeout: Duration,
    ) -> (Self, oneshot::Receiver<()>)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (sender, frames) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let (closer, closed) = oneshot::channel();
        let task = tokio::spawn(run_writer(id, writer, frames, write_timeout, closer));
        let connection = Self {
            id,
            sender,
            writer: task.abort_handle(),
        };
        (connection, closed)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues a frame without waiting for the socket. A peer whose queue is
    /// full has stopped reading; its writer is stopped and the connection
    /// torn down.
    pub fn send_frame(&self, frame: Frame) -> Result<(), RelayError> {
        match self.sender.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.writer.abort();
                Err(RelayError::QueueFull(OUTBOUND_QUEUE_SIZE))
            }
            Err(TrySendError::Closed(_)) => Err(RelayError::ConnectionClosed),
        }
    }

    pub fn send(&self, packet: &OutboundPacket) -> Result<(), RelayError> {
        let frame = encode_packet(packet)?;
        self.send_frame(Arc::new(frame))
    }

    /// Lets go of the socket. Frames already queued are still written before
    /// the write half is shut down.
    pub fn close(self) {
        debug!("Releasing connection {}", self.id);
    }
}

async fn run_writer<W>(
    id: ConnectionId,
    mut writer: W,
    mut frames: mpsc::Receiver<Frame>,
    write_timeout: Duration,
    _closer: oneshot::Sender<()>,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    while let Some(frame) = frames.recv().await {
        let write = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        let result = match timeout(write_timeout, write).await {
            Ok(result) => result.map_err(RelayError::from),
            Err(_) => Err(RelayError::WriteTimeout(write_timeout)),
        };
        if let Err(e) = result {
            debug!("Connection {} stopped writing: {}", id, e);
            return;
        }
    }

    match timeout(write_timeout, writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Shutdown of connection {} failed: {}", id, e),
        Err(_) => debug!("Shutdown of connection {} timed out", id),
    }
}

struct SessionInner {
    connection: Option<Connection>,
    state: Value,
    team_id: String,
    last_activity: Instant,
}

/// A participant in a room, online or retained after a disconnect.
pub struct ClientSession {
    id: ClientId,
    room: Weak<Room>,
    inner: Mutex<SessionInner>,
}

impl ClientSession {
    pub fn new(
        id: ClientId,
        room: Weak<Room>,
        connection: Connection,
        state: Value,
        team_id: String,
    ) -> Self {
        Self {
            id,
            room,
            inner: Mutex::new(SessionInner {
                connection: Some(connection),
                state,
                team_id,
                last_activity: Instant::now(),
            }),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// The owning room, unless it has been evicted.
    pub fn room(&self) -> Option<Arc<Room>> {
        self.room.upgrade()
    }

    /// Installs a new connection and state. Returns the connection it replaced
    /// so the caller can close it once no locks are held.
    pub async fn attach(
        &self,
        connection: Connection,
        state: Value,
        team_id: String,
    ) -> Option<Connection> {
        let mut inner = self.inner.lock().await;
        inner.state = state;
        inner.team_id = team_id;
        inner.last_activity = Instant::now();
        inner.connection.replace(connection)
    }

    /// Releases the connection only if it is still the one identified by
    /// `connection_id`; a stale connection task must not unseat a newer one.
    pub async fn detach(&self, connection_id: ConnectionId) -> Option<Connection> {
        let mut inner = self.inner.lock().await;
        match &inner.connection {
            Some(current) if current.id() == connection_id => {
                inner.last_activity = Instant::now();
                inner.connection.take()
            }
            _ => None,
        }
    }

    pub async fn force_detach(&self) -> Option<Connection> {
        let mut inner = self.inner.lock().await;
        if inner.connection.is_some() {
            inner.last_activity = Instant::now();
        }
        inner.connection.take()
    }

    pub async fn is_attached(&self, connection_id: ConnectionId) -> bool {
        let inner = self.inner.lock().await;
        inner
            .connection
            .as_ref()
            .is_some_and(|c| c.id() == connection_id)
    }

    pub async fn is_online(&self) -> bool {
        self.inner.lock().await.connection.is_some()
    }

    pub async fn touch(&self) {
        self.inner.lock().await.last_activity = Instant::now();
    }

    pub async fn idle_for(&self) -> Duration {
        self.inner.lock().await.last_activity.elapsed()
    }

    pub async fn team_id(&self) -> String {
        self.inner.lock().await.team_id.clone()
    }

    pub async fn state(&self) -> Value {
        self.inner.lock().await.state.clone()
    }

    /// Replaces the state blob and team, returning the previous team id.
    pub(crate) async fn replace_state(&self, state: Value, team_id: String) -> String {
        let mut inner = self.inner.lock().await;
        inner.state = state;
        inner.last_activity = Instant::now();
        std::mem::replace(&mut inner.team_id, team_id)
    }

    pub async fn member_state(&self) -> MemberState {
        let inner = self.inner.lock().await;
        MemberState {
            client_id: self.id,
            team_id: inner.team_id.clone(),
            online: inner.connection.is_some(),
            state: inner.state.clone(),
        }
    }

    /// Queues a pre-encoded frame. Returns `Ok(false)` when the client is
    /// offline and nothing was queued.
    pub async fn send_frame(&self, frame: Frame) -> Result<bool, RelayError> {
        let inner = self.inner.lock().await;
        match inner.connection.as_ref() {
            Some(connection) => {
                connection.send_frame(frame)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn send(&self, packet: &OutboundPacket) -> Result<bool, RelayError> {
        let frame = encode_packet(packet)?;
        self.send_frame(Arc::new(frame)).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use relay_shared::PacketReader;
    use serde_json::json;
    use tokio::io::DuplexStream;

    /// A connection backed by an in-memory pipe, plus a reader for whatever
    /// the server writes to it.
    pub(crate) fn test_connection(
        id: ConnectionId,
    ) -> (Connection, PacketReader<DuplexStream>, oneshot::Receiver<()>) {
        let (server_side, client_side) = tokio::io::duplex(64 * 1024);
        let (connection, closed) = Connection::new(id, server_side, Duration::from_secs(1));
        (connection, PacketReader::new(client_side), closed)
    }

    pub(crate) async fn next_packet(reader: &mut PacketReader<DuplexStream>) -> OutboundPacket {
        let frame = reader.next_frame().await.unwrap().unwrap();
        serde_json::from_slice(&frame).unwrap()
    }

    fn detached_session(id: ClientId, connection: Connection) -> ClientSession {
        ClientSession::new(id, Weak::new(), connection, json!({"clientId": id}), "red".into())
    }

    #[tokio::test]
    async fn send_reaches_the_peer() {
        let (connection, mut reader, _closed) = test_connection(1);
        let session = detached_session(5, connection);

        assert!(session.send(&OutboundPacket::heartbeat()).await.unwrap());
        assert_eq!(next_packet(&mut reader).await, OutboundPacket::heartbeat());
    }

    #[tokio::test]
    async fn frames_are_written_with_delimiter() {
        let mock = tokio_test::io::Builder::new()
            .write(b"{\"type\":\"DISABLE_ANCHOR\"}\0")
            .build();
        let (connection, closed) = Connection::new(1, mock, Duration::from_secs(1));

        connection.send(&OutboundPacket::DisableAnchor).unwrap();
        connection.close();
        // Resolves once the writer has drained the queue and exited
        assert!(closed.await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_peer_hits_write_timeout() {
        // The peer never reads, so the pipe fills after one byte
        let (server_side, _client_side) = tokio::io::duplex(1);
        let (connection, closed) = Connection::new(1, server_side, Duration::from_secs(10));

        connection.send(&OutboundPacket::heartbeat()).unwrap();
        assert!(closed.await.is_err());

        let result = connection.send(&OutboundPacket::heartbeat());
        assert!(matches!(result, Err(RelayError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn overflowing_queue_tears_down_connection() {
        let (server_side, _client_side) = tokio::io::duplex(1);
        let (connection, closed) = Connection::new(1, server_side, Duration::from_secs(10));
        let frame: Frame = Arc::new(vec![b'x'; 16]);

        let overflowed = (0..OUTBOUND_QUEUE_SIZE + 2)
            .map(|_| connection.send_frame(Arc::clone(&frame)))
            .any(|result| matches!(result, Err(RelayError::QueueFull(_))));
        assert!(overflowed);
        assert!(closed.await.is_err());
    }

    #[tokio::test]
    async fn detach_ignores_stale_connection_ids() {
        let (first, _reader1, _closed1) = test_connection(1);
        let (second, _reader2, _closed2) = test_connection(2);
        let session = detached_session(5, first);

        let stale = session
            .attach(second, json!({"clientId": 5}), "blue".into())
            .await
            .unwrap();
        assert_eq!(stale.id(), 1);

        assert!(session.detach(1).await.is_none());
        assert!(session.is_attached(2).await);
        assert_eq!(session.team_id().await, "blue");

        assert!(session.detach(2).await.is_some());
        assert!(!session.is_online().await);
    }

    #[tokio::test]
    async fn offline_sessions_skip_sends() {
        let (connection, _reader, _closed) = test_connection(1);
        let session = detached_session(5, connection);
        session.force_detach().await;

        assert!(!session.send(&OutboundPacket::DisableAnchor).await.unwrap());
        assert!(!session.member_state().await.online);
    }

    #[tokio::test]
    async fn dropping_connection_signals_reader_task() {
        let (connection, _reader, closed) = test_connection(1);
        let session = detached_session(5, connection);

        let taken = session.force_detach().await.unwrap();
        taken.close();
        assert!(closed.await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_time_tracks_activity() {
        let (connection, _reader, _closed) = test_connection(1);
        let session = detached_session(5, connection);

        tokio::time::advance(Duration::from_secs(40)).await;
        assert!(session.idle_for().await >= Duration::from_secs(40));

        session.touch().await;
        assert!(session.idle_for().await < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn replace_state_returns_previous_team() {
        let (connection, _reader, _closed) = test_connection(1);
        let session = detached_session(5, connection);

        let previous = session
            .replace_state(json!({"clientId": 5, "hp": 3}), "blue".into())
            .await;
        assert_eq!(previous, "red");
        assert_eq!(session.state().await["hp"], 3);
    }
}
