//! TCP listener, per-connection packet loop and the maintenance loops

use crate::client::{ClientSession, Connection, ConnectionId};
use crate::config::ServerConfig;
use crate::error::RelayError;
use crate::registry::Registry;
use crate::supervisor::{spawn_supervised, ShutdownHandle};
use log::{debug, error, info, warn};
use relay_shared::{Packet, PacketKind, PacketReader};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::AbortHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Accepts connections and hands each one its own task
pub struct RelayServer {
    listener: TcpListener,
    registry: Arc<Registry>,
    config: ServerConfig,
    next_connection_id: AtomicU64,
}

impl RelayServer {
    pub async fn bind(config: ServerConfig, registry: Arc<Registry>) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: config.bind_addr.clone(),
                source,
            })?;
        info!("Server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            registry,
            config,
            next_connection_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Starts the room sweeper, the heartbeat and the stats writer
    pub fn spawn_maintenance(&self, shutdown: &ShutdownHandle) -> Vec<AbortHandle> {
        let config = &self.config;
        vec![
            spawn_supervised(
                "room sweeper",
                shutdown.clone(),
                run_room_sweeper(self.registry(), config.sweep_interval),
            ),
            spawn_supervised(
                "heartbeat",
                shutdown.clone(),
                run_heartbeat(self.registry(), config.heartbeat_interval),
            ),
            spawn_supervised(
                "stats writer",
                shutdown.clone(),
                run_stats_writer(
                    self.registry(),
                    config.stats_path.clone(),
                    config.stats_interval,
                ),
            ),
        ]
    }

    /// Accept loop. Runs until the task is aborted; a failed accept only
    /// affects the connection that was being accepted.
    pub async fn run(self) -> Result<(), RelayError> {
        let write_timeout = self.config.write_timeout;
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                    let registry = self.registry();
                    tokio::spawn(async move {
                        handle_connection(registry, stream, addr, connection_id, write_timeout)
                            .await;
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
}

/// Drives one TCP connection from accept to close
///
/// Before a `HANDSHAKE` the connection is unauthenticated: only `STATS` is
/// answered and everything else is dropped. The handshake resolves a session
/// and moves the write half into it; from then on packets go to the
/// registry. The loop also ends when the connection's writer task exits:
/// the server dropped it (operator disable, room eviction) or the peer
/// stopped accepting writes.
pub async fn handle_connection(
    registry: Arc<Registry>,
    stream: TcpStream,
    addr: SocketAddr,
    connection_id: ConnectionId,
    write_timeout: Duration,
) {
    if !registry.is_quiet() {
        debug!("Connection {} accepted from {}", connection_id, addr);
    }
    let (read_half, write_half) = stream.into_split();
    let mut reader = PacketReader::new(read_half);
    let (connection, mut closed) = Connection::new(connection_id, write_half, write_timeout);
    let mut pending = Some(connection);
    let mut session: Option<Arc<ClientSession>> = None;

    let outcome: Result<(), RelayError> = loop {
        let frame = tokio::select! {
            frame = reader.next_frame() => frame,
            _ = &mut closed => {
                debug!("Connection {} writer finished", connection_id);
                break Ok(());
            }
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e.into()),
        };

        let packet = match Packet::decode(&frame) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping packet from {}: {}", addr, e);
                continue;
            }
        };

        if packet.kind() == &PacketKind::Stats {
            let reply = registry.stats().await;
            let sent = match (&session, pending.as_ref()) {
                (Some(session), _) => session.send(&reply).await.map(|_| ()),
                (None, Some(connection)) => connection.send(&reply),
                (None, None) => Ok(()),
            };
            if let Err(e) = sent {
                break Err(e);
            }
            continue;
        }

        match &session {
            None => {
                if packet.kind() != &PacketKind::Handshake {
                    warn!("Client at {} must handshake first, got {:?}", addr, packet.type_name());
                    continue;
                }
                let Some(connection) = pending.take() else {
                    break Ok(());
                };

                let resolved = registry.resolve_client(&packet, connection).await;
                if !registry.is_quiet() {
                    info!("Client {} connected from {}", resolved.id(), addr);
                }
                if let Some(room) = resolved.room() {
                    room.broadcast_all_client_state().await;
                    if let Err(e) = room.send_room_state(&resolved).await {
                        warn!("Failed to send room state to client {}: {}", resolved.id(), e);
                    }
                }
                session = Some(resolved);
            }
            Some(current) => {
                if !current.is_attached(connection_id).await {
                    break Ok(());
                }
                registry.handle_client_packet(current, &packet).await;
            }
        }
    };

    match session {
        Some(session) => {
            registry.disconnect(&session, connection_id).await;
            match outcome {
                Err(e) => warn!("Client {} disconnected with error: {}", session.id(), e),
                Ok(()) if !registry.is_quiet() => info!("Client {} disconnected", session.id()),
                Ok(()) => {}
            }
        }
        None => {
            if let Err(e) = outcome {
                warn!("Unknown client at {} disconnected with error: {}", addr, e);
            } else {
                debug!("Unknown client at {} disconnected", addr);
            }
        }
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    // Skip the immediate first tick
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

pub async fn run_room_sweeper(registry: Arc<Registry>, period: Duration) -> Result<(), RelayError> {
    let mut ticker = ticker(period);
    loop {
        ticker.tick().await;
        registry.evict_idle_rooms().await;
    }
}

pub async fn run_heartbeat(registry: Arc<Registry>, period: Duration) -> Result<(), RelayError> {
    let mut ticker = ticker(period);
    loop {
        ticker.tick().await;
        let sent = registry.heartbeat().await;
        if sent > 0 {
            debug!("Sent {} heartbeats", sent);
        }
    }
}

pub async fn run_stats_writer(
    registry: Arc<Registry>,
    path: PathBuf,
    period: Duration,
) -> Result<(), RelayError> {
    let mut ticker = ticker(period);
    loop {
        ticker.tick().await;
        registry.persist_snapshot(&path).await;
    }
}
