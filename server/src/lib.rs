//! # Room Relay Server Library
//!
//! A TCP relay that groups clients into rooms and keeps every member of a
//! room up to date with everyone else's state. The server does not interpret
//! the state it relays: each client owns an opaque JSON blob that is stored,
//! stamped with the client's identity and rebroadcast to the room whenever it
//! changes.
//!
//! ## Core Responsibilities
//!
//! ### Identity and Membership
//! A client opens with a `HANDSHAKE` naming a room and optionally a previous
//! identity. The registry honours the identity when nobody online holds it,
//! otherwise it hands out a fresh one. The client then joins the room and the
//! team named in its state, and the whole room receives the new membership.
//!
//! ### State Broadcasting
//! Joins, departures and state changes each produce an `ALL_CLIENT_STATE`
//! packet sent to every connected member of the room. A joining client also
//! receives a directed `ROOM_STATE` carrying its assigned identity.
//!
//! ### Maintenance
//! Background loops evict idle rooms, release long-offline sessions, send
//! keep-alives to quiet clients and persist the server counters.
//!
//! ## Module Organization
//!
//! - `network`: listener, per-connection packet loop, maintenance loops
//! - `registry`: identities, rooms, counters and the snapshot
//! - `room` / `team` / `client`: room membership and per-client sessions
//! - `admin` / `console`: operator actions and the stdin command console
//! - `supervisor`: shutdown channel and supervised background tasks
//! - `config` / `error` / `stats` / `utils`: supporting pieces
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use relay_server::{supervisor, Registry, RelayServer, ServerConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let registry = Arc::new(Registry::new(&config));
//!     registry.load_snapshot(&config.stats_path).await;
//!
//!     let (shutdown, mut reasons) = supervisor::channel();
//!     let server = RelayServer::bind(config, registry).await?;
//!     let _maintenance = server.spawn_maintenance(&shutdown);
//!     supervisor::spawn_supervised("listener", shutdown, server.run());
//!
//!     let reason = reasons.recv().await;
//!     println!("Stopping: {:?}", reason);
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod client;
pub mod config;
pub mod console;
pub mod error;
pub mod network;
pub mod registry;
pub mod room;
pub mod stats;
pub mod supervisor;
pub mod team;
pub mod utils;

pub use admin::Admin;
pub use config::ServerConfig;
pub use error::RelayError;
pub use network::RelayServer;
pub use registry::Registry;
pub use supervisor::Shutdown;
