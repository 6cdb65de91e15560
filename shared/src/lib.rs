use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod codec;

pub use codec::{encode_packet, write_frame, PacketReader};

pub type ClientId = u64;

pub const DEFAULT_PORT: u16 = 43383;
/// Byte that terminates every packet on the wire.
pub const PACKET_DELIMITER: u8 = 0;
pub const MAX_PACKET_SIZE: usize = 64 * 1024;

pub const HANDSHAKE: &str = "HANDSHAKE";
pub const STATS: &str = "STATS";
pub const HEARTBEAT: &str = "HEARTBEAT";
pub const GAME_COMPLETE: &str = "GAME_COMPLETE";

pub const DEFAULT_SERVER_MESSAGE: &str =
    "You have been disconnected by the server. Try to connect again in a bit!";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid JSON packet: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("packet is not a JSON object")]
    NotAnObject,
    #[error("packet missing string type field")]
    MissingType,
    #[error("packet exceeds the 64 KiB frame limit")]
    TooLarge,
    #[error("failed to encode packet: {0}")]
    Encode(#[source] serde_json::Error),
}

/// What the server does with an inbound packet, keyed off its `type` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketKind {
    Handshake,
    Stats,
    Heartbeat,
    GameComplete,
    Other(String),
}

impl PacketKind {
    fn from_type(kind: &str) -> Self {
        match kind {
            HANDSHAKE => PacketKind::Handshake,
            STATS => PacketKind::Stats,
            HEARTBEAT => PacketKind::Heartbeat,
            GAME_COMPLETE => PacketKind::GameComplete,
            other => PacketKind::Other(other.to_string()),
        }
    }
}

/// A decoded inbound packet. The body is kept as raw JSON; the server only
/// reads the handful of fields it routes on.
#[derive(Debug, Clone)]
pub struct Packet {
    kind: PacketKind,
    body: Map<String, Value>,
}

impl Packet {
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(payload).map_err(ProtocolError::InvalidJson)?;
        let Value::Object(body) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        let kind = match body.get("type") {
            Some(Value::String(kind)) => PacketKind::from_type(kind),
            _ => return Err(ProtocolError::MissingType),
        };

        Ok(Self { kind, body })
    }

    pub fn kind(&self) -> &PacketKind {
        &self.kind
    }

    pub fn type_name(&self) -> &str {
        self.body.get("type").and_then(Value::as_str).unwrap_or_default()
    }

    /// Identity claimed by the peer; absent or non-numeric claims count as 0.
    pub fn client_id(&self) -> ClientId {
        self.body
            .get("clientId")
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    pub fn room_id(&self) -> String {
        self.body
            .get("roomId")
            .map(value_as_key)
            .unwrap_or_default()
    }

    pub fn client_state(&self) -> Option<&Value> {
        self.body.get("clientState")
    }
}

/// Turns a loosely typed JSON field into a map key. Strings are used as-is,
/// null becomes the empty key and anything else uses its JSON text.
pub fn value_as_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Normalises a client's state blob: non-objects are replaced by an empty
/// object and the `clientId` field is overwritten with the server-side identity.
pub fn stamp_client_state(state: Option<&Value>, client_id: ClientId) -> Value {
    let mut fields = match state {
        Some(Value::Object(fields)) => fields.clone(),
        _ => Map::new(),
    };
    fields.insert("clientId".to_string(), Value::from(client_id));
    Value::Object(fields)
}

pub fn team_id_of(state: &Value) -> String {
    state.get("teamId").map(value_as_key).unwrap_or_default()
}

/// One room member as it appears in room-state packets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberState {
    pub client_id: ClientId,
    pub team_id: String,
    pub online: bool,
    pub state: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum OutboundPacket {
    Stats {
        unique_players: u64,
        games_completed: u64,
        online: usize,
    },
    /// Sent only to the client that just joined.
    RoomState {
        room_id: String,
        client_id: ClientId,
        clients: Vec<MemberState>,
    },
    AllClientState {
        room_id: String,
        clients: Vec<MemberState>,
    },
    Heartbeat {
        quiet: bool,
    },
    ServerMessage {
        message: String,
    },
    DisableAnchor,
}

impl OutboundPacket {
    pub fn heartbeat() -> Self {
        OutboundPacket::Heartbeat { quiet: true }
    }

    /// Builds a `SERVER_MESSAGE`, falling back to the standard disconnect
    /// notice when the text is blank.
    pub fn server_message(message: &str) -> Self {
        let message = message.trim();
        let message = if message.is_empty() {
            DEFAULT_SERVER_MESSAGE
        } else {
            message
        };
        OutboundPacket::ServerMessage {
            message: message.to_string(),
        }
    }
}
