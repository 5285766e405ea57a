use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::domain::{ActorId, BoardSnapshot, Cell};

/// Cell as served over the wire. Older servers send the "square" shape with a
/// nested `owner` object, newer ones a flat `ownerId`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireCell {
    pub x: i32,
    pub y: i32,
    #[serde(default)]
    pub owner_id: Option<ActorId>,
    #[serde(default)]
    pub owner: Option<WireOwner>,
    #[serde(default)]
    pub defense_bonus: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireOwner {
    pub id: ActorId,
}

impl From<WireCell> for Cell {
    fn from(wire: WireCell) -> Self {
        let owner_id = wire.owner_id.or(wire.owner.map(|owner| owner.id));
        let defense_bonus = u32::try_from(wire.defense_bonus.max(0)).unwrap_or(u32::MAX);
        Cell {
            x: wire.x,
            y: wire.y,
            owner_id,
            defense_bonus,
        }
    }
}

/// Broadcast tag on the room topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InboundKind {
    SquareCaptured,
    SquareDefended,
    WorldReset,
}

/// Raw envelope pushed on `/topic/worlds/{slug}`. Tag validation happens in
/// the decoder, so `kind` stays a string here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board: Option<BoardSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub square: Option<Cell>,
    #[serde(default, alias = "playerId")]
    pub actor_id: Option<ActorId>,
    /// Metadata only. Anything unreadable decodes as `None` so the payload
    /// is never lost over it.
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        serialize_with = "chrono::serde::ts_milliseconds_option::serialize"
    )]
    pub timestamp: Option<DateTime<Utc>>,
}

impl InboundEnvelope {
    pub fn board_event(kind: InboundKind, board: BoardSnapshot, actor_id: Option<ActorId>) -> Self {
        Self {
            kind: kind.wire_name().to_string(),
            board: Some(board),
            square: None,
            actor_id,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }
}

/// Epoch values at or above this are taken as milliseconds, below as seconds.
const MILLIS_THRESHOLD: f64 = 1e11;

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(timestamp_from_value))
}

/// Accepts epoch millis, epoch seconds with a fraction, and RFC 3339 text.
fn timestamp_from_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(number) => match number.as_i64() {
            Some(whole) => from_epoch_integer(whole),
            None => number.as_f64().and_then(from_epoch_float),
        },
        Value::String(text) => DateTime::parse_from_rfc3339(text.trim())
            .map(|parsed| parsed.with_timezone(&Utc))
            .ok()
            .or_else(|| text.trim().parse::<f64>().ok().and_then(from_epoch_float)),
        _ => None,
    }
}

fn from_epoch_integer(whole: i64) -> Option<DateTime<Utc>> {
    if whole.unsigned_abs() as f64 >= MILLIS_THRESHOLD {
        DateTime::from_timestamp_millis(whole)
    } else {
        DateTime::from_timestamp(whole, 0)
    }
}

fn from_epoch_float(raw: f64) -> Option<DateTime<Utc>> {
    if !raw.is_finite() {
        return None;
    }
    let seconds = if raw.abs() >= MILLIS_THRESHOLD {
        raw / 1000.0
    } else {
        raw
    };
    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::from_timestamp(whole as i64, nanos)
}

impl InboundKind {
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::SquareCaptured => "SQUARE_CAPTURED",
            Self::SquareDefended => "SQUARE_DEFENDED",
            Self::WorldReset => "WORLD_RESET",
        }
    }

    pub fn from_wire(tag: &str) -> Option<Self> {
        match tag {
            "SQUARE_CAPTURED" => Some(Self::SquareCaptured),
            "SQUARE_DEFENDED" => Some(Self::SquareDefended),
            "WORLD_RESET" => Some(Self::WorldReset),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CellActionRequest {
    pub x: i32,
    pub y: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<ActorId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResetRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<ActorId>,
}

/// Capture and defend answer with either the updated cell or the whole board.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ActionResponse {
    Board(BoardSnapshot),
    Cell(Cell),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserType {
    Guest,
    Registered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub token: String,
    pub user_id: ActorId,
    pub username: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub user_type: Option<UserType>,
}
