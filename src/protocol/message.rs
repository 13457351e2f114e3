//! Protocol message definitions
//!
//! The wire carries open records; this module gives them a closed set of meanings.
//! Recognized keys are matched by presence, so extra fields never make a record
//! unusable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::codec::{decode_record, encode_record, CodecError, Record};

/// Server-assigned participant identity
pub type Identity = u32;

/// Authoritative view of every active participant, ordered by identity
pub type Roster = BTreeMap<Identity, ParticipantState>;

/// Key of the handshake reply
pub const ASSIGNED_ID_KEY: &str = "assigned_ID";
/// Presence of this key makes a record a quit signal
pub const QUIT_KEY: &str = "quit";
/// Presence of this key makes a record a ping
pub const PING_KEY: &str = "ping";
/// Presence of this key makes a record a state update
pub const NAME_KEY: &str = "name";

/// Axis-aligned bounding box, sent as `[x, y, w, h]`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[i32; 4]", into = "[i32; 4]")]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }
}

impl From<[i32; 4]> for Rect {
    fn from([x, y, w, h]: [i32; 4]) -> Self {
        Self { x, y, w, h }
    }
}

impl From<Rect> for [i32; 4] {
    fn from(rect: Rect) -> Self {
        [rect.x, rect.y, rect.w, rect.h]
    }
}

/// State of one participant as produced by its presentation layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantState {
    /// Identity; `None` until the server assigns one
    #[serde(rename = "ID", default)]
    pub id: Option<Identity>,
    /// Display name
    pub name: String,
    /// Bounding box in presentation coordinates
    #[serde(default)]
    pub rect: Rect,
    /// Palette/appearance index
    #[serde(default)]
    pub color: u32,
    /// Mirrored horizontally
    #[serde(default)]
    pub flip: bool,
}

impl ParticipantState {
    pub fn new(name: impl Into<String>, rect: Rect, color: u32, flip: bool) -> Self {
        Self {
            id: None,
            name: name.into(),
            rect,
            color,
            flip,
        }
    }

    /// Copy of this state carrying the given identity
    pub fn with_id(mut self, id: Identity) -> Self {
        self.id = Some(id);
        self
    }
}

/// Every meaning a record can have
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Latest state of the sending participant
    StateUpdate(ParticipantState),

    /// Liveness heartbeat, no state effect
    Ping,

    /// Graceful termination request
    Quit,

    /// Reply to a first-contact datagram
    HandshakeReply { assigned_id: Identity },

    /// Full roster broadcast from the server
    Roster(Roster),

    /// Well-formed record with no recognized meaning; kept verbatim
    Unknown(Record),
}

impl Message {
    /// Classify a decoded record
    pub fn from_record(record: Record) -> Self {
        if record.contains_key(QUIT_KEY) {
            return Message::Quit;
        }

        if record.contains_key(NAME_KEY) {
            return match serde_json::from_value(Value::Object(record.clone())) {
                Ok(state) => Message::StateUpdate(state),
                Err(_) => Message::Unknown(record),
            };
        }

        if record.contains_key(PING_KEY) {
            return Message::Ping;
        }

        if let Some(value) = record.get(ASSIGNED_ID_KEY) {
            return match value.as_u64().and_then(|id| Identity::try_from(id).ok()) {
                Some(assigned_id) => Message::HandshakeReply { assigned_id },
                None => Message::Unknown(record),
            };
        }

        if record.keys().all(|key| key.parse::<Identity>().is_ok()) {
            if let Ok(roster) = serde_json::from_value(Value::Object(record.clone())) {
                return Message::Roster(roster);
            }
        }

        Message::Unknown(record)
    }

    /// Render this message as a wire record
    pub fn to_record(&self) -> Result<Record, CodecError> {
        let value = match self {
            Message::StateUpdate(state) => serde_json::to_value(state)?,
            Message::Ping => json!({ PING_KEY: true }),
            Message::Quit => json!({ QUIT_KEY: true }),
            Message::HandshakeReply { assigned_id } => json!({ ASSIGNED_ID_KEY: assigned_id }),
            Message::Roster(roster) => serde_json::to_value(roster)?,
            Message::Unknown(record) => return Ok(record.clone()),
        };

        match value {
            Value::Object(record) => Ok(record),
            _ => Err(CodecError::NotARecord),
        }
    }

    /// Encode into a datagram payload
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        match self {
            // straight from the roster so keys stay in numeric order
            Message::Roster(roster) => encode_record(roster),
            _ => encode_record(&self.to_record()?),
        }
    }

    /// Decode a datagram payload
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        decode_record(payload).map(Self::from_record)
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Message::StateUpdate(_) => "state",
            Message::Ping => "ping",
            Message::Quit => "quit",
            Message::HandshakeReply { .. } => "handshake-reply",
            Message::Roster(_) => "roster",
            Message::Unknown(_) => "unknown",
        }
    }
}

impl From<ParticipantState> for Message {
    fn from(state: ParticipantState) -> Self {
        Message::StateUpdate(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> ParticipantState {
        ParticipantState::new("alice", Rect::new(10, 10, 10, 10), 0, false)
    }

    #[test]
    fn test_state_roundtrip() {
        let states = [
            alice(),
            alice().with_id(4),
            ParticipantState::new("ünïcødé", Rect::new(-3, 900, 1, 0), 2, true),
        ];

        for state in states {
            let bytes = Message::StateUpdate(state.clone()).encode().unwrap();
            assert_eq!(Message::decode(&bytes).unwrap(), Message::StateUpdate(state));
        }
    }

    #[test]
    fn test_state_wire_shape() {
        let bytes = Message::StateUpdate(alice().with_id(0)).encode().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(
            value,
            json!({"ID": 0, "name": "alice", "rect": [10, 10, 10, 10], "color": 0, "flip": false})
        );
    }

    #[test]
    fn test_extra_fields_are_tolerated() {
        let payload = br#"{"ID":null,"name":"bob","rect":[1,2,3,4],"color":1,"flip":true,"hat":"fez"}"#;

        match Message::decode(payload).unwrap() {
            Message::StateUpdate(state) => {
                assert_eq!(state.name, "bob");
                assert_eq!(state.rect, Rect::new(1, 2, 3, 4));
                assert_eq!(state.id, None);
                assert!(state.flip);
            }
            other => panic!("expected state update, got {other:?}"),
        }
    }

    #[test]
    fn test_control_signals_match_by_presence() {
        assert_eq!(Message::decode(br#"{"quit":true}"#).unwrap(), Message::Quit);
        assert_eq!(Message::decode(br#"{"quit":false}"#).unwrap(), Message::Quit);
        assert_eq!(Message::decode(br#"{"ping":true,"seq":9}"#).unwrap(), Message::Ping);
        assert_eq!(
            Message::decode(br#"{"name":"carol","quit":true}"#).unwrap(),
            Message::Quit
        );
    }

    #[test]
    fn test_bad_state_fields_become_unknown() {
        let msg = Message::decode(br#"{"name":"dave","rect":"wide"}"#).unwrap();
        assert_eq!(msg.kind(), "unknown");
    }

    #[test]
    fn test_handshake_reply_wire_shape() {
        let bytes = Message::HandshakeReply { assigned_id: 2 }.encode().unwrap();
        assert_eq!(bytes, br#"{"assigned_ID":2}"#);
        assert_eq!(
            Message::decode(&bytes).unwrap(),
            Message::HandshakeReply { assigned_id: 2 }
        );
        assert_eq!(Message::decode(br#"{"assigned_ID":-1}"#).unwrap().kind(), "unknown");
    }

    #[test]
    fn test_roster_wire_shape() {
        let mut roster = Roster::new();
        roster.insert(0, alice().with_id(0));

        let bytes = Message::Roster(roster.clone()).encode().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            value,
            json!({"0": {"ID": 0, "name": "alice", "rect": [10, 10, 10, 10], "color": 0, "flip": false}})
        );

        assert_eq!(Message::decode(&bytes).unwrap(), Message::Roster(roster));
    }

    #[test]
    fn test_roster_keys_are_ordered_numerically() {
        let mut roster = Roster::new();
        for id in [10, 2, 0] {
            roster.insert(id, alice().with_id(id));
        }

        let bytes = Message::Roster(roster).encode().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let zero = text.find("\"0\"").unwrap();
        let two = text.find("\"2\"").unwrap();
        let ten = text.find("\"10\"").unwrap();
        assert!(zero < two && two < ten);
    }

    #[test]
    fn test_empty_record_is_empty_roster() {
        assert_eq!(Message::decode(b"{}").unwrap(), Message::Roster(Roster::new()));
    }

    #[test]
    fn test_unknown_record_is_kept() {
        let msg = Message::decode(br#"{"emote":"wave"}"#).unwrap();
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes, br#"{"emote":"wave"}"#);
    }
}
