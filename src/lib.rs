//! Rollcall - session layer for small multiplayer games over UDP
//!
//! A server admits participants through a dedicated admission socket, hands each
//! one an identity, and broadcasts the full roster of participant states to
//! everyone at a fixed tick. Clients push their own state and read the latest
//! roster back. Presentation (drawing, input) is left to the caller.

pub mod config;
pub mod network;
pub mod protocol;

pub use network::{
    Client, ClientError, ClientState, NetworkConfig, PingTimer, Server, ServerError, ServerEvent,
};
pub use protocol::{Identity, Message, ParticipantState, Rect, Roster};
