//! Protocol module - Defines the wire protocol for Rollcall sessions
//!
//! Every datagram carries one JSON object. The server and clients agree only on a
//! handful of recognized keys; anything else is carried along and ignored:
//! - `{"assigned_ID": n}` handshake reply
//! - `{"ping": true}` / `{"quit": true}` control signals
//! - `{"ID":..,"name":..,"rect":[..],"color":..,"flip":..}` participant state
//! - `{"0": {..}, "1": {..}}` roster broadcast

mod codec;
mod message;

pub use codec::*;
pub use message::*;

/// Default port of the session socket (steady-state traffic)
pub const DEFAULT_SESSION_PORT: u16 = 8888;

/// Default port of the admission socket (first contact only)
pub const DEFAULT_ADMISSION_PORT: u16 = 8889;

/// Default host both sockets live on
pub const DEFAULT_HOST: &str = "localhost";
