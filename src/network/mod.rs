//! Network module - Runs Rollcall sessions over UDP
//!
//! Provides:
//! - Server: admission listener, datagram router and per-participant session workers
//! - Client for joining a server and exchanging state with it
//! - The session registry shared by the server's tasks

mod client;
mod registry;
mod server;
mod worker;

pub use client::*;
pub use registry::*;
pub use server::*;
pub use worker::*;

use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::{DEFAULT_ADMISSION_PORT, DEFAULT_HOST, DEFAULT_SESSION_PORT};

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Host both server sockets are bound to (and clients send to)
    pub host: String,
    /// Port of the session socket
    pub session_port: u16,
    /// Port of the admission socket
    pub admission_port: u16,
    /// Presentation refresh rate; the network ticks at twice this
    pub frame_rate: u32,
    /// How long a client waits for its handshake reply
    pub handshake_timeout_ms: u64,
    /// Maximum number of concurrent participants
    pub max_clients: usize,
    /// Stop listening for handshakes once the server is full
    pub close_when_full: bool,
    /// Drop a participant after this long without a usable datagram (`None` = never)
    pub idle_timeout_ms: Option<u64>,
    /// Outbound messages a client may have queued at once
    pub outbound_queue_capacity: usize,
    /// Frames without a state change before a client pings
    pub ping_interval_frames: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            session_port: DEFAULT_SESSION_PORT,
            admission_port: DEFAULT_ADMISSION_PORT,
            frame_rate: 60,
            handshake_timeout_ms: 5000,
            max_clients: 3,
            close_when_full: true,
            idle_timeout_ms: Some(10_000),
            outbound_queue_capacity: 256,
            ping_interval_frames: 180,
        }
    }
}

impl NetworkConfig {
    pub fn new(host: impl Into<String>, session_port: u16, admission_port: u16) -> Self {
        Self {
            host: host.into(),
            session_port,
            admission_port,
            ..Default::default()
        }
    }

    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    pub fn keep_admitting(mut self) -> Self {
        self.close_when_full = false;
        self
    }

    /// Interval between network iterations (twice the frame rate)
    pub fn tick_interval(&self) -> Duration {
        let ticks_per_second = u64::from(self.frame_rate.max(1)) * 2;
        Duration::from_micros(1_000_000 / ticks_per_second)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis)
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
