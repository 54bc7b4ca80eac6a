//! Per-connection lifecycle.

use std::fmt;
use std::net::SocketAddr;

/// State of a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Transport not yet established.
    #[default]
    Connecting,
    /// Transport up and our Hello sent, awaiting the peer's Hello.
    Handshaking,
    /// Peer registered, messages are dispatched or relayed.
    Active,
    /// An error or stop request ended the read loop.
    Closing,
    /// Peer unregistered and transport closed.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Handshaking => write!(f, "handshaking"),
            ConnectionState::Active => write!(f, "active"),
            ConnectionState::Closing => write!(f, "closing"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Tracks the state of one connection and logs its transitions.
#[derive(Debug)]
pub struct ConnectionContext {
    pub address: SocketAddr,
    pub state: ConnectionState,
    /// Frames received on this connection
    pub received: u64,
    /// Frames forwarded to other connections
    pub relayed: u64,
}

impl ConnectionContext {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            state: ConnectionState::Connecting,
            received: 0,
            relayed: 0,
        }
    }

    pub fn transition_to(&mut self, new_state: ConnectionState) {
        if self.state == new_state {
            return;
        }
        tracing::debug!(
            peer = %self.address,
            from = %self.state,
            to = %new_state,
            "Connection state transition"
        );
        self.state = new_state;
    }
}
