pub mod engine;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod state;
pub mod wire;

pub use engine::{resolve, ClientHandler, ClientRole, Dispatcher, ProtocolEngine, ProxyConfig, ServerHandler, ServerRole};
pub use error::{ProtocolError, ProtocolResult};
pub use peer::{Connection, PeerDirectory, PeerEntry};
pub use protocol::{Message, MessageKind, MessageWrapper};
pub use state::{ConnectionContext, ConnectionState};
