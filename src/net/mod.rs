//! The framed TCP front-end: connection tracking, the accept loop, and the
//! per-connection message state machine.

mod connection;
mod handler;
mod tcp;

pub use connection::{Connection, ConnectionId, ConnectionManager, ConnectionStats};
pub use handler::{HandlerStats, MessageHandler};
pub use tcp::TcpServer;
