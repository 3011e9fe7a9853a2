//! Concrete channel transports.

mod ws;

pub use ws::{connect, serve, ConnectOptions, ServerWsChannel, WsChannel};
