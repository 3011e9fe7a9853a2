//! Client side: the request-issuing protocol engine.

mod engine;

pub use engine::SftpClient;
