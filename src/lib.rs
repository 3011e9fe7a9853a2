//! SFTP-over-WebSocket filesystem stack.
//!
//! `wsftp` provides both ends of a network-mounted POSIX-style filesystem
//! whose transport is a WebSocket connection carrying an SFTPv3-derived
//! protocol:
//!
//! - **Protocol**: length-prefixed binary packets with typed field codecs
//! - **Channel**: framed binary transport with a close-code error taxonomy
//! - **Client**: request-multiplexing engine exposing filesystem operations
//! - **Server**: per-channel sessions over a root-jailed local filesystem
//! - **Adapter**: kernel-callback surface with TTL caches, write
//!   coalescing, and automatic reconnection
//!
//! # Quick start
//!
//! ```rust,ignore
//! use wsftp::server::SessionConfig;
//!
//! // Serve /srv/pub over ws://0.0.0.0:4002
//! let config = SessionConfig { virtual_root: "/srv/pub".into(), ..Default::default() };
//! wsftp::transport::serve("0.0.0.0:4002".parse()?, config).await?;
//! ```

pub mod adapter;
pub mod channel;
pub mod client;
pub mod error;
pub mod fs;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod util;

pub use adapter::{MountOptions, SftpMount};
pub use client::SftpClient;
pub use error::{ErrorCode, SftpError, SftpResult};
pub use fs::FileOps;
pub use protocol::{FeatureSet, FileAttrs, Handle, Item, StatVfs};
pub use server::{SafeFs, SessionConfig};

/// Prelude for common imports.
pub mod prelude {
    pub use crate::error::{ErrorCode, SftpError, SftpResult};
    pub use crate::fs::FileOps;
    pub use crate::protocol::{FeatureSet, FileAttrs, Handle, Item, StatVfs};
}
