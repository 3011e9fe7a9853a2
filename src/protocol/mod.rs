//! SFTPv3-derived wire protocol: packet taxonomy, status codes, limits.
//!
//! # Frame format
//!
//! ```text
//! +----------+------+--------------+-----------------+
//! |  length  | type | request id   | payload         |
//! | (4 bytes)| (1)  | (4, not for  | (type-specific) |
//! |          |      |  INIT/VERSION)|                |
//! +----------+------+--------------+-----------------+
//! ```
//!
//! - Length is a big-endian u32 covering everything after itself
//! - One WebSocket binary message carries exactly one packet
//! - EXTENDED packets carry a length-prefixed extension name after the id

pub mod attrs;
pub mod codec;

pub use attrs::{FileAttrs, Item, StatVfs};
pub use codec::{PacketReader, PacketWriter, WireError};

/// Protocol version spoken on both sides.
pub const SFTP_VERSION: u32 = 3;

/// Maximum payload of a single READ or WRITE (1 MiB).
pub const MAX_BLOCK_SIZE: u32 = 1024 * 1024;

/// Maximum accepted packet size (data block plus generous header room).
pub const MAX_PACKET_SIZE: u32 = MAX_BLOCK_SIZE + 1024;

/// Largest position value the protocol guarantees to carry faithfully.
///
/// The legacy encoding round-trips offsets through double-precision
/// arithmetic, so positions beyond 2^53-1 are rejected before sending.
pub const MAX_SAFE_POSITION: u64 = (1 << 53) - 1;

/// WebSocket subprotocol token.
pub const SUBPROTOCOL: &str = "sftp";

/// Packet type discriminator: the raw one-byte wire value. EXTENDED
/// requests select their operation by a name string that follows the
/// request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Init = 1,
    Version = 2,
    Open = 3,
    Close = 4,
    Read = 5,
    Write = 6,
    Lstat = 7,
    Fstat = 8,
    Setstat = 9,
    Fsetstat = 10,
    Opendir = 11,
    Readdir = 12,
    Remove = 13,
    Mkdir = 14,
    Rmdir = 15,
    Realpath = 16,
    Stat = 17,
    Rename = 18,
    Readlink = 19,
    Symlink = 20,
    Status = 101,
    Handle = 102,
    Data = 103,
    Name = 104,
    Attrs = 105,
    Extended = 200,
    ExtendedReply = 201,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => PacketType::Init,
            2 => PacketType::Version,
            3 => PacketType::Open,
            4 => PacketType::Close,
            5 => PacketType::Read,
            6 => PacketType::Write,
            7 => PacketType::Lstat,
            8 => PacketType::Fstat,
            9 => PacketType::Setstat,
            10 => PacketType::Fsetstat,
            11 => PacketType::Opendir,
            12 => PacketType::Readdir,
            13 => PacketType::Remove,
            14 => PacketType::Mkdir,
            15 => PacketType::Rmdir,
            16 => PacketType::Realpath,
            17 => PacketType::Stat,
            18 => PacketType::Rename,
            19 => PacketType::Readlink,
            20 => PacketType::Symlink,
            101 => PacketType::Status,
            102 => PacketType::Handle,
            103 => PacketType::Data,
            104 => PacketType::Name,
            105 => PacketType::Attrs,
            200 => PacketType::Extended,
            201 => PacketType::ExtendedReply,
            _ => return None,
        })
    }

    /// INIT and VERSION are the only packets without a request id.
    pub fn has_request_id(&self) -> bool {
        !matches!(self, PacketType::Init | PacketType::Version)
    }

    /// Command tag used in error context and logs.
    pub fn op_name(&self) -> &'static str {
        match self {
            PacketType::Init => "init",
            PacketType::Version => "version",
            PacketType::Open => "open",
            PacketType::Close => "close",
            PacketType::Read => "read",
            PacketType::Write => "write",
            PacketType::Lstat => "lstat",
            PacketType::Fstat => "fstat",
            PacketType::Setstat => "setstat",
            PacketType::Fsetstat => "fsetstat",
            PacketType::Opendir => "opendir",
            PacketType::Readdir => "readdir",
            PacketType::Remove => "remove",
            PacketType::Mkdir => "mkdir",
            PacketType::Rmdir => "rmdir",
            PacketType::Realpath => "realpath",
            PacketType::Stat => "stat",
            PacketType::Rename => "rename",
            PacketType::Readlink => "readlink",
            PacketType::Symlink => "symlink",
            PacketType::Status => "status",
            PacketType::Handle => "handle",
            PacketType::Data => "data",
            PacketType::Name => "name",
            PacketType::Attrs => "attrs",
            PacketType::Extended => "extended",
            PacketType::ExtendedReply => "extended-reply",
        }
    }
}

/// STATUS packet result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StatusCode {
    Ok = 0,
    Eof = 1,
    NoSuchFile = 2,
    PermissionDenied = 3,
    Failure = 4,
    BadMessage = 5,
    NoConnection = 6,
    ConnectionLost = 7,
    OpUnsupported = 8,
}

impl StatusCode {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => StatusCode::Ok,
            1 => StatusCode::Eof,
            2 => StatusCode::NoSuchFile,
            3 => StatusCode::PermissionDenied,
            4 => StatusCode::Failure,
            5 => StatusCode::BadMessage,
            6 => StatusCode::NoConnection,
            7 => StatusCode::ConnectionLost,
            8 => StatusCode::OpUnsupported,
            _ => return None,
        })
    }
}

/// Extension names exchanged in VERSION and EXTENDED packets.
pub mod extensions {
    pub const HARDLINK: &str = "hardlink@openssh.com";
    pub const POSIX_RENAME: &str = "posix-rename@openssh.com";
    pub const STATVFS: &str = "statvfs@openssh.com";
    pub const COPY_DATA: &str = "copy-data";
    pub const CHECK_FILE_HANDLE: &str = "check-file-handle";
}

/// Optional capabilities negotiated during the handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureSet {
    pub hardlink: bool,
    pub posix_rename: bool,
    pub copy_data: bool,
    pub check_file_handle: bool,
    pub statvfs: bool,
}

impl FeatureSet {
    /// Fold one VERSION extension pair into the feature table.
    pub fn apply(&mut self, name: &str, value: &str) {
        match name {
            extensions::HARDLINK if value.contains('1') => self.hardlink = true,
            extensions::POSIX_RENAME if value.contains('1') => self.posix_rename = true,
            extensions::COPY_DATA => self.copy_data = true,
            extensions::CHECK_FILE_HANDLE => self.check_file_handle = true,
            extensions::STATVFS => self.statvfs = true,
            _ => {}
        }
    }
}

/// Rename flag requesting overwrite semantics (requires posix-rename).
pub const RENAME_OVERWRITE: u32 = 1;

/// An opaque server-allocated token for an open file or directory.
///
/// On the wire a handle is a length-prefixed opaque sequence; this
/// implementation always encodes exactly four bytes holding a big-endian
/// u32 which doubles as the handle's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub u32);

impl Handle {
    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 4] = bytes.try_into().ok()?;
        Some(Handle(u32::from_be_bytes(arr)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_type_roundtrip() {
        for code in [1u8, 2, 3, 12, 20, 101, 105, 200, 201] {
            let ty = PacketType::from_u8(code).unwrap();
            assert_eq!(ty as u8, code);
        }
        assert!(PacketType::from_u8(0).is_none());
        assert!(PacketType::from_u8(99).is_none());
    }

    #[test]
    fn request_id_presence() {
        assert!(!PacketType::Init.has_request_id());
        assert!(!PacketType::Version.has_request_id());
        assert!(PacketType::Open.has_request_id());
        assert!(PacketType::Status.has_request_id());
    }

    #[test]
    fn feature_negotiation() {
        let mut features = FeatureSet::default();
        features.apply(extensions::POSIX_RENAME, "1");
        features.apply(extensions::HARDLINK, "0");
        features.apply(extensions::STATVFS, "2");
        features.apply("unknown@nowhere", "1");
        assert!(features.posix_rename);
        assert!(!features.hardlink);
        assert!(features.statvfs);
    }

    #[test]
    fn handle_encoding() {
        let h = Handle(258);
        assert_eq!(h.to_bytes(), [0, 0, 1, 2]);
        assert_eq!(Handle::from_bytes(&[0, 0, 1, 2]), Some(h));
        assert_eq!(Handle::from_bytes(&[1, 2, 3]), None);
        assert_eq!(Handle::from_bytes(&[1, 2, 3, 4, 5]), None);
    }
}
