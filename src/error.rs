//! Structured errors for the protocol stack.
//!
//! Every failed operation yields an [`SftpError`] carrying the textual
//! POSIX-like code, its legacy integer errno, the server-provided message,
//! and whatever context (command, path, handle) the originating call had.

use crate::protocol::StatusCode;
use std::fmt;

/// Textual error code taxonomy.
///
/// The first group mirrors the wire STATUS table; the second group covers
/// transport-level failures that never appear in a STATUS packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Eof,
    NoEnt,
    Access,
    Failure,
    NotConn,
    Shutdown,
    NoSys,
    ReadOnlyFs,
    FileTableOverflow,
    Io,
    ConnRefused,
    ConnAborted,
    ConnReset,
    Prototype,
    GoingAway,
    NoAuth,
    BadMessage,
    MessageTooLarge,
}

impl ErrorCode {
    /// The textual name, as carried in error context and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Eof => "EOF",
            ErrorCode::NoEnt => "ENOENT",
            ErrorCode::Access => "EACCES",
            ErrorCode::Failure => "EFAILURE",
            ErrorCode::NotConn => "ENOTCONN",
            ErrorCode::Shutdown => "ESHUTDOWN",
            ErrorCode::NoSys => "ENOSYS",
            ErrorCode::ReadOnlyFs => "EROFS",
            ErrorCode::FileTableOverflow => "ENFILE",
            ErrorCode::Io => "EIO",
            ErrorCode::ConnRefused => "ECONNREFUSED",
            ErrorCode::ConnAborted => "ECONNABORTED",
            ErrorCode::ConnReset => "ECONNRESET",
            ErrorCode::Prototype => "EPROTOTYPE",
            ErrorCode::GoingAway => "X_GOINGAWAY",
            ErrorCode::NoAuth => "X_NOAUTH",
            ErrorCode::BadMessage => "EBADMSG",
            ErrorCode::MessageTooLarge => "EMSGSIZE",
        }
    }

    /// The legacy integer errno paired with the code.
    ///
    /// The protocol inherited these values from its original host platform;
    /// they match the STATUS translation table and are distinct from the
    /// kernel errno space (see [`ErrorCode::kernel_errno`]).
    pub fn errno(&self) -> i32 {
        match self {
            ErrorCode::Eof => 1,
            ErrorCode::NoEnt => 34,
            ErrorCode::Access => 3,
            ErrorCode::Failure => -2,
            ErrorCode::NotConn => 31,
            ErrorCode::Shutdown => 46,
            ErrorCode::NoSys => 35,
            ErrorCode::ReadOnlyFs => 53,
            ErrorCode::FileTableOverflow => 20,
            ErrorCode::Io => 5,
            ErrorCode::ConnRefused => 61,
            ErrorCode::ConnAborted => 53,
            ErrorCode::ConnReset => 54,
            ErrorCode::Prototype => 41,
            ErrorCode::GoingAway => -3,
            ErrorCode::NoAuth => -4,
            ErrorCode::BadMessage => 94,
            ErrorCode::MessageTooLarge => 40,
        }
    }

    /// Translate to the kernel errno space used by the mount adapter.
    ///
    /// Codes with no kernel counterpart fall back to ENOSYS.
    pub fn kernel_errno(&self) -> i32 {
        match self {
            ErrorCode::Eof => 0,
            ErrorCode::NoEnt => libc::ENOENT,
            ErrorCode::Access => libc::EACCES,
            ErrorCode::Failure => libc::EIO,
            ErrorCode::NotConn => libc::ENOTCONN,
            ErrorCode::Shutdown => libc::ESHUTDOWN,
            ErrorCode::NoSys => libc::ENOSYS,
            ErrorCode::ReadOnlyFs => libc::EROFS,
            ErrorCode::FileTableOverflow => libc::ENFILE,
            ErrorCode::Io => libc::EIO,
            ErrorCode::ConnRefused | ErrorCode::ConnAborted | ErrorCode::ConnReset => {
                libc::ENOTCONN
            }
            ErrorCode::Prototype => libc::EPROTO,
            ErrorCode::BadMessage => libc::EBADMSG,
            ErrorCode::MessageTooLarge => libc::EMSGSIZE,
            _ => libc::ENOSYS,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured protocol error.
#[derive(Debug, Clone)]
pub struct SftpError {
    /// Textual POSIX-like code.
    pub code: ErrorCode,
    /// Legacy integer errno (see [`ErrorCode::errno`]).
    pub errno: i32,
    /// Human-readable description, server-provided where available.
    pub message: String,
    /// Raw wire STATUS code, when the error originated in a STATUS packet.
    pub native_code: Option<u32>,
    /// Command tag of the originating operation.
    pub command: Option<&'static str>,
    /// Path context of the originating operation.
    pub path: Option<String>,
    /// Handle context of the originating operation.
    pub handle: Option<u32>,
}

impl SftpError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            errno: code.errno(),
            message: message.into(),
            native_code: None,
            command: None,
            path: None,
            handle: None,
        }
    }

    /// Build an error from a non-OK wire STATUS.
    pub fn from_status(status: StatusCode, message: impl Into<String>) -> Self {
        let code = match status {
            StatusCode::Ok | StatusCode::Eof => ErrorCode::Eof,
            StatusCode::NoSuchFile => ErrorCode::NoEnt,
            StatusCode::PermissionDenied => ErrorCode::Access,
            StatusCode::Failure | StatusCode::BadMessage => ErrorCode::Failure,
            StatusCode::NoConnection => ErrorCode::NotConn,
            StatusCode::ConnectionLost => ErrorCode::Shutdown,
            StatusCode::OpUnsupported => ErrorCode::NoSys,
        };
        let mut err = Self::new(code, message);
        err.native_code = Some(status as u32);
        err
    }

    pub fn with_command(mut self, command: &'static str) -> Self {
        self.command = Some(command);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_handle(mut self, handle: u32) -> Self {
        self.handle = Some(handle);
        self
    }

    /// The error surfaced to every request outstanding when a channel dies.
    pub fn connection_lost() -> Self {
        Self::new(ErrorCode::Shutdown, "connection lost")
    }

    /// Operation attempted while no session is established.
    pub fn not_connected() -> Self {
        Self::new(ErrorCode::NotConn, "not connected")
    }

    /// Malformed or truncated packet.
    pub fn bad_message(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadMessage, detail)
    }
}

impl fmt::Display for SftpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(cmd) = self.command {
            write!(f, " ({})", cmd)?;
        }
        if let Some(ref path) = self.path {
            write!(f, " [{}]", path)?;
        }
        Ok(())
    }
}

impl std::error::Error for SftpError {}

/// Result alias used throughout the protocol stack.
pub type SftpResult<T> = Result<T, SftpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_translation_table() {
        let cases = [
            (StatusCode::Eof, ErrorCode::Eof, 1),
            (StatusCode::NoSuchFile, ErrorCode::NoEnt, 34),
            (StatusCode::PermissionDenied, ErrorCode::Access, 3),
            (StatusCode::Failure, ErrorCode::Failure, -2),
            (StatusCode::BadMessage, ErrorCode::Failure, -2),
            (StatusCode::NoConnection, ErrorCode::NotConn, 31),
            (StatusCode::ConnectionLost, ErrorCode::Shutdown, 46),
            (StatusCode::OpUnsupported, ErrorCode::NoSys, 35),
        ];
        for (status, code, errno) in cases {
            let err = SftpError::from_status(status, "x");
            assert_eq!(err.code, code);
            assert_eq!(err.errno, errno);
            assert_eq!(err.native_code, Some(status as u32));
        }
    }

    #[test]
    fn context_accumulates() {
        let err = SftpError::new(ErrorCode::NoEnt, "no such file")
            .with_command("lstat")
            .with_path("/a/b");
        assert_eq!(err.command, Some("lstat"));
        assert_eq!(err.path.as_deref(), Some("/a/b"));
        let rendered = err.to_string();
        assert!(rendered.contains("ENOENT"));
        assert!(rendered.contains("lstat"));
    }

    #[test]
    fn kernel_errno_fallback() {
        assert_eq!(ErrorCode::NoAuth.kernel_errno(), libc::ENOSYS);
        assert_eq!(ErrorCode::NoEnt.kernel_errno(), libc::ENOENT);
        assert_eq!(ErrorCode::ReadOnlyFs.kernel_errno(), libc::EROFS);
    }
}
