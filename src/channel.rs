//! Framed binary message transport.
//!
//! A channel carries one SFTP session: binary frames in both directions,
//! an explicit close with a WebSocket close code, and a mapping from close
//! codes into the error taxonomy. Concrete channels live in
//! [`crate::transport`]; [`pair`] builds an in-memory pair for tests.

use crate::error::{ErrorCode, SftpError, SftpResult};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// WebSocket close codes the protocol cares about.
pub mod close_codes {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const ABNORMAL: u16 = 1006;
    pub const BAD_DATA: u16 = 1007;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const TOO_LARGE: u16 = 1009;
    pub const MISSING_EXTENSION: u16 = 1010;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const TLS_FAILURE: u16 = 1015;
}

/// One SFTP session's transport. At most one open channel per session.
#[async_trait]
pub trait Channel: Send {
    /// Queue one binary frame. After a local close, frames are silently
    /// dropped.
    async fn send(&mut self, frame: Vec<u8>) -> SftpResult<()>;

    /// Receive the next binary frame. `None` means the peer closed
    /// normally; an `Err` is terminal and carries the mapped close error.
    async fn recv(&mut self) -> Option<SftpResult<Vec<u8>>>;

    /// Close the channel with a code and description. Idempotent.
    async fn close(&mut self, code: u16, reason: &str);
}

/// Map a transport close code into the error taxonomy.
///
/// Returns `None` for a normal close. A channel that never reached the
/// established state yields ECONNREFUSED regardless of code.
pub fn close_code_error(code: u16, reason: &str, established: bool) -> Option<SftpError> {
    if !established {
        return Some(SftpError::new(
            ErrorCode::ConnRefused,
            if reason.is_empty() {
                "connection refused".to_string()
            } else {
                reason.to_string()
            },
        ));
    }
    let err = match code {
        close_codes::NORMAL => return None,
        close_codes::GOING_AWAY => SftpError::new(ErrorCode::GoingAway, "server is going away"),
        close_codes::PROTOCOL_ERROR => SftpError::new(ErrorCode::Prototype, "protocol error"),
        close_codes::ABNORMAL => SftpError::new(ErrorCode::ConnAborted, "connection aborted"),
        close_codes::BAD_DATA => SftpError::new(ErrorCode::BadMessage, "invalid message"),
        close_codes::POLICY_VIOLATION => SftpError::new(ErrorCode::Access, "prohibited message"),
        close_codes::TOO_LARGE => SftpError::new(ErrorCode::MessageTooLarge, "message too large"),
        close_codes::MISSING_EXTENSION | close_codes::INTERNAL_ERROR => SftpError::new(
            ErrorCode::ConnReset,
            if reason.is_empty() {
                "connection reset".to_string()
            } else {
                reason.to_string()
            },
        ),
        close_codes::TLS_FAILURE => SftpError::new(
            ErrorCode::Failure,
            "secure connection negotiation failed",
        ),
        other => SftpError::new(ErrorCode::Failure, format!("connection closed ({})", other)),
    };
    Some(err)
}

enum Frame {
    Binary(Vec<u8>),
    Close(u16, String),
}

/// In-memory channel end, used for tests and in-process sessions.
pub struct PipeChannel {
    tx: mpsc::Sender<Frame>,
    rx: mpsc::Receiver<Frame>,
    closed: bool,
}

/// Build a connected pair of in-memory channels.
pub fn pair() -> (PipeChannel, PipeChannel) {
    let (a_tx, a_rx) = mpsc::channel(64);
    let (b_tx, b_rx) = mpsc::channel(64);
    (
        PipeChannel {
            tx: a_tx,
            rx: b_rx,
            closed: false,
        },
        PipeChannel {
            tx: b_tx,
            rx: a_rx,
            closed: false,
        },
    )
}

#[async_trait]
impl Channel for PipeChannel {
    async fn send(&mut self, frame: Vec<u8>) -> SftpResult<()> {
        if self.closed {
            return Ok(());
        }
        self.tx
            .send(Frame::Binary(frame))
            .await
            .map_err(|_| SftpError::new(ErrorCode::ConnAborted, "peer is gone"))
    }

    async fn recv(&mut self) -> Option<SftpResult<Vec<u8>>> {
        match self.rx.recv().await {
            Some(Frame::Binary(data)) => Some(Ok(data)),
            Some(Frame::Close(code, reason)) => {
                close_code_error(code, &reason, true).map(Err)
            }
            // Peer dropped without a close frame.
            None => close_code_error(close_codes::ABNORMAL, "", true).map(Err),
        }
    }

    async fn close(&mut self, code: u16, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.tx.send(Frame::Close(code, reason.to_string())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_code_table() {
        assert!(close_code_error(1000, "", true).is_none());
        let cases = [
            (1001, ErrorCode::GoingAway),
            (1002, ErrorCode::Prototype),
            (1006, ErrorCode::ConnAborted),
            (1007, ErrorCode::BadMessage),
            (1008, ErrorCode::Access),
            (1009, ErrorCode::MessageTooLarge),
            (1010, ErrorCode::ConnReset),
            (1011, ErrorCode::ConnReset),
            (1015, ErrorCode::Failure),
            (4999, ErrorCode::Failure),
        ];
        for (code, expect) in cases {
            assert_eq!(close_code_error(code, "", true).unwrap().code, expect);
        }
    }

    #[test]
    fn refused_before_establishment() {
        for code in [1000u16, 1006, 1011] {
            let err = close_code_error(code, "", false).unwrap();
            assert_eq!(err.code, ErrorCode::ConnRefused);
        }
    }

    #[test]
    fn reset_carries_reason() {
        let err = close_code_error(1011, "disk on fire", true).unwrap();
        assert_eq!(err.code, ErrorCode::ConnReset);
        assert_eq!(err.message, "disk on fire");
    }

    #[tokio::test]
    async fn pair_delivers_frames() {
        let (mut a, mut b) = pair();
        a.send(vec![1, 2, 3]).await.unwrap();
        assert_eq!(b.recv().await.unwrap().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn pair_close_maps_code() {
        let (mut a, mut b) = pair();
        a.close(1011, "bye").await;
        let err = b.recv().await.unwrap().unwrap_err();
        assert_eq!(err.code, ErrorCode::ConnReset);
        assert_eq!(err.message, "bye");
        // Normal close surfaces as end-of-stream.
        let (mut c, mut d) = pair();
        c.close(1000, "").await;
        assert!(d.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_after_close_is_dropped() {
        let (mut a, mut b) = pair();
        a.close(1000, "").await;
        a.send(vec![9]).await.unwrap();
        assert!(b.recv().await.is_none());
    }
}
