//! Binary packet codec: typed field writers and readers.
//!
//! All multi-byte integers are big-endian. Strings and opaque blobs share
//! the same framing (u32 byte length, then the bytes, no trailing null).
//! Int64 values travel as two u32 halves, high half first.

use super::{PacketType, MAX_PACKET_SIZE};
use crate::error::SftpError;

/// Codec-level failure. Any occurrence is a protocol violation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("packet truncated: needed {needed} more bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("packet too large: {0} bytes")]
    TooLarge(usize),

    #[error("unknown packet type {0}")]
    UnknownType(u8),

    #[error("length prefix {declared} does not match frame size {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("frame shorter than packet header")]
    MissingHeader,
}

impl From<WireError> for SftpError {
    fn from(err: WireError) -> Self {
        SftpError::bad_message(err.to_string())
    }
}

/// Grows a packet by appending typed fields; `finish` stamps the leading
/// length prefix (total length minus the four prefix bytes).
pub struct PacketWriter {
    buf: Vec<u8>,
}

impl PacketWriter {
    /// Start a packet of the given type. The length prefix is reserved and
    /// back-patched by [`PacketWriter::finish`].
    pub fn new(ty: PacketType) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&[0, 0, 0, 0]);
        buf.push(ty as u8);
        Self { buf }
    }

    /// Start a request packet: type byte followed by the request id.
    pub fn request(ty: PacketType, id: u32) -> Self {
        let mut w = Self::new(ty);
        w.write_u32(id);
        w
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Two u32 halves, high first.
    pub fn write_u64(&mut self, v: u64) {
        self.write_u32((v >> 32) as u32);
        self.write_u32(v as u32);
    }

    /// u32 byte length followed by UTF-8 bytes; length zero is the empty
    /// string. Rust strings are always valid UTF-8, so encoding never
    /// needs replacement characters.
    pub fn write_string(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    /// Opaque blob with the same framing as a string.
    pub fn write_data(&mut self, data: &[u8]) {
        self.write_u32(data.len() as u32);
        self.buf.extend_from_slice(data);
    }

    /// Unframed bytes, for payloads that run to the end of the packet.
    pub fn write_raw(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Stamp the length prefix and return the completed frame.
    pub fn finish(mut self) -> Vec<u8> {
        let len = (self.buf.len() - 4) as u32;
        self.buf[0..4].copy_from_slice(&len.to_be_bytes());
        self.buf
    }
}

/// Consumes typed fields sequentially, advancing a position cursor. Any
/// read past the available bytes fails with [`WireError::Truncated`].
pub struct PacketReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn at_end(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated {
                needed: n - self.remaining(),
                available: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        let hi = self.read_u32()? as u64;
        let lo = self.read_u32()? as u64;
        Ok((hi << 32) | lo)
    }

    /// Length-prefixed UTF-8. Invalid sequences decode to U+FFFD and
    /// decoding resumes past the offending byte.
    pub fn read_string(&mut self) -> Result<String, WireError> {
        let bytes = self.read_bytes()?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Length-prefixed opaque blob, borrowed from the frame.
    pub fn read_bytes(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    /// Everything up to the end of the packet, for payloads with no
    /// length framing of their own.
    pub fn read_remaining(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }
}

/// A decoded inbound frame: the type byte and a reader positioned just
/// after it (request id still unread, where present).
pub struct InboundPacket<'a> {
    pub ty: PacketType,
    pub reader: PacketReader<'a>,
}

/// Validate framing of one WebSocket message and expose its payload.
pub fn parse_frame(frame: &[u8]) -> Result<InboundPacket<'_>, WireError> {
    if frame.len() > MAX_PACKET_SIZE as usize {
        return Err(WireError::TooLarge(frame.len()));
    }
    if frame.len() < 5 {
        return Err(WireError::MissingHeader);
    }
    let declared = u32::from_be_bytes(frame[0..4].try_into().unwrap()) as usize;
    if declared != frame.len() - 4 {
        return Err(WireError::LengthMismatch {
            declared,
            actual: frame.len() - 4,
        });
    }
    let ty = PacketType::from_u8(frame[4]).ok_or(WireError::UnknownType(frame[4]))?;
    Ok(InboundPacket {
        ty,
        reader: PacketReader::new(&frame[5..]),
    })
}
