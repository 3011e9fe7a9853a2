//! File attributes, open flags, and directory items.

use super::codec::{PacketReader, PacketWriter, WireError};

/// Attribute presence flags.
pub mod attr_flags {
    pub const SIZE: u32 = 0x0000_0001;
    pub const UIDGID: u32 = 0x0000_0002;
    pub const PERMISSIONS: u32 = 0x0000_0004;
    pub const ACMODTIME: u32 = 0x0000_0008;
    pub const EXTENDED: u32 = 0x8000_0000;
}

/// Open flag bits and their string aliases.
pub mod open_flags {
    pub const READ: u32 = 0x01;
    pub const WRITE: u32 = 0x02;
    pub const APPEND: u32 = 0x04;
    pub const CREAT: u32 = 0x08;
    pub const TRUNC: u32 = 0x10;
    pub const EXCL: u32 = 0x20;

    /// Map an fopen-style mode string to flag bits.
    pub fn from_mode_string(mode: &str) -> Option<u32> {
        Some(match mode {
            "r" => READ,
            "r+" => READ | WRITE,
            "w" => WRITE | CREAT | TRUNC,
            "w+" => READ | WRITE | CREAT | TRUNC,
            "a" => WRITE | CREAT | APPEND,
            "a+" => READ | WRITE | CREAT | APPEND,
            "wx" => WRITE | CREAT | TRUNC | EXCL,
            _ => return None,
        })
    }
}

/// A bit-flagged record of file metadata.
///
/// Only fields whose flag bit is set travel on the wire; absent fields are
/// `None`. Times are seconds since the epoch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileAttrs {
    pub size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mode: Option<u32>,
    pub atime: Option<u32>,
    pub mtime: Option<u32>,
    pub extended: Vec<(String, String)>,
}

impl FileAttrs {
    pub fn encode(&self, w: &mut PacketWriter) {
        let mut flags = 0u32;
        if self.size.is_some() {
            flags |= attr_flags::SIZE;
        }
        if self.uid.is_some() || self.gid.is_some() {
            flags |= attr_flags::UIDGID;
        }
        if self.mode.is_some() {
            flags |= attr_flags::PERMISSIONS;
        }
        if self.atime.is_some() || self.mtime.is_some() {
            flags |= attr_flags::ACMODTIME;
        }
        if !self.extended.is_empty() {
            flags |= attr_flags::EXTENDED;
        }
        w.write_u32(flags);
        if flags & attr_flags::SIZE != 0 {
            w.write_u64(self.size.unwrap_or(0));
        }
        if flags & attr_flags::UIDGID != 0 {
            w.write_u32(self.uid.unwrap_or(0));
            w.write_u32(self.gid.unwrap_or(0));
        }
        if flags & attr_flags::PERMISSIONS != 0 {
            w.write_u32(self.mode.unwrap_or(0));
        }
        if flags & attr_flags::ACMODTIME != 0 {
            w.write_u32(self.atime.unwrap_or(0));
            w.write_u32(self.mtime.unwrap_or(0));
        }
        if flags & attr_flags::EXTENDED != 0 {
            w.write_u32(self.extended.len() as u32);
            for (name, value) in &self.extended {
                w.write_string(name);
                w.write_string(value);
            }
        }
    }

    pub fn decode(r: &mut PacketReader<'_>) -> Result<Self, WireError> {
        let flags = r.read_u32()?;
        let mut attrs = FileAttrs::default();
        if flags & attr_flags::SIZE != 0 {
            attrs.size = Some(r.read_u64()?);
        }
        if flags & attr_flags::UIDGID != 0 {
            attrs.uid = Some(r.read_u32()?);
            attrs.gid = Some(r.read_u32()?);
        }
        if flags & attr_flags::PERMISSIONS != 0 {
            attrs.mode = Some(r.read_u32()?);
        }
        if flags & attr_flags::ACMODTIME != 0 {
            attrs.atime = Some(r.read_u32()?);
            attrs.mtime = Some(r.read_u32()?);
        }
        if flags & attr_flags::EXTENDED != 0 {
            let count = r.read_u32()?;
            for _ in 0..count {
                let name = r.read_string()?;
                let value = r.read_string()?;
                attrs.extended.push((name, value));
            }
        }
        Ok(attrs)
    }

    pub fn is_dir(&self) -> bool {
        self.kind_is(libc::S_IFDIR)
    }

    pub fn is_file(&self) -> bool {
        self.kind_is(libc::S_IFREG)
    }

    pub fn is_symlink(&self) -> bool {
        self.kind_is(libc::S_IFLNK)
    }

    fn kind_is(&self, kind: libc::mode_t) -> bool {
        self.mode
            .map(|m| m & libc::S_IFMT as u32 == kind as u32)
            .unwrap_or(false)
    }

    /// Drop ownership fields (uid/gid hiding policy).
    pub fn strip_ownership(&mut self) {
        self.uid = None;
        self.gid = None;
    }

    /// Value of an extension pair by name.
    pub fn extension(&self, name: &str) -> Option<&str> {
        self.extended
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// A directory entry: leaf name, `ls -l`-style longname, attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub filename: String,
    pub longname: String,
    pub attrs: FileAttrs,
}

impl Item {
    pub fn encode(&self, w: &mut PacketWriter) {
        w.write_string(&self.filename);
        w.write_string(&self.longname);
        self.attrs.encode(w);
    }

    pub fn decode(r: &mut PacketReader<'_>) -> Result<Self, WireError> {
        Ok(Item {
            filename: r.read_string()?,
            longname: r.read_string()?,
            attrs: FileAttrs::decode(r)?,
        })
    }
}

/// Filesystem statistics carried in the statvfs extended reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatVfs {
    pub bsize: u64,
    pub frsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub favail: u64,
    pub fsid: u64,
    pub flag: u64,
    pub namemax: u64,
}

impl StatVfs {
    pub fn encode(&self, w: &mut PacketWriter) {
        for v in [
            self.bsize,
            self.frsize,
            self.blocks,
            self.bfree,
            self.bavail,
            self.files,
            self.ffree,
            self.favail,
            self.fsid,
            self.flag,
            self.namemax,
        ] {
            w.write_u64(v);
        }
    }

    pub fn decode(r: &mut PacketReader<'_>) -> Result<Self, WireError> {
        Ok(StatVfs {
            bsize: r.read_u64()?,
            frsize: r.read_u64()?,
            blocks: r.read_u64()?,
            bfree: r.read_u64()?,
            bavail: r.read_u64()?,
            files: r.read_u64()?,
            ffree: r.read_u64()?,
            favail: r.read_u64()?,
            fsid: r.read_u64()?,
            flag: r.read_u64()?,
            namemax: r.read_u64()?,
        })
    }
}

/// Render a mode word as the ten-character symbolic form (`drwxr-xr-x`).
pub fn mode_to_symbolic(mode: u32) -> String {
    let kind = match mode & libc::S_IFMT as u32 {
        x if x == libc::S_IFDIR as u32 => 'd',
        x if x == libc::S_IFLNK as u32 => 'l',
        x if x == libc::S_IFCHR as u32 => 'c',
        x if x == libc::S_IFBLK as u32 => 'b',
        x if x == libc::S_IFIFO as u32 => 'p',
        x if x == libc::S_IFSOCK as u32 => 's',
        _ => '-',
    };
    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

/// Parse the ten-character symbolic form back to a mode word.
pub fn symbolic_to_mode(s: &str) -> Option<u32> {
    let bytes = s.as_bytes();
    if bytes.len() != 10 {
        return None;
    }
    let mut mode = match bytes[0] {
        b'd' => libc::S_IFDIR as u32,
        b'l' => libc::S_IFLNK as u32,
        b'c' => libc::S_IFCHR as u32,
        b'b' => libc::S_IFBLK as u32,
        b'p' => libc::S_IFIFO as u32,
        b's' => libc::S_IFSOCK as u32,
        b'-' => libc::S_IFREG as u32,
        _ => return None,
    };
    for (i, ch) in bytes[1..].iter().enumerate() {
        let bit = 1u32 << (8 - i);
        match ch {
            b'r' | b'w' | b'x' => mode |= bit,
            b'-' => {}
            _ => return None,
        }
    }
    Some(mode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::parse_frame;
    use crate::protocol::PacketType;

    fn roundtrip(attrs: &FileAttrs) -> FileAttrs {
        let mut w = PacketWriter::new(PacketType::Attrs);
        attrs.encode(&mut w);
        let frame = w.finish();
        let mut r = parse_frame(&frame).unwrap().reader;
        FileAttrs::decode(&mut r).unwrap()
    }

    #[test]
    fn empty_attrs_are_one_flag_word() {
        let attrs = FileAttrs::default();
        let mut w = PacketWriter::new(PacketType::Attrs);
        attrs.encode(&mut w);
        let frame = w.finish();
        // prefix + type + flags
        assert_eq!(frame.len(), 4 + 1 + 4);
        assert_eq!(roundtrip(&attrs), attrs);
    }

    #[test]
    fn full_attrs_roundtrip() {
        let attrs = FileAttrs {
            size: Some(1 << 40),
            uid: Some(1000),
            gid: Some(100),
            mode: Some(libc::S_IFREG as u32 | 0o644),
            atime: Some(1_700_000_000),
            mtime: Some(1_700_000_100),
            extended: vec![("blocks".into(), "16".into())],
        };
        let back = roundtrip(&attrs);
        assert_eq!(back, attrs);
        assert!(back.is_file());
        assert_eq!(back.extension("blocks"), Some("16"));
    }

    #[test]
    fn ownership_stripping() {
        let mut attrs = FileAttrs {
            uid: Some(1),
            gid: Some(2),
            ..Default::default()
        };
        attrs.strip_ownership();
        let back = roundtrip(&attrs);
        assert_eq!(back.uid, None);
        assert_eq!(back.gid, None);
    }

    #[test]
    fn mode_string_aliases() {
        assert_eq!(open_flags::from_mode_string("r"), Some(open_flags::READ));
        assert_eq!(
            open_flags::from_mode_string("w"),
            Some(open_flags::WRITE | open_flags::CREAT | open_flags::TRUNC)
        );
        assert_eq!(
            open_flags::from_mode_string("a+"),
            Some(
                open_flags::READ | open_flags::WRITE | open_flags::CREAT | open_flags::APPEND
            )
        );
        assert_eq!(open_flags::from_mode_string("rw"), None);
    }

    #[test]
    fn symbolic_mode_roundtrip() {
        let mode = libc::S_IFDIR as u32 | 0o755;
        let s = mode_to_symbolic(mode);
        assert_eq!(s, "drwxr-xr-x");
        assert_eq!(symbolic_to_mode(&s), Some(mode));
        assert_eq!(
            symbolic_to_mode("-rw-r--r--"),
            Some(libc::S_IFREG as u32 | 0o644)
        );
        assert_eq!(symbolic_to_mode("bogus"), None);
    }

    #[test]
    fn statvfs_roundtrip() {
        let st = StatVfs {
            bsize: 4096,
            frsize: 4096,
            blocks: 1 << 30,
            bfree: 1 << 20,
            bavail: 1 << 19,
            files: 1 << 20,
            ffree: 1 << 10,
            favail: 1 << 10,
            fsid: 7,
            flag: 0,
            namemax: 255,
        };
        let mut w = PacketWriter::new(PacketType::ExtendedReply);
        st.encode(&mut w);
        let frame = w.finish();
        let mut r = parse_frame(&frame).unwrap().reader;
        assert_eq!(StatVfs::decode(&mut r).unwrap(), st);
    }
}
