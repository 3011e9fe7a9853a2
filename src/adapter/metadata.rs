//! Bulk metadata prefetch from a local snapshot file.
//!
//! The file holds a sorted concatenation of records separated by a two-NUL
//! delimiter; each record is `relative_path\0mtime atime blocks size mode`
//! with a symbolic mode string. A `.lz4` suffix selects frame decompression.
//! A fresh snapshot lets `readdir` answer directory listings and warm the
//! attribute cache without touching the server.

use crate::protocol::attrs::symbolic_to_mode;
use std::io::Read;
use std::path::Path;
use std::time::SystemTime;

/// One parsed metadata record.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaRecord {
    /// Path relative to the mount root, no leading slash.
    pub path: String,
    pub mtime: u32,
    pub atime: u32,
    pub blocks: u64,
    pub size: u64,
    pub mode: u32,
}

/// A loaded snapshot, sorted by record path.
pub struct MetadataIndex {
    records: Vec<MetaRecord>,
    /// Modification time of the snapshot file when loaded.
    pub file_mtime: SystemTime,
}

impl MetadataIndex {
    /// Load and parse a snapshot file.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let raw = std::fs::read(path)?;
        let file_mtime = std::fs::metadata(path)?.modified()?;
        let bytes = if path.extension().is_some_and(|e| e == "lz4") {
            let mut out = Vec::new();
            lz4_flex::frame::FrameDecoder::new(&raw[..])
                .read_to_end(&mut out)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            out
        } else {
            raw
        };

        let mut records = Vec::new();
        for chunk in split_double_nul(&bytes) {
            if chunk.is_empty() {
                continue;
            }
            if let Some(record) = parse_record(chunk) {
                records.push(record);
            }
        }
        // The producer writes sorted records; sorting again keeps the
        // binary search correct even for a sloppy snapshot.
        records.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(Self { records, file_mtime })
    }

    /// True while the snapshot file was modified within `ttl` of now.
    pub fn is_fresh(&self, ttl: std::time::Duration) -> bool {
        match SystemTime::now().duration_since(self.file_mtime) {
            Ok(age) => age <= ttl,
            // Snapshot from the future; treat as fresh.
            Err(_) => true,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Immediate children of a directory (virtual-absolute `dir`).
    ///
    /// Locates the directory by binary search, then walks forward while
    /// entries remain under its prefix. Returns `None` when the snapshot
    /// does not cover the directory.
    pub fn children_of(&self, dir: &str) -> Option<Vec<&MetaRecord>> {
        let rel = dir.trim_matches('/');
        let prefix = if rel.is_empty() {
            String::new()
        } else {
            // The directory itself must be present in the snapshot.
            self.records
                .binary_search_by(|r| r.path.as_str().cmp(rel))
                .ok()?;
            format!("{}/", rel)
        };

        let start = self
            .records
            .partition_point(|r| r.path.as_str() <= prefix.as_str());
        let mut children = Vec::new();
        for record in &self.records[start..] {
            let rest = match record.path.strip_prefix(&prefix) {
                Some(rest) => rest,
                None => break,
            };
            if rest.is_empty() {
                continue;
            }
            if !rest.contains('/') {
                children.push(record);
            }
        }
        Some(children)
    }
}

// `slice::split` has no two-byte pattern form.
fn split_double_nul(bytes: &[u8]) -> Vec<&[u8]> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == 0 && bytes[i + 1] == 0 {
            out.push(&bytes[start..i]);
            start = i + 2;
            i += 2;
        } else {
            i += 1;
        }
    }
    out.push(&bytes[start..]);
    out
}

fn parse_record(chunk: &[u8]) -> Option<MetaRecord> {
    let nul = chunk.iter().position(|&b| b == 0)?;
    let path = String::from_utf8_lossy(&chunk[..nul]).into_owned();
    let fields = String::from_utf8_lossy(&chunk[nul + 1..]).into_owned();
    let mut parts = fields.split_whitespace();
    let mtime = parts.next()?.parse().ok()?;
    let atime = parts.next()?.parse().ok()?;
    let blocks = parts.next()?.parse().ok()?;
    let size = parts.next()?.parse().ok()?;
    let mode = symbolic_to_mode(parts.next()?)?;
    Some(MetaRecord {
        path,
        mtime,
        atime,
        blocks,
        size,
        mode,
    })
}
