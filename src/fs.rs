//! The filesystem-operation interface.
//!
//! Both ends of the wire speak this trait: [`crate::client::SftpClient`]
//! implements it by issuing requests, [`crate::server::SafeFs`] by acting on
//! the local filesystem. Code that only needs filesystem semantics (the
//! recursive search, the server dispatch loop) consumes the trait and runs
//! identically on either side.

use crate::error::SftpResult;
use crate::protocol::{FileAttrs, Handle, Item, StatVfs};
use async_trait::async_trait;

/// Filesystem operations with SFTP semantics.
///
/// `readdir` returns one batch per call; an empty batch signals the end of
/// the directory. `read` yields a short or empty buffer at end of file,
/// never an error.
#[async_trait]
pub trait FileOps: Send + Sync {
    async fn open(&self, path: &str, flags: u32, attrs: &FileAttrs) -> SftpResult<Handle>;
    async fn close(&self, handle: Handle) -> SftpResult<()>;
    async fn read(&self, handle: Handle, position: u64, length: u32) -> SftpResult<Vec<u8>>;
    async fn write(&self, handle: Handle, position: u64, data: &[u8]) -> SftpResult<()>;
    async fn lstat(&self, path: &str) -> SftpResult<FileAttrs>;
    async fn fstat(&self, handle: Handle) -> SftpResult<FileAttrs>;
    async fn setstat(&self, path: &str, attrs: &FileAttrs) -> SftpResult<()>;
    async fn fsetstat(&self, handle: Handle, attrs: &FileAttrs) -> SftpResult<()>;
    async fn opendir(&self, path: &str) -> SftpResult<Handle>;
    async fn readdir(&self, handle: Handle) -> SftpResult<Vec<Item>>;
    async fn unlink(&self, path: &str) -> SftpResult<()>;
    async fn mkdir(&self, path: &str, attrs: &FileAttrs) -> SftpResult<()>;
    async fn rmdir(&self, path: &str) -> SftpResult<()>;
    async fn realpath(&self, path: &str) -> SftpResult<String>;
    async fn stat(&self, path: &str) -> SftpResult<FileAttrs>;
    async fn statvfs(&self, path: &str) -> SftpResult<StatVfs>;
    async fn rename(&self, old_path: &str, new_path: &str, flags: u32) -> SftpResult<()>;
    async fn readlink(&self, path: &str) -> SftpResult<String>;
    async fn symlink(&self, target: &str, link_path: &str) -> SftpResult<()>;
    async fn link(&self, old_path: &str, new_path: &str) -> SftpResult<()>;

    /// Copy `length` bytes between open handles.
    async fn fcopy(
        &self,
        src: Handle,
        src_position: u64,
        length: u64,
        dst: Handle,
        dst_position: u64,
    ) -> SftpResult<()>;

    /// Digest `length` bytes of an open handle in `block_size` blocks,
    /// returning the algorithm used and the concatenated per-block digests.
    async fn fhash(
        &self,
        handle: Handle,
        algorithms: &str,
        position: u64,
        length: u64,
        block_size: u32,
    ) -> SftpResult<(String, Vec<u8>)>;
}
