//! Policy-enforcing filesystem backing a server session.
//!
//! Every path from the wire is normalized and re-rooted under the virtual
//! root before touching the disk; read-only mode and uid/gid hiding are
//! applied here, before any syscall. Handles are small integers backed by a
//! fixed slot table; each slot's mutex serializes operations on that handle
//! while queueing the rest in arrival order.

use crate::error::{ErrorCode, SftpError, SftpResult};
use crate::fs::FileOps;
use crate::protocol::attrs::{mode_to_symbolic, open_flags};
use crate::protocol::{FileAttrs, Handle, Item, StatVfs, MAX_BLOCK_SIZE};
use crate::util::path::normalize_path;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use std::collections::VecDeque;
use std::ffi::CString;
use std::io::SeekFrom;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

/// Handle ids live in [1, MAX_HANDLES].
pub const MAX_HANDLES: usize = 1024;

/// Items returned per READDIR call.
const READDIR_BATCH: usize = 64;

enum OpenHandle {
    File {
        file: fs::File,
        path: PathBuf,
    },
    Dir {
        path: PathBuf,
        // None until the first readdir; then drained batch by batch.
        entries: Option<VecDeque<Item>>,
    },
}

/// Server-side filesystem wrapper enforcing the session's policies.
pub struct SafeFs {
    root: PathBuf,
    read_only: bool,
    hide_uid_gid: bool,
    slots: Vec<Mutex<Option<OpenHandle>>>,
    cursor: AtomicUsize,
}

impl SafeFs {
    pub fn new(root: impl Into<PathBuf>, read_only: bool, hide_uid_gid: bool) -> Self {
        Self {
            root: root.into(),
            read_only,
            hide_uid_gid,
            slots: (0..MAX_HANDLES).map(|_| Mutex::new(None)).collect(),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a wire path to a real path at or beneath the virtual root.
    ///
    /// `..` segments are collapsed syntactically against a forced-absolute
    /// form first, so no input can name anything above the root.
    pub fn to_real_path(&self, virtual_path: &str) -> PathBuf {
        let forced = if virtual_path.starts_with('/') {
            normalize_path(virtual_path)
        } else {
            normalize_path(&format!("/{}", virtual_path))
        };
        let rel = forced.trim_start_matches('/');
        if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }

    /// Translate a real path back into the session's namespace. Paths that
    /// do not begin with the root translate to "/".
    pub fn to_virtual_path(&self, real: &Path) -> String {
        match real.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => "/".to_string(),
            Ok(rel) => format!("/{}", rel.to_string_lossy()),
            Err(_) => "/".to_string(),
        }
    }

    fn deny_write(&self, command: &'static str) -> SftpResult<()> {
        if self.read_only {
            return Err(
                SftpError::new(ErrorCode::ReadOnlyFs, "filesystem is read-only")
                    .with_command(command),
            );
        }
        Ok(())
    }

    fn slot(&self, handle: Handle) -> SftpResult<&Mutex<Option<OpenHandle>>> {
        let id = handle.0 as usize;
        if id == 0 || id > MAX_HANDLES {
            return Err(invalid_handle(handle));
        }
        Ok(&self.slots[id - 1])
    }

    /// Allocate a slot, scanning from the round-robin cursor.
    async fn alloc(&self, opened: OpenHandle) -> SftpResult<Handle> {
        let start = self.cursor.load(Ordering::Relaxed);
        for i in 0..MAX_HANDLES {
            let idx = (start + i) % MAX_HANDLES;
            // A locked slot is in use; skip it rather than queueing.
            if let Ok(mut guard) = self.slots[idx].try_lock() {
                if guard.is_none() {
                    *guard = Some(opened);
                    self.cursor.store((idx + 1) % MAX_HANDLES, Ordering::Relaxed);
                    return Ok(Handle(idx as u32 + 1));
                }
            }
        }
        Err(SftpError::new(
            ErrorCode::FileTableOverflow,
            "no free handles",
        ))
    }

    /// Close every open handle, lowest id first. Used at session teardown.
    pub async fn close_all(&self) {
        for (idx, slot) in self.slots.iter().enumerate() {
            let mut guard = slot.lock().await;
            if guard.take().is_some() {
                debug!(target: "wsftp::server", handle = idx + 1, "closing handle at teardown");
            }
        }
    }

    fn attrs_from_metadata(&self, meta: &std::fs::Metadata) -> FileAttrs {
        let mut attrs = FileAttrs {
            size: Some(meta.size()),
            uid: Some(meta.uid()),
            gid: Some(meta.gid()),
            mode: Some(meta.mode()),
            atime: Some(clamp_time(meta.atime())),
            mtime: Some(clamp_time(meta.mtime())),
            extended: Vec::new(),
        };
        if self.hide_uid_gid {
            attrs.strip_ownership();
        }
        attrs
    }

    /// Apply a setstat record to a real path, honoring the hiding policy.
    async fn apply_setstat(&self, real: &Path, attrs: &FileAttrs) -> SftpResult<()> {
        let mut attrs = attrs.clone();
        if self.hide_uid_gid {
            attrs.strip_ownership();
        }
        if let Some(size) = attrs.size {
            let file = fs::OpenOptions::new()
                .write(true)
                .open(real)
                .await
                .map_err(|e| io_err(e, real))?;
            file.set_len(size).await.map_err(|e| io_err(e, real))?;
        }
        if let Some(mode) = attrs.mode {
            fs::set_permissions(real, std::fs::Permissions::from_mode(mode & 0o7777))
                .await
                .map_err(|e| io_err(e, real))?;
        }
        if attrs.uid.is_some() || attrs.gid.is_some() {
            let path = cstring(real)?;
            let uid = attrs.uid.unwrap_or(u32::MAX);
            let gid = attrs.gid.unwrap_or(u32::MAX);
            run_os(real, move || {
                let rc = unsafe { libc::chown(path.as_ptr(), uid, gid) };
                os_result(rc)
            })
            .await?;
        }
        if attrs.atime.is_some() || attrs.mtime.is_some() {
            let meta = fs::symlink_metadata(real).await.map_err(|e| io_err(e, real))?;
            let atime = attrs.atime.map(i64::from).unwrap_or_else(|| meta.atime());
            let mtime = attrs.mtime.map(i64::from).unwrap_or_else(|| meta.mtime());
            let path = cstring(real)?;
            run_os(real, move || {
                let times = [
                    libc::timespec {
                        tv_sec: atime,
                        tv_nsec: 0,
                    },
                    libc::timespec {
                        tv_sec: mtime,
                        tv_nsec: 0,
                    },
                ];
                let rc =
                    unsafe { libc::utimensat(libc::AT_FDCWD, path.as_ptr(), times.as_ptr(), 0) };
                os_result(rc)
            })
            .await?;
        }
        Ok(())
    }

    async fn list_dir(&self, path: &Path) -> SftpResult<VecDeque<Item>> {
        let mut rd = fs::read_dir(path).await.map_err(|e| io_err(e, path))?;
        let mut items = Vec::new();
        while let Some(entry) = rd.next_entry().await.map_err(|e| io_err(e, path))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = match fs::symlink_metadata(entry.path()).await {
                Ok(m) => m,
                // Entry vanished between listing and stat.
                Err(_) => continue,
            };
            let attrs = self.attrs_from_metadata(&meta);
            let longname = longname(&name, &meta, &attrs);
            items.push(Item {
                filename: name,
                longname,
                attrs,
            });
        }
        items.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(items.into())
    }
}

fn invalid_handle(handle: Handle) -> SftpError {
    SftpError::new(ErrorCode::Failure, "invalid handle").with_handle(handle.0)
}

fn clamp_time(secs: i64) -> u32 {
    secs.clamp(0, u32::MAX as i64) as u32
}

fn cstring(path: &Path) -> SftpResult<CString> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| SftpError::new(ErrorCode::Failure, "path contains NUL"))
}

fn os_result(rc: i32) -> std::io::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

async fn run_os<F>(path: &Path, f: F) -> SftpResult<()>
where
    F: FnOnce() -> std::io::Result<()> + Send + 'static,
{
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|_| SftpError::new(ErrorCode::Failure, "blocking task failed"))?
        .map_err(|e| io_err(e, &owned))
}

/// Map an OS error into the wire-facing taxonomy.
pub fn io_err(err: std::io::Error, path: &Path) -> SftpError {
    let code = match err.kind() {
        std::io::ErrorKind::NotFound => ErrorCode::NoEnt,
        std::io::ErrorKind::PermissionDenied => ErrorCode::Access,
        std::io::ErrorKind::Unsupported => ErrorCode::NoSys,
        _ => ErrorCode::Failure,
    };
    SftpError::new(code, err.to_string()).with_path(path.to_string_lossy())
}

/// `ls -l`-style longname, blocks count first.
fn longname(name: &str, meta: &std::fs::Metadata, attrs: &FileAttrs) -> String {
    let mtime = meta.mtime();
    let stamp = DateTime::<Utc>::from_timestamp(mtime, 0)
        .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).unwrap());
    let now = Utc::now();
    const SIX_MONTHS: i64 = 60 * 60 * 24 * 182;
    let when = if (now.timestamp() - mtime).abs() < SIX_MONTHS {
        stamp.format("%b %e %H:%M")
    } else {
        stamp.format("%b %e  %Y")
    };
    format!(
        "{:>6} {} {:>3} {:>8} {:>8} {:>10} {} {}",
        meta.blocks(),
        mode_to_symbolic(meta.mode()),
        meta.nlink(),
        attrs.uid.unwrap_or(0),
        attrs.gid.unwrap_or(0),
        meta.size(),
        when,
        name
    )
}

/// Check-file-handle digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HashAlg {
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
    Crc32,
}

impl HashAlg {
    /// Parse one algorithm name; a `@sftp.ws` suffix selects the same
    /// implementation under its extended name.
    fn parse(name: &str) -> Option<Self> {
        let base = name.strip_suffix("@sftp.ws").unwrap_or(name);
        Some(match base {
            "md5" => HashAlg::Md5,
            "sha1" => HashAlg::Sha1,
            "sha224" => HashAlg::Sha224,
            "sha256" => HashAlg::Sha256,
            "sha384" => HashAlg::Sha384,
            "sha512" => HashAlg::Sha512,
            "crc32" => HashAlg::Crc32,
            _ => return None,
        })
    }

    fn digest(&self, block: &[u8]) -> Vec<u8> {
        match self {
            HashAlg::Md5 => Md5::digest(block).to_vec(),
            HashAlg::Sha1 => Sha1::digest(block).to_vec(),
            HashAlg::Sha224 => Sha224::digest(block).to_vec(),
            HashAlg::Sha256 => Sha256::digest(block).to_vec(),
            HashAlg::Sha384 => Sha384::digest(block).to_vec(),
            HashAlg::Sha512 => Sha512::digest(block).to_vec(),
            HashAlg::Crc32 => crc32fast::hash(block).to_be_bytes().to_vec(),
        }
    }
}

fn open_options_for(flags: u32) -> fs::OpenOptions {
    let mut opts = fs::OpenOptions::new();
    opts.read(flags & open_flags::READ != 0);
    opts.write(flags & open_flags::WRITE != 0);
    if flags & open_flags::APPEND != 0 {
        opts.append(true);
    }
    if flags & open_flags::CREAT != 0 {
        opts.create(true);
    }
    if flags & open_flags::TRUNC != 0 {
        opts.truncate(true);
    }
    if flags & open_flags::EXCL != 0 {
        opts.create_new(true);
    }
    opts
}

async fn read_at(file: &mut fs::File, position: u64, length: usize) -> std::io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(position)).await?;
    let mut buf = vec![0u8; length];
    let mut filled = 0;
    while filled < length {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

#[async_trait]
impl FileOps for SafeFs {
    async fn open(&self, path: &str, flags: u32, attrs: &FileAttrs) -> SftpResult<Handle> {
        if flags & !open_flags::READ != 0 {
            self.deny_write("open")?;
        }
        if flags & (open_flags::READ | open_flags::WRITE) == 0 {
            return Err(SftpError::new(ErrorCode::Failure, "open without access mode")
                .with_command("open")
                .with_path(path));
        }
        let real = self.to_real_path(path);
        let mut opts = open_options_for(flags);
        if flags & open_flags::CREAT != 0 {
            if let Some(mode) = attrs.mode {
                opts.mode(mode & 0o7777);
            }
        }
        let file = opts.open(&real).await.map_err(|e| io_err(e, &real))?;
        self.alloc(OpenHandle::File { file, path: real }).await
    }

    async fn close(&self, handle: Handle) -> SftpResult<()> {
        let mut guard = self.slot(handle)?.lock().await;
        match guard.take() {
            Some(_) => Ok(()),
            None => Err(invalid_handle(handle)),
        }
    }

    async fn read(&self, handle: Handle, position: u64, length: u32) -> SftpResult<Vec<u8>> {
        let length = length.min(MAX_BLOCK_SIZE) as usize;
        let mut guard = self.slot(handle)?.lock().await;
        match guard.as_mut() {
            Some(OpenHandle::File { file, path }) => {
                let path = path.clone();
                read_at(file, position, length)
                    .await
                    .map_err(|e| io_err(e, &path))
            }
            _ => Err(invalid_handle(handle)),
        }
    }

    async fn write(&self, handle: Handle, position: u64, data: &[u8]) -> SftpResult<()> {
        self.deny_write("write")?;
        let mut guard = self.slot(handle)?.lock().await;
        match guard.as_mut() {
            Some(OpenHandle::File { file, path }) => {
                let path = path.clone();
                let write = async {
                    file.seek(SeekFrom::Start(position)).await?;
                    file.write_all(data).await
                };
                write.await.map_err(|e| io_err(e, &path))
            }
            _ => Err(invalid_handle(handle)),
        }
    }

    async fn lstat(&self, path: &str) -> SftpResult<FileAttrs> {
        let real = self.to_real_path(path);
        let meta = fs::symlink_metadata(&real)
            .await
            .map_err(|e| io_err(e, &real))?;
        Ok(self.attrs_from_metadata(&meta))
    }

    async fn fstat(&self, handle: Handle) -> SftpResult<FileAttrs> {
        let mut guard = self.slot(handle)?.lock().await;
        match guard.as_mut() {
            Some(OpenHandle::File { file, path }) => {
                let path = path.clone();
                let meta = file.metadata().await.map_err(|e| io_err(e, &path))?;
                Ok(self.attrs_from_metadata(&meta))
            }
            Some(OpenHandle::Dir { path, .. }) => {
                let path = path.clone();
                let meta = fs::metadata(&path).await.map_err(|e| io_err(e, &path))?;
                Ok(self.attrs_from_metadata(&meta))
            }
            None => Err(invalid_handle(handle)),
        }
    }

    async fn setstat(&self, path: &str, attrs: &FileAttrs) -> SftpResult<()> {
        self.deny_write("setstat")?;
        let real = self.to_real_path(path);
        self.apply_setstat(&real, attrs).await
    }

    async fn fsetstat(&self, handle: Handle, attrs: &FileAttrs) -> SftpResult<()> {
        self.deny_write("fsetstat")?;
        let mut guard = self.slot(handle)?.lock().await;
        let real = match guard.as_mut() {
            Some(OpenHandle::File { path, .. }) | Some(OpenHandle::Dir { path, .. }) => {
                path.clone()
            }
            None => return Err(invalid_handle(handle)),
        };
        self.apply_setstat(&real, attrs).await
    }

    async fn opendir(&self, path: &str) -> SftpResult<Handle> {
        let real = self.to_real_path(path);
        let meta = fs::metadata(&real).await.map_err(|e| io_err(e, &real))?;
        if !meta.is_dir() {
            return Err(SftpError::new(ErrorCode::NoEnt, "not a directory")
                .with_command("opendir")
                .with_path(path));
        }
        self.alloc(OpenHandle::Dir {
            path: real,
            entries: None,
        })
        .await
    }

    async fn readdir(&self, handle: Handle) -> SftpResult<Vec<Item>> {
        let mut guard = self.slot(handle)?.lock().await;
        let pending_path = match guard.as_ref() {
            Some(OpenHandle::Dir { path, entries }) => {
                entries.is_none().then(|| path.clone())
            }
            _ => return Err(invalid_handle(handle)),
        };
        if let Some(path) = pending_path {
            let listed = self.list_dir(&path).await?;
            if let Some(OpenHandle::Dir { entries, .. }) = guard.as_mut() {
                *entries = Some(listed);
            }
        }
        match guard.as_mut() {
            Some(OpenHandle::Dir {
                entries: Some(queue),
                ..
            }) => {
                let n = queue.len().min(READDIR_BATCH);
                Ok(queue.drain(..n).collect())
            }
            _ => Err(invalid_handle(handle)),
        }
    }

    async fn unlink(&self, path: &str) -> SftpResult<()> {
        self.deny_write("remove")?;
        let real = self.to_real_path(path);
        fs::remove_file(&real).await.map_err(|e| io_err(e, &real))
    }

    async fn mkdir(&self, path: &str, attrs: &FileAttrs) -> SftpResult<()> {
        self.deny_write("mkdir")?;
        let real = self.to_real_path(path);
        fs::create_dir(&real).await.map_err(|e| io_err(e, &real))?;
        if let Some(mode) = attrs.mode {
            fs::set_permissions(&real, std::fs::Permissions::from_mode(mode & 0o7777))
                .await
                .map_err(|e| io_err(e, &real))?;
        }
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> SftpResult<()> {
        self.deny_write("rmdir")?;
        let real = self.to_real_path(path);
        fs::remove_dir(&real).await.map_err(|e| io_err(e, &real))
    }

    async fn realpath(&self, path: &str) -> SftpResult<String> {
        let real = self.to_real_path(path);
        match fs::canonicalize(&real).await {
            Ok(resolved) => Ok(self.to_virtual_path(&resolved)),
            // The path need not exist; fall back to the syntactic form.
            Err(_) => Ok(self.to_virtual_path(&real)),
        }
    }

    async fn stat(&self, path: &str) -> SftpResult<FileAttrs> {
        let real = self.to_real_path(path);
        let meta = fs::metadata(&real).await.map_err(|e| io_err(e, &real))?;
        Ok(self.attrs_from_metadata(&meta))
    }

    async fn statvfs(&self, path: &str) -> SftpResult<StatVfs> {
        let real = self.to_real_path(path);
        let cpath = cstring(&real)?;
        let owned = real.clone();
        tokio::task::spawn_blocking(move || {
            let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
            let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut st) };
            if rc != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(StatVfs {
                bsize: st.f_bsize,
                frsize: st.f_frsize,
                blocks: st.f_blocks,
                bfree: st.f_bfree,
                bavail: st.f_bavail,
                files: st.f_files,
                ffree: st.f_ffree,
                favail: st.f_favail,
                fsid: st.f_fsid,
                flag: st.f_flag,
                namemax: st.f_namemax,
            })
        })
        .await
        .map_err(|_| SftpError::new(ErrorCode::Failure, "blocking task failed"))?
        .map_err(|e| io_err(e, &owned))
    }

    async fn rename(&self, old_path: &str, new_path: &str, _flags: u32) -> SftpResult<()> {
        self.deny_write("rename")?;
        let old = self.to_real_path(old_path);
        let new = self.to_real_path(new_path);
        fs::rename(&old, &new).await.map_err(|e| io_err(e, &old))
    }

    async fn readlink(&self, path: &str) -> SftpResult<String> {
        let real = self.to_real_path(path);
        let target = fs::read_link(&real).await.map_err(|e| io_err(e, &real))?;
        // Targets travel as-is; the mounting side resolves them.
        Ok(target.to_string_lossy().into_owned())
    }

    async fn symlink(&self, target: &str, link_path: &str) -> SftpResult<()> {
        self.deny_write("symlink")?;
        let link = self.to_real_path(link_path);
        fs::symlink(target, &link).await.map_err(|e| io_err(e, &link))
    }

    async fn link(&self, old_path: &str, new_path: &str) -> SftpResult<()> {
        self.deny_write("link")?;
        let old = self.to_real_path(old_path);
        let new = self.to_real_path(new_path);
        fs::hard_link(&old, &new).await.map_err(|e| io_err(e, &old))
    }

    async fn fcopy(
        &self,
        src: Handle,
        src_position: u64,
        length: u64,
        dst: Handle,
        dst_position: u64,
    ) -> SftpResult<()> {
        self.deny_write("fcopy")?;

        if src == dst {
            let mut guard = self.slot(src)?.lock().await;
            let (file, path) = match guard.as_mut() {
                Some(OpenHandle::File { file, path }) => (file, path.clone()),
                _ => return Err(invalid_handle(src)),
            };
            return copy_range_same(file, &path, src_position, length, dst_position).await;
        }

        // Lock in slot order so crossing copies cannot deadlock.
        let (first, second) = if src.0 < dst.0 { (src, dst) } else { (dst, src) };
        let mut first_guard = self.slot(first)?.lock().await;
        let mut second_guard = self.slot(second)?.lock().await;
        let (src_guard, dst_guard) = if src.0 < dst.0 {
            (&mut first_guard, &mut second_guard)
        } else {
            (&mut second_guard, &mut first_guard)
        };
        let (src_file, src_path) = match src_guard.as_mut() {
            Some(OpenHandle::File { file, path }) => (file, path.clone()),
            _ => return Err(invalid_handle(src)),
        };
        let (dst_file, dst_path) = match dst_guard.as_mut() {
            Some(OpenHandle::File { file, path }) => (file, path.clone()),
            _ => return Err(invalid_handle(dst)),
        };

        let mut copied = 0u64;
        loop {
            let want = chunk_len(length, copied);
            if want == 0 {
                break;
            }
            let block = read_at(src_file, src_position + copied, want)
                .await
                .map_err(|e| io_err(e, &src_path))?;
            if block.is_empty() {
                break;
            }
            dst_file
                .seek(SeekFrom::Start(dst_position + copied))
                .await
                .map_err(|e| io_err(e, &dst_path))?;
            dst_file
                .write_all(&block)
                .await
                .map_err(|e| io_err(e, &dst_path))?;
            copied += block.len() as u64;
        }
        Ok(())
    }

    async fn fhash(
        &self,
        handle: Handle,
        algorithms: &str,
        position: u64,
        length: u64,
        block_size: u32,
    ) -> SftpResult<(String, Vec<u8>)> {
        let (alg_name, alg) = algorithms
            .split(',')
            .map(str::trim)
            .find_map(|name| HashAlg::parse(name).map(|alg| (name.to_string(), alg)))
            .ok_or_else(|| {
                SftpError::new(
                    ErrorCode::NoSys,
                    format!("no supported hash algorithm in \"{}\"", algorithms),
                )
            })?;
        let block_size = if block_size == 0 {
            MAX_BLOCK_SIZE as u64
        } else {
            block_size.min(MAX_BLOCK_SIZE) as u64
        };

        let mut guard = self.slot(handle)?.lock().await;
        let (file, path) = match guard.as_mut() {
            Some(OpenHandle::File { file, path }) => (file, path.clone()),
            _ => return Err(invalid_handle(handle)),
        };

        let mut out = Vec::new();
        let mut done = 0u64;
        while done < length {
            let want = (length - done).min(block_size) as usize;
            let block = read_at(file, position + done, want)
                .await
                .map_err(|e| io_err(e, &path))?;
            if block.len() < want {
                return Err(SftpError::new(ErrorCode::Failure, "Unable to read data")
                    .with_command("fhash")
                    .with_handle(handle.0));
            }
            out.extend_from_slice(&alg.digest(&block));
            done += want as u64;
        }
        Ok((alg_name, out))
    }
}

/// Ranged copy within a single handle.
async fn copy_range_same(
    file: &mut fs::File,
    path: &Path,
    src_position: u64,
    length: u64,
    dst_position: u64,
) -> SftpResult<()> {
    let mut copied = 0u64;
    loop {
        let want = chunk_len(length, copied);
        if want == 0 {
            break;
        }
        let block = read_at(file, src_position + copied, want)
            .await
            .map_err(|e| io_err(e, path))?;
        if block.is_empty() {
            break;
        }
        file.seek(SeekFrom::Start(dst_position + copied))
            .await
            .map_err(|e| io_err(e, path))?;
        file.write_all(&block)
            .await
            .map_err(|e| io_err(e, path))?;
        copied += block.len() as u64;
    }
    Ok(())
}

/// Next chunk for a ranged copy: bounded by the block limit, and by the
/// remaining length when one was requested (zero means until EOF).
fn chunk_len(length: u64, copied: u64) -> usize {
    let cap = MAX_BLOCK_SIZE as u64;
    if length == 0 {
        cap as usize
    } else if copied >= length {
        0
    } else {
        (length - copied).min(cap) as usize
    }
}
