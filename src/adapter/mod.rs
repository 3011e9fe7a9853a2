//! Filesystem adapter: the kernel callback surface over the client engine.
//!
//! [`SftpMount`] implements the operations a kernel filesystem bridge
//! drives (getattr, readdir, open, read, write, ...), issuing client-engine
//! requests underneath. It owns the three TTL caches, the per-descriptor
//! write coalescing buffers, the reconnect state machine, and the optional
//! bulk-metadata and read-tracking features. Every entry point returns a
//! kernel errno on failure and is safe to call concurrently.

mod cache;
mod coalesce;
mod metadata;
mod tracking;

pub use cache::TtlCache;
pub use coalesce::{WriteBuffer, MAX_PENDING_WRITES};
pub use metadata::{MetaRecord, MetadataIndex};
pub use tracking::{ReadTracker, ReadTrackingConfig};

use crate::channel::Channel;
use crate::client::SftpClient;
use crate::error::{ErrorCode, SftpError, SftpResult};
use crate::fs::FileOps;
use crate::protocol::attrs::open_flags;
use crate::protocol::{FileAttrs, Handle, StatVfs, MAX_BLOCK_SIZE, RENAME_OVERWRITE};
use crate::util::path::{join_path, normalize_path, parent_path};
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Factory producing a fresh channel for every (re)connection attempt.
pub type Connector = Arc<
    dyn Fn() -> Pin<Box<dyn Future<Output = SftpResult<Box<dyn Channel>>> + Send>> + Send + Sync,
>;

/// Reconnect backoff: initial delay, growth factor, ceiling.
const RECONNECT_INITIAL_MS: u64 = 1000;
const RECONNECT_FACTOR_PERCENT: u64 = 130;
const RECONNECT_CAP_MS: u64 = 7500;

/// Mount configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MountOptions {
    /// Default TTL in seconds for all three caches.
    pub cache_timeout: u64,
    /// Attribute-cache override.
    pub cache_stat_timeout: Option<u64>,
    /// Directory-cache override.
    pub cache_dir_timeout: Option<u64>,
    /// Link-cache override.
    pub cache_link_timeout: Option<u64>,
    /// Reconnect automatically after a lost channel.
    pub reconnect: bool,
    /// Access-log configuration.
    pub read_tracking: Option<ReadTrackingConfig>,
    /// Optional bulk metadata snapshot consulted by readdir.
    pub metadata_file: Option<PathBuf>,
    /// Prefix that always reports ENOENT without contacting the server.
    pub hide_path: Option<String>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            cache_timeout: 20,
            cache_stat_timeout: None,
            cache_dir_timeout: None,
            cache_link_timeout: None,
            reconnect: true,
            read_tracking: None,
            metadata_file: None,
            hide_path: None,
        }
    }
}

impl MountOptions {
    /// Load options from a JSON file.
    pub fn load(path: &std::path::Path) -> std::io::Result<Self> {
        let raw = std::fs::read(path)?;
        serde_json::from_slice(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Init,
    Connecting,
    Ready,
    Closed,
}

/// Post-processed attributes handed to the kernel surface.
///
/// The wire protocol lacks ctime, so ctime mirrors mtime; blocks come from
/// the `blocks` attribute extension, the longname's numeric prefix, or the
/// size rounded up to 512-byte units, in that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub blocks: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
}

impl FileStat {
    fn from_wire(attrs: &FileAttrs, longname: Option<&str>) -> Self {
        let size = attrs.size.unwrap_or(0);
        let mtime = attrs.mtime.unwrap_or(0);
        let blocks = attrs
            .extension("blocks")
            .and_then(|v| v.parse().ok())
            .or_else(|| {
                longname
                    .and_then(|l| l.split_whitespace().next())
                    .and_then(|t| t.parse().ok())
            })
            .unwrap_or_else(|| size.div_ceil(512));
        Self {
            size,
            blocks,
            mode: attrs.mode.unwrap_or(0),
            uid: attrs.uid.unwrap_or(0),
            gid: attrs.gid.unwrap_or(0),
            atime: attrs.atime.unwrap_or(mtime),
            mtime,
            ctime: mtime,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32
    }
}

/// Kernel-surface result: success or errno.
pub type OpResult<T> = Result<T, i32>;

struct FdState {
    handle: Handle,
    path: String,
    writes: WriteBuffer,
}

struct MountInner {
    options: MountOptions,
    connector: Connector,
    state: Mutex<MountState>,
    client: Mutex<Option<SftpClient>>,
    attr_cache: TtlCache<Result<FileStat, i32>>,
    dir_cache: TtlCache<Vec<String>>,
    link_cache: TtlCache<String>,
    fds: Mutex<HashMap<u64, Arc<tokio::sync::Mutex<FdState>>>>,
    next_fd: AtomicU64,
    tracker: Option<Arc<ReadTracker>>,
    metadata: Mutex<Option<MetadataIndex>>,
}

/// The mount adapter. Cheap to clone.
#[derive(Clone)]
pub struct SftpMount {
    inner: Arc<MountInner>,
}

fn errno_of(err: &SftpError) -> i32 {
    let errno = err.code.kernel_errno();
    if errno <= 0 {
        libc::EIO
    } else {
        errno
    }
}

/// Normalize any caller path to the virtual-absolute cache key.
fn vkey(path: &str) -> String {
    let normalized = normalize_path(path);
    if normalized.starts_with('/') {
        normalized
    } else if normalized == "." {
        "/".to_string()
    } else {
        format!("/{}", normalized)
    }
}

/// Map kernel open flags onto the wire flag bits.
fn sftp_flags_from_os(flags: i32) -> u32 {
    let mut out = 0;
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => out |= open_flags::WRITE,
        libc::O_RDWR => out |= open_flags::READ | open_flags::WRITE,
        _ => out |= open_flags::READ,
    }
    if flags & libc::O_APPEND != 0 {
        out |= open_flags::APPEND;
    }
    if flags & libc::O_CREAT != 0 {
        out |= open_flags::CREAT;
    }
    if flags & libc::O_TRUNC != 0 {
        out |= open_flags::TRUNC;
    }
    if flags & libc::O_EXCL != 0 {
        out |= open_flags::EXCL;
    }
    out
}

impl SftpMount {
    pub fn new(connector: Connector, options: MountOptions) -> Self {
        let base = Duration::from_secs(options.cache_timeout);
        let secs = |over: Option<u64>| over.map(Duration::from_secs).unwrap_or(base);
        let tracker = options.read_tracking.clone().map(ReadTracker::spawn);
        Self {
            inner: Arc::new(MountInner {
                attr_cache: TtlCache::new(secs(options.cache_stat_timeout)),
                dir_cache: TtlCache::new(secs(options.cache_dir_timeout)),
                link_cache: TtlCache::new(secs(options.cache_link_timeout)),
                state: Mutex::new(MountState::Init),
                client: Mutex::new(None),
                fds: Mutex::new(HashMap::new()),
                next_fd: AtomicU64::new(1),
                metadata: Mutex::new(None),
                tracker,
                connector,
                options,
            }),
        }
    }

    pub fn state(&self) -> MountState {
        *self.inner.state.lock().unwrap()
    }

    /// Establish the session. Idempotent while connecting or ready.
    pub async fn connect(&self) -> SftpResult<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            match *state {
                MountState::Closed => {
                    return Err(SftpError::new(ErrorCode::Shutdown, "mount is closed"))
                }
                MountState::Connecting | MountState::Ready => return Ok(()),
                MountState::Init => *state = MountState::Connecting,
            }
        }
        let dialed = async {
            let channel = (self.inner.connector)().await?;
            SftpClient::bind(channel).await
        }
        .await;
        match dialed {
            Ok(client) => {
                let closed = client.closed();
                *self.inner.client.lock().unwrap() = Some(client);
                *self.inner.state.lock().unwrap() = MountState::Ready;
                spawn_monitor(&self.inner, closed);
                info!(target: "wsftp::adapter", "session ready");
                Ok(())
            }
            Err(err) => {
                let mut state = self.inner.state.lock().unwrap();
                if *state == MountState::Connecting {
                    *state = MountState::Init;
                }
                Err(err)
            }
        }
    }

    /// Terminal shutdown. Fails all subsequent operations with ENOTCONN.
    pub async fn end(&self) {
        let client = {
            *self.inner.state.lock().unwrap() = MountState::Closed;
            self.inner.client.lock().unwrap().take()
        };
        if let Some(client) = client {
            client.end();
        }
        if let Some(tracker) = &self.inner.tracker {
            tracker.flush().await;
        }
    }

    fn client(&self) -> OpResult<SftpClient> {
        if self.state() != MountState::Ready {
            return Err(libc::ENOTCONN);
        }
        self.inner
            .client
            .lock()
            .unwrap()
            .clone()
            .ok_or(libc::ENOTCONN)
    }

    fn fd_state(&self, fd: u64) -> OpResult<Arc<tokio::sync::Mutex<FdState>>> {
        self.inner
            .fds
            .lock()
            .unwrap()
            .get(&fd)
            .cloned()
            .ok_or(libc::EBADF)
    }

    /// Record an opened path in the access log, honoring the `modified`
    /// threshold against the mtime cached before any invalidation.
    fn note_access(&self, key: &str) {
        let Some(tracker) = &self.inner.tracker else {
            return;
        };
        if let Some(threshold) = tracker.modified_threshold() {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            if let Some(Ok(stat)) = self.inner.attr_cache.get(key) {
                if now.saturating_sub(stat.mtime as u64) < threshold {
                    return;
                }
            }
        }
        tracker.track(key);
    }

    /// Mutation invalidation: the path's attribute and link entries, plus
    /// the directory entries of the path and its parent.
    fn invalidate(&self, key: &str) {
        self.inner.attr_cache.invalidate(key);
        self.inner.link_cache.invalidate(key);
        self.inner.dir_cache.invalidate(key);
        self.inner.dir_cache.invalidate(&parent_path(key));
    }

    // ---- kernel callback surface -------------------------------------

    pub async fn init(&self) -> OpResult<()> {
        self.client().map(|_| ())
    }

    pub async fn statfs(&self, path: &str) -> OpResult<StatVfs> {
        let client = self.client()?;
        client
            .statvfs(&vkey(path))
            .await
            .map_err(|e| errno_of(&e))
    }

    pub async fn getattr(&self, path: &str) -> OpResult<FileStat> {
        let key = vkey(path);
        if let Some(prefix) = &self.inner.options.hide_path {
            if key.starts_with(prefix.as_str()) {
                return Err(libc::ENOENT);
            }
        }
        if let Some(cached) = self.inner.attr_cache.get(&key) {
            return cached;
        }
        let client = self.client()?;
        match client.lstat(&key).await {
            Ok(attrs) => {
                let stat = FileStat::from_wire(&attrs, None);
                self.inner.attr_cache.insert(key, Ok(stat));
                Ok(stat)
            }
            Err(err) => {
                let errno = errno_of(&err);
                // Definitive server answers are negatively cached; transport
                // failures are not.
                if err.native_code.is_some() {
                    self.inner.attr_cache.insert(key, Err(errno));
                }
                Err(errno)
            }
        }
    }

    pub async fn fgetattr(&self, fd: u64) -> OpResult<FileStat> {
        let state = self.fd_state(fd)?;
        let client = self.client()?;
        let guard = state.lock().await;
        let attrs = client.fstat(guard.handle).await.map_err(|e| errno_of(&e))?;
        let stat = FileStat::from_wire(&attrs, None);
        self.inner.attr_cache.insert(guard.path.clone(), Ok(stat));
        Ok(stat)
    }

    pub async fn readdir(&self, path: &str) -> OpResult<Vec<String>> {
        let key = vkey(path);
        if let Some(names) = self.metadata_readdir(&key) {
            return Ok(names);
        }
        if let Some(names) = self.inner.dir_cache.get(&key) {
            return Ok(names);
        }
        let client = self.client()?;
        let handle = client.opendir(&key).await.map_err(|e| errno_of(&e))?;
        let mut names = Vec::new();
        loop {
            match client.readdir(handle).await {
                Ok(batch) if batch.is_empty() => break,
                Ok(batch) => {
                    for item in batch {
                        if item.filename == "." || item.filename == ".." {
                            continue;
                        }
                        let stat = FileStat::from_wire(&item.attrs, Some(&item.longname));
                        self.inner
                            .attr_cache
                            .insert(join_path(&key, &item.filename), Ok(stat));
                        names.push(item.filename);
                    }
                }
                Err(err) => {
                    let _ = client.close(handle).await;
                    return Err(errno_of(&err));
                }
            }
        }
        let _ = client.close(handle).await;
        self.inner.dir_cache.insert(key, names.clone());
        Ok(names)
    }

    /// Serve a directory listing from the metadata snapshot, when one is
    /// configured, loaded, fresh, and covering the directory.
    fn metadata_readdir(&self, key: &str) -> Option<Vec<String>> {
        let file = self.inner.options.metadata_file.as_ref()?;
        let file_mtime = std::fs::metadata(file).ok()?.modified().ok()?;
        let mut guard = self.inner.metadata.lock().unwrap();
        let reload = match guard.as_ref() {
            Some(index) => index.file_mtime != file_mtime,
            None => true,
        };
        if reload {
            match MetadataIndex::load(file) {
                Ok(index) => {
                    debug!(target: "wsftp::adapter", records = index.len(), "metadata snapshot loaded");
                    *guard = Some(index);
                }
                Err(err) => {
                    warn!(target: "wsftp::adapter", error = %err, "metadata snapshot unreadable");
                    return None;
                }
            }
        }
        let index = guard.as_ref()?;
        if !index.is_fresh(self.inner.dir_cache.ttl()) {
            return None;
        }
        let children = index.children_of(key)?;
        let mut names = Vec::new();
        for record in children {
            let name = record
                .path
                .rsplit('/')
                .next()
                .unwrap_or(record.path.as_str())
                .to_string();
            let stat = FileStat {
                size: record.size,
                blocks: record.blocks,
                mode: record.mode,
                uid: 0,
                gid: 0,
                atime: record.atime,
                mtime: record.mtime,
                ctime: record.mtime,
            };
            self.inner
                .attr_cache
                .insert(join_path(key, &name), Ok(stat));
            names.push(name);
        }
        Some(names)
    }

    pub async fn open(&self, path: &str, flags: i32) -> OpResult<u64> {
        self.open_with(path, sftp_flags_from_os(flags), FileAttrs::default())
            .await
    }

    pub async fn create(&self, path: &str, mode: u32, flags: i32) -> OpResult<u64> {
        let attrs = FileAttrs {
            mode: Some(mode),
            ..Default::default()
        };
        self.open_with(
            path,
            sftp_flags_from_os(flags) | open_flags::CREAT,
            attrs,
        )
        .await
    }

    async fn open_with(&self, path: &str, flags: u32, attrs: FileAttrs) -> OpResult<u64> {
        let key = vkey(path);
        let client = self.client()?;
        let handle = client
            .open(&key, flags, &attrs)
            .await
            .map_err(|e| errno_of(&e))?;
        // Tracking consults the cached (pre-open) mtime, so it runs before
        // the invalidation below.
        self.note_access(&key);
        if flags & (open_flags::WRITE | open_flags::TRUNC | open_flags::CREAT) != 0 {
            self.invalidate(&key);
        }
        let fd = self.inner.next_fd.fetch_add(1, Ordering::Relaxed);
        self.inner.fds.lock().unwrap().insert(
            fd,
            Arc::new(tokio::sync::Mutex::new(FdState {
                handle,
                path: key,
                writes: WriteBuffer::new(),
            })),
        );
        Ok(fd)
    }

    pub async fn read(&self, fd: u64, offset: u64, size: u32) -> OpResult<Vec<u8>> {
        let state = self.fd_state(fd)?;
        let client = self.client()?;
        let mut guard = state.lock().await;
        if !guard.writes.is_empty() {
            self.flush_locked(&client, &mut guard).await?;
        }
        let handle = guard.handle;
        let mut out = Vec::with_capacity(size as usize);
        while (out.len() as u32) < size {
            let want = (size - out.len() as u32).min(MAX_BLOCK_SIZE);
            let chunk = client
                .read(handle, offset + out.len() as u64, want)
                .await
                .map_err(|e| errno_of(&e))?;
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    pub async fn write(&self, fd: u64, offset: u64, data: &[u8]) -> OpResult<u32> {
        let state = self.fd_state(fd)?;
        let client = self.client()?;
        let mut guard = state.lock().await;
        self.invalidate(&guard.path.clone());
        let force = guard.writes.push(offset, data.to_vec());
        if force {
            self.flush_locked(&client, &mut guard).await?;
        }
        Ok(data.len() as u32)
    }

    async fn flush_locked(&self, client: &SftpClient, state: &mut FdState) -> OpResult<()> {
        for (position, buffer) in state.writes.take_runs() {
            let mut off = 0usize;
            while off < buffer.len() {
                let end = (off + MAX_BLOCK_SIZE as usize).min(buffer.len());
                match client
                    .write(state.handle, position + off as u64, &buffer[off..end])
                    .await
                {
                    Ok(()) => off = end,
                    // The descriptor can be freed server-side while writes
                    // are still buffered; the flush still reports success.
                    Err(err) if err.code == ErrorCode::NoEnt => {
                        warn!(target: "wsftp::adapter", path = %state.path, "flush hit ENOENT, suppressed");
                        return Ok(());
                    }
                    Err(err) => return Err(errno_of(&err)),
                }
            }
        }
        Ok(())
    }

    pub async fn flush(&self, fd: u64) -> OpResult<()> {
        let state = self.fd_state(fd)?;
        let client = self.client()?;
        let mut guard = state.lock().await;
        self.flush_locked(&client, &mut guard).await
    }

    pub async fn fsync(&self, fd: u64) -> OpResult<()> {
        self.flush(fd).await
    }

    pub async fn fsyncdir(&self, _fd: u64) -> OpResult<()> {
        self.client().map(|_| ())
    }

    pub async fn release(&self, fd: u64) -> OpResult<()> {
        let state = match self.inner.fds.lock().unwrap().remove(&fd) {
            Some(state) => state,
            None => return Err(libc::EBADF),
        };
        let client = self.client()?;
        let mut guard = state.lock().await;
        self.flush_locked(&client, &mut guard).await?;
        let result = client.close(guard.handle).await;
        self.invalidate(&guard.path.clone());
        result.map_err(|e| errno_of(&e))
    }

    pub async fn releasedir(&self, _fd: u64) -> OpResult<()> {
        self.client().map(|_| ())
    }

    pub async fn truncate(&self, path: &str, size: u64) -> OpResult<()> {
        let key = vkey(path);
        let client = self.client()?;
        let attrs = FileAttrs {
            size: Some(size),
            ..Default::default()
        };
        client
            .setstat(&key, &attrs)
            .await
            .map_err(|e| errno_of(&e))?;
        self.invalidate(&key);
        Ok(())
    }

    pub async fn ftruncate(&self, fd: u64, size: u64) -> OpResult<()> {
        let state = self.fd_state(fd)?;
        let client = self.client()?;
        let mut guard = state.lock().await;
        self.flush_locked(&client, &mut guard).await?;
        let attrs = FileAttrs {
            size: Some(size),
            ..Default::default()
        };
        client
            .fsetstat(guard.handle, &attrs)
            .await
            .map_err(|e| errno_of(&e))?;
        self.invalidate(&guard.path.clone());
        Ok(())
    }

    pub async fn chmod(&self, path: &str, mode: u32) -> OpResult<()> {
        self.setstat_one(
            path,
            FileAttrs {
                mode: Some(mode),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn chown(&self, path: &str, uid: u32, gid: u32) -> OpResult<()> {
        self.setstat_one(
            path,
            FileAttrs {
                uid: Some(uid),
                gid: Some(gid),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn utimens(&self, path: &str, atime: u32, mtime: u32) -> OpResult<()> {
        self.setstat_one(
            path,
            FileAttrs {
                atime: Some(atime),
                mtime: Some(mtime),
                ..Default::default()
            },
        )
        .await
    }

    async fn setstat_one(&self, path: &str, attrs: FileAttrs) -> OpResult<()> {
        let key = vkey(path);
        let client = self.client()?;
        client
            .setstat(&key, &attrs)
            .await
            .map_err(|e| errno_of(&e))?;
        self.invalidate(&key);
        Ok(())
    }

    pub async fn readlink(&self, path: &str) -> OpResult<String> {
        let key = vkey(path);
        if let Some(target) = self.inner.link_cache.get(&key) {
            return Ok(target);
        }
        let client = self.client()?;
        let target = client.readlink(&key).await.map_err(|e| errno_of(&e))?;
        self.inner.link_cache.insert(key, target.clone());
        Ok(target)
    }

    pub async fn unlink(&self, path: &str) -> OpResult<()> {
        let key = vkey(path);
        let client = self.client()?;
        client.unlink(&key).await.map_err(|e| errno_of(&e))?;
        self.invalidate(&key);
        Ok(())
    }

    pub async fn rename(&self, old_path: &str, new_path: &str) -> OpResult<()> {
        let old = vkey(old_path);
        let new = vkey(new_path);
        let client = self.client()?;
        // Kernel rename overwrites; use the posix-rename extension when the
        // peer negotiated it, plain RENAME otherwise.
        let flags = if client.features().posix_rename {
            RENAME_OVERWRITE
        } else {
            0
        };
        client
            .rename(&old, &new, flags)
            .await
            .map_err(|e| errno_of(&e))?;
        self.invalidate(&old);
        self.invalidate(&new);
        Ok(())
    }

    pub async fn link(&self, old_path: &str, new_path: &str) -> OpResult<()> {
        let old = vkey(old_path);
        let new = vkey(new_path);
        let client = self.client()?;
        client.link(&old, &new).await.map_err(|e| errno_of(&e))?;
        self.invalidate(&old);
        self.invalidate(&new);
        Ok(())
    }

    pub async fn symlink(&self, target: &str, link_path: &str) -> OpResult<()> {
        let link = vkey(link_path);
        let client = self.client()?;
        client
            .symlink(target, &link)
            .await
            .map_err(|e| errno_of(&e))?;
        self.invalidate(&link);
        Ok(())
    }

    pub async fn mkdir(&self, path: &str, mode: u32) -> OpResult<()> {
        let key = vkey(path);
        let client = self.client()?;
        let attrs = FileAttrs {
            mode: Some(mode),
            ..Default::default()
        };
        client.mkdir(&key, &attrs).await.map_err(|e| errno_of(&e))?;
        self.invalidate(&key);
        Ok(())
    }

    pub async fn rmdir(&self, path: &str) -> OpResult<()> {
        let key = vkey(path);
        let client = self.client()?;
        client.rmdir(&key).await.map_err(|e| errno_of(&e))?;
        self.invalidate(&key);
        Ok(())
    }
}

fn spawn_monitor(inner: &Arc<MountInner>, mut closed: watch::Receiver<bool>) {
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        while !*closed.borrow() {
            if closed.changed().await.is_err() {
                break;
            }
        }
        let Some(inner) = weak.upgrade() else { return };
        {
            let mut state = inner.state.lock().unwrap();
            if *state == MountState::Closed {
                return;
            }
            *state = MountState::Init;
        }
        inner.client.lock().unwrap().take();
        warn!(target: "wsftp::adapter", "channel lost");
        if inner.options.reconnect {
            reconnect_loop(inner).await;
        }
    });
}

/// Exponential backoff reconnect, retrying until the mount is closed.
async fn reconnect_loop(inner: Arc<MountInner>) {
    let mount = SftpMount {
        inner: Arc::clone(&inner),
    };
    let mut delay = RECONNECT_INITIAL_MS;
    loop {
        tokio::time::sleep(Duration::from_millis(delay)).await;
        if *inner.state.lock().unwrap() == MountState::Closed {
            return;
        }
        match mount.connect().await {
            Ok(()) => {
                info!(target: "wsftp::adapter", "reconnected");
                return;
            }
            Err(err) => {
                debug!(target: "wsftp::adapter", %err, delay_ms = delay, "reconnect failed");
                delay = (delay * RECONNECT_FACTOR_PERCENT / 100).min(RECONNECT_CAP_MS);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::SessionConfig;
    use std::path::Path;

    fn connector_for(root: &Path) -> Connector {
        let root = root.to_path_buf();
        Arc::new(move || {
            let root = root.clone();
            Box::pin(async move {
                let (ours, theirs) = crate::channel::pair();
                tokio::spawn(crate::server::serve_channel(
                    Box::new(theirs),
                    SessionConfig {
                        virtual_root: root,
                        read_only: false,
                        hide_uid_gid: false,
                    },
                ));
                Ok(Box::new(ours) as Box<dyn Channel>)
            })
        })
    }

    async fn mounted(root: &Path, options: MountOptions) -> SftpMount {
        let mount = SftpMount::new(connector_for(root), options);
        mount.connect().await.unwrap();
        mount
    }

    #[test]
    fn options_load_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("mount.json");
        std::fs::write(
            &file,
            r#"{
                "cacheTimeout": 5,
                "cacheStatTimeout": 2,
                "reconnect": false,
                "hidePath": "/private",
                "readTracking": { "path": "/tmp/reads.log", "timeout": 120, "update": 10 }
            }"#,
        )
        .unwrap();
        let options = MountOptions::load(&file).unwrap();
        assert_eq!(options.cache_timeout, 5);
        assert_eq!(options.cache_stat_timeout, Some(2));
        assert!(!options.reconnect);
        assert_eq!(options.hide_path.as_deref(), Some("/private"));
        let tracking = options.read_tracking.unwrap();
        assert_eq!(tracking.timeout, 120);
        assert_eq!(tracking.modified, None);
    }

    #[tokio::test]
    async fn not_connected_yields_enotconn() {
        let dir = tempfile::tempdir().unwrap();
        let mount = SftpMount::new(connector_for(dir.path()), MountOptions::default());
        assert_eq!(mount.state(), MountState::Init);
        assert_eq!(mount.getattr("/x").await.unwrap_err(), libc::ENOTCONN);
        assert_eq!(mount.readdir("/").await.unwrap_err(), libc::ENOTCONN);
    }

    #[tokio::test]
    async fn open_write_release_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let mount = mounted(dir.path(), MountOptions::default()).await;

        let fd = mount
            .create("/f.txt", 0o644, libc::O_WRONLY)
            .await
            .unwrap();
        assert_eq!(mount.write(fd, 0, b"hello").await.unwrap(), 5);
        assert_eq!(mount.write(fd, 5, b" world").await.unwrap(), 6);
        mount.release(fd).await.unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("f.txt")).unwrap(),
            b"hello world"
        );

        let fd = mount.open("/f.txt", libc::O_RDONLY).await.unwrap();
        assert_eq!(mount.read(fd, 6, 16).await.unwrap(), b"world");
        mount.release(fd).await.unwrap();
        mount.end().await;
    }

    #[tokio::test]
    async fn getattr_uses_negative_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mount = mounted(dir.path(), MountOptions::default()).await;
        assert_eq!(mount.getattr("/missing").await.unwrap_err(), libc::ENOENT);
        // Second call is served from the negative entry.
        assert_eq!(
            mount.inner.attr_cache.get("/missing"),
            Some(Err(libc::ENOENT))
        );
        assert_eq!(mount.getattr("/missing").await.unwrap_err(), libc::ENOENT);
        mount.end().await;
    }

    #[tokio::test]
    async fn hide_path_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("secret"), b"x").unwrap();
        let options = MountOptions {
            hide_path: Some("/secret".to_string()),
            ..Default::default()
        };
        let mount = mounted(dir.path(), options).await;
        assert_eq!(mount.getattr("/secret").await.unwrap_err(), libc::ENOENT);
        mount.end().await;
    }

    #[tokio::test]
    async fn readdir_caches_names_and_attrs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"12345").unwrap();
        std::fs::write(dir.path().join("b"), b"1").unwrap();
        let mount = mounted(dir.path(), MountOptions::default()).await;

        let names = mount.readdir("/").await.unwrap();
        assert_eq!(names, vec!["a", "b"]);
        // readdir warmed the attribute cache, so getattr answers locally.
        assert!(matches!(mount.inner.attr_cache.get("/a"), Some(Ok(_))));
        let stat = mount.getattr("/a").await.unwrap();
        assert_eq!(stat.size, 5);
        assert_eq!(stat.ctime, stat.mtime);
        mount.end().await;
    }

    #[tokio::test]
    async fn mutation_invalidates_caches() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"x").unwrap();
        let mount = mounted(dir.path(), MountOptions::default()).await;

        let _ = mount.readdir("/").await.unwrap();
        let _ = mount.getattr("/a").await.unwrap();
        assert!(mount.inner.dir_cache.get("/").is_some());

        mount.unlink("/a").await.unwrap();
        assert!(mount.inner.attr_cache.get("/a").is_none());
        assert!(mount.inner.dir_cache.get("/").is_none());
        assert_eq!(mount.getattr("/a").await.unwrap_err(), libc::ENOENT);
        mount.end().await;
    }

    #[tokio::test]
    async fn metadata_snapshot_serves_readdir() {
        let dir = tempfile::tempdir().unwrap();
        let meta = dir.path().join("snapshot");
        let mut body = Vec::new();
        for (i, record) in [
            ("docs\x001700000000 1700000000 8 4096 drwxr-xr-x"),
            ("docs/guide.md\x001700000000 1700000000 4 1500 -rw-r--r--"),
            ("readme.md\x001700000000 1700000000 2 300 -rw-r--r--"),
        ]
        .iter()
        .enumerate()
        {
            if i > 0 {
                body.extend_from_slice(&[0, 0]);
            }
            body.extend_from_slice(record.as_bytes());
        }
        std::fs::write(&meta, body).unwrap();

        let options = MountOptions {
            metadata_file: Some(meta),
            ..Default::default()
        };
        // Point the server at an empty directory: listings must come from
        // the snapshot, not the wire.
        let empty = tempfile::tempdir().unwrap();
        let mount = mounted(empty.path(), options).await;

        let names = mount.readdir("/docs").await.unwrap();
        assert_eq!(names, vec!["guide.md"]);
        let stat = mount.getattr("/docs/guide.md").await.unwrap();
        assert_eq!(stat.size, 1500);
        assert_eq!(stat.blocks, 4);
        mount.end().await;
    }

    #[tokio::test]
    async fn reconnect_restores_service() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        let mount = mounted(dir.path(), MountOptions::default()).await;

        // Kill the current session from the client side; the monitor sees
        // the close and the reconnect loop redials the connector.
        let client = mount.inner.client.lock().unwrap().clone().unwrap();
        client.end();
        let mut closed = client.closed();
        let _ = closed.wait_for(|c| *c).await;

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            if mount.state() == MountState::Ready {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "reconnect did not complete"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(mount.getattr("/f").await.is_ok());
        mount.end().await;
    }
}
