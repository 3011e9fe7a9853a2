//! Client protocol engine: request multiplexing over one channel.
//!
//! The engine owns one channel, assigns request ids, correlates responses,
//! and surfaces the filesystem-operation interface. The INIT/VERSION
//! handshake runs on the bare channel before the multiplexing loop starts,
//! so the handshake never occupies a slot in the id-keyed request table.

use crate::channel::{close_codes, Channel};
use crate::error::{ErrorCode, SftpError, SftpResult};
use crate::fs::FileOps;
use crate::protocol::{
    extensions, FeatureSet, FileAttrs, Handle, Item, PacketReader, PacketType, PacketWriter,
    StatVfs, StatusCode, MAX_BLOCK_SIZE, MAX_SAFE_POSITION, RENAME_OVERWRITE, SFTP_VERSION,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn};

/// Zero-length DATA responses tolerated before a read fails with EIO.
const MAX_ZERO_READS: u32 = 4;

/// A correlated response: the type byte and the payload following the
/// request id.
struct Response {
    ty: PacketType,
    payload: Vec<u8>,
}

impl Response {
    fn reader(&self) -> PacketReader<'_> {
        PacketReader::new(&self.payload)
    }
}

enum Outbound {
    Frame(Vec<u8>),
    Close(u16, String),
}

struct ClientInner {
    out_tx: mpsc::UnboundedSender<Outbound>,
    pending: DashMap<u32, oneshot::Sender<SftpResult<Response>>>,
    next_id: AtomicU32,
    alive: AtomicBool,
}

impl ClientInner {
    /// Allocate a request id: monotonically increasing, wrapping, skipping
    /// zero and ids still in flight.
    fn allocate_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Fail every outstanding request. Called exactly once, on loop exit.
    fn fail_all(&self, err: &SftpError) {
        let ids: Vec<u32> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(err.clone()));
            }
        }
    }
}

/// The client protocol engine.
///
/// Cheap to clone; all clones share the channel and the request table.
#[derive(Clone)]
pub struct SftpClient {
    inner: Arc<ClientInner>,
    features: FeatureSet,
    closed_rx: watch::Receiver<bool>,
}

impl SftpClient {
    /// Bind a channel: perform the INIT/VERSION handshake, then start the
    /// multiplexing loop.
    pub async fn bind(mut channel: Box<dyn Channel>) -> SftpResult<Self> {
        let mut init = PacketWriter::new(PacketType::Init);
        init.write_u32(SFTP_VERSION);
        channel.send(init.finish()).await?;

        let frame = match channel.recv().await {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => return Err(err),
            None => {
                return Err(SftpError::new(
                    ErrorCode::ConnRefused,
                    "channel closed during handshake",
                ))
            }
        };

        let features = match Self::parse_version(&frame) {
            Ok(features) => features,
            Err(err) => {
                channel.close(close_codes::PROTOCOL_ERROR, &err.message).await;
                return Err(err);
            }
        };

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let inner = Arc::new(ClientInner {
            out_tx,
            pending: DashMap::new(),
            next_id: AtomicU32::new(1),
            alive: AtomicBool::new(true),
        });

        tokio::spawn(run_loop(channel, out_rx, Arc::clone(&inner), closed_tx));

        debug!(target: "wsftp::client", ?features, "session established");
        Ok(Self {
            inner,
            features,
            closed_rx,
        })
    }

    fn parse_version(frame: &[u8]) -> SftpResult<FeatureSet> {
        let pkt = crate::protocol::codec::parse_frame(frame)?;
        if pkt.ty != PacketType::Version {
            return Err(SftpError::new(
                ErrorCode::Prototype,
                format!("expected VERSION, got {}", pkt.ty.op_name()),
            ));
        }
        let mut r = pkt.reader;
        let version = r.read_u32()?;
        if version != SFTP_VERSION {
            return Err(SftpError::new(
                ErrorCode::Prototype,
                format!("unsupported protocol version {}", version),
            ));
        }
        let mut features = FeatureSet::default();
        while !r.at_end() {
            let name = r.read_string()?;
            let value = r.read_string()?;
            features.apply(&name, &value);
        }
        // These ride on the base protocol once the peer speaks version 3.
        features.statvfs = true;
        features.copy_data = true;
        features.check_file_handle = true;
        Ok(features)
    }

    /// Negotiated feature table.
    pub fn features(&self) -> FeatureSet {
        self.features
    }

    /// True while the channel is up.
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// Watch that flips to `true` when the channel goes down.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    /// Close the channel. Outstanding requests fail with CONNECTION_LOST.
    pub fn end(&self) {
        let _ = self
            .inner
            .out_tx
            .send(Outbound::Close(close_codes::NORMAL, String::new()));
    }

    /// Issue one request and await its correlated response.
    async fn call(
        &self,
        tag: &'static str,
        build: impl FnOnce(u32) -> Vec<u8>,
    ) -> SftpResult<Response> {
        if !self.is_alive() {
            return Err(SftpError::not_connected().with_command(tag));
        }
        let id = self.inner.allocate_id();
        let (tx, rx) = oneshot::channel();
        // A occupied slot here means the allocator handed out a live id,
        // which is a local bug, not a recoverable condition.
        if self.inner.pending.insert(id, tx).is_some() {
            panic!("duplicate request id {}", id);
        }
        if self.inner.out_tx.send(Outbound::Frame(build(id))).is_err() {
            self.inner.pending.remove(&id);
            return Err(SftpError::connection_lost().with_command(tag));
        }
        match rx.await {
            Ok(result) => result.map_err(|e| e.with_command(tag)),
            Err(_) => Err(SftpError::connection_lost().with_command(tag)),
        }
    }

    /// Decode a STATUS payload into a result.
    fn status_of(resp: &Response) -> SftpResult<StatusCode> {
        let mut r = resp.reader();
        let raw = r.read_u32()?;
        let code = StatusCode::from_u32(raw)
            .ok_or_else(|| SftpError::bad_message(format!("unknown status code {}", raw)))?;
        if code == StatusCode::Ok {
            return Ok(code);
        }
        let message = r.read_string().unwrap_or_default();
        let _lang = r.read_string().unwrap_or_default();
        if code == StatusCode::Eof {
            return Ok(code);
        }
        Err(SftpError::from_status(code, message))
    }

    fn expect_ok(resp: Response) -> SftpResult<()> {
        match resp.ty {
            PacketType::Status => Self::status_of(&resp).map(|_| ()),
            other => Err(unexpected_response(other)),
        }
    }

    fn expect_handle(resp: Response) -> SftpResult<Handle> {
        match resp.ty {
            PacketType::Handle => {
                let mut r = resp.reader();
                let bytes = r.read_bytes()?;
                Handle::from_bytes(bytes).ok_or_else(|| {
                    SftpError::bad_message(format!("handle of {} bytes", bytes.len()))
                })
            }
            PacketType::Status => Self::status_of(&resp).and_then(|_| {
                Err(SftpError::new(ErrorCode::Failure, "unexpected EOF status"))
            }),
            other => Err(unexpected_response(other)),
        }
    }

    fn expect_attrs(resp: Response) -> SftpResult<FileAttrs> {
        match resp.ty {
            PacketType::Attrs => {
                let mut r = resp.reader();
                Ok(FileAttrs::decode(&mut r)?)
            }
            PacketType::Status => Self::status_of(&resp).and_then(|_| {
                Err(SftpError::new(ErrorCode::Failure, "unexpected EOF status"))
            }),
            other => Err(unexpected_response(other)),
        }
    }

    fn expect_items(resp: Response) -> SftpResult<Vec<Item>> {
        match resp.ty {
            PacketType::Name => {
                let mut r = resp.reader();
                let count = r.read_u32()?;
                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    items.push(Item::decode(&mut r)?);
                }
                Ok(items)
            }
            // EOF ends the listing.
            PacketType::Status => Self::status_of(&resp).map(|_| Vec::new()),
            other => Err(unexpected_response(other)),
        }
    }

    fn expect_single_name(resp: Response) -> SftpResult<String> {
        let items = Self::expect_items(resp)?;
        items
            .into_iter()
            .next()
            .map(|item| item.filename)
            .ok_or_else(|| SftpError::bad_message("empty NAME response"))
    }

    fn check_position(position: u64, tag: &'static str) -> SftpResult<()> {
        if position > MAX_SAFE_POSITION {
            return Err(SftpError::new(
                ErrorCode::Io,
                format!("position {} beyond safe range", position),
            )
            .with_command(tag));
        }
        Ok(())
    }
}

fn unexpected_response(ty: PacketType) -> SftpError {
    SftpError::bad_message(format!("unexpected response packet {}", ty.op_name()))
}

/// The channel loop: ships outbound frames, routes inbound responses.
async fn run_loop(
    mut channel: Box<dyn Channel>,
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
    inner: Arc<ClientInner>,
    closed_tx: watch::Sender<bool>,
) {
    let exit_err = loop {
        tokio::select! {
            outbound = out_rx.recv() => match outbound {
                Some(Outbound::Frame(frame)) => {
                    if let Err(err) = channel.send(frame).await {
                        break err;
                    }
                }
                Some(Outbound::Close(code, reason)) => {
                    channel.close(code, &reason).await;
                    break SftpError::connection_lost();
                }
                // Every engine clone dropped.
                None => {
                    channel.close(close_codes::NORMAL, "").await;
                    break SftpError::connection_lost();
                }
            },
            inbound = channel.recv() => match inbound {
                Some(Ok(frame)) => {
                    if let Err(err) = route_response(&inner, &frame) {
                        error!(target: "wsftp::client", %err, "protocol violation");
                        channel.close(close_codes::PROTOCOL_ERROR, &err.message).await;
                        break err;
                    }
                }
                Some(Err(err)) => {
                    warn!(target: "wsftp::client", %err, "channel failed");
                    break err;
                }
                None => break SftpError::connection_lost(),
            },
        }
    };

    inner.alive.store(false, Ordering::Release);
    let shutdown = SftpError::new(ErrorCode::Shutdown, exit_err.message.clone());
    inner.fail_all(&shutdown);
    let _ = closed_tx.send(true);
}

/// Match one inbound packet against the request table. An unknown id or a
/// non-response packet is a fatal protocol violation.
fn route_response(inner: &ClientInner, frame: &[u8]) -> SftpResult<()> {
    let pkt = crate::protocol::codec::parse_frame(frame)?;
    match pkt.ty {
        PacketType::Status
        | PacketType::Handle
        | PacketType::Data
        | PacketType::Name
        | PacketType::Attrs
        | PacketType::ExtendedReply => {}
        other => {
            return Err(SftpError::bad_message(format!(
                "unexpected packet {} from server",
                other.op_name()
            )))
        }
    }
    let mut r = pkt.reader;
    let id = r.read_u32()?;
    let payload_offset = frame.len() - r.remaining();
    match inner.pending.remove(&id) {
        Some((_, tx)) => {
            let _ = tx.send(Ok(Response {
                ty: pkt.ty,
                payload: frame[payload_offset..].to_vec(),
            }));
            Ok(())
        }
        None => Err(SftpError::bad_message(format!(
            "response for unknown request id {}",
            id
        ))),
    }
}

#[async_trait]
impl FileOps for SftpClient {
    async fn open(&self, path: &str, flags: u32, attrs: &FileAttrs) -> SftpResult<Handle> {
        let resp = self
            .call("open", |id| {
                let mut w = PacketWriter::request(PacketType::Open, id);
                w.write_string(path);
                w.write_u32(flags);
                attrs.encode(&mut w);
                w.finish()
            })
            .await
            .map_err(|e| e.with_path(path))?;
        Self::expect_handle(resp).map_err(|e| e.with_path(path))
    }

    async fn close(&self, handle: Handle) -> SftpResult<()> {
        let resp = self
            .call("close", |id| {
                let mut w = PacketWriter::request(PacketType::Close, id);
                w.write_data(&handle.to_bytes());
                w.finish()
            })
            .await?;
        Self::expect_ok(resp).map_err(|e| e.with_handle(handle.0))
    }

    async fn read(&self, handle: Handle, position: u64, length: u32) -> SftpResult<Vec<u8>> {
        if length == 0 {
            return Ok(Vec::new());
        }
        if length > MAX_BLOCK_SIZE {
            return Err(SftpError::new(
                ErrorCode::Io,
                format!("read length {} exceeds block limit", length),
            )
            .with_command("read"));
        }
        Self::check_position(position, "read")?;

        // A zero-length DATA response is a transient server condition; retry
        // at the same offset a bounded number of times.
        for _ in 0..=MAX_ZERO_READS {
            let resp = self
                .call("read", |id| {
                    let mut w = PacketWriter::request(PacketType::Read, id);
                    w.write_data(&handle.to_bytes());
                    w.write_u64(position);
                    w.write_u32(length);
                    w.finish()
                })
                .await?;
            match resp.ty {
                PacketType::Data => {
                    let mut r = resp.reader();
                    let data = r.read_bytes()?;
                    if !data.is_empty() {
                        return Ok(data.to_vec());
                    }
                }
                // EOF yields a cleanly empty buffer, not an error.
                PacketType::Status => {
                    return Self::status_of(&resp).map(|_| Vec::new());
                }
                other => return Err(unexpected_response(other)),
            }
        }
        Err(SftpError::new(ErrorCode::Io, "read returned no data")
            .with_command("read")
            .with_handle(handle.0))
    }

    async fn write(&self, handle: Handle, position: u64, data: &[u8]) -> SftpResult<()> {
        if data.len() > MAX_BLOCK_SIZE as usize {
            return Err(SftpError::new(
                ErrorCode::Io,
                format!("write length {} exceeds block limit", data.len()),
            )
            .with_command("write"));
        }
        Self::check_position(position, "write")?;
        let resp = self
            .call("write", |id| {
                let mut w = PacketWriter::request(PacketType::Write, id);
                w.write_data(&handle.to_bytes());
                w.write_u64(position);
                w.write_data(data);
                w.finish()
            })
            .await?;
        Self::expect_ok(resp).map_err(|e| e.with_handle(handle.0))
    }

    async fn lstat(&self, path: &str) -> SftpResult<FileAttrs> {
        let resp = self
            .call("lstat", |id| {
                let mut w = PacketWriter::request(PacketType::Lstat, id);
                w.write_string(path);
                w.finish()
            })
            .await
            .map_err(|e| e.with_path(path))?;
        Self::expect_attrs(resp).map_err(|e| e.with_path(path))
    }

    async fn fstat(&self, handle: Handle) -> SftpResult<FileAttrs> {
        let resp = self
            .call("fstat", |id| {
                let mut w = PacketWriter::request(PacketType::Fstat, id);
                w.write_data(&handle.to_bytes());
                w.finish()
            })
            .await?;
        Self::expect_attrs(resp).map_err(|e| e.with_handle(handle.0))
    }

    async fn setstat(&self, path: &str, attrs: &FileAttrs) -> SftpResult<()> {
        let resp = self
            .call("setstat", |id| {
                let mut w = PacketWriter::request(PacketType::Setstat, id);
                w.write_string(path);
                attrs.encode(&mut w);
                w.finish()
            })
            .await
            .map_err(|e| e.with_path(path))?;
        Self::expect_ok(resp).map_err(|e| e.with_path(path))
    }

    async fn fsetstat(&self, handle: Handle, attrs: &FileAttrs) -> SftpResult<()> {
        let resp = self
            .call("fsetstat", |id| {
                let mut w = PacketWriter::request(PacketType::Fsetstat, id);
                w.write_data(&handle.to_bytes());
                attrs.encode(&mut w);
                w.finish()
            })
            .await?;
        Self::expect_ok(resp).map_err(|e| e.with_handle(handle.0))
    }

    async fn opendir(&self, path: &str) -> SftpResult<Handle> {
        let resp = self
            .call("opendir", |id| {
                let mut w = PacketWriter::request(PacketType::Opendir, id);
                w.write_string(path);
                w.finish()
            })
            .await
            .map_err(|e| e.with_path(path))?;
        Self::expect_handle(resp).map_err(|e| e.with_path(path))
    }

    async fn readdir(&self, handle: Handle) -> SftpResult<Vec<Item>> {
        let resp = self
            .call("readdir", |id| {
                let mut w = PacketWriter::request(PacketType::Readdir, id);
                w.write_data(&handle.to_bytes());
                w.finish()
            })
            .await?;
        Self::expect_items(resp).map_err(|e| e.with_handle(handle.0))
    }

    async fn unlink(&self, path: &str) -> SftpResult<()> {
        let resp = self
            .call("remove", |id| {
                let mut w = PacketWriter::request(PacketType::Remove, id);
                w.write_string(path);
                w.finish()
            })
            .await
            .map_err(|e| e.with_path(path))?;
        Self::expect_ok(resp).map_err(|e| e.with_path(path))
    }

    async fn mkdir(&self, path: &str, attrs: &FileAttrs) -> SftpResult<()> {
        let resp = self
            .call("mkdir", |id| {
                let mut w = PacketWriter::request(PacketType::Mkdir, id);
                w.write_string(path);
                attrs.encode(&mut w);
                w.finish()
            })
            .await
            .map_err(|e| e.with_path(path))?;
        Self::expect_ok(resp).map_err(|e| e.with_path(path))
    }

    async fn rmdir(&self, path: &str) -> SftpResult<()> {
        let resp = self
            .call("rmdir", |id| {
                let mut w = PacketWriter::request(PacketType::Rmdir, id);
                w.write_string(path);
                w.finish()
            })
            .await
            .map_err(|e| e.with_path(path))?;
        Self::expect_ok(resp).map_err(|e| e.with_path(path))
    }

    async fn realpath(&self, path: &str) -> SftpResult<String> {
        let resp = self
            .call("realpath", |id| {
                let mut w = PacketWriter::request(PacketType::Realpath, id);
                w.write_string(path);
                w.finish()
            })
            .await
            .map_err(|e| e.with_path(path))?;
        Self::expect_single_name(resp).map_err(|e| e.with_path(path))
    }

    async fn stat(&self, path: &str) -> SftpResult<FileAttrs> {
        let resp = self
            .call("stat", |id| {
                let mut w = PacketWriter::request(PacketType::Stat, id);
                w.write_string(path);
                w.finish()
            })
            .await
            .map_err(|e| e.with_path(path))?;
        Self::expect_attrs(resp).map_err(|e| e.with_path(path))
    }

    async fn statvfs(&self, path: &str) -> SftpResult<StatVfs> {
        let resp = self
            .call("statvfs", |id| {
                let mut w = PacketWriter::request(PacketType::Extended, id);
                w.write_string(extensions::STATVFS);
                w.write_string(path);
                w.finish()
            })
            .await
            .map_err(|e| e.with_path(path))?;
        match resp.ty {
            PacketType::ExtendedReply => {
                let mut r = resp.reader();
                Ok(StatVfs::decode(&mut r)?)
            }
            PacketType::Status => Self::status_of(&resp).and_then(|_| {
                Err(SftpError::new(ErrorCode::Failure, "unexpected EOF status"))
            }),
            other => Err(unexpected_response(other)),
        }
    }

    async fn rename(&self, old_path: &str, new_path: &str, flags: u32) -> SftpResult<()> {
        let resp = match flags {
            0 => {
                self.call("rename", |id| {
                    let mut w = PacketWriter::request(PacketType::Rename, id);
                    w.write_string(old_path);
                    w.write_string(new_path);
                    w.finish()
                })
                .await
            }
            RENAME_OVERWRITE => {
                if !self.features.posix_rename {
                    return Err(SftpError::new(
                        ErrorCode::NoSys,
                        "peer does not support posix-rename",
                    )
                    .with_command("rename")
                    .with_path(old_path));
                }
                self.call("rename", |id| {
                    let mut w = PacketWriter::request(PacketType::Extended, id);
                    w.write_string(extensions::POSIX_RENAME);
                    w.write_string(old_path);
                    w.write_string(new_path);
                    w.finish()
                })
                .await
            }
            other => {
                return Err(SftpError::new(
                    ErrorCode::NoSys,
                    format!("unsupported rename flags {:#x}", other),
                )
                .with_command("rename"))
            }
        }
        .map_err(|e| e.with_path(old_path))?;
        Self::expect_ok(resp).map_err(|e| e.with_path(old_path))
    }

    async fn readlink(&self, path: &str) -> SftpResult<String> {
        let resp = self
            .call("readlink", |id| {
                let mut w = PacketWriter::request(PacketType::Readlink, id);
                w.write_string(path);
                w.finish()
            })
            .await
            .map_err(|e| e.with_path(path))?;
        Self::expect_single_name(resp).map_err(|e| e.with_path(path))
    }

    async fn symlink(&self, target: &str, link_path: &str) -> SftpResult<()> {
        let resp = self
            .call("symlink", |id| {
                let mut w = PacketWriter::request(PacketType::Symlink, id);
                w.write_string(target);
                w.write_string(link_path);
                w.finish()
            })
            .await
            .map_err(|e| e.with_path(link_path))?;
        Self::expect_ok(resp).map_err(|e| e.with_path(link_path))
    }

    async fn link(&self, old_path: &str, new_path: &str) -> SftpResult<()> {
        if !self.features.hardlink {
            return Err(
                SftpError::new(ErrorCode::NoSys, "peer does not support hardlink")
                    .with_command("link")
                    .with_path(old_path),
            );
        }
        let resp = self
            .call("link", |id| {
                let mut w = PacketWriter::request(PacketType::Extended, id);
                w.write_string(extensions::HARDLINK);
                w.write_string(old_path);
                w.write_string(new_path);
                w.finish()
            })
            .await
            .map_err(|e| e.with_path(old_path))?;
        Self::expect_ok(resp).map_err(|e| e.with_path(old_path))
    }

    async fn fcopy(
        &self,
        src: Handle,
        src_position: u64,
        length: u64,
        dst: Handle,
        dst_position: u64,
    ) -> SftpResult<()> {
        Self::check_position(src_position, "fcopy")?;
        Self::check_position(dst_position, "fcopy")?;
        let resp = self
            .call("fcopy", |id| {
                let mut w = PacketWriter::request(PacketType::Extended, id);
                w.write_string(extensions::COPY_DATA);
                w.write_data(&src.to_bytes());
                w.write_u64(src_position);
                w.write_u64(length);
                w.write_data(&dst.to_bytes());
                w.write_u64(dst_position);
                w.finish()
            })
            .await?;
        Self::expect_ok(resp).map_err(|e| e.with_handle(src.0))
    }

    async fn fhash(
        &self,
        handle: Handle,
        algorithms: &str,
        position: u64,
        length: u64,
        block_size: u32,
    ) -> SftpResult<(String, Vec<u8>)> {
        Self::check_position(position, "fhash")?;
        let resp = self
            .call("fhash", |id| {
                let mut w = PacketWriter::request(PacketType::Extended, id);
                w.write_string(extensions::CHECK_FILE_HANDLE);
                w.write_data(&handle.to_bytes());
                w.write_string(algorithms);
                w.write_u64(position);
                w.write_u64(length);
                w.write_u32(block_size);
                w.finish()
            })
            .await?;
        match resp.ty {
            PacketType::ExtendedReply => {
                let mut r = resp.reader();
                let alg = r.read_string()?;
                let digest = r.read_remaining().to_vec();
                Ok((alg, digest))
            }
            PacketType::Status => Self::status_of(&resp).and_then(|_| {
                Err(SftpError::new(ErrorCode::Failure, "unexpected EOF status"))
            }),
            other => Err(unexpected_response(other)),
        }
    }
}
