//! Per-channel server session: decode, dispatch, encode.
//!
//! One session owns one channel and one [`SafeFs`]. Requests are decoded on
//! the channel loop and dispatched on spawned tasks, so responses may
//! complete out of order; each carries the request id it answers. The
//! channel loop is the single writer.

use crate::channel::{close_codes, Channel};
use crate::error::{ErrorCode, SftpError};
use crate::fs::FileOps;
use crate::protocol::{
    extensions, FileAttrs, Handle, Item, PacketReader, PacketType, PacketWriter, StatusCode,
    MAX_PACKET_SIZE, RENAME_OVERWRITE, SFTP_VERSION,
};
use crate::server::SafeFs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Session policy knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Subtree exposed as "/". Defaults to the current working directory.
    pub virtual_root: PathBuf,
    /// Reject every mutating operation with EROFS.
    pub read_only: bool,
    /// Strip uid/gid from outbound attributes, drop them inbound.
    pub hide_uid_gid: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            virtual_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            read_only: false,
            hide_uid_gid: false,
        }
    }
}

/// Serve one accepted channel until it closes.
pub async fn serve_channel(channel: Box<dyn Channel>, config: SessionConfig) {
    let fs = Arc::new(SafeFs::new(
        config.virtual_root,
        config.read_only,
        config.hide_uid_gid,
    ));
    run_session(channel, fs).await;
}

/// Session loop over an already-built filesystem.
pub async fn run_session(mut channel: Box<dyn Channel>, fs: Arc<SafeFs>) {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(256);

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                // We hold a sender, so the channel cannot be exhausted.
                if let Some(frame) = outbound {
                    if channel.send(frame).await.is_err() {
                        break;
                    }
                }
            }
            inbound = channel.recv() => match inbound {
                Some(Ok(frame)) => {
                    if let Err(err) = accept_frame(&fs, &tx, &mut channel, frame).await {
                        warn!(target: "wsftp::server", %err, "malformed frame");
                        channel.close(close_codes::BAD_DATA, &err.message).await;
                        break;
                    }
                }
                Some(Err(err)) => {
                    warn!(target: "wsftp::server", %err, "channel failed");
                    break;
                }
                None => break,
            },
        }
    }

    fs.close_all().await;
    debug!(target: "wsftp::server", "session ended");
}

/// Validate framing and route one request. Errors are unrecoverable framing
/// violations; anything answerable is answered with a STATUS instead.
async fn accept_frame(
    fs: &Arc<SafeFs>,
    tx: &mpsc::Sender<Vec<u8>>,
    channel: &mut Box<dyn Channel>,
    frame: Vec<u8>,
) -> Result<(), SftpError> {
    if frame.len() > MAX_PACKET_SIZE as usize {
        return Err(SftpError::bad_message("packet too large"));
    }
    if frame.len() < 5 {
        return Err(SftpError::bad_message("frame shorter than packet header"));
    }
    let declared = u32::from_be_bytes(frame[0..4].try_into().unwrap()) as usize;
    if declared != frame.len() - 4 {
        return Err(SftpError::bad_message("length prefix mismatch"));
    }
    let ty_byte = frame[4];

    if ty_byte == PacketType::Init as u8 {
        let mut r = PacketReader::new(&frame[5..]);
        let version = r.read_u32().unwrap_or(0);
        info!(target: "wsftp::server", version, "client INIT");
        channel.send(version_frame()).await.ok();
        return Ok(());
    }

    if frame.len() < 9 {
        return Err(SftpError::bad_message("request without id"));
    }
    let id = u32::from_be_bytes(frame[5..9].try_into().unwrap());

    let ty = match PacketType::from_u8(ty_byte) {
        Some(ty) if ty.has_request_id() && !is_response_type(ty) => ty,
        // Unknown or inverted-direction packets are answered, not fatal.
        _ => {
            let _ = tx
                .send(status_frame(
                    id,
                    StatusCode::BadMessage,
                    &format!("unexpected packet type {}", ty_byte),
                ))
                .await;
            return Ok(());
        }
    };

    let payload = frame[9..].to_vec();
    let fs = Arc::clone(fs);
    let tx = tx.clone();
    tokio::spawn(async move {
        let response = dispatch(&fs, ty, id, &payload).await;
        let _ = tx.send(response).await;
    });
    Ok(())
}

fn is_response_type(ty: PacketType) -> bool {
    matches!(
        ty,
        PacketType::Status
            | PacketType::Handle
            | PacketType::Data
            | PacketType::Name
            | PacketType::Attrs
            | PacketType::ExtendedReply
    )
}

/// Decode one request payload, run it, encode the response.
async fn dispatch(fs: &SafeFs, ty: PacketType, id: u32, payload: &[u8]) -> Vec<u8> {
    let mut r = PacketReader::new(payload);
    let result = run_op(fs, ty, id, &mut r).await;
    match result {
        Ok(frame) => frame,
        Err(err) => error_frame(id, &err),
    }
}

async fn run_op(
    fs: &SafeFs,
    ty: PacketType,
    id: u32,
    r: &mut PacketReader<'_>,
) -> Result<Vec<u8>, SftpError> {
    Ok(match ty {
        PacketType::Open => {
            let path = r.read_string()?;
            let flags = r.read_u32()?;
            let attrs = FileAttrs::decode(r)?;
            let handle = fs.open(&path, flags, &attrs).await?;
            handle_frame(id, handle)
        }
        PacketType::Close => {
            let handle = read_handle(r)?;
            fs.close(handle).await?;
            ok_frame(id)
        }
        PacketType::Read => {
            let handle = read_handle(r)?;
            let position = r.read_u64()?;
            let length = r.read_u32()?;
            let data = fs.read(handle, position, length).await?;
            if data.is_empty() && length > 0 {
                status_frame(id, StatusCode::Eof, "end of file")
            } else {
                data_frame(id, &data)
            }
        }
        PacketType::Write => {
            let handle = read_handle(r)?;
            let position = r.read_u64()?;
            let data = r.read_bytes()?;
            fs.write(handle, position, data).await?;
            ok_frame(id)
        }
        PacketType::Lstat => {
            let path = r.read_string()?;
            attrs_frame(id, &fs.lstat(&path).await?)
        }
        PacketType::Fstat => {
            let handle = read_handle(r)?;
            attrs_frame(id, &fs.fstat(handle).await?)
        }
        PacketType::Setstat => {
            let path = r.read_string()?;
            let attrs = FileAttrs::decode(r)?;
            fs.setstat(&path, &attrs).await?;
            ok_frame(id)
        }
        PacketType::Fsetstat => {
            let handle = read_handle(r)?;
            let attrs = FileAttrs::decode(r)?;
            fs.fsetstat(handle, &attrs).await?;
            ok_frame(id)
        }
        PacketType::Opendir => {
            let path = r.read_string()?;
            handle_frame(id, fs.opendir(&path).await?)
        }
        PacketType::Readdir => {
            let handle = read_handle(r)?;
            let items = fs.readdir(handle).await?;
            if items.is_empty() {
                status_frame(id, StatusCode::Eof, "end of directory")
            } else {
                name_frame(id, &items)
            }
        }
        PacketType::Remove => {
            let path = r.read_string()?;
            fs.unlink(&path).await?;
            ok_frame(id)
        }
        PacketType::Mkdir => {
            let path = r.read_string()?;
            let attrs = FileAttrs::decode(r)?;
            fs.mkdir(&path, &attrs).await?;
            ok_frame(id)
        }
        PacketType::Rmdir => {
            let path = r.read_string()?;
            fs.rmdir(&path).await?;
            ok_frame(id)
        }
        PacketType::Realpath => {
            let path = r.read_string()?;
            let resolved = fs.realpath(&path).await?;
            single_name_frame(id, &resolved)
        }
        PacketType::Stat => {
            let path = r.read_string()?;
            attrs_frame(id, &fs.stat(&path).await?)
        }
        PacketType::Rename => {
            let old = r.read_string()?;
            let new = r.read_string()?;
            fs.rename(&old, &new, 0).await?;
            ok_frame(id)
        }
        PacketType::Readlink => {
            let path = r.read_string()?;
            let target = fs.readlink(&path).await?;
            single_name_frame(id, &target)
        }
        PacketType::Symlink => {
            let target = r.read_string()?;
            let link = r.read_string()?;
            fs.symlink(&target, &link).await?;
            ok_frame(id)
        }
        PacketType::Extended => {
            let name = r.read_string()?;
            return run_extended(fs, &name, id, r).await;
        }
        _ => status_frame(id, StatusCode::BadMessage, "unexpected packet type"),
    })
}

async fn run_extended(
    fs: &SafeFs,
    name: &str,
    id: u32,
    r: &mut PacketReader<'_>,
) -> Result<Vec<u8>, SftpError> {
    Ok(match name {
        extensions::POSIX_RENAME => {
            let old = r.read_string()?;
            let new = r.read_string()?;
            fs.rename(&old, &new, RENAME_OVERWRITE).await?;
            ok_frame(id)
        }
        extensions::HARDLINK => {
            let old = r.read_string()?;
            let new = r.read_string()?;
            fs.link(&old, &new).await?;
            ok_frame(id)
        }
        extensions::STATVFS => {
            let path = r.read_string()?;
            let st = fs.statvfs(&path).await?;
            let mut w = PacketWriter::request(PacketType::ExtendedReply, id);
            st.encode(&mut w);
            w.finish()
        }
        extensions::COPY_DATA => {
            let src = read_handle(r)?;
            let src_position = r.read_u64()?;
            let length = r.read_u64()?;
            let dst = read_handle(r)?;
            let dst_position = r.read_u64()?;
            fs.fcopy(src, src_position, length, dst, dst_position).await?;
            ok_frame(id)
        }
        extensions::CHECK_FILE_HANDLE => {
            let handle = read_handle(r)?;
            let algorithms = r.read_string()?;
            let position = r.read_u64()?;
            let length = r.read_u64()?;
            let block_size = r.read_u32()?;
            let (alg, digest) = fs
                .fhash(handle, &algorithms, position, length, block_size)
                .await?;
            let mut w = PacketWriter::request(PacketType::ExtendedReply, id);
            w.write_string(&alg);
            w.write_raw(&digest);
            w.finish()
        }
        other => status_frame(
            id,
            StatusCode::OpUnsupported,
            &format!("unsupported extension {}", other),
        ),
    })
}

fn read_handle(r: &mut PacketReader<'_>) -> Result<Handle, SftpError> {
    let bytes = r.read_bytes()?;
    Handle::from_bytes(bytes)
        .ok_or_else(|| SftpError::new(ErrorCode::Failure, "invalid handle"))
}

/// The VERSION response, including every extension this server implements.
fn version_frame() -> Vec<u8> {
    let mut w = PacketWriter::new(PacketType::Version);
    w.write_u32(SFTP_VERSION);
    for (name, value) in [
        (extensions::HARDLINK, "1"),
        (extensions::POSIX_RENAME, "1"),
        (extensions::STATVFS, "2"),
        (extensions::COPY_DATA, "1"),
        (extensions::CHECK_FILE_HANDLE, "1"),
    ] {
        w.write_string(name);
        w.write_string(value);
    }
    w.finish()
}

fn status_frame(id: u32, code: StatusCode, message: &str) -> Vec<u8> {
    let mut w = PacketWriter::request(PacketType::Status, id);
    w.write_u32(code as u32);
    w.write_string(message);
    w.write_string("");
    w.finish()
}

fn ok_frame(id: u32) -> Vec<u8> {
    status_frame(id, StatusCode::Ok, "")
}

fn error_frame(id: u32, err: &SftpError) -> Vec<u8> {
    status_frame(id, status_for(err), &err.message)
}

/// Collapse the error taxonomy onto the wire STATUS codes.
fn status_for(err: &SftpError) -> StatusCode {
    match err.code {
        ErrorCode::Eof => StatusCode::Eof,
        ErrorCode::NoEnt => StatusCode::NoSuchFile,
        ErrorCode::Access => StatusCode::PermissionDenied,
        ErrorCode::NoSys => StatusCode::OpUnsupported,
        ErrorCode::BadMessage => StatusCode::BadMessage,
        ErrorCode::NotConn => StatusCode::NoConnection,
        ErrorCode::Shutdown => StatusCode::ConnectionLost,
        _ => StatusCode::Failure,
    }
}

fn handle_frame(id: u32, handle: Handle) -> Vec<u8> {
    let mut w = PacketWriter::request(PacketType::Handle, id);
    w.write_data(&handle.to_bytes());
    w.finish()
}

fn data_frame(id: u32, data: &[u8]) -> Vec<u8> {
    let mut w = PacketWriter::request(PacketType::Data, id);
    w.write_data(data);
    w.finish()
}

fn attrs_frame(id: u32, attrs: &FileAttrs) -> Vec<u8> {
    let mut w = PacketWriter::request(PacketType::Attrs, id);
    attrs.encode(&mut w);
    w.finish()
}

fn name_frame(id: u32, items: &[Item]) -> Vec<u8> {
    let mut w = PacketWriter::request(PacketType::Name, id);
    w.write_u32(items.len() as u32);
    for item in items {
        item.encode(&mut w);
    }
    w.finish()
}

fn single_name_frame(id: u32, name: &str) -> Vec<u8> {
    let mut w = PacketWriter::request(PacketType::Name, id);
    w.write_u32(1);
    w.write_string(name);
    w.write_string(name);
    FileAttrs::default().encode(&mut w);
    w.finish()
}
