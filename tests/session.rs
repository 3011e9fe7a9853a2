//! End-to-end client/server scenarios over in-memory channel pairs.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use wsftp::adapter::{Connector, MountOptions, SftpMount};
use wsftp::channel::{pair, Channel, PipeChannel};
use wsftp::client::SftpClient;
use wsftp::error::{ErrorCode, SftpResult};
use wsftp::fs::FileOps;
use wsftp::protocol::attrs::open_flags;
use wsftp::protocol::{FileAttrs, PacketType, PacketWriter, RENAME_OVERWRITE, SFTP_VERSION};
use wsftp::server::{serve_channel, SessionConfig};

/// Channel wrapper counting outbound frames per packet type.
struct CountingChannel {
    inner: PipeChannel,
    counts: Arc<Mutex<HashMap<u8, usize>>>,
}

impl CountingChannel {
    fn new(inner: PipeChannel, counts: Arc<Mutex<HashMap<u8, usize>>>) -> Self {
        Self { inner, counts }
    }
}

#[async_trait]
impl Channel for CountingChannel {
    async fn send(&mut self, frame: Vec<u8>) -> SftpResult<()> {
        if frame.len() > 4 {
            *self.counts.lock().unwrap().entry(frame[4]).or_insert(0) += 1;
        }
        self.inner.send(frame).await
    }

    async fn recv(&mut self) -> Option<SftpResult<Vec<u8>>> {
        self.inner.recv().await
    }

    async fn close(&mut self, code: u16, reason: &str) {
        self.inner.close(code, reason).await;
    }
}

fn sent(counts: &Arc<Mutex<HashMap<u8, usize>>>, ty: PacketType) -> usize {
    *counts.lock().unwrap().get(&(ty as u8)).unwrap_or(&0)
}

fn config_for(root: &Path) -> SessionConfig {
    SessionConfig {
        virtual_root: root.to_path_buf(),
        read_only: false,
        hide_uid_gid: false,
    }
}

/// Client bound to an in-process server session, with a frame counter.
async fn session(config: SessionConfig) -> (SftpClient, Arc<Mutex<HashMap<u8, usize>>>) {
    let (ours, theirs) = pair();
    tokio::spawn(serve_channel(Box::new(theirs), config));
    let counts = Arc::new(Mutex::new(HashMap::new()));
    let channel = CountingChannel::new(ours, Arc::clone(&counts));
    let client = SftpClient::bind(Box::new(channel)).await.unwrap();
    (client, counts)
}

/// Mount whose connector dials a fresh in-process session each time.
fn mount_for(root: &Path, options: MountOptions) -> (SftpMount, Arc<Mutex<HashMap<u8, usize>>>) {
    let counts = Arc::new(Mutex::new(HashMap::new()));
    let root = root.to_path_buf();
    let counts_for_connector = Arc::clone(&counts);
    let connector: Connector = Arc::new(move || {
        let root = root.clone();
        let counts = Arc::clone(&counts_for_connector);
        Box::pin(async move {
            let (ours, theirs) = pair();
            tokio::spawn(serve_channel(Box::new(theirs), config_for(&root)));
            Ok(Box::new(CountingChannel::new(ours, counts)) as Box<dyn Channel>)
        })
    });
    (SftpMount::new(connector, options), counts)
}

#[tokio::test]
async fn handshake_negotiates_features() {
    let dir = tempfile::tempdir().unwrap();
    let (client, counts) = session(config_for(dir.path())).await;
    let features = client.features();
    assert!(features.posix_rename);
    assert!(features.hardlink);
    assert!(features.statvfs);
    assert!(features.copy_data);
    assert!(features.check_file_handle);
    assert_eq!(sent(&counts, PacketType::Init), 1);
    client.end();
}

#[tokio::test]
async fn file_roundtrip_over_session() {
    let dir = tempfile::tempdir().unwrap();
    let (client, _) = session(config_for(dir.path())).await;

    let h = client
        .open(
            "/notes.txt",
            open_flags::READ | open_flags::WRITE | open_flags::CREAT,
            &FileAttrs::default(),
        )
        .await
        .unwrap();
    client.write(h, 0, b"first line\n").await.unwrap();
    let attrs = client.fstat(h).await.unwrap();
    assert_eq!(attrs.size, Some(11));
    assert_eq!(client.read(h, 6, 4).await.unwrap(), b"line");
    client.close(h).await.unwrap();

    assert_eq!(
        std::fs::read(dir.path().join("notes.txt")).unwrap(),
        b"first line\n"
    );

    // A read that lands at EOF yields empty bytes, not an error.
    let h = client
        .open("/notes.txt", open_flags::READ, &FileAttrs::default())
        .await
        .unwrap();
    assert!(client.read(h, 11, 64).await.unwrap().is_empty());
    client.close(h).await.unwrap();
    client.end();
}

#[tokio::test]
async fn oversized_transfers_rejected_before_sending() {
    let dir = tempfile::tempdir().unwrap();
    let (client, counts) = session(config_for(dir.path())).await;

    let h = client
        .open(
            "/big",
            open_flags::READ | open_flags::WRITE | open_flags::CREAT,
            &FileAttrs::default(),
        )
        .await
        .unwrap();

    let err = client.read(h, 0, 1024 * 1024 + 1).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Io);
    let err = client
        .write(h, 0, &vec![0u8; 1024 * 1024 + 1])
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Io);
    assert_eq!(sent(&counts, PacketType::Read), 0);
    assert_eq!(sent(&counts, PacketType::Write), 0);

    // Zero-length reads complete locally.
    assert!(client.read(h, 0, 0).await.unwrap().is_empty());
    assert_eq!(sent(&counts, PacketType::Read), 0);

    client.close(h).await.unwrap();
    client.end();
}

#[tokio::test]
async fn responses_correlate_out_of_order() {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..8 {
        std::fs::write(dir.path().join(format!("f{}", i)), format!("content-{}", i)).unwrap();
    }
    let (client, _) = session(config_for(dir.path())).await;

    let mut tasks = Vec::new();
    for i in 0..8 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let path = format!("/f{}", i);
            let h = client
                .open(&path, open_flags::READ, &FileAttrs::default())
                .await
                .unwrap();
            let data = client.read(h, 0, 64).await.unwrap();
            client.close(h).await.unwrap();
            (i, data)
        }));
    }
    for task in tasks {
        let (i, data) = task.await.unwrap();
        assert_eq!(data, format!("content-{}", i).as_bytes());
    }
    client.end();
}

#[tokio::test]
async fn jail_keeps_paths_under_virtual_root() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("etc")).unwrap();
    std::fs::write(dir.path().join("etc/passwd"), b"jailed").unwrap();
    let (client, _) = session(config_for(dir.path())).await;

    // "/../etc/passwd" resolves inside the root, not the host's /etc.
    let attrs = client.stat("/../etc/passwd").await.unwrap();
    assert_eq!(attrs.size, Some(6));
    assert_eq!(client.realpath("/..").await.unwrap(), "/");
    assert_eq!(client.realpath("/etc").await.unwrap(), "/etc");
    client.end();
}

#[tokio::test]
async fn read_only_session_refuses_mutation() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("f"), b"x").unwrap();
    let config = SessionConfig {
        read_only: true,
        ..config_for(dir.path())
    };
    let (client, _) = session(config).await;

    let err = client
        .open("/f", open_flags::WRITE, &FileAttrs::default())
        .await
        .unwrap_err();
    assert!(err.message.contains("read-only"));
    let err = client.unlink("/f").await.unwrap_err();
    assert!(err.message.contains("read-only"));
    let err = client.mkdir("/d", &FileAttrs::default()).await.unwrap_err();
    assert!(err.message.contains("read-only"));

    // The filesystem is untouched.
    assert!(dir.path().join("f").exists());
    assert!(!dir.path().join("d").exists());
    client.end();
}

#[tokio::test]
async fn hidden_ownership_never_crosses_the_wire() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("f"), b"x").unwrap();
    let config = SessionConfig {
        hide_uid_gid: true,
        ..config_for(dir.path())
    };
    let (client, _) = session(config).await;

    let attrs = client.lstat("/f").await.unwrap();
    assert_eq!(attrs.uid, None);
    assert_eq!(attrs.gid, None);

    let dh = client.opendir("/").await.unwrap();
    let items = client.readdir(dh).await.unwrap();
    assert!(items.iter().all(|i| i.attrs.uid.is_none()));
    client.close(dh).await.unwrap();
    client.end();
}

#[tokio::test]
async fn extended_operations_over_the_wire() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a"), b"0123456789").unwrap();
    let (client, _) = session(config_for(dir.path())).await;

    // statvfs
    let st = client.statvfs("/").await.unwrap();
    assert!(st.bsize > 0);

    // hardlink
    client.link("/a", "/a2").await.unwrap();
    assert_eq!(client.stat("/a2").await.unwrap().size, Some(10));

    // posix rename over an existing target
    std::fs::write(dir.path().join("target"), b"old").unwrap();
    client.rename("/a2", "/target", RENAME_OVERWRITE).await.unwrap();
    assert_eq!(
        std::fs::read(dir.path().join("target")).unwrap(),
        b"0123456789"
    );

    // copy-data and check-file-handle
    let src = client
        .open("/a", open_flags::READ, &FileAttrs::default())
        .await
        .unwrap();
    let dst = client
        .open(
            "/copy",
            open_flags::READ | open_flags::WRITE | open_flags::CREAT,
            &FileAttrs::default(),
        )
        .await
        .unwrap();
    client.fcopy(src, 2, 4, dst, 0).await.unwrap();
    assert_eq!(client.read(dst, 0, 16).await.unwrap(), b"2345");

    let (alg, digest) = client.fhash(src, "sha256", 0, 10, 10).await.unwrap();
    assert_eq!(alg, "sha256");
    assert_eq!(digest.len(), 32);

    client.close(src).await.unwrap();
    client.close(dst).await.unwrap();
    client.end();
}

#[tokio::test]
async fn symlink_and_readlink_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("real"), b"x").unwrap();
    let (client, _) = session(config_for(dir.path())).await;

    client.symlink("real", "/alias").await.unwrap();
    assert_eq!(client.readlink("/alias").await.unwrap(), "real");
    let attrs = client.lstat("/alias").await.unwrap();
    assert!(attrs.is_symlink());
    client.end();
}

#[tokio::test]
async fn teardown_fails_outstanding_and_future_calls() {
    let dir = tempfile::tempdir().unwrap();
    let (client, _) = session(config_for(dir.path())).await;
    client.end();

    let mut closed = client.closed();
    let _ = closed.wait_for(|c| *c).await;
    let err = client.lstat("/x").await.unwrap_err();
    assert!(matches!(
        err.code,
        ErrorCode::NotConn | ErrorCode::Shutdown
    ));
}

// Scenario: rename with OVERWRITE against a peer whose VERSION carried no
// extensions fails locally with ENOSYS and sends nothing.
#[tokio::test]
async fn overwrite_rename_requires_posix_rename() {
    let (ours, mut theirs) = pair();
    tokio::spawn(async move {
        // Minimal peer: answer INIT with a bare VERSION, then go silent.
        let _init = theirs.recv().await;
        let mut w = PacketWriter::new(PacketType::Version);
        w.write_u32(SFTP_VERSION);
        theirs.send(w.finish()).await.unwrap();
        // Hold the channel open.
        loop {
            match theirs.recv().await {
                Some(Ok(frame)) => panic!("unexpected packet type {}", frame[4]),
                _ => break,
            }
        }
    });

    let counts = Arc::new(Mutex::new(HashMap::new()));
    let channel = CountingChannel::new(ours, Arc::clone(&counts));
    let client = SftpClient::bind(Box::new(channel)).await.unwrap();
    assert!(!client.features().posix_rename);

    let err = client.rename("/a", "/b", RENAME_OVERWRITE).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NoSys);
    let err = client.rename("/a", "/b", 99).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NoSys);
    assert_eq!(sent(&counts, PacketType::Extended), 0);
    assert_eq!(sent(&counts, PacketType::Rename), 0);
    client.end();
}

// A zero-length DATA response is retried at most four times; the fifth
// attempt surfaces EIO.
#[tokio::test]
async fn zero_length_reads_retry_then_fail() {
    let (ours, mut theirs) = pair();
    tokio::spawn(async move {
        let _init = theirs.recv().await;
        let mut w = PacketWriter::new(PacketType::Version);
        w.write_u32(SFTP_VERSION);
        theirs.send(w.finish()).await.unwrap();
        while let Some(Ok(frame)) = theirs.recv().await {
            let id = u32::from_be_bytes(frame[5..9].try_into().unwrap());
            let response = match frame[4] {
                x if x == PacketType::Open as u8 => {
                    let mut w = PacketWriter::request(PacketType::Handle, id);
                    w.write_data(&1u32.to_be_bytes());
                    w.finish()
                }
                x if x == PacketType::Read as u8 => {
                    let mut w = PacketWriter::request(PacketType::Data, id);
                    w.write_data(&[]);
                    w.finish()
                }
                _ => continue,
            };
            theirs.send(response).await.unwrap();
        }
    });

    let counts = Arc::new(Mutex::new(HashMap::new()));
    let channel = CountingChannel::new(ours, Arc::clone(&counts));
    let client = SftpClient::bind(Box::new(channel)).await.unwrap();

    let h = client
        .open("/f", open_flags::READ, &FileAttrs::default())
        .await
        .unwrap();
    let err = client.read(h, 0, 128).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Io);
    assert_eq!(sent(&counts, PacketType::Read), 5);
    client.end();
}

// A response naming an unknown request id is fatal for the channel.
#[tokio::test]
async fn unknown_response_id_kills_the_channel() {
    let (ours, mut theirs) = pair();
    tokio::spawn(async move {
        let _init = theirs.recv().await;
        let mut w = PacketWriter::new(PacketType::Version);
        w.write_u32(SFTP_VERSION);
        theirs.send(w.finish()).await.unwrap();
        // Unsolicited STATUS for an id nobody allocated.
        let mut w = PacketWriter::request(PacketType::Status, 0xDEAD);
        w.write_u32(0);
        w.write_string("");
        w.write_string("");
        theirs.send(w.finish()).await.unwrap();
    });

    let client = SftpClient::bind(Box::new(CountingChannel::new(
        ours,
        Arc::new(Mutex::new(HashMap::new())),
    )))
    .await
    .unwrap();

    let mut closed = client.closed();
    let _ = closed.wait_for(|c| *c).await;
    assert!(!client.is_alive());
}

// Scenario: two contiguous writes then flush arrive as one WRITE packet.
#[tokio::test]
async fn adapter_coalesces_contiguous_writes() {
    let dir = tempfile::tempdir().unwrap();
    let (mount, counts) = mount_for(dir.path(), MountOptions::default());
    mount.connect().await.unwrap();

    let fd = mount.create("/f", 0o644, libc::O_WRONLY).await.unwrap();
    mount.write(fd, 0, b"hello").await.unwrap();
    mount.write(fd, 5, b" world").await.unwrap();
    mount.flush(fd).await.unwrap();

    assert_eq!(sent(&counts, PacketType::Write), 1);
    assert_eq!(
        std::fs::read(dir.path().join("f")).unwrap(),
        b"hello world"
    );
    mount.release(fd).await.unwrap();
    mount.end().await;
}

// Scenario: a cached listing answers the second readdir without reopening
// the directory; a zero TTL forces a fresh OPENDIR every time.
#[tokio::test]
async fn adapter_directory_cache_controls_wire_traffic() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a"), b"1").unwrap();

    let (mount, counts) = mount_for(dir.path(), MountOptions::default());
    mount.connect().await.unwrap();
    assert_eq!(mount.readdir("/").await.unwrap(), vec!["a"]);
    assert_eq!(mount.readdir("/").await.unwrap(), vec!["a"]);
    assert_eq!(sent(&counts, PacketType::Opendir), 1);
    mount.end().await;

    let options = MountOptions {
        cache_timeout: 0,
        ..Default::default()
    };
    let (mount, counts) = mount_for(dir.path(), options);
    mount.connect().await.unwrap();
    let _ = mount.readdir("/").await.unwrap();
    let _ = mount.readdir("/").await.unwrap();
    assert_eq!(sent(&counts, PacketType::Opendir), 2);
    mount.end().await;
}

// Scenario: a missing path is answered from the negative cache; the server
// sees a single LSTAT.
#[tokio::test]
async fn adapter_negative_cache_serves_repeat_lookups() {
    let dir = tempfile::tempdir().unwrap();
    let (mount, counts) = mount_for(dir.path(), MountOptions::default());
    mount.connect().await.unwrap();

    assert_eq!(mount.getattr("/nope").await.unwrap_err(), libc::ENOENT);
    assert_eq!(mount.getattr("/nope").await.unwrap_err(), libc::ENOENT);
    assert_eq!(sent(&counts, PacketType::Lstat), 1);
    mount.end().await;
}

#[tokio::test]
async fn forced_flush_past_fifty_records() {
    let dir = tempfile::tempdir().unwrap();
    let (mount, counts) = mount_for(dir.path(), MountOptions::default());
    mount.connect().await.unwrap();

    let fd = mount.create("/f", 0o644, libc::O_WRONLY).await.unwrap();
    // 51 one-byte contiguous writes trip the forced flush on the last one.
    for i in 0..51u64 {
        mount.write(fd, i, b"x").await.unwrap();
    }
    assert_eq!(sent(&counts, PacketType::Write), 1);
    mount.release(fd).await.unwrap();
    assert_eq!(std::fs::read(dir.path().join("f")).unwrap().len(), 51);
    mount.end().await;
}

#[tokio::test]
async fn search_runs_against_a_live_session() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("top.log"), b"x").unwrap();
    std::fs::write(dir.path().join("sub/inner.log"), b"x").unwrap();
    std::fs::write(dir.path().join("sub/other.txt"), b"x").unwrap();
    let (client, _) = session(config_for(dir.path())).await;

    let hits = wsftp::util::search::search(&client, "/", "**/*.log")
        .await
        .unwrap();
    let paths: Vec<&str> = hits.iter().map(|m| m.path.as_str()).collect();
    assert_eq!(paths, vec!["/sub/inner.log", "/top.log"]);
    client.end();
}
