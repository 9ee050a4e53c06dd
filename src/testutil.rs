//! In-process session plumbing shared by integration-style tests: a real
//! editor-side session and a real remote-side serve loop, joined by an
//! in-memory transport instead of an ssh-spawned process.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::UnixListener;

use crate::connect::{establish, read_handshake};
use crate::pool::MsgPool;
use crate::proto::MAX_MSG;
use crate::session::Session;
use crate::srv::cmdfs::{CmdFs, CmdRegistry};
use crate::srv::exportfs::ExportFs;
use crate::srv::serve_mux;

/// A live in-process session plus everything that must stay alive with it.
pub(crate) struct SessionFixture {
    pub session: Arc<Session>,
    pub registry: Arc<CmdRegistry>,
    /// Root directory served by the export service.
    pub export_root: tempfile::TempDir,
    _ns_local: tempfile::TempDir,
    _ns_remote: tempfile::TempDir,
    /// Abort to simulate the remote process dying.
    pub server: tokio::task::JoinHandle<()>,
}

/// Stand up the full topology: local plumb/editor listeners, the remote-side
/// multiplexed server, and an established session over a duplex transport.
pub(crate) async fn in_process_session() -> SessionFixture {
    let ns_local = tempfile::tempdir().expect("local namespace");
    let ns_remote = tempfile::tempdir().expect("remote namespace");
    let export_root = tempfile::tempdir().expect("export root");
    let pool = Arc::new(MsgPool::new());

    // Local services the session dials at setup.
    for label in ["plumb", "editor"] {
        let listener = UnixListener::bind(ns_local.path().join(label)).expect("bind");
        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 256];
                    while matches!(conn.read(&mut buf).await, Ok(n) if n > 0) {}
                });
            }
        });
    }

    let (editor_io, remote_io) = tokio::io::duplex(MAX_MSG * 8);

    let registry = CmdRegistry::new("/bin/sh");
    let export = ExportFs::new(export_root.path());
    let cmd = CmdFs::new(registry.clone());
    let (remote_rd, remote_wr) = tokio::io::split(remote_io);
    let ns = ns_remote.path().to_path_buf();
    let server_pool = pool.clone();
    let server = tokio::spawn(async move {
        let _ = serve_mux(remote_rd, remote_wr, export, cmd, &ns, server_pool).await;
    });

    let (mut editor_rd, editor_wr) = tokio::io::split(editor_io);
    read_handshake(&mut editor_rd, "testhost")
        .await
        .expect("handshake");
    let session = establish(
        "testhost",
        None,
        &pool,
        ns_local.path(),
        editor_rd,
        editor_wr,
        None,
    )
    .await
    .expect("establish session");

    SessionFixture {
        session,
        registry,
        export_root,
        _ns_local: ns_local,
        _ns_remote: ns_remote,
        server,
    }
}
