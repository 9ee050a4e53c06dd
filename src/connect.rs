//! Remote hosts, the per-host session cache, and connection setup.
//!
//! Each [`Remote`] owns at most one live [`Session`], created lazily on the
//! first operation that routes to it. Connection attempts serialize behind
//! the remote's lock, so concurrent callers all observe the same session (or
//! the same failure). On session failure the watchdog clears the cache entry
//! and the next operation transparently reconnects.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::UnixStream;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::client::{FsClient, FsError};
use crate::config::{Config, RemoteConfig, SessionConfig};
use crate::mux;
use crate::pool::MsgPool;
use crate::proto::{Port, HANDSHAKE, MAX_MSG};
use crate::session::{run_watchdog, Session};

/// Errors from connection setup.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The transport command could not be spawned.
    #[error("cannot spawn remote process: {0}")]
    Spawn(#[source] io::Error),
    /// The remote never produced the handshake marker.
    #[error("handshake failed: {0}")]
    Handshake(#[source] io::Error),
    /// A local service socket could not be dialed.
    #[error("could not connect service {service}: {source}")]
    Dial {
        /// Port label.
        service: &'static str,
        /// Underlying error.
        source: io::Error,
    },
    /// A session service could not be mounted.
    #[error("could not mount {service} service: {source}")]
    Mount {
        /// Port label.
        service: &'static str,
        /// Underlying error.
        source: FsError,
    },
}

/// A configured remote host: identity, routed prefixes, and the cached
/// session.
pub struct Remote {
    host: String,
    prefixes: Vec<String>,
    command: Vec<String>,
    server: String,
    namespace: PathBuf,
    pool: Arc<MsgPool>,
    cached: Mutex<Option<Arc<Session>>>,
}

impl Remote {
    /// Build a remote from its configuration.
    pub fn new(
        remote: &RemoteConfig,
        session: &SessionConfig,
        pool: Arc<MsgPool>,
    ) -> Arc<Remote> {
        Arc::new(Remote {
            host: remote.host.clone(),
            prefixes: remote.prefixes.clone(),
            command: remote.command.clone(),
            server: session.server.clone(),
            namespace: session.namespace.clone(),
            pool,
            cached: Mutex::new(None),
        })
    }

    /// Host identifier.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Whether any registered prefix is a literal prefix of `path`.
    pub fn matches(&self, path: &str) -> bool {
        self.prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }

    /// Drop the cache entry if it still points at `session`. Called by the
    /// watchdog when the session fails, so the next operation reconnects.
    pub(crate) async fn forget(&self, session: &Arc<Session>) {
        let mut cached = self.cached.lock().await;
        if cached.as_ref().is_some_and(|s| Arc::ptr_eq(s, session)) {
            *cached = None;
        }
    }

    #[cfg(test)]
    pub(crate) async fn install(&self, session: Arc<Session>) {
        *self.cached.lock().await = Some(session);
    }

    /// Get the live session, connecting if there is none. On success one
    /// reference is credited to the caller; release it with
    /// [`Session::close`].
    pub async fn connect(self: &Arc<Self>) -> Result<Arc<Session>, ConnectError> {
        let mut cached = self.cached.lock().await;
        if let Some(session) = cached.as_ref() {
            session.addref();
            return Ok(session.clone());
        }

        info!(host = %self.host, "connecting");
        let argv = if self.command.is_empty() {
            vec!["ssh".to_string(), self.host.clone(), self.server.clone()]
        } else {
            self.command.clone()
        };

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        // Its own process group, so killing the session cannot signal the
        // editor's group.
        // SAFETY: setpgid is async-signal-safe per POSIX.
        unsafe {
            cmd.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }
        let mut child = cmd.spawn().map_err(ConnectError::Spawn)?;
        let pid = child.id().map(|p| p as i32);
        let mut transport_rd = child.stdout.take().expect("stdout is piped");
        let transport_wr = child.stdin.take().expect("stdin is piped");

        if let Err(e) = read_handshake(&mut transport_rd, &self.host).await {
            warn!(host = %self.host, "remote process produced no handshake: {e}");
            let _ = child.start_kill();
            return Err(ConnectError::Handshake(e));
        }

        let session = establish(
            &self.host,
            Some(self.clone()),
            &self.pool,
            &self.namespace,
            transport_rd,
            transport_wr,
            pid,
        )
        .await?;

        // The transport process holds one reference; its exit is a session
        // error like any other transport failure.
        session.addref();
        let watcher = session.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => watcher.error(format!("remote process exited: {status}")),
                Err(e) => watcher.error(format!("remote process wait failed: {e}")),
            }
        });

        *cached = Some(session.clone());
        info!(host = %self.host, "connected");
        Ok(session)
    }
}

/// Scan the transport for the literal handshake marker, logging whatever the
/// remote printed before it (motd noise, shell banners).
pub(crate) async fn read_handshake<R>(r: &mut R, host: &str) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut window = [0u8; 2];
    let mut preamble = Vec::new();
    r.read_exact(&mut window[..1]).await?;
    loop {
        r.read_exact(&mut window[1..2]).await?;
        if window[..] == *HANDSHAKE {
            break;
        }
        if preamble.len() < 4096 {
            preamble.push(window[0]);
        }
        window[0] = window[1];
    }
    if !preamble.is_empty() {
        warn!(
            host,
            "discarding {} bytes before handshake: {}",
            preamble.len(),
            String::from_utf8_lossy(&preamble)
        );
    }
    Ok(())
}

/// Wire the full port topology over an established transport and mount the
/// session services. Used by [`Remote::connect`] once the handshake is done;
/// also lets tests run a whole session over in-memory streams.
pub(crate) async fn establish<R, W>(
    host: &str,
    remote: Option<Arc<Remote>>,
    pool: &Arc<MsgPool>,
    namespace: &Path,
    transport_rd: R,
    transport_wr: W,
    remote_pid: Option<i32>,
) -> Result<Arc<Session>, ConnectError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (session, watchdog) = Session::new(host);
    tokio::spawn(run_watchdog(watchdog, session.clone(), remote, remote_pid));
    // Connect-in-progress reference: pre-credited so the error paths below
    // can report a failure that is backed by a reference. On success it
    // becomes the reference returned to the caller.
    session.addref();

    let (out_tx, out_rx) = mpsc::channel(1);
    let mut inbound = Vec::with_capacity(Port::COUNT);
    let mut app_export = None;
    let mut app_cmd = None;

    for port in Port::ALL {
        let (in_tx, in_rx) = mpsc::channel(1);
        inbound.push(in_tx);
        match port {
            Port::Export | Port::Cmd => {
                let (app, mux_end) = tokio::io::duplex(MAX_MSG * 4);
                if port == Port::Export {
                    app_export = Some(app);
                } else {
                    app_cmd = Some(app);
                }
                let (rd, wr) = tokio::io::split(mux_end);
                mux::spawn_writer(&session, pool, format!("mux->{}", port.label()), in_rx, wr);
                mux::spawn_port_reader(
                    &session,
                    pool,
                    format!("{}->mux", port.label()),
                    rd,
                    port,
                    out_tx.clone(),
                );
            }
            Port::Plumb | Port::Editor => {
                match UnixStream::connect(namespace.join(port.label())).await {
                    Ok(stream) => {
                        let (rd, wr) = stream.into_split();
                        mux::spawn_writer(
                            &session,
                            pool,
                            format!("mux->{}", port.label()),
                            in_rx,
                            wr,
                        );
                        mux::spawn_port_reader(
                            &session,
                            pool,
                            format!("{}->mux", port.label()),
                            rd,
                            port,
                            out_tx.clone(),
                        );
                    }
                    Err(e) => {
                        session.error(format!(
                            "could not connect service {}: {e}",
                            port.label()
                        ));
                        return Err(ConnectError::Dial {
                            service: port.label(),
                            source: e,
                        });
                    }
                }
            }
        }
    }
    drop(out_tx);

    mux::spawn_demux(&session, pool, "remote->mux".to_string(), transport_rd, inbound);
    mux::spawn_writer(&session, pool, "mux->remote".to_string(), out_rx, transport_wr);

    let export = app_export.expect("export endpoint");
    match FsClient::mount(export, Port::Export.label()).await {
        Ok(client) => session.set_fs(client),
        Err(e) => {
            session.error(format!("could not mount export service: {e}"));
            return Err(ConnectError::Mount {
                service: Port::Export.label(),
                source: e,
            });
        }
    }
    let cmd = app_cmd.expect("cmd endpoint");
    match FsClient::mount(cmd, Port::Cmd.label()).await {
        Ok(client) => session.set_cmd(client),
        Err(e) => {
            session.error(format!("could not mount cmd service: {e}"));
            return Err(ConnectError::Mount {
                service: Port::Cmd.label(),
                source: e,
            });
        }
    }
    Ok(session)
}

/// The set of configured remotes plus the shared message pool.
pub struct RemoteTable {
    remotes: Vec<Arc<Remote>>,
    pass_env: Vec<String>,
    pool: Arc<MsgPool>,
}

impl RemoteTable {
    /// Build the table from configuration.
    pub fn new(config: &Config) -> RemoteTable {
        let pool = Arc::new(MsgPool::new());
        let remotes = config
            .remotes
            .iter()
            .map(|r| Remote::new(r, &config.session, pool.clone()))
            .collect();
        RemoteTable {
            remotes,
            pass_env: config.session.pass_env.clone(),
            pool,
        }
    }

    /// The remote whose prefix set matches `path`, if any.
    pub fn lookup(&self, path: &str) -> Option<Arc<Remote>> {
        self.remotes.iter().find(|r| r.matches(path)).cloned()
    }

    /// All configured remotes.
    pub fn remotes(&self) -> &[Arc<Remote>] {
        &self.remotes
    }

    /// The shared message pool.
    pub fn pool(&self) -> &Arc<MsgPool> {
        &self.pool
    }

    /// Resolve the configured pass-through environment from this process.
    pub fn pass_env(&self) -> Vec<(String, String)> {
        self.pass_env
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|v| (name.clone(), v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(prefixes: &[&str]) -> RemoteTable {
        let config = Config {
            remotes: vec![RemoteConfig {
                host: "dev1".into(),
                prefixes: prefixes.iter().map(|s| s.to_string()).collect(),
                command: Vec::new(),
            }],
            ..Config::default()
        };
        RemoteTable::new(&config)
    }

    #[test]
    fn prefix_lookup_is_literal() {
        let table = table_with(&["/n/dev1", "dev1:"]);
        assert!(table.lookup("/n/dev1/src/main.rs").is_some());
        assert!(table.lookup("dev1:/etc/hosts").is_some());
        assert!(table.lookup("/n/dev2/src").is_none());
        assert!(table.lookup("/home/me").is_none());
    }

    #[tokio::test]
    async fn handshake_skips_and_reports_preamble() {
        let (mut a, mut b) = tokio::io::duplex(256);
        tokio::io::AsyncWriteExt::write_all(&mut a, b"login banner\nOKrest")
            .await
            .unwrap();
        read_handshake(&mut b, "dev1").await.unwrap();
        // Bytes after the marker stay in the stream.
        let mut rest = [0u8; 4];
        tokio::io::AsyncReadExt::read_exact(&mut b, &mut rest)
            .await
            .unwrap();
        assert_eq!(&rest, b"rest");
    }

    #[tokio::test]
    async fn handshake_eof_is_an_error() {
        let (a, mut b) = tokio::io::duplex(256);
        drop(a);
        assert!(read_handshake(&mut b, "dev1").await.is_err());
    }

    #[tokio::test]
    async fn cache_hit_returns_the_same_session_without_spawning() {
        let config = Config::default();
        let pool = Arc::new(MsgPool::new());
        // A command that cannot spawn proves the cache path never exec's.
        let remote = Remote::new(
            &RemoteConfig {
                host: "dev1".into(),
                prefixes: vec!["/n/dev1".into()],
                command: vec!["/nonexistent/transport".into()],
            },
            &config.session,
            pool,
        );

        let (session, wd) = Session::new("dev1");
        tokio::spawn(crate::session::run_watchdog(wd, session.clone(), None, None));
        session.addref();
        remote.install(session.clone()).await;

        let a = remote.connect().await.unwrap();
        let b = remote.connect().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &session));

        a.close();
        b.close();
        session.close();
    }

    #[tokio::test]
    async fn full_session_reads_files_and_runs_commands() {
        use crate::proto::codec::OpenMode;

        let fixture = crate::testutil::in_process_session().await;
        std::fs::write(fixture.export_root.path().join("motd"), b"welcome\n").unwrap();

        let fs = fixture.session.fs_client().expect("export mounted");
        let file = fs.open("motd", OpenMode::Read).await.unwrap();
        assert_eq!(file.read_to_end().await.unwrap(), b"welcome\n");
        file.close().await;

        let cmd = fixture.session.cmd_client().expect("cmd mounted");
        let ctl = cmd.open("new/ctl", OpenMode::ReadWrite).await.unwrap();
        ctl.print("cmd echo over the mux").await.unwrap();
        ctl.print("start").await.unwrap();
        let stdout = cmd.open("1/stdout", OpenMode::Read).await.unwrap();
        assert_eq!(stdout.read_to_end().await.unwrap(), b"over the mux\n");
    }

    #[tokio::test]
    async fn remote_process_death_tears_down_within_bounded_time() {
        use crate::proto::codec::OpenMode;
        use std::time::Duration;

        let fixture = crate::testutil::in_process_session().await;
        let mut stop = fixture.session.stop_rx();

        // What the transport exit watcher reports when ssh dies.
        fixture
            .session
            .error("remote process exited: simulated".into());

        tokio::time::timeout(Duration::from_secs(2), stop.recv())
            .await
            .expect("teardown begins in bounded time")
            .unwrap();

        let fs = fixture.session.fs_client().expect("export mounted");
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            fs.open("anything", OpenMode::Read),
        )
        .await
        .expect("operations fail instead of hanging");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_as_an_error() {
        let config = Config::default();
        let pool = Arc::new(MsgPool::new());
        let remote = Remote::new(
            &RemoteConfig {
                host: "dev1".into(),
                prefixes: Vec::new(),
                command: vec!["/nonexistent/transport".into()],
            },
            &config.session,
            pool,
        );
        assert!(matches!(
            remote.connect().await,
            Err(ConnectError::Spawn(_))
        ));
    }
}
