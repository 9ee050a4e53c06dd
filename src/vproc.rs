//! Running commands locally or remotely through one interface.
//!
//! [`vshell`] spawns a shell command for the editor: locally through the
//! process collaborator, or remotely through the session's command service.
//! Either way the caller supplies three byte streams and receives a
//! [`VPid`]; relay tasks make the stdio plumbing symmetric, and the exit
//! message arrives on the caller's wait channel.

use std::cmp::Ordering;
use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::warn;

use crate::client::{FsError, FsFid};
use crate::connect::{ConnectError, Remote, RemoteTable};
use crate::proto::codec::{OpenMode, IOUNIT};
use crate::session::Session;
use crate::spawn;

/// Errors from command spawning.
#[derive(Debug, thiserror::Error)]
pub enum VprocError {
    /// Local process plumbing failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// The remote command service failed.
    #[error("remote error: {0}")]
    Fs(#[from] FsError),
    /// Connecting to the owning remote failed.
    #[error("connect error: {0}")]
    Connect(#[from] ConnectError),
    /// The session has no mounted command service.
    #[error("command service unavailable")]
    NoService,
    /// The ctl file returned an unparseable id line.
    #[error("bad id line from ctl")]
    BadId,
}

/// Identity of a spawned command: a local OS pid, or a session plus its
/// command id.
#[derive(Clone)]
pub struct VPid {
    /// Owning session; `None` for local processes.
    pub session: Option<Arc<Session>>,
    /// OS pid (local) or command id (remote).
    pub id: i64,
}

impl VPid {
    /// Total order by (session identity, id), for the editor's command list.
    pub fn compare(&self, other: &VPid) -> Ordering {
        let a = self.session.as_ref().map_or(std::ptr::null(), Arc::as_ptr) as usize;
        let b = other.session.as_ref().map_or(std::ptr::null(), Arc::as_ptr) as usize;
        a.cmp(&b).then(self.id.cmp(&other.id))
    }

    /// Whether two pids name the same command.
    pub fn same(&self, other: &VPid) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

/// Exit report for a spawned command.
pub struct VWaitMsg {
    /// Which command exited.
    pub vp: VPid,
    /// The wait text (`"<pid> <code>"`, or a failure description).
    pub msg: String,
}

/// Spawn `cmd` with the given stdio streams. `remote` selects the target;
/// `None` runs locally. The exit message is delivered on `waitc`.
pub async fn vshell<R, W, E>(
    table: &RemoteTable,
    remote: Option<&Arc<Remote>>,
    stdin: R,
    stdout: W,
    stderr: E,
    cmd: &str,
    dir: Option<&str>,
    waitc: mpsc::Sender<VWaitMsg>,
) -> Result<VPid, VprocError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    E: AsyncWrite + Unpin + Send + 'static,
{
    match remote {
        None => local_shell(stdin, stdout, stderr, cmd, dir, waitc),
        Some(remote) => {
            let session = remote.connect().await?;
            match remote_shell(
                session.clone(),
                &table.pass_env(),
                stdin,
                stdout,
                stderr,
                cmd,
                dir,
                waitc,
            )
            .await
            {
                Ok(vp) => Ok(vp),
                Err(e) => {
                    session.close();
                    Err(e)
                }
            }
        }
    }
}

fn local_shell<R, W, E>(
    stdin: R,
    stdout: W,
    stderr: E,
    cmd: &str,
    dir: Option<&str>,
    waitc: mpsc::Sender<VWaitMsg>,
) -> Result<VPid, VprocError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    E: AsyncWrite + Unpin + Send + 'static,
{
    let mut child = spawn::spawn_group("/bin/sh", cmd, dir, &[])?;
    let pid = child.id().map_or(-1, |p| i64::from(p));

    let mut child_in = child.stdin.take();
    let mut child_out = child.stdout.take();
    let mut child_err = child.stderr.take();

    tokio::spawn(async move {
        let mut stdin = stdin;
        if let Some(child_in) = child_in.as_mut() {
            let _ = tokio::io::copy(&mut stdin, child_in).await;
        }
        // Dropping the handle delivers end-of-input.
    });
    tokio::spawn(async move {
        let mut stdout = stdout;
        if let Some(child_out) = child_out.as_mut() {
            let _ = tokio::io::copy(child_out, &mut stdout).await;
        }
    });
    tokio::spawn(async move {
        let mut stderr = stderr;
        if let Some(child_err) = child_err.as_mut() {
            let _ = tokio::io::copy(child_err, &mut stderr).await;
        }
    });

    let vp = VPid { session: None, id: pid };
    let wait_vp = vp.clone();
    tokio::spawn(async move {
        let msg = match child.wait().await {
            Ok(status) => format!("{pid} {}", status.code().unwrap_or(-1)),
            Err(e) => format!("{pid} wait error: {e}"),
        };
        let _ = waitc.send(VWaitMsg { vp: wait_vp, msg }).await;
    });
    Ok(vp)
}

/// Start a command through a session's command service. Consumes the
/// caller's session reference on success (the returned [`VPid`] owns it).
pub(crate) async fn remote_shell<R, W, E>(
    session: Arc<Session>,
    env: &[(String, String)],
    stdin: R,
    stdout: W,
    stderr: E,
    cmd: &str,
    dir: Option<&str>,
    waitc: mpsc::Sender<VWaitMsg>,
) -> Result<VPid, VprocError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    E: AsyncWrite + Unpin + Send + 'static,
{
    let fsys = session.cmd_client().ok_or(VprocError::NoService)?;

    let ctl = fsys.open("new/ctl", OpenMode::ReadWrite).await?;
    let id = match configure(&ctl, env, cmd, dir).await {
        Ok(id) => id,
        Err(e) => {
            ctl.close().await;
            return Err(e);
        }
    };

    let fid_in = match fsys.open(&format!("{id}/stdin"), OpenMode::Write).await {
        Ok(fid) => fid,
        Err(e) => {
            ctl.close().await;
            return Err(e.into());
        }
    };
    let fid_out = match fsys.open(&format!("{id}/stdout"), OpenMode::Read).await {
        Ok(fid) => fid,
        Err(e) => {
            fid_in.close().await;
            ctl.close().await;
            return Err(e.into());
        }
    };
    let fid_err = match fsys.open(&format!("{id}/stderr"), OpenMode::Read).await {
        Ok(fid) => fid,
        Err(e) => {
            fid_out.close().await;
            fid_in.close().await;
            ctl.close().await;
            return Err(e.into());
        }
    };

    if let Err(e) = ctl.print("start").await {
        fid_err.close().await;
        fid_out.close().await;
        fid_in.close().await;
        ctl.close().await;
        return Err(e.into());
    }

    tokio::spawn(out_relay(stdin, fid_in, ctl));
    tokio::spawn(in_relay(fid_out, stdout));
    tokio::spawn(in_relay(fid_err, stderr));

    let vp = VPid {
        session: Some(session),
        id: i64::from(id),
    };
    let wait_vp = vp.clone();
    tokio::spawn(async move {
        match fsys.open(&format!("{id}/wait"), OpenMode::Read).await {
            Ok(fid) => {
                let msg = fid
                    .read_string()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                fid.close().await;
                let _ = waitc.send(VWaitMsg { vp: wait_vp, msg }).await;
            }
            Err(e) => warn!("cannot wait for remote command {id}: {e}"),
        }
    });
    Ok(vp)
}

// Send the configuration writes that must precede start, and read back the
// assigned id.
async fn configure(
    ctl: &FsFid,
    env: &[(String, String)],
    cmd: &str,
    dir: Option<&str>,
) -> Result<u32, VprocError> {
    let line = String::from_utf8_lossy(&ctl.read(64).await?).into_owned();
    let id: u32 = line
        .split_whitespace()
        .next()
        .and_then(|t| t.parse().ok())
        .ok_or(VprocError::BadId)?;

    ctl.print(&format!("cmd {cmd}")).await?;
    for (name, value) in env {
        ctl.print(&format!("env {name}={value}")).await?;
    }
    if let Some(dir) = dir {
        ctl.print(&format!("dir {dir}")).await?;
    }
    Ok(id)
}

// Local stream -> remote stdin; at end-of-input, tell the command service.
async fn out_relay<R>(mut stdin: R, fid: FsFid, ctl: FsFid)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 1024];
    loop {
        let n = match stdin.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if fid.write(&buf[..n]).await.is_err() {
            break;
        }
    }
    let _ = ctl.print("eof").await;
    fid.close().await;
    ctl.close().await;
}

// Remote stdout/stderr -> local stream.
async fn in_relay<W>(fid: FsFid, mut out: W)
where
    W: AsyncWrite + Unpin,
{
    loop {
        match fid.read(IOUNIT).await {
            Ok(data) if data.is_empty() => break,
            Ok(data) => {
                if out.write_all(&data).await.is_err() {
                    break;
                }
                let _ = out.flush().await;
            }
            Err(_) => break,
        }
    }
    fid.close().await;
}

/// Deliver a note to a command, local or remote.
pub async fn vpostnote(vp: &VPid, note: &str) -> Result<(), VprocError> {
    match &vp.session {
        None => Ok(spawn::post_note(vp.id as i32, note)?),
        Some(session) => {
            let fsys = session.cmd_client().ok_or(VprocError::NoService)?;
            let ctl = fsys.open(&format!("{}/ctl", vp.id), OpenMode::Write).await?;
            let result = ctl.print(&format!("note {note}")).await;
            ctl.close().await;
            Ok(result?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testutil::in_process_session;
    use std::time::Duration;

    fn empty_table() -> RemoteTable {
        RemoteTable::new(&Config::default())
    }

    #[tokio::test]
    async fn local_vshell_relays_stdio_and_reports_exit() {
        let table = empty_table();
        let (mut stdin_feed, stdin) = tokio::io::duplex(1024);
        let (stdout, mut stdout_view) = tokio::io::duplex(1024);
        let (stderr, _stderr_view) = tokio::io::duplex(1024);
        let (wait_tx, mut wait_rx) = mpsc::channel(1);

        let vp = vshell(&table, None, stdin, stdout, stderr, "cat", None, wait_tx)
            .await
            .unwrap();
        assert!(vp.session.is_none());

        stdin_feed.write_all(b"through the shell\n").await.unwrap();
        drop(stdin_feed);

        let mut buf = vec![0u8; 64];
        let n = stdout_view.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"through the shell\n");

        let wait = tokio::time::timeout(Duration::from_secs(5), wait_rx.recv())
            .await
            .expect("wait message arrives")
            .unwrap();
        assert!(wait.msg.ends_with(" 0"), "{}", wait.msg);
        assert!(wait.vp.same(&vp));
    }

    #[tokio::test]
    async fn remote_vshell_runs_through_the_session() {
        let fixture = in_process_session().await;
        let session = fixture.session.clone();
        session.addref(); // the reference remote_shell consumes

        let (stdin_feed, stdin) = tokio::io::duplex(1024);
        let (stdout, mut stdout_view) = tokio::io::duplex(1024);
        let (stderr, _stderr_view) = tokio::io::duplex(1024);
        let (wait_tx, mut wait_rx) = mpsc::channel(1);

        let vp = remote_shell(
            session,
            &[("GREETING".to_string(), "hi from afar".to_string())],
            stdin,
            stdout,
            stderr,
            "echo $GREETING",
            None,
            wait_tx,
        )
        .await
        .unwrap();
        assert!(vp.session.is_some());
        drop(stdin_feed);

        let mut buf = vec![0u8; 64];
        let n = stdout_view.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hi from afar\n");

        let wait = tokio::time::timeout(Duration::from_secs(5), wait_rx.recv())
            .await
            .expect("wait message arrives")
            .unwrap();
        assert!(wait.msg.ends_with(" 0"), "{}", wait.msg);
    }

    #[tokio::test]
    async fn vpostnote_remote_interrupts_a_running_command() {
        let fixture = in_process_session().await;
        let session = fixture.session.clone();
        session.addref();

        let (_stdin_feed, stdin) = tokio::io::duplex(64);
        let (stdout, _stdout_view) = tokio::io::duplex(64);
        let (stderr, _stderr_view) = tokio::io::duplex(64);
        let (wait_tx, mut wait_rx) = mpsc::channel(1);

        let vp = remote_shell(
            session,
            &[],
            stdin,
            stdout,
            stderr,
            "sleep 30",
            None,
            wait_tx,
        )
        .await
        .unwrap();

        vpostnote(&vp, "kill").await.unwrap();
        let wait = tokio::time::timeout(Duration::from_secs(5), wait_rx.recv())
            .await
            .expect("killed command reports exit")
            .unwrap();
        assert!(wait.msg.ends_with(" -1"), "{}", wait.msg);
    }
}
