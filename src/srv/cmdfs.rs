//! The command filesystem: one directory per spawned process.
//!
//! Walking into `new` allocates a command and lands the fid in its
//! directory:
//!
//! ```text
//! /
//! /new            allocate a command, rebind to its directory
//! /<id>/ctl       control file; reads back "id pid"
//! /<id>/stdin     write-only
//! /<id>/stdout    read-only
//! /<id>/stderr    read-only
//! /<id>/wait      read-only, blocks until the process exits
//! ```
//!
//! A command's life is reference counted: it starts at 2 (the creating fid
//! and the pending exit delivery), every walk that resolves to it adds one,
//! every walk away, fid clunk, or `del` removes one. At zero it leaves the
//! registry and its pipes close. Ids are session-scoped and never reused.
//!
//! Reading the root directory does not enumerate live ids; walking to a
//! numeric name still works, only the listing is incomplete.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::warn;

use super::{iounit, synthetic_stat, FileService, Reply, SrvResult};
use crate::proto::codec::{OpenMode, Qid, Stat, IOUNIT, QID_APPEND, QID_DIR};
use crate::spawn;

/// Exit report delivered on a command's wait channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitStatus {
    /// OS pid, or -1 when the process never started.
    pub pid: i32,
    /// Exit code rendered as text, or a failure description.
    pub text: String,
}

impl WaitStatus {
    fn render(&self) -> String {
        format!("{} {}", self.pid, self.text)
    }
}

struct CmdConfig {
    body: String,
    dir: Option<String>,
    env: Vec<(String, String)>,
}

/// One command: configuration accumulated through ctl writes, then a spawned
/// process once `start` arrives.
pub struct Cmd {
    /// Session-scoped id, also the directory name.
    pub id: u32,
    pid: AtomicI32,
    cfg: Mutex<CmdConfig>,
    // Flips to true when start is processed (successfully or not), waking
    // reads that arrived before the pipes existed.
    started: watch::Sender<bool>,
    stdin: AsyncMutex<Option<ChildStdin>>,
    stdout: AsyncMutex<Option<ChildStdout>>,
    stderr: AsyncMutex<Option<ChildStderr>>,
    wait: watch::Sender<Option<WaitStatus>>,
}

impl Cmd {
    fn new(id: u32) -> Arc<Cmd> {
        Arc::new(Cmd {
            id,
            pid: AtomicI32::new(-1),
            cfg: Mutex::new(CmdConfig {
                body: String::new(),
                dir: None,
                env: Vec::new(),
            }),
            started: watch::channel(false).0,
            stdin: AsyncMutex::new(None),
            stdout: AsyncMutex::new(None),
            stderr: AsyncMutex::new(None),
            wait: watch::channel(None).0,
        })
    }

    /// Current pid, -1 before start.
    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::Relaxed)
    }

    fn upsert_env(&self, name: &str, value: &str) {
        let mut cfg = self.cfg.lock().expect("command lock poisoned");
        if let Some(entry) = cfg.env.iter_mut().find(|(n, _)| n == name) {
            entry.1 = value.to_string();
        } else {
            cfg.env.push((name.to_string(), value.to_string()));
        }
    }

    // Release process resources. Readers parked on the started watch wake
    // and observe the missing pipes as end-of-file.
    async fn release(&self) {
        self.stdin.lock().await.take();
        self.stdout.lock().await.take();
        self.stderr.lock().await.take();
        self.started.send_replace(true);
    }
}

struct CmdSlot {
    cmd: Arc<Cmd>,
    refs: u32,
}

struct RegistryInner {
    cmds: HashMap<u32, CmdSlot>,
    next_id: u32,
}

/// The live-command registry: owns every command's reference count and the
/// id allocator. One per served session; injected into [`CmdFs`].
pub struct CmdRegistry {
    shell: String,
    inner: Mutex<RegistryInner>,
}

impl CmdRegistry {
    /// Create a registry whose commands run under `shell -c`.
    pub fn new(shell: &str) -> Arc<CmdRegistry> {
        Arc::new(CmdRegistry {
            shell: shell.to_string(),
            inner: Mutex::new(RegistryInner {
                cmds: HashMap::new(),
                next_id: 0,
            }),
        })
    }

    fn create(&self) -> Arc<Cmd> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.next_id += 1;
        let id = inner.next_id;
        let cmd = Cmd::new(id);
        // One reference for the creating fid, one held until the exit
        // status is delivered.
        inner.cmds.insert(
            id,
            CmdSlot {
                cmd: cmd.clone(),
                refs: 2,
            },
        );
        cmd
    }

    fn lookup(&self, id: u32) -> Option<Arc<Cmd>> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let slot = inner.cmds.get_mut(&id)?;
        slot.refs += 1;
        Some(slot.cmd.clone())
    }

    fn incref(&self, id: u32) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if let Some(slot) = inner.cmds.get_mut(&id) {
            slot.refs += 1;
        }
    }

    fn decref(&self, id: u32) {
        let released = {
            let mut inner = self.inner.lock().expect("registry lock poisoned");
            let Some(slot) = inner.cmds.get_mut(&id) else {
                return;
            };
            slot.refs -= 1;
            if slot.refs > 0 {
                return;
            }
            inner.cmds.remove(&id).map(|slot| slot.cmd)
        };
        if let Some(cmd) = released {
            tokio::spawn(async move { cmd.release().await });
        }
    }

    fn deliver_exit(&self, id: u32, status: WaitStatus) {
        let cmd = {
            let inner = self.inner.lock().expect("registry lock poisoned");
            inner.cmds.get(&id).map(|slot| slot.cmd.clone())
        };
        if let Some(cmd) = cmd {
            cmd.wait.send_replace(Some(status));
            // The reference credited for the exit delivery.
            self.decref(id);
        }
    }

    /// Number of live commands (diagnostics and tests).
    pub fn live(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").cmds.len()
    }

    #[cfg(test)]
    fn refs(&self, id: u32) -> Option<u32> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .cmds
            .get(&id)
            .map(|slot| slot.refs)
    }

    async fn control(
        registry: &Arc<CmdRegistry>,
        cmd: &Arc<Cmd>,
        line: &str,
    ) -> Result<(), String> {
        match parse_ctl(line)? {
            CtlOp::Env { name, value } => {
                cmd.upsert_env(name, value);
                Ok(())
            }
            CtlOp::Cmd(body) => {
                cmd.cfg.lock().expect("command lock poisoned").body = body.to_string();
                Ok(())
            }
            CtlOp::Dir(dir) => {
                cmd.cfg.lock().expect("command lock poisoned").dir = Some(dir.to_string());
                Ok(())
            }
            CtlOp::Start => CmdRegistry::start(registry, cmd).await,
            CtlOp::Eof => {
                // Off the dispatch loop: a stalled stdin write may hold the
                // lock, and end-of-input applies after it completes.
                let cmd = cmd.clone();
                tokio::spawn(async move {
                    cmd.stdin.lock().await.take();
                });
                Ok(())
            }
            CtlOp::Note(text) => {
                let pid = cmd.pid();
                if pid <= 0 {
                    return Err("could not kill process".into());
                }
                spawn::post_note(pid, text).map_err(|_| "could not kill process".to_string())
            }
            CtlOp::Del => {
                registry.decref(cmd.id);
                Ok(())
            }
        }
    }

    async fn start(registry: &Arc<CmdRegistry>, cmd: &Arc<Cmd>) -> Result<(), String> {
        if cmd.started.send_replace(true) {
            return Err("already started".into());
        }
        let (body, dir, env) = {
            let cfg = cmd.cfg.lock().expect("command lock poisoned");
            (cfg.body.clone(), cfg.dir.clone(), cfg.env.clone())
        };
        match spawn::spawn_group(&registry.shell, &body, dir.as_deref(), &env) {
            Ok(mut child) => {
                let pid = child.id().map_or(-1, |p| p as i32);
                cmd.pid.store(pid, Ordering::Relaxed);
                *cmd.stdin.lock().await = child.stdin.take();
                *cmd.stdout.lock().await = child.stdout.take();
                *cmd.stderr.lock().await = child.stderr.take();

                let registry = registry.clone();
                let id = cmd.id;
                tokio::spawn(async move {
                    let text = match child.wait().await {
                        Ok(status) => status.code().unwrap_or(-1).to_string(),
                        Err(e) => format!("wait error: {e}"),
                    };
                    registry.deliver_exit(id, WaitStatus { pid, text });
                });
                Ok(())
            }
            Err(e) => {
                // The ctl write still succeeds; the failure is observable
                // through wait, the same way a real exit is.
                warn!("command {}: start failed: {e}", cmd.id);
                registry.deliver_exit(
                    cmd.id,
                    WaitStatus {
                        pid: -1,
                        text: "failed to start".into(),
                    },
                );
                Ok(())
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum CtlOp<'a> {
    Env { name: &'a str, value: &'a str },
    Cmd(&'a str),
    Dir(&'a str),
    Start,
    Eof,
    Note(&'a str),
    Del,
}

// One command per write; first token selects the operation. A single
// trailing newline is tolerated.
fn parse_ctl(line: &str) -> Result<CtlOp<'_>, String> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    match line {
        "start" => return Ok(CtlOp::Start),
        "eof" => return Ok(CtlOp::Eof),
        "del" => return Ok(CtlOp::Del),
        _ => {}
    }
    let Some((token, arg)) = line.split_once(' ') else {
        return Err("bad command".into());
    };
    match token {
        "env" => {
            let Some((name, value)) = arg.split_once('=') else {
                return Err("bad command".into());
            };
            Ok(CtlOp::Env { name, value })
        }
        "cmd" => Ok(CtlOp::Cmd(arg)),
        "dir" => Ok(CtlOp::Dir(arg)),
        "note" => Ok(CtlOp::Note(arg)),
        _ => Err("bad command".into()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmdNode {
    Root,
    Dir,
    Ctl,
    Stdin,
    Stdout,
    Stderr,
    Wait,
}

impl CmdNode {
    fn code(self) -> u64 {
        match self {
            CmdNode::Root => 0,
            CmdNode::Dir => 1,
            CmdNode::Ctl => 2,
            CmdNode::Stdin => 3,
            CmdNode::Stdout => 4,
            CmdNode::Stderr => 5,
            CmdNode::Wait => 6,
        }
    }

    fn name(self) -> &'static str {
        match self {
            CmdNode::Root | CmdNode::Dir => ".",
            CmdNode::Ctl => "ctl",
            CmdNode::Stdin => "stdin",
            CmdNode::Stdout => "stdout",
            CmdNode::Stderr => "stderr",
            CmdNode::Wait => "wait",
        }
    }

    fn perm(self) -> u32 {
        match self {
            CmdNode::Root | CmdNode::Dir => 0o500,
            CmdNode::Ctl => 0o600,
            CmdNode::Stdin => 0o200,
            CmdNode::Stdout | CmdNode::Stderr | CmdNode::Wait => 0o400,
        }
    }
}

fn qid_for(node: CmdNode, id: u32) -> Qid {
    let ty = match node {
        CmdNode::Root | CmdNode::Dir => QID_DIR,
        CmdNode::Ctl | CmdNode::Stdin => QID_APPEND,
        _ => 0,
    };
    Qid {
        ty,
        version: 0,
        path: node.code() | u64::from(id) << 8,
    }
}

#[derive(Clone)]
struct CmdFid {
    node: CmdNode,
    cmd: Option<Arc<Cmd>>,
}

/// The command service as mounted on the session's command port.
pub struct CmdFs {
    registry: Arc<CmdRegistry>,
    fids: Mutex<HashMap<u32, CmdFid>>,
}

impl CmdFs {
    /// Build the service over an injected registry.
    pub fn new(registry: Arc<CmdRegistry>) -> Arc<CmdFs> {
        Arc::new(CmdFs {
            registry,
            fids: Mutex::new(HashMap::new()),
        })
    }

    fn fid(&self, fid: u32) -> Option<CmdFid> {
        self.fids.lock().expect("fid table lock poisoned").get(&fid).cloned()
    }

    fn step(&self, cur: &mut CmdFid, name: &str) -> Result<Qid, String> {
        if name == ".." {
            if let Some(cmd) = cur.cmd.take() {
                self.registry.decref(cmd.id);
            }
            cur.node = CmdNode::Root;
            return Ok(qid_for(CmdNode::Root, 0));
        }
        if let Some(cmd) = &cur.cmd {
            let node = match name {
                "." => CmdNode::Dir,
                "ctl" => CmdNode::Ctl,
                "stdin" => CmdNode::Stdin,
                "stdout" => CmdNode::Stdout,
                "stderr" => CmdNode::Stderr,
                "wait" => CmdNode::Wait,
                _ => return Err("no such file".into()),
            };
            cur.node = node;
            return Ok(qid_for(node, cmd.id));
        }
        match name {
            "." => Ok(qid_for(CmdNode::Root, 0)),
            "new" => {
                let cmd = self.registry.create();
                let qid = qid_for(CmdNode::Dir, cmd.id);
                cur.cmd = Some(cmd);
                cur.node = CmdNode::Dir;
                Ok(qid)
            }
            _ => {
                let id: u32 = name.parse().map_err(|_| "no such file".to_string())?;
                let cmd = self.registry.lookup(id).ok_or("no such file")?;
                let qid = qid_for(CmdNode::Dir, cmd.id);
                cur.cmd = Some(cmd);
                cur.node = CmdNode::Dir;
                Ok(qid)
            }
        }
    }

    fn dir_listing(&self, cur: &CmdFid) -> Vec<u8> {
        let mut out = Vec::new();
        match &cur.cmd {
            None => {
                // Live ids are not enumerated; numeric walks still work.
                synthetic_stat(".", qid_for(CmdNode::Root, 0), 0o500).encode(&mut out);
                synthetic_stat("new", qid_for(CmdNode::Dir, 0), 0o500).encode(&mut out);
            }
            Some(cmd) => {
                for node in [
                    CmdNode::Dir,
                    CmdNode::Ctl,
                    CmdNode::Stdin,
                    CmdNode::Stdout,
                    CmdNode::Stderr,
                    CmdNode::Wait,
                ] {
                    synthetic_stat(node.name(), qid_for(node, cmd.id), node.perm())
                        .encode(&mut out);
                }
            }
        }
        out
    }
}

fn slice_at(data: &[u8], offset: u64, count: u32) -> Vec<u8> {
    let start = (offset as usize).min(data.len());
    let end = (start + count as usize).min(data.len());
    data[start..end].to_vec()
}

#[async_trait]
impl FileService for CmdFs {
    fn label(&self) -> &'static str {
        "cmd"
    }

    async fn attach(&self, fid: u32) -> SrvResult<Qid> {
        self.fids.lock().expect("fid table lock poisoned").insert(
            fid,
            CmdFid {
                node: CmdNode::Root,
                cmd: None,
            },
        );
        Ok(qid_for(CmdNode::Root, 0))
    }

    async fn walk(&self, fid: u32, newfid: u32, wnames: &[String]) -> SrvResult<Vec<Qid>> {
        let mut cur = if newfid == fid {
            // Walk in place: the fid's reference moves with it.
            self.fids
                .lock()
                .expect("fid table lock poisoned")
                .remove(&fid)
                .ok_or("unknown fid")?
        } else {
            let cur = self.fid(fid).ok_or("unknown fid")?;
            if let Some(cmd) = &cur.cmd {
                self.registry.incref(cmd.id);
            }
            cur
        };

        let mut qids = Vec::with_capacity(wnames.len());
        for name in wnames {
            match self.step(&mut cur, name) {
                Ok(qid) => qids.push(qid),
                Err(e) => {
                    if newfid == fid {
                        // Leave the fid in its partially walked state.
                        self.fids
                            .lock()
                            .expect("fid table lock poisoned")
                            .insert(fid, cur);
                    } else if let Some(cmd) = &cur.cmd {
                        self.registry.decref(cmd.id);
                    }
                    return Err(e);
                }
            }
        }
        self.fids
            .lock()
            .expect("fid table lock poisoned")
            .insert(newfid, cur);
        Ok(qids)
    }

    async fn open(&self, fid: u32, _mode: OpenMode) -> SrvResult<(Qid, u32)> {
        let cur = self.fid(fid).ok_or("unknown fid")?;
        let id = cur.cmd.as_ref().map_or(0, |c| c.id);
        Ok((qid_for(cur.node, id), iounit()))
    }

    async fn create(&self, _fid: u32, _name: &str, _mode: OpenMode, _perm: u32)
        -> SrvResult<(Qid, u32)> {
        Err("permission denied".into())
    }

    async fn read(&self, fid: u32, offset: u64, count: u32, reply: Reply) {
        let Some(cur) = self.fid(fid) else {
            reply.error("unknown fid").await;
            return;
        };
        match cur.node {
            CmdNode::Root | CmdNode::Dir => {
                let listing = self.dir_listing(&cur);
                reply.data(slice_at(&listing, offset, count)).await;
            }
            CmdNode::Ctl => match cur.cmd {
                Some(cmd) => {
                    let line = format!("{} {}", cmd.id, cmd.pid());
                    reply.data(slice_at(line.as_bytes(), offset, count)).await;
                }
                None => reply.error("unknown fid").await,
            },
            CmdNode::Stdout => match cur.cmd {
                Some(cmd) => {
                    tokio::spawn(read_pipe(cmd, PipeEnd::Stdout, count, reply));
                }
                None => reply.error("unknown fid").await,
            },
            CmdNode::Stderr => match cur.cmd {
                Some(cmd) => {
                    tokio::spawn(read_pipe(cmd, PipeEnd::Stderr, count, reply));
                }
                None => reply.error("unknown fid").await,
            },
            CmdNode::Wait => match cur.cmd {
                Some(cmd) => {
                    tokio::spawn(read_wait(cmd, offset, count, reply));
                }
                None => reply.error("unknown fid").await,
            },
            CmdNode::Stdin => reply.error("permission denied").await,
        }
    }

    async fn write(&self, fid: u32, _offset: u64, data: Vec<u8>, reply: Reply) {
        let Some(cur) = self.fid(fid) else {
            reply.error("unknown fid").await;
            return;
        };
        match (cur.node, cur.cmd) {
            (CmdNode::Ctl, Some(cmd)) => {
                let text = String::from_utf8_lossy(&data).into_owned();
                match CmdRegistry::control(&self.registry, &cmd, &text).await {
                    Ok(()) => reply.count(data.len() as u32).await,
                    Err(message) => reply.error(message).await,
                }
            }
            (CmdNode::Stdin, Some(cmd)) => {
                tokio::spawn(write_stdin(cmd, data, reply));
            }
            _ => reply.error("permission denied").await,
        }
    }

    async fn stat(&self, fid: u32) -> SrvResult<Stat> {
        let cur = self.fid(fid).ok_or("unknown fid")?;
        let id = cur.cmd.as_ref().map_or(0, |c| c.id);
        Ok(synthetic_stat(cur.node.name(), qid_for(cur.node, id), cur.node.perm()))
    }

    async fn clunk(&self, fid: u32) {
        let removed = self
            .fids
            .lock()
            .expect("fid table lock poisoned")
            .remove(&fid);
        if let Some(CmdFid { cmd: Some(cmd), .. }) = removed {
            self.registry.decref(cmd.id);
        }
    }
}

enum PipeEnd {
    Stdout,
    Stderr,
}

// Serviced off the dispatch loop: blocks until the process has started and
// produced output (or exited).
async fn read_pipe(cmd: Arc<Cmd>, end: PipeEnd, count: u32, reply: Reply) {
    let mut started = cmd.started.subscribe();
    if started.wait_for(|s| *s).await.is_err() {
        reply.error("process gone").await;
        return;
    }
    match end {
        PipeEnd::Stdout => read_from_pipe(&mut *cmd.stdout.lock().await, count, reply).await,
        PipeEnd::Stderr => read_from_pipe(&mut *cmd.stderr.lock().await, count, reply).await,
    }
}

async fn read_from_pipe<R: AsyncReadExt + Unpin>(
    guard: &mut Option<R>,
    count: u32,
    reply: Reply,
) {
    let Some(pipe) = guard.as_mut() else {
        // Never piped (spawn failed) or already released: end of file.
        reply.data(Vec::new()).await;
        return;
    };
    let mut buf = vec![0u8; count.min(IOUNIT) as usize];
    match pipe.read(&mut buf).await {
        Ok(n) => {
            buf.truncate(n);
            reply.data(buf).await;
        }
        Err(e) => reply.error(format!("read error: {e}")).await,
    }
}

async fn read_wait(cmd: Arc<Cmd>, offset: u64, count: u32, reply: Reply) {
    let mut rx = cmd.wait.subscribe();
    let resolved = rx
        .wait_for(|w| w.is_some())
        .await
        .map(|guard| guard.clone().expect("wait_for guarantees Some"))
        .map_err(|_| ());
    let status = match resolved {
        Ok(status) => status,
        Err(()) => {
            reply.error("process gone").await;
            return;
        }
    };
    let line = status.render();
    reply.data(slice_at(line.as_bytes(), offset, count)).await;
}

async fn write_stdin(cmd: Arc<Cmd>, data: Vec<u8>, reply: Reply) {
    let mut started = cmd.started.subscribe();
    if started.wait_for(|s| *s).await.is_err() {
        reply.error("process gone").await;
        return;
    }
    let mut guard = cmd.stdin.lock().await;
    let Some(pipe) = guard.as_mut() else {
        reply.error("stdin closed").await;
        return;
    };
    match tokio::io::AsyncWriteExt::write_all(pipe, &data).await {
        Ok(()) => {
            let _ = tokio::io::AsyncWriteExt::flush(pipe).await;
            reply.count(data.len() as u32).await;
        }
        Err(e) => reply.error(format!("write error: {e}")).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::FsClient;
    use crate::srv::serve;
    use std::time::Duration;

    async fn mounted() -> (Arc<CmdRegistry>, FsClient) {
        let registry = CmdRegistry::new("/bin/sh");
        let fs = CmdFs::new(registry.clone());
        let (app, srv_end) = tokio::io::duplex(crate::proto::MAX_MSG * 4);
        tokio::spawn(async move {
            let _ = serve(fs, srv_end).await;
        });
        let client = FsClient::mount(app, "cmd").await.expect("mount");
        (registry, client)
    }

    #[test]
    fn ctl_grammar_accepts_the_documented_commands() {
        assert_eq!(parse_ctl("start"), Ok(CtlOp::Start));
        assert_eq!(parse_ctl("eof\n"), Ok(CtlOp::Eof));
        assert_eq!(parse_ctl("del"), Ok(CtlOp::Del));
        assert_eq!(
            parse_ctl("env PATH=/bin"),
            Ok(CtlOp::Env {
                name: "PATH",
                value: "/bin"
            })
        );
        assert_eq!(parse_ctl("cmd echo hi there"), Ok(CtlOp::Cmd("echo hi there")));
        assert_eq!(parse_ctl("dir /tmp"), Ok(CtlOp::Dir("/tmp")));
        assert_eq!(parse_ctl("note hangup"), Ok(CtlOp::Note("hangup")));

        assert_eq!(parse_ctl("bogus"), Err("bad command".into()));
        assert_eq!(parse_ctl("frobnicate now"), Err("bad command".into()));
        assert_eq!(parse_ctl("env NOEQUALS"), Err("bad command".into()));
    }

    #[test]
    fn env_upsert_is_last_write_wins() {
        let cmd = Cmd::new(1);
        cmd.upsert_env("X", "1");
        cmd.upsert_env("Y", "a");
        cmd.upsert_env("X", "2");
        let cfg = cmd.cfg.lock().unwrap();
        assert_eq!(
            cfg.env,
            vec![("X".into(), "2".into()), ("Y".into(), "a".into())]
        );
    }

    #[tokio::test]
    async fn new_walk_reads_id_and_unset_pid() {
        let (_registry, client) = mounted().await;
        let ctl = client.open("new/ctl", OpenMode::ReadWrite).await.unwrap();
        let line = ctl.read_string().await.unwrap();
        assert_eq!(line, "1 -1");
    }

    #[tokio::test]
    async fn echo_scenario_runs_to_completion() {
        let (_registry, client) = mounted().await;
        let ctl = client.open("new/ctl", OpenMode::ReadWrite).await.unwrap();
        let line = ctl.read_string().await.unwrap();
        let id: u32 = line.split_whitespace().next().unwrap().parse().unwrap();

        ctl.print("cmd echo hi").await.unwrap();
        ctl.print("start").await.unwrap();

        let stdout = client
            .open(&format!("{id}/stdout"), OpenMode::Read)
            .await
            .unwrap();
        let out = stdout.read_to_end().await.unwrap();
        assert_eq!(out, b"hi\n");

        let wait = client
            .open(&format!("{id}/wait"), OpenMode::Read)
            .await
            .unwrap();
        let status = wait.read_string().await.unwrap();
        assert!(status.ends_with(" 0"), "expected exit status 0, got {status}");
    }

    #[tokio::test]
    async fn env_last_write_wins_in_the_child() {
        let (_registry, client) = mounted().await;
        let ctl = client.open("new/ctl", OpenMode::ReadWrite).await.unwrap();
        let line = ctl.read_string().await.unwrap();
        let id: u32 = line.split_whitespace().next().unwrap().parse().unwrap();

        ctl.print("env X=1").await.unwrap();
        ctl.print("env X=2").await.unwrap();
        ctl.print("cmd echo $X").await.unwrap();
        ctl.print("start").await.unwrap();

        let stdout = client
            .open(&format!("{id}/stdout"), OpenMode::Read)
            .await
            .unwrap();
        assert_eq!(stdout.read_to_end().await.unwrap(), b"2\n");
    }

    #[tokio::test]
    async fn stdin_eof_flows_through_to_the_child() {
        let (_registry, client) = mounted().await;
        let ctl = client.open("new/ctl", OpenMode::ReadWrite).await.unwrap();
        let line = ctl.read_string().await.unwrap();
        let id: u32 = line.split_whitespace().next().unwrap().parse().unwrap();

        ctl.print("cmd cat").await.unwrap();
        ctl.print("start").await.unwrap();

        let stdin = client
            .open(&format!("{id}/stdin"), OpenMode::Write)
            .await
            .unwrap();
        stdin.write(b"over the wire\n").await.unwrap();
        ctl.print("eof").await.unwrap();

        let stdout = client
            .open(&format!("{id}/stdout"), OpenMode::Read)
            .await
            .unwrap();
        assert_eq!(stdout.read_to_end().await.unwrap(), b"over the wire\n");
    }

    #[tokio::test]
    async fn bad_ctl_write_changes_nothing() {
        let (_registry, client) = mounted().await;
        let ctl = client.open("new/ctl", OpenMode::ReadWrite).await.unwrap();
        let err = ctl.print("launch missiles").await.unwrap_err();
        assert!(err.to_string().contains("bad command"), "{err}");
        // The fid still works afterwards.
        assert_eq!(ctl.read_string().await.unwrap(), "1 -1");
    }

    #[tokio::test]
    async fn spawn_failure_synthesizes_a_failed_wait_result() {
        let registry = CmdRegistry::new("/nonexistent/shell");
        let fs = CmdFs::new(registry.clone());
        let (app, srv_end) = tokio::io::duplex(crate::proto::MAX_MSG * 4);
        tokio::spawn(async move {
            let _ = serve(fs, srv_end).await;
        });
        let client = FsClient::mount(app, "cmd").await.unwrap();

        let ctl = client.open("new/ctl", OpenMode::ReadWrite).await.unwrap();
        ctl.print("cmd true").await.unwrap();
        ctl.print("start").await.unwrap();

        let wait = client.open("1/wait", OpenMode::Read).await.unwrap();
        let status = wait.read_string().await.unwrap();
        assert_eq!(status, "-1 failed to start");
    }

    #[tokio::test]
    async fn note_after_exit_reports_an_error() {
        let (_registry, client) = mounted().await;
        let ctl = client.open("new/ctl", OpenMode::ReadWrite).await.unwrap();
        ctl.print("cmd true").await.unwrap();
        ctl.print("start").await.unwrap();

        let wait = client.open("1/wait", OpenMode::Read).await.unwrap();
        wait.read_string().await.unwrap();

        // Process group is gone; the note must fail, not wedge the service.
        let err = ctl.print("note hangup").await.unwrap_err();
        assert!(err.to_string().contains("could not kill process"), "{err}");
        assert_eq!(ctl.read_string().await.unwrap().split(' ').next(), Some("1"));
    }

    #[tokio::test]
    async fn refcounts_release_exactly_once() {
        let (registry, client) = mounted().await;
        let ctl = client.open("new/ctl", OpenMode::ReadWrite).await.unwrap();
        assert_eq!(registry.refs(1), Some(2));

        // A second walk to the same command adds a reference.
        let ctl2 = client.open("1/ctl", OpenMode::ReadWrite).await.unwrap();
        assert_eq!(registry.refs(1), Some(3));

        ctl2.close().await;
        assert_eq!(registry.refs(1), Some(2));

        // del drops the creator's reference; the handle close drops another.
        ctl.print("del").await.unwrap();
        assert_eq!(registry.refs(1), Some(1));
        ctl.close().await;
        assert_eq!(registry.refs(1), None);
        assert_eq!(registry.live(), 0);
    }

    #[tokio::test]
    async fn del_then_wait_resolves_after_completion() {
        let (_registry, client) = mounted().await;
        let ctl = client.open("new/ctl", OpenMode::ReadWrite).await.unwrap();
        ctl.print("cmd sleep 0.1; exit 3").await.unwrap();
        ctl.print("start").await.unwrap();

        let wait = client.open("1/wait", OpenMode::Read).await.unwrap();
        ctl.print("del").await.unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), wait.read_string())
            .await
            .expect("wait read must not hang past process completion")
            .unwrap();
        assert!(status.contains('3'), "{status}");
    }

    #[tokio::test]
    async fn root_listing_does_not_enumerate_live_commands() {
        let (_registry, client) = mounted().await;
        let _ctl = client.open("new/ctl", OpenMode::ReadWrite).await.unwrap();

        let root = client.open("/", OpenMode::Read).await.unwrap();
        let names: Vec<String> = root
            .read_dir()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec![".", "new"]);
    }

    #[tokio::test]
    async fn command_directory_lists_its_files() {
        let (_registry, client) = mounted().await;
        let _ctl = client.open("new/ctl", OpenMode::ReadWrite).await.unwrap();

        let dir = client.open("1", OpenMode::Read).await.unwrap();
        let names: Vec<String> = dir
            .read_dir()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec![".", "ctl", "stdin", "stdout", "stderr", "wait"]);
    }
}
