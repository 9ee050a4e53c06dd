//! Session state and the watchdog that owns its lifetime.
//!
//! A [`Session`] is one live connection to a remote process. Every concurrent
//! task attached to the session (port readers, writers, the demultiplexer,
//! the remote-process exit watcher, plus the caller holding the returned
//! session) contributes one reference, counted by a channel of signed deltas
//! that only the watchdog consumes. Each task retires its reference exactly
//! once: by reporting an error (the watchdog decrements on receipt) or by
//! sending `-1` on a clean stop-exit. Never both.
//!
//! The watchdog drives the whole shutdown sequence, so there is never a race
//! between "still in use" and "tear it down": the first error wins, later
//! errors during teardown are discarded after their decrement, and the
//! session is released only when the count reaches zero.

use std::sync::{Arc, OnceLock};

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::client::FsClient;
use crate::connect::Remote;

/// Live state of one remote connection.
pub struct Session {
    host: String,
    deltas: mpsc::UnboundedSender<i32>,
    errors: mpsc::UnboundedSender<String>,
    stop: broadcast::Sender<()>,
    fs: OnceLock<FsClient>,
    cmd: OnceLock<FsClient>,
}

/// Receiving side of the session's bookkeeping channels, consumed by
/// [`run_watchdog`].
pub(crate) struct Watchdog {
    deltas: mpsc::UnboundedReceiver<i32>,
    errors: mpsc::UnboundedReceiver<String>,
}

impl Session {
    /// Create a session and the watchdog half of its channels.
    pub(crate) fn new(host: &str) -> (Arc<Session>, Watchdog) {
        let (delta_tx, delta_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = broadcast::channel(1);
        let session = Arc::new(Session {
            host: host.to_string(),
            deltas: delta_tx,
            errors: error_tx,
            stop: stop_tx,
            fs: OnceLock::new(),
            cmd: OnceLock::new(),
        });
        let watchdog = Watchdog {
            deltas: delta_rx,
            errors: error_rx,
        };
        (session, watchdog)
    }

    /// Remote host this session is connected to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Acquire one reference. Pairs with [`Session::close`].
    pub fn addref(&self) {
        let _ = self.deltas.send(1);
    }

    /// Release one reference. Never blocks.
    pub fn close(&self) {
        let _ = self.deltas.send(-1);
    }

    /// Report a fatal error on behalf of an exiting task. The report carries
    /// the task's reference with it; do not also call [`Session::close`].
    pub(crate) fn error(&self, msg: String) {
        let _ = self.errors.send(msg);
    }

    /// Subscribe to the stop broadcast. Fires once when teardown begins.
    pub(crate) fn stop_rx(&self) -> broadcast::Receiver<()> {
        self.stop.subscribe()
    }

    /// File-export service client, if mounted.
    pub fn fs_client(&self) -> Option<FsClient> {
        self.fs.get().cloned()
    }

    /// Command service client, if mounted.
    pub fn cmd_client(&self) -> Option<FsClient> {
        self.cmd.get().cloned()
    }

    pub(crate) fn set_fs(&self, client: FsClient) {
        let _ = self.fs.set(client);
    }

    pub(crate) fn set_cmd(&self, client: FsClient) {
        let _ = self.cmd.set(client);
    }

    async fn unmount(&self) {
        if let Some(fs) = self.fs.get() {
            fs.shutdown().await;
        }
        if let Some(cmd) = self.cmd.get() {
            cmd.shutdown().await;
        }
    }
}

/// Own the session's reference count and drive teardown.
///
/// `remote` is the cache entry to clear on failure (absent for sessions built
/// directly over a provided transport, e.g. in tests); `remote_pid` is the
/// process group of the spawned transport command, killed on failure.
pub(crate) async fn run_watchdog(
    mut wd: Watchdog,
    session: Arc<Session>,
    remote: Option<Arc<Remote>>,
    remote_pid: Option<i32>,
) {
    // The first delta is the connect-in-progress reference, sent before
    // anything can fail.
    let Some(first) = wd.deltas.recv().await else {
        return;
    };
    let mut refs = i64::from(first);
    let mut stopping = false;

    while refs > 0 {
        // Biased: a task enqueues its +1 delta before it can ever report an
        // error, so draining deltas first keeps the count from touching zero
        // while a contribution is still queued.
        tokio::select! {
            biased;
            delta = wd.deltas.recv() => {
                match delta {
                    Some(d) => refs += i64::from(d),
                    None => break,
                }
            }
            report = wd.errors.recv() => {
                let Some(msg) = report else { break };
                refs -= 1;
                if stopping {
                    continue;
                }
                stopping = true;
                if let Some(remote) = &remote {
                    remote.forget(&session).await;
                }
                warn!(host = %session.host, "remote session failed: {msg}");
                if let Some(pid) = remote_pid {
                    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
                        if e != Errno::ESRCH {
                            warn!(host = %session.host, "could not kill remote process: {e}");
                        }
                    }
                }
                // Unblocks every task parked on a channel or descriptor.
                let _ = session.stop.send(());
            }
        }
    }
    session.unmount().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn refcount_reaches_zero_after_error_and_releases() {
        let (session, wd) = Session::new("testhost");
        let handle = tokio::spawn(run_watchdog(wd, session.clone(), None, None));

        session.addref(); // initial connect reference
        session.addref(); // a worker
        session.addref(); // another worker

        let mut stop = session.stop_rx();
        session.error("demux: read error: eof".into()); // consumes one ref
        stop.recv().await.expect("stop broadcast fires");

        // Remaining workers exit cleanly after observing stop.
        session.close();
        session.close();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("watchdog terminates")
            .unwrap();
    }

    #[tokio::test]
    async fn later_errors_are_discarded_but_still_decrement() {
        let (session, wd) = Session::new("testhost");
        let handle = tokio::spawn(run_watchdog(wd, session.clone(), None, None));

        session.addref();
        session.addref();
        session.addref();

        session.error("writer: write error: broken pipe".into());
        session.error("reader: read error: eof".into());
        session.close();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("watchdog terminates")
            .unwrap();
    }

    #[tokio::test]
    async fn close_alone_does_not_trigger_stop() {
        let (session, wd) = Session::new("testhost");
        tokio::spawn(run_watchdog(wd, session.clone(), None, None));

        session.addref();
        session.addref();
        session.close();

        let mut stop = session.stop_rx();
        let fired = tokio::time::timeout(Duration::from_millis(100), stop.recv()).await;
        assert!(fired.is_err(), "stop must not fire while references remain");
    }
}
