//! Process spawning and note delivery.
//!
//! Commands run as process-group leaders so a note reaches the whole tree:
//! `setpgid(0, 0)` in `pre_exec`, then `killpg` on the group. Notes use the
//! traditional textual names; unrecognized text falls back to SIGTERM.

use std::io;
use std::process::Stdio;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

/// Spawn `<shell> -c <body>` with piped stdio in its own process group.
///
/// `env` entries are merged into the inherited environment. The child is
/// `kill_on_drop` so an orphaned handle cannot leak a process.
pub fn spawn_group(
    shell: &str,
    body: &str,
    dir: Option<&str>,
    env: &[(String, String)],
) -> io::Result<Child> {
    let mut cmd = Command::new(shell);
    cmd.arg("-c")
        .arg(body)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    for (name, value) in env {
        cmd.env(name, value);
    }
    // SAFETY: setpgid is async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }
    cmd.spawn()
}

/// Map a note's text to the signal it delivers.
pub fn note_signal(note: &str) -> Signal {
    match note {
        "hangup" => Signal::SIGHUP,
        "interrupt" => Signal::SIGINT,
        "quit" => Signal::SIGQUIT,
        "kill" => Signal::SIGKILL,
        "alarm" => Signal::SIGALRM,
        _ => Signal::SIGTERM,
    }
}

/// Deliver a note to an entire process group.
pub fn post_note(pgid: i32, note: &str) -> io::Result<()> {
    killpg(Pid::from_raw(pgid), note_signal(note)).map_err(io::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_names_map_to_signals() {
        assert_eq!(note_signal("hangup"), Signal::SIGHUP);
        assert_eq!(note_signal("interrupt"), Signal::SIGINT);
        assert_eq!(note_signal("kill"), Signal::SIGKILL);
        assert_eq!(note_signal("something else"), Signal::SIGTERM);
    }

    #[tokio::test]
    async fn spawned_group_runs_and_exits() {
        let mut child = spawn_group("/bin/sh", "exit 7", None, &[]).unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(status.code(), Some(7));
    }
}
