#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]

//! remux library — the remote-session layer of the editor.
//!
//! One ssh-spawned `remuxd` process carries four independent logical ports
//! over its stdio (file export, command execution, plumber, editor control).
//! This crate provides both ends:
//!
//! - `connect`/`session`/`mux` — the editor side: lazy per-host session
//!   cache, the port multiplexer, and the watchdog that owns teardown
//! - `client` — the file-protocol client mounted on a session port
//! - `srv` — the remote side: the command filesystem, the export
//!   filesystem, and the multiplexed serve loop used by `remuxd`
//! - `vfs`/`vproc` — the editor-facing surface: open files and run commands
//!   without caring whether the target is local or remote
//! - `proto`/`pool` — the shared wire format and message buffers

pub mod client;
pub mod config;
pub mod connect;
pub(crate) mod mux;
pub mod pool;
pub mod proto;
pub mod session;
pub mod spawn;
pub mod srv;
pub mod vfs;
pub mod vproc;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export key types at crate root for convenience.
pub use client::{FsClient, FsFid};
pub use config::Config;
pub use connect::{Remote, RemoteTable};
pub use session::Session;
pub use vfs::Vfd;
pub use vproc::{VPid, VWaitMsg};
