#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # remuxd
//!
//! The remote end of an editor session. The editor spawns this program on
//! the far host (normally over ssh) and speaks a multiplexed protocol over
//! its stdio: four logical ports carrying the file-export service, the
//! command-execution service, and the reverse connections back to the
//! editor's plumber and control services.
//!
//! Once the services are listening, remuxd writes the literal `OK` marker to
//! stdout; everything after that is framed traffic. When stdin reaches
//! end-of-stream the process exits and every running command's pipes close
//! with it.
//!
//! ```text
//! main.rs          — entry point, clap flags, tracing init, serve loop
//! srv/mod.rs       — file-protocol dispatch and the multiplexed topology
//! srv/cmdfs.rs     — directory-per-process command service
//! srv/exportfs.rs  — local files served to the editor
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use remux::pool::MsgPool;
use remux::srv::cmdfs::{CmdFs, CmdRegistry};
use remux::srv::exportfs::ExportFs;
use remux::srv::{serve, serve_mux, FileService};

/// Remote session endpoint for the editor.
#[derive(Parser)]
#[command(name = "remuxd", version)]
struct Cli {
    /// Namespace directory for the plumb/editor service sockets.
    #[arg(short = 'n', long, default_value = "/tmp/ns.remux")]
    namespace: PathBuf,

    /// Root of the exported file tree.
    #[arg(long, default_value = "/")]
    root: PathBuf,

    /// Shell used to run commands.
    #[arg(long, default_value = "/bin/sh")]
    shell: String,

    /// Serve a single service on stdio without multiplexing (debugging aid):
    /// `export` or `cmd`.
    #[arg(short = 'p', long)]
    post: Option<String>,

    /// Verbose tracing to stderr.
    #[arg(short = 'd', long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let registry = CmdRegistry::new(&cli.shell);
    let export: Arc<dyn FileService> = ExportFs::new(cli.root.clone());
    let cmd: Arc<dyn FileService> = CmdFs::new(registry);

    if let Some(post) = cli.post.as_deref() {
        let service = match post {
            "export" => export,
            "cmd" => cmd,
            other => {
                eprintln!("remuxd: unknown service {other:?} (use export or cmd)");
                std::process::exit(2);
            }
        };
        info!(service = post, "serving single service on stdio");
        let stdio = tokio::io::join(tokio::io::stdin(), tokio::io::stdout());
        return serve(service, stdio).await;
    }

    tokio::fs::create_dir_all(&cli.namespace).await?;
    let pool = Arc::new(MsgPool::new());
    serve_mux(
        tokio::io::stdin(),
        tokio::io::stdout(),
        export,
        cmd,
        &cli.namespace,
        pool,
    )
    .await
}
