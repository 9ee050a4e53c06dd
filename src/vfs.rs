//! Virtual I/O: one open call, local or remote decided by the prefix table.
//!
//! Callers branch once at open time and hold a [`Vfd`] afterwards; reads,
//! writes and close dispatch on the variant. Remote handles keep the session
//! reference they acquired at open and release it on close.

use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use std::sync::Arc;

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::client::{FsError, FsFid};
use crate::connect::{ConnectError, RemoteTable};
use crate::proto::codec::{OpenMode, Qid, Stat, MODE_DIR, QID_DIR};
use crate::session::Session;

/// Errors from virtual I/O operations.
#[derive(Debug, thiserror::Error)]
pub enum VfsError {
    /// Local file I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// The remote file service failed.
    #[error("remote error: {0}")]
    Fs(#[from] FsError),
    /// Connecting to the owning remote failed.
    #[error("connect error: {0}")]
    Connect(#[from] ConnectError),
    /// The handle was already closed.
    #[error("closed handle")]
    Closed,
}

/// An open file that is either local or remote.
pub enum Vfd {
    /// Ordinary local file.
    Local(fs::File),
    /// Remote file plus the session reference held for it.
    Remote {
        /// Owning session; released on close.
        session: Arc<Session>,
        /// Open handle on the session's export service.
        fid: FsFid,
    },
    /// Closed; every operation fails.
    Closed,
}

/// Open `path`, routing through the remote's export service when a prefix
/// matches.
pub async fn open(table: &RemoteTable, path: &str, mode: OpenMode) -> Result<Vfd, VfsError> {
    match table.lookup(path) {
        Some(remote) => {
            let session = remote.connect().await?;
            let fs = session.fs_client().ok_or(FsError::Closed)?;
            match fs.open(path, mode).await {
                Ok(fid) => Ok(Vfd::Remote { session, fid }),
                Err(e) => {
                    session.close();
                    Err(e.into())
                }
            }
        }
        None => {
            let mut options = fs::OpenOptions::new();
            options.read(mode.allows_read()).write(mode.allows_write());
            Ok(Vfd::Local(options.open(path).await?))
        }
    }
}

/// Create `path` with `perm`, local or remote by prefix.
pub async fn create(
    table: &RemoteTable,
    path: &str,
    mode: OpenMode,
    perm: u32,
) -> Result<Vfd, VfsError> {
    match table.lookup(path) {
        Some(remote) => {
            let session = remote.connect().await?;
            let fs = session.fs_client().ok_or(FsError::Closed)?;
            match fs.create(path, mode, perm).await {
                Ok(fid) => Ok(Vfd::Remote { session, fid }),
                Err(e) => {
                    session.close();
                    Err(e.into())
                }
            }
        }
        None => {
            let mut options = fs::OpenOptions::new();
            options
                .read(mode.allows_read())
                .write(true)
                .create(true)
                .truncate(true);
            let file = options.open(path).await?;
            let std_perm = std::fs::Permissions::from_mode(perm & 0o777);
            file.set_permissions(std_perm).await?;
            Ok(Vfd::Local(file))
        }
    }
}

/// Stat by path, local or remote by prefix.
pub async fn stat(table: &RemoteTable, path: &str) -> Result<Stat, VfsError> {
    match table.lookup(path) {
        Some(remote) => {
            let session = remote.connect().await?;
            let fs = session.fs_client().ok_or(FsError::Closed)?;
            let result = fs.stat(path).await;
            session.close();
            Ok(result?)
        }
        None => Ok(local_stat(Path::new(path)).await?),
    }
}

/// Whether `path` exists, local or remote by prefix.
pub async fn access(table: &RemoteTable, path: &str) -> bool {
    match table.lookup(path) {
        Some(remote) => {
            let Ok(session) = remote.connect().await else {
                return false;
            };
            let Some(fs) = session.fs_client() else {
                session.close();
                return false;
            };
            let ok = fs.access(path).await;
            session.close();
            ok
        }
        None => fs::metadata(path).await.is_ok(),
    }
}

async fn local_stat(path: &Path) -> io::Result<Stat> {
    let meta = fs::metadata(path).await?;
    let name = path
        .file_name()
        .map_or_else(|| "/".to_string(), |n| n.to_string_lossy().into_owned());
    let mode = if meta.is_dir() {
        MODE_DIR | (meta.permissions().mode() & 0o777)
    } else {
        meta.permissions().mode() & 0o777
    };
    Ok(Stat {
        name,
        mode,
        length: meta.len(),
        qid: Qid {
            ty: if meta.is_dir() { QID_DIR } else { 0 },
            version: 0,
            path: meta.ino(),
        },
    })
}

impl Vfd {
    /// Read up to `buf.len()` bytes; 0 means end of file.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, VfsError> {
        match self {
            Vfd::Local(file) => Ok(file.read(buf).await?),
            Vfd::Remote { fid, .. } => {
                let data = fid.read(buf.len() as u32).await?;
                buf[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }
            Vfd::Closed => Err(VfsError::Closed),
        }
    }

    /// Write all of `data`.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, VfsError> {
        match self {
            Vfd::Local(file) => {
                file.write_all(data).await?;
                Ok(data.len())
            }
            Vfd::Remote { fid, .. } => Ok(fid.write(data).await?),
            Vfd::Closed => Err(VfsError::Closed),
        }
    }

    /// Stat the open handle.
    pub async fn stat(&self) -> Result<Stat, VfsError> {
        match self {
            Vfd::Local(file) => {
                let meta = file.metadata().await?;
                let mode = if meta.is_dir() {
                    MODE_DIR | (meta.permissions().mode() & 0o777)
                } else {
                    meta.permissions().mode() & 0o777
                };
                Ok(Stat {
                    name: String::new(),
                    mode,
                    length: meta.len(),
                    qid: Qid {
                        ty: if meta.is_dir() { QID_DIR } else { 0 },
                        version: 0,
                        path: meta.ino(),
                    },
                })
            }
            Vfd::Remote { fid, .. } => Ok(fid.stat().await?),
            Vfd::Closed => Err(VfsError::Closed),
        }
    }

    /// Read a directory handle's full listing.
    pub async fn read_dir(&mut self) -> Result<Vec<Stat>, VfsError> {
        match self {
            Vfd::Local(_) => Err(VfsError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "use std read_dir for local directories",
            ))),
            Vfd::Remote { fid, .. } => Ok(fid.read_dir().await?),
            Vfd::Closed => Err(VfsError::Closed),
        }
    }

    /// Close the handle; the variant becomes [`Vfd::Closed`]. Remote handles
    /// release their session reference.
    pub async fn close(&mut self) {
        match std::mem::replace(self, Vfd::Closed) {
            Vfd::Local(file) => drop(file),
            Vfd::Remote { session, fid } => {
                fid.close().await;
                session.close();
            }
            Vfd::Closed => {}
        }
    }

    /// Whether the handle is still usable.
    pub fn is_open(&self) -> bool {
        !matches!(self, Vfd::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn empty_table() -> RemoteTable {
        RemoteTable::new(&Config::default())
    }

    #[tokio::test]
    async fn local_files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let table = empty_table();

        let mut vfd = create(&table, path.to_str().unwrap(), OpenMode::Write, 0o644)
            .await
            .unwrap();
        vfd.write(b"local bytes").await.unwrap();
        vfd.close().await;
        assert!(!vfd.is_open());

        let mut vfd = open(&table, path.to_str().unwrap(), OpenMode::Read)
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        let n = vfd.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"local bytes");

        let stat = stat(&table, path.to_str().unwrap()).await.unwrap();
        assert_eq!(stat.length, 11);
        assert!(access(&table, path.to_str().unwrap()).await);
        assert!(!access(&table, "/definitely/not/here").await);
    }

    #[tokio::test]
    async fn closed_handles_reject_io() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();
        let table = empty_table();

        let mut vfd = open(&table, path.to_str().unwrap(), OpenMode::Read)
            .await
            .unwrap();
        vfd.close().await;
        let mut buf = [0u8; 4];
        assert!(matches!(vfd.read(&mut buf).await, Err(VfsError::Closed)));
    }
}
