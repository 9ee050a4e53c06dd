//! Export service: the remote host's files, served to the editor.
//!
//! A thin shim over local file I/O. Fid state is an accumulated path (walks
//! never escape the configured root) plus an open file handle. Directory
//! reads serve the encoded listing; file reads and writes are positioned by
//! the client-supplied offset.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

use super::{iounit, FileService, Reply, SrvResult};
use crate::proto::codec::{OpenMode, Qid, Stat, IOUNIT, MODE_DIR, QID_DIR};

#[derive(Clone)]
struct EFid {
    path: PathBuf,
    file: Option<Arc<AsyncMutex<fs::File>>>,
}

/// File-export service rooted at a directory (usually `/`).
pub struct ExportFs {
    root: PathBuf,
    fids: Mutex<HashMap<u32, EFid>>,
}

impl ExportFs {
    /// Serve the tree under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Arc<ExportFs> {
        Arc::new(ExportFs {
            root: root.into(),
            fids: Mutex::new(HashMap::new()),
        })
    }

    fn fid(&self, fid: u32) -> Option<EFid> {
        self.fids.lock().expect("fid table lock poisoned").get(&fid).cloned()
    }

    fn put(&self, fid: u32, efid: EFid) {
        self.fids
            .lock()
            .expect("fid table lock poisoned")
            .insert(fid, efid);
    }

    // Apply one walk element, clamped to the export root.
    fn step_path(&self, path: &mut PathBuf, name: &str) {
        if name == ".." {
            if *path != self.root {
                path.pop();
            }
        } else if name != "." {
            path.push(name);
        }
        if !path.starts_with(&self.root) {
            *path = self.root.clone();
        }
    }

    async fn stat_path(&self, path: &Path) -> SrvResult<Stat> {
        let meta = fs::metadata(path)
            .await
            .map_err(|e| format!("cannot stat: {e}"))?;
        let name = if *path == self.root {
            "/".to_string()
        } else {
            path.file_name()
                .map_or_else(|| "/".to_string(), |n| n.to_string_lossy().into_owned())
        };
        let mode = if meta.is_dir() {
            MODE_DIR | (meta.permissions().mode() & 0o777)
        } else {
            meta.permissions().mode() & 0o777
        };
        Ok(Stat {
            name,
            mode,
            length: meta.len(),
            qid: qid_of(&meta),
        })
    }
}

fn qid_of(meta: &std::fs::Metadata) -> Qid {
    Qid {
        ty: if meta.is_dir() { QID_DIR } else { 0 },
        version: 0,
        path: meta.ino(),
    }
}

fn open_options(mode: OpenMode) -> fs::OpenOptions {
    let mut options = fs::OpenOptions::new();
    options
        .read(mode.allows_read())
        .write(mode.allows_write());
    options
}

#[async_trait]
impl FileService for ExportFs {
    fn label(&self) -> &'static str {
        "export"
    }

    async fn attach(&self, fid: u32) -> SrvResult<Qid> {
        let meta = fs::metadata(&self.root)
            .await
            .map_err(|e| format!("cannot attach: {e}"))?;
        self.put(
            fid,
            EFid {
                path: self.root.clone(),
                file: None,
            },
        );
        Ok(qid_of(&meta))
    }

    async fn walk(&self, fid: u32, newfid: u32, wnames: &[String]) -> SrvResult<Vec<Qid>> {
        let cur = self.fid(fid).ok_or("unknown fid")?;
        let mut path = cur.path.clone();
        let mut qids = Vec::with_capacity(wnames.len());
        for name in wnames {
            if name.contains('/') {
                return Err("could not walk".into());
            }
            self.step_path(&mut path, name);
            let meta = fs::metadata(&path)
                .await
                .map_err(|_| "could not walk".to_string())?;
            qids.push(qid_of(&meta));
        }
        self.put(newfid, EFid { path, file: None });
        Ok(qids)
    }

    async fn open(&self, fid: u32, mode: OpenMode) -> SrvResult<(Qid, u32)> {
        let cur = self.fid(fid).ok_or("unknown fid")?;
        let meta = fs::metadata(&cur.path)
            .await
            .map_err(|e| format!("can't open file: {e}"))?;
        if meta.is_dir() {
            // Directory reads go through read_dir; no handle to keep.
            return Ok((qid_of(&meta), iounit()));
        }
        let file = open_options(mode)
            .open(&cur.path)
            .await
            .map_err(|e| format!("can't open file: {e}"))?;
        self.put(
            fid,
            EFid {
                path: cur.path,
                file: Some(Arc::new(AsyncMutex::new(file))),
            },
        );
        Ok((qid_of(&meta), iounit()))
    }

    async fn create(
        &self,
        fid: u32,
        name: &str,
        mode: OpenMode,
        perm: u32,
    ) -> SrvResult<(Qid, u32)> {
        if name == "." || name == ".." || name.contains('/') {
            return Err("illegal name".into());
        }
        let cur = self.fid(fid).ok_or("unknown fid")?;
        let path = cur.path.join(name);
        let file = open_options(mode)
            .create(true)
            .truncate(mode.allows_write())
            .mode(perm & 0o777)
            .open(&path)
            .await
            .map_err(|e| format!("cannot create: {e}"))?;
        let meta = file
            .metadata()
            .await
            .map_err(|e| format!("cannot stat: {e}"))?;
        self.put(
            fid,
            EFid {
                path,
                file: Some(Arc::new(AsyncMutex::new(file))),
            },
        );
        Ok((qid_of(&meta), iounit()))
    }

    async fn read(&self, fid: u32, offset: u64, count: u32, reply: Reply) {
        let Some(cur) = self.fid(fid) else {
            reply.error("unknown fid").await;
            return;
        };
        if let Some(file) = cur.file {
            let mut file = file.lock().await;
            if let Err(e) = file.seek(SeekFrom::Start(offset)).await {
                reply.error(format!("could not seek: {e}")).await;
                return;
            }
            let mut buf = vec![0u8; count.min(IOUNIT) as usize];
            match file.read(&mut buf).await {
                Ok(n) => {
                    buf.truncate(n);
                    reply.data(buf).await;
                }
                Err(e) => reply.error(format!("read error: {e}")).await,
            }
            return;
        }
        // Directory: encode the whole listing, serve the requested slice.
        let mut entries = match fs::read_dir(&cur.path).await {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(format!("could not dirread: {e}")).await;
                return;
            }
        };
        let mut listing = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    if let Ok(stat) = self.stat_path(&path).await {
                        stat.encode(&mut listing);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    reply.error(format!("could not dirread: {e}")).await;
                    return;
                }
            }
        }
        let start = (offset as usize).min(listing.len());
        let end = (start + count as usize).min(listing.len());
        reply.data(listing[start..end].to_vec()).await;
    }

    async fn write(&self, fid: u32, offset: u64, data: Vec<u8>, reply: Reply) {
        let Some(cur) = self.fid(fid) else {
            reply.error("unknown fid").await;
            return;
        };
        let Some(file) = cur.file else {
            reply.error("cannot write directory").await;
            return;
        };
        let mut file = file.lock().await;
        if let Err(e) = file.seek(SeekFrom::Start(offset)).await {
            reply.error(format!("could not seek: {e}")).await;
            return;
        }
        match file.write_all(&data).await {
            Ok(()) => reply.count(data.len() as u32).await,
            Err(e) => reply.error(format!("cannot write: {e}")).await,
        }
    }

    async fn stat(&self, fid: u32) -> SrvResult<Stat> {
        let cur = self.fid(fid).ok_or("unknown fid")?;
        self.stat_path(&cur.path).await
    }

    async fn clunk(&self, fid: u32) {
        self.fids
            .lock()
            .expect("fid table lock poisoned")
            .remove(&fid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::FsClient;
    use crate::srv::serve;

    async fn mounted(root: &Path) -> FsClient {
        let fs = ExportFs::new(root);
        let (app, srv_end) = tokio::io::duplex(crate::proto::MAX_MSG * 4);
        tokio::spawn(async move {
            let _ = serve(fs, srv_end).await;
        });
        FsClient::mount(app, "export").await.expect("mount")
    }

    #[tokio::test]
    async fn reads_and_writes_files_under_the_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("greeting"), b"hello\n").unwrap();
        let client = mounted(dir.path()).await;

        let file = client.open("greeting", OpenMode::Read).await.unwrap();
        assert_eq!(file.read_to_end().await.unwrap(), b"hello\n");

        let out = client
            .create("notes", OpenMode::Write, 0o644)
            .await
            .unwrap();
        out.write(b"from afar").await.unwrap();
        out.close().await;
        assert_eq!(
            std::fs::read(dir.path().join("notes")).unwrap(),
            b"from afar"
        );
    }

    #[tokio::test]
    async fn directory_listing_and_stat() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"x").unwrap();
        std::fs::write(dir.path().join("b"), b"xy").unwrap();
        let client = mounted(dir.path()).await;

        let root = client.open("/", OpenMode::Read).await.unwrap();
        let mut names: Vec<String> = root
            .read_dir()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);

        let stat = client.stat("b").await.unwrap();
        assert_eq!(stat.length, 2);
        assert_eq!(stat.mode & MODE_DIR, 0);
    }

    #[tokio::test]
    async fn walks_cannot_escape_the_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("inside"), b"ok").unwrap();
        let client = mounted(dir.path()).await;

        // ".." at the root stays at the root.
        let stat = client.stat("../../..").await.unwrap();
        assert_eq!(stat.name, "/");
        assert!(client.access("inside").await);
        assert!(!client.access("missing").await);
    }
}
