//! File-protocol client: the editor-side view of one mounted service.
//!
//! One [`FsClient`] owns one byte stream (in practice the local end of a
//! session port). Requests are tagged; a background task reads responses and
//! completes the matching pending request, so any number of callers can have
//! operations in flight at once. When the stream dies, every pending and
//! future request fails with [`FsError::Closed`].

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::debug;

use crate::proto::codec::{
    self, OpenMode, Qid, RequestBody, ResponseBody, Stat, IOUNIT, VERSION,
};
use crate::proto::{wire, MAX_MSG};

/// Errors surfaced by client operations.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    /// Transport failure underneath the client.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// The peer sent something the codec rejects.
    #[error("codec error: {0}")]
    Codec(#[from] codec::CodecError),
    /// The service answered with an error message.
    #[error("{0}")]
    Service(String),
    /// The mount is gone; the session was torn down.
    #[error("connection closed")]
    Closed,
    /// The peer answered with the wrong response type.
    #[error("protocol error: {0}")]
    Protocol(&'static str),
}

type Pending = Mutex<HashMap<u16, oneshot::Sender<ResponseBody>>>;

struct ClientInner {
    label: String,
    writer: AsyncMutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
    pending: Pending,
    next_tag: AtomicU16,
    next_fid: AtomicU32,
}

/// A mounted file service. Cheap to clone; all clones share the mount.
#[derive(Clone)]
pub struct FsClient {
    inner: Arc<ClientInner>,
}

/// An open (or walked) file handle on a mounted service. Sequential reads
/// and writes advance an internal offset, like a Unix file descriptor.
pub struct FsFid {
    client: FsClient,
    fid: u32,
    qid: Qid,
    iounit: u32,
    offset: AsyncMutex<u64>,
}

impl FsClient {
    /// Mount a service over `stream`: start the response reader, negotiate
    /// the protocol version, and attach the root fid.
    pub async fn mount<S>(stream: S, label: &str) -> Result<FsClient, FsError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let inner = Arc::new(ClientInner {
            label: label.to_string(),
            writer: AsyncMutex::new(Some(Box::new(write_half))),
            pending: Mutex::new(HashMap::new()),
            next_tag: AtomicU16::new(1),
            // Fid 0 is the root, attached below.
            next_fid: AtomicU32::new(1),
        });
        tokio::spawn(read_responses(inner.clone(), read_half));

        let client = FsClient { inner };
        match client
            .rpc(RequestBody::Version {
                msize: MAX_MSG as u32,
                version: VERSION.into(),
            })
            .await?
        {
            ResponseBody::Version { .. } => {}
            _ => return Err(FsError::Protocol("expected version response")),
        }
        match client.rpc(RequestBody::Attach { fid: 0 }).await? {
            ResponseBody::Attach { .. } => {}
            _ => return Err(FsError::Protocol("expected attach response")),
        }
        Ok(client)
    }

    /// Drop the write half, which makes the peer see end-of-stream and in
    /// turn fails the response reader and all pending requests.
    pub async fn shutdown(&self) {
        self.inner.writer.lock().await.take();
    }

    async fn rpc(&self, body: RequestBody) -> Result<ResponseBody, FsError> {
        let tag = self.inner.next_tag.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .expect("pending map lock poisoned")
            .insert(tag, tx);

        let bytes = codec::encode_request(&codec::Request { tag, body })?;
        {
            let mut guard = self.inner.writer.lock().await;
            let Some(writer) = guard.as_mut() else {
                self.forget(tag);
                return Err(FsError::Closed);
            };
            if let Err(e) = writer.write_all(&bytes).await {
                self.forget(tag);
                return Err(FsError::Io(e));
            }
            if let Err(e) = writer.flush().await {
                self.forget(tag);
                return Err(FsError::Io(e));
            }
        }

        match rx.await {
            Ok(ResponseBody::Error { message }) => Err(FsError::Service(message)),
            Ok(body) => Ok(body),
            Err(_) => Err(FsError::Closed),
        }
    }

    fn forget(&self, tag: u16) {
        self.inner
            .pending
            .lock()
            .expect("pending map lock poisoned")
            .remove(&tag);
    }

    fn alloc_fid(&self) -> u32 {
        self.inner.next_fid.fetch_add(1, Ordering::Relaxed)
    }

    /// Walk `path` from the root onto a fresh fid, without opening it.
    async fn walk(&self, path: &str) -> Result<(u32, Qid), FsError> {
        let wnames: Vec<String> = path
            .split('/')
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        let fid = self.alloc_fid();
        let wanted = wnames.len();
        match self
            .rpc(RequestBody::Walk {
                fid: 0,
                newfid: fid,
                wnames,
            })
            .await?
        {
            ResponseBody::Walk { qids } if qids.len() == wanted => {
                let qid = qids.last().copied().unwrap_or(Qid {
                    ty: codec::QID_DIR,
                    version: 0,
                    path: 0,
                });
                Ok((fid, qid))
            }
            ResponseBody::Walk { .. } => {
                self.clunk(fid).await;
                Err(FsError::Service("no such file".into()))
            }
            _ => Err(FsError::Protocol("expected walk response")),
        }
    }

    /// Open `path` with `mode`.
    pub async fn open(&self, path: &str, mode: OpenMode) -> Result<FsFid, FsError> {
        let (fid, _) = self.walk(path).await?;
        match self.rpc(RequestBody::Open { fid, mode }).await {
            Ok(ResponseBody::Open { qid, iounit }) => Ok(self.handle(fid, qid, iounit)),
            Ok(_) => {
                self.clunk(fid).await;
                Err(FsError::Protocol("expected open response"))
            }
            Err(e) => {
                self.clunk(fid).await;
                Err(e)
            }
        }
    }

    /// Create `path` (its parent must exist) and open it with `mode`.
    pub async fn create(
        &self,
        path: &str,
        mode: OpenMode,
        perm: u32,
    ) -> Result<FsFid, FsError> {
        let trimmed = path.trim_end_matches('/');
        let (parent, name) = match trimmed.rfind('/') {
            Some(pos) => (&trimmed[..pos], &trimmed[pos + 1..]),
            None => ("", trimmed),
        };
        let (fid, _) = self.walk(parent).await?;
        match self
            .rpc(RequestBody::Create {
                fid,
                name: name.to_string(),
                mode,
                perm,
            })
            .await
        {
            Ok(ResponseBody::Create { qid, iounit }) => Ok(self.handle(fid, qid, iounit)),
            Ok(_) => {
                self.clunk(fid).await;
                Err(FsError::Protocol("expected create response"))
            }
            Err(e) => {
                self.clunk(fid).await;
                Err(e)
            }
        }
    }

    /// Stat `path` without keeping a handle.
    pub async fn stat(&self, path: &str) -> Result<Stat, FsError> {
        let (fid, _) = self.walk(path).await?;
        let result = match self.rpc(RequestBody::Stat { fid }).await {
            Ok(ResponseBody::Stat { stat }) => Ok(stat),
            Ok(_) => Err(FsError::Protocol("expected stat response")),
            Err(e) => Err(e),
        };
        self.clunk(fid).await;
        result
    }

    /// Whether `path` exists on the service.
    pub async fn access(&self, path: &str) -> bool {
        self.stat(path).await.is_ok()
    }

    async fn clunk(&self, fid: u32) {
        if let Err(e) = self.rpc(RequestBody::Clunk { fid }).await {
            debug!("{}: clunk fid {fid}: {e}", self.inner.label);
        }
    }

    fn handle(&self, fid: u32, qid: Qid, iounit: u32) -> FsFid {
        let iounit = if iounit == 0 { IOUNIT } else { iounit.min(IOUNIT) };
        FsFid {
            client: self.clone(),
            fid,
            qid,
            iounit,
            offset: AsyncMutex::new(0),
        }
    }
}

async fn read_responses<R>(inner: Arc<ClientInner>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; MAX_MSG];
    loop {
        let n = match wire::read_msg(&mut reader, &mut buf).await {
            Ok(n) => n,
            Err(e) => {
                debug!("{}: response stream closed: {e}", inner.label);
                break;
            }
        };
        let response = match codec::decode_response(&buf[..n]) {
            Ok(r) => r,
            Err(e) => {
                debug!("{}: bad response: {e}", inner.label);
                break;
            }
        };
        let waiter = inner
            .pending
            .lock()
            .expect("pending map lock poisoned")
            .remove(&response.tag);
        if let Some(tx) = waiter {
            let _ = tx.send(response.body);
        }
    }
    // Fail everything still in flight; later rpcs see the closed writer.
    inner.writer.lock().await.take();
    inner
        .pending
        .lock()
        .expect("pending map lock poisoned")
        .clear();
}

impl FsFid {
    /// Qid reported when the handle was opened.
    pub fn qid(&self) -> Qid {
        self.qid
    }

    /// Read up to `count` bytes at the current offset. An empty result means
    /// end of file.
    pub async fn read(&self, count: u32) -> Result<Vec<u8>, FsError> {
        let mut offset = self.offset.lock().await;
        let body = self
            .client
            .rpc(RequestBody::Read {
                fid: self.fid,
                offset: *offset,
                count: count.min(self.iounit),
            })
            .await?;
        match body {
            ResponseBody::Read { data } => {
                *offset += data.len() as u64;
                Ok(data)
            }
            _ => Err(FsError::Protocol("expected read response")),
        }
    }

    /// Read until end of file.
    pub async fn read_to_end(&self) -> Result<Vec<u8>, FsError> {
        let mut out = Vec::new();
        loop {
            let chunk = self.read(self.iounit).await?;
            if chunk.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
        }
    }

    /// Read until end of file and interpret as UTF-8 (lossily).
    pub async fn read_string(&self) -> Result<String, FsError> {
        let bytes = self.read_to_end().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Write all of `data` at the current offset.
    pub async fn write(&self, data: &[u8]) -> Result<usize, FsError> {
        let mut offset = self.offset.lock().await;
        let mut written = 0;
        while written < data.len() {
            let chunk = &data[written..(written + self.iounit as usize).min(data.len())];
            let body = self
                .client
                .rpc(RequestBody::Write {
                    fid: self.fid,
                    offset: *offset,
                    data: chunk.to_vec(),
                })
                .await?;
            match body {
                ResponseBody::Write { count } => {
                    written += count as usize;
                    *offset += u64::from(count);
                    if count == 0 {
                        return Err(FsError::Protocol("zero-length write accepted"));
                    }
                }
                _ => return Err(FsError::Protocol("expected write response")),
            }
        }
        Ok(written)
    }

    /// Write a control string (no newline appended).
    pub async fn print(&self, text: &str) -> Result<(), FsError> {
        self.write(text.as_bytes()).await.map(|_| ())
    }

    /// Read the handle as a directory: decode the full listing.
    pub async fn read_dir(&self) -> Result<Vec<Stat>, FsError> {
        let data = self.read_to_end().await?;
        Ok(Stat::decode_all(&data)?)
    }

    /// Stat the open handle.
    pub async fn stat(&self) -> Result<Stat, FsError> {
        match self.client.rpc(RequestBody::Stat { fid: self.fid }).await? {
            ResponseBody::Stat { stat } => Ok(stat),
            _ => Err(FsError::Protocol("expected stat response")),
        }
    }

    /// Release the handle on the service.
    pub async fn close(self) {
        self.client.clunk(self.fid).await;
    }
}
