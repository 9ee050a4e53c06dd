//! File-protocol serving: the dispatch loop shared by the command and export
//! services, and the remote-side multiplexed serve topology.
//!
//! A service implements [`FileService`]; [`serve`] runs one connection worth
//! of requests against it. Quick operations (walk, open, stat, clunk) answer
//! inline. Reads and writes receive a [`Reply`] they may complete from a
//! spawned task, so a read blocked on a child process's stdout never stalls
//! the dispatch loop.

pub mod cmdfs;
pub mod exportfs;

use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::pool::{Msg, MsgPool};
use crate::proto::codec::{
    self, OpenMode, Qid, Response, ResponseBody, Stat, IOUNIT, VERSION,
};
use crate::proto::{wire, Port, HANDSHAKE, MAX_MSG};

/// Result type for the quick service operations; the error string travels to
/// the client verbatim.
pub type SrvResult<T> = Result<T, String>;

/// Completion handle for one read or write request.
pub struct Reply {
    tag: u16,
    tx: mpsc::Sender<Response>,
}

impl Reply {
    /// Answer a read with data; empty means end of file.
    pub async fn data(self, data: Vec<u8>) {
        let _ = self
            .tx
            .send(Response {
                tag: self.tag,
                body: ResponseBody::Read { data },
            })
            .await;
    }

    /// Answer a write with the accepted byte count.
    pub async fn count(self, count: u32) {
        let _ = self
            .tx
            .send(Response {
                tag: self.tag,
                body: ResponseBody::Write { count },
            })
            .await;
    }

    /// Fail the request.
    pub async fn error(self, message: impl Into<String>) {
        let _ = self
            .tx
            .send(Response {
                tag: self.tag,
                body: ResponseBody::Error {
                    message: message.into(),
                },
            })
            .await;
    }
}

/// One file service: a namespace of fids over some backing state.
#[async_trait]
pub trait FileService: Send + Sync + 'static {
    /// Service name for logs.
    fn label(&self) -> &'static str;

    /// Bind `fid` to the service root.
    async fn attach(&self, fid: u32) -> SrvResult<Qid>;

    /// Clone `fid` to `newfid`, then walk the elements. Returns one qid per
    /// element walked.
    async fn walk(&self, fid: u32, newfid: u32, wnames: &[String]) -> SrvResult<Vec<Qid>>;

    /// Open a walked fid. Returns its qid and preferred I/O size.
    async fn open(&self, fid: u32, mode: OpenMode) -> SrvResult<(Qid, u32)>;

    /// Create `name` under the directory `fid` and rebind the fid to it.
    async fn create(&self, fid: u32, name: &str, mode: OpenMode, perm: u32)
        -> SrvResult<(Qid, u32)>;

    /// Read from an open fid; complete through `reply`, possibly later.
    async fn read(&self, fid: u32, offset: u64, count: u32, reply: Reply);

    /// Write to an open fid; complete through `reply`, possibly later.
    async fn write(&self, fid: u32, offset: u64, data: Vec<u8>, reply: Reply);

    /// Metadata for a fid.
    async fn stat(&self, fid: u32) -> SrvResult<Stat>;

    /// Release a fid and whatever it references.
    async fn clunk(&self, fid: u32);
}

/// Serve one connection. Returns when the peer closes the stream or the
/// transport fails.
pub async fn serve<S>(service: Arc<dyn FileService>, stream: S) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let (reply_tx, mut reply_rx) = mpsc::channel::<Response>(64);

    let label = service.label();
    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(response) = reply_rx.recv().await {
            let bytes = match codec::encode_response(&response) {
                Ok(b) => b,
                Err(e) => {
                    warn!("{label}: cannot encode response: {e}");
                    continue;
                }
            };
            if wire::write_msg(&mut writer, None, &bytes).await.is_err() {
                break;
            }
        }
    });

    let mut buf = vec![0u8; MAX_MSG];
    loop {
        let n = match wire::read_msg(&mut reader, &mut buf).await {
            Ok(n) => n,
            Err(e) => {
                debug!("{label}: request stream closed: {e}");
                break;
            }
        };
        let request = match codec::decode_request(&buf[..n]) {
            Ok(r) => r,
            Err(e) => {
                debug!("{label}: bad request: {e}");
                break;
            }
        };
        dispatch(&service, request, &reply_tx).await;
    }

    drop(reply_tx);
    let _ = writer_task.await;
    Ok(())
}

async fn dispatch(
    service: &Arc<dyn FileService>,
    request: codec::Request,
    reply_tx: &mpsc::Sender<Response>,
) {
    use codec::RequestBody as Req;

    let tag = request.tag;
    let body = match request.body {
        Req::Version { msize, .. } => ResponseBody::Version {
            msize: msize.min(MAX_MSG as u32),
            version: VERSION.into(),
        },
        Req::Attach { fid } => match service.attach(fid).await {
            Ok(qid) => ResponseBody::Attach { qid },
            Err(message) => ResponseBody::Error { message },
        },
        Req::Walk {
            fid,
            newfid,
            wnames,
        } => match service.walk(fid, newfid, &wnames).await {
            Ok(qids) => ResponseBody::Walk { qids },
            Err(message) => ResponseBody::Error { message },
        },
        Req::Open { fid, mode } => match service.open(fid, mode).await {
            Ok((qid, iounit)) => ResponseBody::Open { qid, iounit },
            Err(message) => ResponseBody::Error { message },
        },
        Req::Create {
            fid,
            name,
            mode,
            perm,
        } => match service.create(fid, &name, mode, perm).await {
            Ok((qid, iounit)) => ResponseBody::Create { qid, iounit },
            Err(message) => ResponseBody::Error { message },
        },
        Req::Stat { fid } => match service.stat(fid).await {
            Ok(stat) => ResponseBody::Stat { stat },
            Err(message) => ResponseBody::Error { message },
        },
        Req::Clunk { fid } => {
            service.clunk(fid).await;
            ResponseBody::Clunk
        }
        Req::Read { fid, offset, count } => {
            let reply = Reply {
                tag,
                tx: reply_tx.clone(),
            };
            service.read(fid, offset, count, reply).await;
            return;
        }
        Req::Write { fid, offset, data } => {
            let reply = Reply {
                tag,
                tx: reply_tx.clone(),
            };
            service.write(fid, offset, data, reply).await;
            return;
        }
    };
    let _ = reply_tx.send(Response { tag, body }).await;
}

/// Stat record for a synthetic (service-defined) file.
pub(crate) fn synthetic_stat(name: &str, qid: Qid, perm: u32) -> Stat {
    Stat {
        name: name.to_string(),
        mode: if qid.is_dir() {
            codec::MODE_DIR | perm
        } else {
            perm
        },
        length: 0,
        qid,
    }
}

/// Serve the preferred I/O unit for open/create responses.
pub(crate) const fn iounit() -> u32 {
    IOUNIT
}

/// Run the remote side of a session: bridge the export and command services,
/// plus Unix listeners for the plumber and editor-control ports, onto the
/// multiplexed transport, then pump frames until the transport closes.
///
/// Writes the handshake marker once everything is listening. The inbound
/// loop runs on the calling task; it returns when `transport_rd` reaches
/// end-of-stream.
pub async fn serve_mux<R, W>(
    mut transport_rd: R,
    transport_wr: W,
    export: Arc<dyn FileService>,
    cmd: Arc<dyn FileService>,
    namespace: &Path,
    pool: Arc<MsgPool>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let out = Arc::new(Mutex::new(transport_wr));
    let mut inbound = Vec::with_capacity(Port::COUNT);

    for port in Port::ALL {
        let (tx, rx) = mpsc::channel::<Msg>(1);
        inbound.push(tx);
        match port {
            Port::Export | Port::Cmd => {
                let (app, bridge) = tokio::io::duplex(MAX_MSG * 4);
                let service = if port == Port::Export {
                    export.clone()
                } else {
                    cmd.clone()
                };
                tokio::spawn(async move {
                    if let Err(e) = serve(service, app).await {
                        debug!("{}: service loop ended: {e}", port.label());
                    }
                });
                let (bridge_rd, bridge_wr) = tokio::io::split(bridge);
                tokio::spawn(port_in_loop(rx, bridge_wr, pool.clone()));
                tokio::spawn(port_out_loop(port, bridge_rd, out.clone()));
            }
            Port::Plumb | Port::Editor => {
                let path = namespace.join(port.label());
                // A stale socket from a previous run would make bind fail.
                let _ = std::fs::remove_file(&path);
                let listener = UnixListener::bind(&path)?;
                tokio::spawn(port_accept_loop(port, listener, rx, out.clone(), pool.clone()));
            }
        }
    }

    {
        let mut out = out.lock().await;
        out.write_all(HANDSHAKE).await?;
        out.flush().await?;
    }
    info!("serving on multiplexed transport");

    // Inbound demultiplexer: stdin frames fan out to the port endpoints.
    loop {
        let mut tag = [0u8; 1];
        if transport_rd.read_exact(&mut tag).await.is_err() {
            info!("transport closed, exiting");
            return Ok(());
        }
        let mut msg = pool.acquire();
        let n = match wire::read_msg(&mut transport_rd, &mut msg.buf[..]).await {
            Ok(n) => n,
            Err(e) => {
                pool.release(msg);
                return Err(e);
            }
        };
        msg.len = n;
        match Port::try_from(tag[0]) {
            Ok(port) => {
                if inbound[port.index()].send(msg).await.is_err() {
                    return Ok(());
                }
            }
            Err(bad) => {
                warn!("invalid destination port {bad}");
                pool.release(msg);
            }
        }
    }
}

// Drain one port's inbound frames into its local endpoint.
async fn port_in_loop<W>(mut rx: mpsc::Receiver<Msg>, mut writer: W, pool: Arc<MsgPool>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while let Some(msg) = rx.recv().await {
        let result = wire::write_msg(&mut writer, None, msg.payload()).await;
        pool.release(msg);
        if result.is_err() {
            break;
        }
    }
}

// Read messages from one local endpoint and write tagged frames to the
// shared transport, whole frames under the write lock.
async fn port_out_loop<R, W>(port: Port, mut reader: R, out: Arc<Mutex<W>>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut buf = vec![0u8; MAX_MSG];
    loop {
        let n = match wire::read_msg(&mut reader, &mut buf).await {
            Ok(n) => n,
            Err(_) => return,
        };
        let mut out = out.lock().await;
        if wire::write_msg(&mut *out, Some(port as u8), &buf[..n])
            .await
            .is_err()
        {
            return;
        }
    }
}

// Accept one local connection at a time on a posted service socket and
// bridge it to the port, the original posted-pipe semantics.
async fn port_accept_loop<W>(
    port: Port,
    listener: UnixListener,
    mut rx: mpsc::Receiver<Msg>,
    out: Arc<Mutex<W>>,
    pool: Arc<MsgPool>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let Ok((conn, _)) = listener.accept().await else {
            return;
        };
        let (conn_rd, mut conn_wr) = conn.into_split();

        let inbound = async {
            while let Some(msg) = rx.recv().await {
                let result = wire::write_msg(&mut conn_wr, None, msg.payload()).await;
                pool.release(msg);
                if result.is_err() {
                    return false;
                }
            }
            true
        };
        let outbound = port_out_loop(port, conn_rd, out.clone());

        tokio::select! {
            closed = inbound => {
                if closed {
                    // Demultiplexer is gone; no more traffic will come.
                    return;
                }
            }
            () = outbound => {}
        }
        debug!("{}: local connection closed, re-listening", port.label());
    }
}
