//! Reader and writer tasks that move whole messages between one descriptor
//! and the per-port channels.
//!
//! Three shapes, all sharing the same exit protocol (see [`crate::session`]):
//!
//! - the **demultiplexer** reads tagged frames from the remote descriptor and
//!   fans them out to each port's inbound channel;
//! - a **port reader** reads untagged messages from one local endpoint,
//!   stamps its fixed port, and feeds the shared fan-in channel;
//! - a **writer** drains one channel onto a descriptor, prefixing the tag
//!   byte only for messages that carry a port (fan-in traffic).
//!
//! Within a port, order is preserved: one reader, one channel, one writer per
//! direction. Across ports nothing is ordered, and nothing needs to be.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tracing::warn;

use crate::pool::{Msg, MsgPool};
use crate::proto::{wire, Port};
use crate::session::Session;

/// Start the demultiplexer for the remote descriptor. `inbound` is indexed by
/// port tag.
pub(crate) fn spawn_demux<R>(
    session: &Arc<Session>,
    pool: &Arc<MsgPool>,
    name: String,
    reader: R,
    inbound: Vec<mpsc::Sender<Msg>>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    session.addref();
    let session = session.clone();
    let pool = pool.clone();
    tokio::spawn(async move {
        run_reader(session, pool, name, reader, None, inbound).await;
    });
}

/// Start a single-port reader: every message read from `reader` is stamped
/// with `port` and sent into the shared fan-in channel.
pub(crate) fn spawn_port_reader<R>(
    session: &Arc<Session>,
    pool: &Arc<MsgPool>,
    name: String,
    reader: R,
    port: Port,
    outbound: mpsc::Sender<Msg>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    session.addref();
    let session = session.clone();
    let pool = pool.clone();
    tokio::spawn(async move {
        run_reader(session, pool, name, reader, Some(port), vec![outbound]).await;
    });
}

/// Start a writer draining `rx` onto `writer`.
pub(crate) fn spawn_writer<W>(
    session: &Arc<Session>,
    pool: &Arc<MsgPool>,
    name: String,
    rx: mpsc::Receiver<Msg>,
    writer: W,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    session.addref();
    let session = session.clone();
    let pool = pool.clone();
    tokio::spawn(async move {
        run_writer(session, pool, name, rx, writer).await;
    });
}

// Shared loop for the demultiplexer (fixed == None: a tag byte leads every
// frame) and single-port readers (fixed == Some: no tag on the wire).
async fn run_reader<R>(
    session: Arc<Session>,
    pool: Arc<MsgPool>,
    name: String,
    mut reader: R,
    fixed: Option<Port>,
    channels: Vec<mpsc::Sender<Msg>>,
) where
    R: AsyncRead + Unpin,
{
    let mut stop = session.stop_rx();
    loop {
        let mut msg = pool.acquire();

        let index = if let Some(port) = fixed {
            msg.port = Some(port);
            0
        } else {
            let mut tag = [0u8; 1];
            let read = tokio::select! {
                r = reader.read_exact(&mut tag) => Some(r),
                _ = stop.recv() => None,
            };
            match read {
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    pool.release(msg);
                    session.error(format!("{name}: read error: {e}"));
                    return;
                }
                None => {
                    pool.release(msg);
                    session.close();
                    return;
                }
            }
            match Port::try_from(tag[0]) {
                Ok(port) => port.index(),
                Err(bad) => {
                    // Protocol violation, not fatal: consume the frame's
                    // message and move on.
                    let drained = tokio::select! {
                        r = wire::read_msg(&mut reader, &mut msg.buf[..]) => Some(r),
                        _ = stop.recv() => None,
                    };
                    match drained {
                        Some(Ok(_)) => {
                            warn!(host = %session.host(), "{name}: invalid destination port {bad}");
                            pool.release(msg);
                            continue;
                        }
                        Some(Err(e)) => {
                            pool.release(msg);
                            session.error(format!("{name}: read error: {e}"));
                            return;
                        }
                        None => {
                            pool.release(msg);
                            session.close();
                            return;
                        }
                    }
                }
            }
        };

        let read = tokio::select! {
            r = wire::read_msg(&mut reader, &mut msg.buf[..]) => Some(r),
            _ = stop.recv() => None,
        };
        match read {
            Some(Ok(n)) => msg.len = n,
            Some(Err(e)) => {
                pool.release(msg);
                session.error(format!("{name}: read error: {e}"));
                return;
            }
            None => {
                pool.release(msg);
                session.close();
                return;
            }
        }

        let permit = tokio::select! {
            p = channels[index].reserve() => p.ok(),
            _ = stop.recv() => None,
        };
        match permit {
            Some(permit) => permit.send(msg),
            None => {
                // Stopping, or the draining writer is already gone.
                pool.release(msg);
                session.close();
                return;
            }
        }
    }
}

async fn run_writer<W>(
    session: Arc<Session>,
    pool: Arc<MsgPool>,
    name: String,
    mut rx: mpsc::Receiver<Msg>,
    mut writer: W,
) where
    W: AsyncWrite + Unpin,
{
    let mut stop = session.stop_rx();
    loop {
        let msg = tokio::select! {
            m = rx.recv() => m,
            _ = stop.recv() => None,
        };
        let Some(msg) = msg else {
            session.close();
            return;
        };

        let tag = msg.port.map(|p| p as u8);
        let written = tokio::select! {
            r = wire::write_msg(&mut writer, tag, msg.payload()) => Some(r),
            _ = stop.recv() => None,
        };
        pool.release(msg);
        match written {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                session.error(format!("{name}: write error: {e}"));
                return;
            }
            None => {
                session.close();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::MAX_MSG;
    use crate::session::run_watchdog;
    use std::time::Duration;

    fn encode_test_msg(body: &[u8]) -> Vec<u8> {
        let size = body.len() + 4;
        let mut out = Vec::with_capacity(size);
        out.extend_from_slice(&(size as u32).to_le_bytes());
        out.extend_from_slice(body);
        out
    }

    fn msg_with(pool: &MsgPool, port: Option<Port>, body: &[u8]) -> Msg {
        let mut msg = pool.acquire();
        msg.set_payload(&encode_test_msg(body));
        msg.port = port;
        msg
    }

    #[tokio::test]
    async fn writer_preserves_per_port_order_and_tags() {
        let (session, wd) = Session::new("testhost");
        tokio::spawn(run_watchdog(wd, session.clone(), None, None));
        session.addref();
        let pool = Arc::new(MsgPool::new());

        let (wire_a, mut wire_b) = tokio::io::duplex(MAX_MSG * 8);
        let (tx, rx) = mpsc::channel(1);
        spawn_writer(&session, &pool, "mux->remote".into(), rx, wire_a);

        for (port, body) in [
            (Port::Cmd, &b"first"[..]),
            (Port::Cmd, &b"second"[..]),
            (Port::Export, &b"other"[..]),
        ] {
            tx.send(msg_with(&pool, Some(port), body)).await.unwrap();
        }

        for (tag, body) in [(1u8, &b"first"[..]), (1, &b"second"[..]), (0, &b"other"[..])] {
            let mut got_tag = [0u8; 1];
            wire_b.read_exact(&mut got_tag).await.unwrap();
            assert_eq!(got_tag[0], tag);
            let mut buf = vec![0u8; MAX_MSG];
            let n = wire::read_msg(&mut wire_b, &mut buf).await.unwrap();
            assert_eq!(&buf[4..n], body);
        }
    }

    #[tokio::test]
    async fn demux_routes_by_tag_and_drops_invalid_ports() {
        let (session, wd) = Session::new("testhost");
        tokio::spawn(run_watchdog(wd, session.clone(), None, None));
        session.addref();
        let pool = Arc::new(MsgPool::new());

        let (mut wire_a, wire_b) = tokio::io::duplex(MAX_MSG * 8);
        let mut inbound_rx = Vec::new();
        let mut inbound_tx = Vec::new();
        for _ in 0..Port::COUNT {
            let (tx, rx) = mpsc::channel(1);
            inbound_tx.push(tx);
            inbound_rx.push(rx);
        }
        spawn_demux(&session, &pool, "remote->mux".into(), wire_b, inbound_tx);

        wire::write_msg(&mut wire_a, Some(1), &encode_test_msg(b"for cmd"))
            .await
            .unwrap();
        // Tag 9 is out of range: dropped with a warning, not fatal.
        wire::write_msg(&mut wire_a, Some(9), &encode_test_msg(b"nonsense"))
            .await
            .unwrap();
        wire::write_msg(&mut wire_a, Some(3), &encode_test_msg(b"for editor"))
            .await
            .unwrap();

        let msg = inbound_rx[1].recv().await.unwrap();
        assert_eq!(&msg.payload()[4..], b"for cmd");
        pool.release(msg);

        let msg = inbound_rx[3].recv().await.unwrap();
        assert_eq!(&msg.payload()[4..], b"for editor");
        pool.release(msg);
    }

    #[tokio::test]
    async fn transport_eof_stops_the_session() {
        let (session, wd) = Session::new("testhost");
        let watchdog = tokio::spawn(run_watchdog(wd, session.clone(), None, None));
        session.addref(); // owner reference
        let pool = Arc::new(MsgPool::new());

        let (wire_a, wire_b) = tokio::io::duplex(MAX_MSG);
        let mut inbound_tx = Vec::new();
        for _ in 0..Port::COUNT {
            let (tx, _rx) = mpsc::channel::<Msg>(1);
            inbound_tx.push(tx);
        }
        spawn_demux(&session, &pool, "remote->mux".into(), wire_b, inbound_tx);

        let mut stop = session.stop_rx();
        drop(wire_a); // remote dies
        tokio::time::timeout(Duration::from_secs(2), stop.recv())
            .await
            .expect("teardown begins in bounded time")
            .unwrap();

        session.close(); // owner lets go; watchdog can now finish
        tokio::time::timeout(Duration::from_secs(2), watchdog)
            .await
            .expect("watchdog terminates")
            .unwrap();
    }
}
