//! Reusable message buffers for the multiplexer.
//!
//! Every frame moving through a session borrows one [`Msg`] from the shared
//! pool and returns it when written out or dropped on error, so steady-state
//! traffic does not allocate per message. The pool grows without bound under
//! load; backpressure comes from the per-port channel capacities above it.

use std::sync::Mutex;

use crate::proto::{Port, MAX_MSG};

/// One in-flight message: an optional destination port and up to
/// [`MAX_MSG`] payload bytes. Owned by exactly one task at a time.
pub struct Msg {
    /// Destination port; `None` when the frame goes to a dedicated
    /// single-port descriptor and needs no tag byte.
    pub port: Option<Port>,
    /// Valid length of `buf`.
    pub len: usize,
    /// Payload storage.
    pub buf: Box<[u8; MAX_MSG]>,
}

impl Msg {
    fn new() -> Msg {
        Msg {
            port: None,
            len: 0,
            buf: Box::new([0u8; MAX_MSG]),
        }
    }

    /// The valid payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Replace the payload, panicking if it exceeds the buffer.
    pub fn set_payload(&mut self, data: &[u8]) {
        self.buf[..data.len()].copy_from_slice(data);
        self.len = data.len();
    }
}

/// Free list of message buffers.
pub struct MsgPool {
    free: Mutex<Vec<Msg>>,
}

impl MsgPool {
    /// Create an empty pool.
    pub fn new() -> MsgPool {
        MsgPool {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Take a buffer with zeroed metadata, reusing a free one if available.
    pub fn acquire(&self) -> Msg {
        let mut msg = self
            .free
            .lock()
            .expect("message pool lock poisoned")
            .pop()
            .unwrap_or_else(Msg::new);
        msg.len = 0;
        msg.port = None;
        msg
    }

    /// Return a buffer to the free list.
    pub fn release(&self, msg: Msg) {
        self.free
            .lock()
            .expect("message pool lock poisoned")
            .push(msg);
    }
}

impl Default for MsgPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_reuses_released_buffers() {
        let pool = MsgPool::new();
        let mut msg = pool.acquire();
        msg.set_payload(b"abc");
        msg.port = Some(Port::Cmd);
        let ptr = msg.buf.as_ptr();
        pool.release(msg);

        let again = pool.acquire();
        assert_eq!(again.buf.as_ptr(), ptr);
        assert_eq!(again.len, 0);
        assert_eq!(again.port, None);
    }

    #[test]
    fn pool_grows_when_empty() {
        let pool = MsgPool::new();
        let a = pool.acquire();
        let b = pool.acquire();
        assert_ne!(a.buf.as_ptr(), b.buf.as_ptr());
    }
}
