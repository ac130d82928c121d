//! In-process transport pair
//!
//! Two [`MemoryTransport`] ends share a pair of pipes. Used by the tests and
//! by anything that wants a client and server in the same process.
//!
//! Fault injection:
//! - [`MemoryTransport::set_capacity`] bounds the unread bytes a pipe holds,
//!   so writes past it report `WouldBlock`
//! - [`MemoryTransport::reset`] makes both ends fail with `ConnectionReset`
//! - [`MemoryConnector::fail_next`] refuses the next N connects

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::{Buf, BytesMut};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Connector, LoopWaker, Transport};
use crate::Config;
use crate::error::{Error, Result};
use crate::handshake::Header;

#[derive(Default)]
struct Pipe {
    data: BytesMut,
    headers: VecDeque<Vec<Header>>,
    fin: bool,
    reset: bool,
    capacity: Option<usize>,
    reader: Option<LoopWaker>,
    writer: Option<LoopWaker>,
}

impl Pipe {
    fn wake_reader(&self) {
        if let Some(w) = &self.reader {
            w.wake();
        }
    }
}

fn reset_pipes(pipes: [&Arc<Mutex<Pipe>>; 2]) {
    for pipe in pipes {
        let mut p = pipe.lock();
        p.reset = true;
        p.wake_reader();
        if let Some(w) = &p.writer {
            w.wake();
        }
    }
}

/// Resets a [`MemoryTransport`] from outside its owner
#[derive(Clone)]
pub struct ResetHandle {
    outbound: Arc<Mutex<Pipe>>,
    inbound: Arc<Mutex<Pipe>>,
}

impl ResetHandle {
    pub fn reset(&self) {
        reset_pipes([&self.outbound, &self.inbound]);
    }
}

/// One end of an in-memory stream
pub struct MemoryTransport {
    outbound: Arc<Mutex<Pipe>>,
    inbound: Arc<Mutex<Pipe>>,
}

/// Create a connected pair of transports
pub fn pair() -> (MemoryTransport, MemoryTransport) {
    let a_to_b = Arc::new(Mutex::new(Pipe::default()));
    let b_to_a = Arc::new(Mutex::new(Pipe::default()));
    (
        MemoryTransport {
            outbound: a_to_b.clone(),
            inbound: b_to_a.clone(),
        },
        MemoryTransport {
            outbound: b_to_a,
            inbound: a_to_b,
        },
    )
}

impl MemoryTransport {
    /// Limit unread bytes in this end's outbound pipe
    pub fn set_capacity(&self, capacity: Option<usize>) {
        self.outbound.lock().capacity = capacity;
    }

    /// Abort the stream in both directions
    pub fn reset(&self) {
        reset_pipes([&self.outbound, &self.inbound]);
    }

    /// Handle that can reset this stream after the transport moved elsewhere
    pub fn reset_handle(&self) -> ResetHandle {
        ResetHandle {
            outbound: self.outbound.clone(),
            inbound: self.inbound.clone(),
        }
    }

    /// Bytes written by this end and not yet read by the peer
    pub fn unread(&self) -> usize {
        self.outbound.lock().data.len()
    }

    /// Whether this end has finished its send side
    pub fn is_finished(&self) -> bool {
        self.outbound.lock().fin
    }
}

impl Transport for MemoryTransport {
    fn stream_send(&mut self, data: &[u8], fin: bool) -> Result<usize> {
        let mut pipe = self.outbound.lock();
        if pipe.reset {
            return Err(Error::ConnectionReset);
        }
        if pipe.fin {
            return Err(Error::ConnectionClosed);
        }

        let room = pipe
            .capacity
            .map_or(usize::MAX, |cap| cap.saturating_sub(pipe.data.len()));
        if room == 0 && !data.is_empty() {
            return Err(Error::WouldBlock);
        }

        let n = data.len().min(room);
        pipe.data.extend_from_slice(&data[..n]);
        if fin && n == data.len() {
            pipe.fin = true;
        }
        pipe.wake_reader();
        Ok(n)
    }

    fn stream_recv(&mut self, buf: &mut BytesMut) -> Result<usize> {
        let mut pipe = self.inbound.lock();
        if pipe.reset {
            return Err(Error::ConnectionReset);
        }
        if pipe.data.is_empty() {
            return if pipe.fin { Ok(0) } else { Err(Error::WouldBlock) };
        }

        let n = pipe.data.len();
        buf.extend_from_slice(&pipe.data);
        pipe.data.advance(n);
        if let Some(w) = &pipe.writer {
            w.wake();
        }
        Ok(n)
    }

    fn send_headers(&mut self, headers: &[Header], fin: bool) -> Result<()> {
        let mut pipe = self.outbound.lock();
        if pipe.reset {
            return Err(Error::ConnectionReset);
        }
        if pipe.fin {
            return Err(Error::ConnectionClosed);
        }
        pipe.headers.push_back(headers.to_vec());
        pipe.fin |= fin;
        pipe.wake_reader();
        Ok(())
    }

    fn recv_headers(&mut self) -> Result<Option<Vec<Header>>> {
        let mut pipe = self.inbound.lock();
        if pipe.reset {
            return Err(Error::ConnectionReset);
        }
        match pipe.headers.pop_front() {
            Some(headers) => Ok(Some(headers)),
            None if pipe.fin => Err(Error::ConnectionClosed),
            None => Ok(None),
        }
    }

    fn set_waker(&mut self, waker: LoopWaker) {
        self.inbound.lock().reader = Some(waker.clone());
        self.outbound.lock().writer = Some(waker);
    }

    fn close(&mut self) {
        let mut pipe = self.outbound.lock();
        pipe.fin = true;
        pipe.wake_reader();
    }
}

/// Connector handing the server end of each new pair to a receiver
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<MemoryTransport>,
    failures: AtomicU32,
}

impl MemoryConnector {
    /// Create a connector and the receiver of server-side ends
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryTransport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                accepted: tx,
                failures: AtomicU32::new(0),
            },
            rx,
        )
    }

    /// Refuse the next `n` connection attempts
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

impl Connector for MemoryConnector {
    fn connect<'a>(&'a self, _config: &'a Config) -> BoxFuture<'a, Result<Box<dyn Transport>>> {
        Box::pin(async move {
            let refused = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(Error::Transport("connection refused".into()));
            }

            let (client, server) = pair();
            self.accepted
                .send(server)
                .map_err(|_| Error::Transport("no listener".into()))?;
            Ok(Box::new(client) as Box<dyn Transport>)
        })
    }
}
