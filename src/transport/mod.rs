//! Transport collaborator interface
//!
//! A [`Transport`] is one bidirectional stream plus a header-list exchange
//! used only during the opening handshake. Calls never block:
//!
//! - `stream_send` returns the number of bytes accepted or
//!   [`Error::WouldBlock`](crate::Error::WouldBlock)
//! - `stream_recv` appends available bytes, returns `Ok(0)` once the peer
//!   has finished its side, or `WouldBlock` when nothing is ready
//! - `recv_headers` returns `Ok(None)` until the peer's header list arrives
//!
//! Readiness is signalled through a [`LoopWaker`] the transport keeps and
//! wakes whenever new bytes or headers arrive.
//!
//! Adapters:
//! - [`memory`]: in-process pair for tests
//! - [`io`]: any tokio `AsyncRead + AsyncWrite` stream (TCP, TLS, a QUIC
//!   bidirectional stream), header lists carried as an HTTP/1.1 block

pub mod io;
pub mod memory;

use std::sync::Arc;
use std::task::Waker;

use bytes::BytesMut;
use futures_util::future::BoxFuture;
use futures_util::task::ArcWake;
use tokio::sync::Notify;

use crate::Config;
use crate::error::Result;
use crate::handshake::Header;

/// Non-blocking stream + header exchange
pub trait Transport: Send {
    /// Write bytes, optionally finishing the send side once all are written
    fn stream_send(&mut self, data: &[u8], fin: bool) -> Result<usize>;

    /// Append received bytes to `buf`
    fn stream_recv(&mut self, buf: &mut BytesMut) -> Result<usize>;

    /// Send a header list
    fn send_headers(&mut self, headers: &[Header], fin: bool) -> Result<()>;

    /// Take the peer's header list once it has arrived
    fn recv_headers(&mut self) -> Result<Option<Vec<Header>>>;

    /// Register the waker to signal when the transport becomes ready
    fn set_waker(&mut self, _waker: LoopWaker) {}

    /// Finish the send side and release the stream
    fn close(&mut self) {}
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    #[inline]
    fn stream_send(&mut self, data: &[u8], fin: bool) -> Result<usize> {
        (**self).stream_send(data, fin)
    }

    #[inline]
    fn stream_recv(&mut self, buf: &mut BytesMut) -> Result<usize> {
        (**self).stream_recv(buf)
    }

    fn send_headers(&mut self, headers: &[Header], fin: bool) -> Result<()> {
        (**self).send_headers(headers, fin)
    }

    fn recv_headers(&mut self) -> Result<Option<Vec<Header>>> {
        (**self).recv_headers()
    }

    fn set_waker(&mut self, waker: LoopWaker) {
        (**self).set_waker(waker)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Opens a new transport per connection attempt
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, config: &'a Config) -> BoxFuture<'a, Result<Box<dyn Transport>>>;
}

/// Cross-thread wakeup for the single-threaded event loop
///
/// Wakes are sticky: a wake that happens while the loop is busy is observed
/// by the next `notified().await`.
#[derive(Clone, Default)]
pub struct LoopWaker {
    notify: Arc<Notify>,
}

impl LoopWaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake the loop
    #[inline]
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Wait until woken
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    /// Adapt into a `std::task::Waker` for polling tokio I/O
    pub fn to_waker(&self) -> Waker {
        futures_util::task::waker(Arc::new(NotifyWake(self.notify.clone())))
    }
}

impl std::fmt::Debug for LoopWaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopWaker").finish_non_exhaustive()
    }
}

struct NotifyWake(Arc<Notify>);

impl ArcWake for NotifyWake {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wake_before_wait_is_kept() {
        let waker = LoopWaker::new();
        waker.wake();
        tokio::time::timeout(Duration::from_millis(100), waker.notified())
            .await
            .expect("stored wake should complete immediately");
    }

    #[tokio::test]
    async fn test_std_waker_wakes_loop() {
        let waker = LoopWaker::new();
        let std_waker = waker.to_waker();
        std::thread::spawn(move || std_waker.wake());
        tokio::time::timeout(Duration::from_secs(1), waker.notified())
            .await
            .expect("thread wake should reach the loop");
    }
}
