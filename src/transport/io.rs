//! Transport adapter for tokio byte streams
//!
//! Wraps any `AsyncRead + AsyncWrite` stream. Handshake header lists travel
//! as an HTTP/1.1 upgrade block: the request pseudo-headers become the
//! request line and `Host`, `:status` becomes the status line. Everything
//! after the blank line is frame data.
//!
//! The stream is polled with a waker built from the loop's [`LoopWaker`], so
//! a `Pending` read or write surfaces as `WouldBlock` and readiness wakes
//! the loop.

use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use bytes::{Buf, BufMut, BytesMut};
use futures_util::future::BoxFuture;
use futures_util::task::noop_waker;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use super::{Connector, LoopWaker, Transport};
use crate::error::{Error, Result};
use crate::handshake::{Header, find_header};
use crate::{Config, RECV_BUFFER_SIZE};

/// Maximum HTTP header block size
const MAX_HEADER_SIZE: usize = 8192;

/// Which header block this end expects to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

/// [`Transport`] over a tokio stream
pub struct IoTransport<S> {
    stream: S,
    side: Side,
    waker: Waker,
    /// Encoded bytes not yet accepted by the stream
    pending: BytesMut,
    /// Unparsed header block, then leftover frame bytes
    inbound: BytesMut,
    headers_done: bool,
    shutdown: bool,
    eof: bool,
}

impl<S> IoTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Client end: sends a request block, reads a response block
    pub fn client(stream: S) -> Self {
        Self::new(stream, Side::Client)
    }

    /// Server end: reads a request block, sends a response block
    pub fn server(stream: S) -> Self {
        Self::new(stream, Side::Server)
    }

    fn new(stream: S, side: Side) -> Self {
        Self {
            stream,
            side,
            waker: noop_waker(),
            pending: BytesMut::new(),
            inbound: BytesMut::with_capacity(RECV_BUFFER_SIZE),
            headers_done: false,
            shutdown: false,
            eof: false,
        }
    }

    /// Write as much of `pending` as the stream accepts
    fn flush_pending(&mut self) -> Result<()> {
        let mut cx = Context::from_waker(&self.waker);
        while !self.pending.is_empty() {
            match Pin::new(&mut self.stream).poll_write(&mut cx, &self.pending) {
                Poll::Ready(Ok(0)) => return Err(Error::ConnectionClosed),
                Poll::Ready(Ok(n)) => self.pending.advance(n),
                Poll::Ready(Err(e)) => return Err(e.into()),
                Poll::Pending => return Err(Error::WouldBlock),
            }
        }
        let _ = Pin::new(&mut self.stream).poll_flush(&mut cx);
        Ok(())
    }

    fn finish(&mut self) {
        self.shutdown = true;
        let mut cx = Context::from_waker(&self.waker);
        let _ = Pin::new(&mut self.stream).poll_shutdown(&mut cx);
    }

    /// Read whatever is ready into `buf`
    fn poll_fill(&mut self, buf: &mut BytesMut) -> Result<usize> {
        if self.eof {
            return Ok(0);
        }
        let mut chunk = [0u8; RECV_BUFFER_SIZE];
        let mut read_buf = ReadBuf::new(&mut chunk);
        let mut cx = Context::from_waker(&self.waker);
        match Pin::new(&mut self.stream).poll_read(&mut cx, &mut read_buf) {
            Poll::Ready(Ok(())) => {
                let filled = read_buf.filled();
                if filled.is_empty() {
                    self.eof = true;
                }
                buf.put_slice(filled);
                Ok(filled.len())
            }
            Poll::Ready(Err(e)) => Err(e.into()),
            Poll::Pending => Err(Error::WouldBlock),
        }
    }
}

impl<S> Transport for IoTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn stream_send(&mut self, data: &[u8], fin: bool) -> Result<usize> {
        if self.shutdown {
            return Err(Error::ConnectionClosed);
        }
        self.flush_pending()?;

        let mut cx = Context::from_waker(&self.waker);
        let mut written = 0;
        while written < data.len() {
            match Pin::new(&mut self.stream).poll_write(&mut cx, &data[written..]) {
                Poll::Ready(Ok(0)) => return Err(Error::ConnectionClosed),
                Poll::Ready(Ok(n)) => written += n,
                Poll::Ready(Err(e)) => return Err(e.into()),
                Poll::Pending if written == 0 => return Err(Error::WouldBlock),
                Poll::Pending => return Ok(written),
            }
        }
        let _ = Pin::new(&mut self.stream).poll_flush(&mut cx);
        if fin {
            self.finish();
        }
        Ok(written)
    }

    fn stream_recv(&mut self, buf: &mut BytesMut) -> Result<usize> {
        if !self.inbound.is_empty() && self.headers_done {
            let n = self.inbound.len();
            buf.extend_from_slice(&self.inbound.split());
            return Ok(n);
        }
        self.poll_fill(buf)
    }

    fn send_headers(&mut self, headers: &[Header], fin: bool) -> Result<()> {
        encode_header_block(headers, &mut self.pending)?;
        match self.flush_pending() {
            Ok(()) | Err(Error::WouldBlock) => {}
            Err(e) => return Err(e),
        }
        if fin {
            self.finish();
        }
        Ok(())
    }

    fn recv_headers(&mut self) -> Result<Option<Vec<Header>>> {
        if self.headers_done {
            return Ok(None);
        }
        // retry any header bytes the stream did not take yet
        match self.flush_pending() {
            Ok(()) | Err(Error::WouldBlock) => {}
            Err(e) => return Err(e),
        }

        loop {
            if let Some((headers, len)) = parse_header_block(&self.inbound, self.side)? {
                self.inbound.advance(len);
                self.headers_done = true;
                return Ok(Some(headers));
            }
            if self.inbound.len() > MAX_HEADER_SIZE {
                return Err(Error::Handshake("header block too large"));
            }
            let mut buf = std::mem::take(&mut self.inbound);
            let res = self.poll_fill(&mut buf);
            self.inbound = buf;
            match res {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(_) => continue,
                Err(Error::WouldBlock) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    fn set_waker(&mut self, waker: LoopWaker) {
        self.waker = waker.to_waker();
    }

    fn close(&mut self) {
        if !self.shutdown {
            let _ = self.flush_pending();
            self.finish();
        }
    }
}

/// Serialize a header list as an HTTP/1.1 block
fn encode_header_block(headers: &[Header], buf: &mut BytesMut) -> Result<()> {
    if let Some(status) = find_header(headers, ":status") {
        let reason = match status {
            "101" => "Switching Protocols",
            "400" => "Bad Request",
            "426" => "Upgrade Required",
            _ => "Error",
        };
        buf.put_slice(format!("HTTP/1.1 {status} {reason}\r\n").as_bytes());
    } else {
        let method = find_header(headers, ":method").ok_or(Error::Handshake("missing :method"))?;
        let path = find_header(headers, ":path").unwrap_or("/");
        buf.put_slice(format!("{method} {path} HTTP/1.1\r\n").as_bytes());
        if let Some(authority) = find_header(headers, ":authority") {
            buf.put_slice(format!("host: {authority}\r\n").as_bytes());
        }
    }

    for header in headers.iter().filter(|h| !h.name.starts_with(':')) {
        buf.put_slice(header.name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(header.value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
    Ok(())
}

/// Parse an HTTP/1.1 block back into a header list with pseudo-headers
fn parse_header_block(buf: &[u8], side: Side) -> Result<Option<(Vec<Header>, usize)>> {
    let mut raw = [httparse::EMPTY_HEADER; 32];

    let (mut headers, len, raw_headers) = match side {
        Side::Server => {
            let mut req = httparse::Request::new(&mut raw);
            let len = match req.parse(buf) {
                Ok(httparse::Status::Complete(len)) => len,
                Ok(httparse::Status::Partial) => return Ok(None),
                Err(_) => return Err(Error::Handshake("malformed request block")),
            };
            let mut headers = vec![
                Header::new(":method", req.method.unwrap_or_default()),
                Header::new(":path", req.path.unwrap_or("/")),
                Header::new(":scheme", "http"),
            ];
            if let Some(host) = req
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case("host"))
            {
                let host = std::str::from_utf8(host.value)
                    .map_err(|_| Error::Handshake("invalid header value"))?;
                headers.push(Header::new(":authority", host));
            }
            (headers, len, req.headers.to_vec())
        }
        Side::Client => {
            let mut res = httparse::Response::new(&mut raw);
            let len = match res.parse(buf) {
                Ok(httparse::Status::Complete(len)) => len,
                Ok(httparse::Status::Partial) => return Ok(None),
                Err(_) => return Err(Error::Handshake("malformed response block")),
            };
            let status = res.code.unwrap_or(0).to_string();
            (vec![Header::new(":status", status)], len, res.headers.to_vec())
        }
    };

    for h in raw_headers.iter().filter(|h| !h.name.eq_ignore_ascii_case("host")) {
        let value =
            std::str::from_utf8(h.value).map_err(|_| Error::Handshake("invalid header value"))?;
        headers.push(Header::new(h.name, value));
    }

    Ok(Some((headers, len)))
}

/// Connects over plain TCP to `config.host:config.port`
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, config: &'a Config) -> BoxFuture<'a, Result<Box<dyn Transport>>> {
        Box::pin(async move {
            let stream = tokio::time::timeout(
                config.connect_timeout(),
                TcpStream::connect((config.host.as_str(), config.port)),
            )
            .await
            .map_err(|_| Error::Timeout(format!("connect to {}", config.authority())))??;
            stream.set_nodelay(true)?;
            Ok(Box::new(IoTransport::client(stream)) as Box<dyn Transport>)
        })
    }
}
