//! Framed connections
//!
//! Wraps a TCP or TLS socket with per-operation deadlines, pullable byte
//! counters, delimiter-based framing with a line cap, raw binary reads for
//! payload phases, and streaming zlib that can be switched on and off
//! mid-stream on either direction.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::TlsStream;

use crate::error::{DcError, Result};

/// Default per-read deadline.
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);
/// Default per-write deadline.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Longest accepted delimited line.
pub const MAX_LINE_SIZE: usize = 10 * 1024;

const READ_CHUNK: usize = 64 * 1024;

/// A plain or TLS-wrapped TCP stream.
pub enum NetStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for NetStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NetStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            NetStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NetStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            NetStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            NetStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NetStream::Plain(s) => Pin::new(s).poll_flush(cx),
            NetStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NetStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            NetStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

impl NetStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, NetStream::Tls(_))
    }
}

/// Monotonic transfer counters, read as a delta (pulling resets).
#[derive(Default)]
pub struct ConnCounters {
    read: AtomicU64,
    write: AtomicU64,
}

impl ConnCounters {
    pub fn pull_read(&self) -> u64 {
        self.read.swap(0, Ordering::Relaxed)
    }

    pub fn pull_write(&self) -> u64 {
        self.write.swap(0, Ordering::Relaxed)
    }
}

async fn with_deadline<T>(
    limit: Duration,
    fut: impl std::future::Future<Output = std::io::Result<T>>,
) -> Result<T> {
    if limit.is_zero() {
        return fut.await.map_err(DcError::from);
    }
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res.map_err(DcError::from),
        Err(_) => Err(DcError::Timeout),
    }
}

/// Reading half: delimiter framing, binary reads, switchable inflate.
pub struct ConnReader {
    inner: ReadHalf<NetStream>,
    timeout: Duration,
    delim: u8,
    counters: Arc<ConnCounters>,
    /// Decoded bytes not yet handed to the caller.
    buf: Vec<u8>,
    pos: usize,
    /// Compressed bytes received but not yet inflated.
    pending: Vec<u8>,
    inflate: Option<Box<Decompress>>,
    closed: bool,
}

/// Writing half: framed and raw writes, switchable deflate.
pub struct ConnWriter {
    inner: WriteHalf<NetStream>,
    timeout: Duration,
    delim: u8,
    counters: Arc<ConnCounters>,
    deflate: Option<Box<Compress>>,
    closed: bool,
}

/// A framed connection; splits into its two halves for tasks that read and
/// write concurrently.
pub struct FramedConn {
    reader: ConnReader,
    writer: ConnWriter,
}

impl FramedConn {
    pub fn new(stream: NetStream, delim: u8) -> Self {
        Self::with_timeouts(stream, delim, READ_TIMEOUT, WRITE_TIMEOUT)
    }

    /// A zero duration disables the corresponding deadline.
    pub fn with_timeouts(
        stream: NetStream,
        delim: u8,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        let counters = Arc::new(ConnCounters::default());
        let (rh, wh) = tokio::io::split(stream);
        FramedConn {
            reader: ConnReader {
                inner: rh,
                timeout: read_timeout,
                delim,
                counters: counters.clone(),
                buf: Vec::new(),
                pos: 0,
                pending: Vec::new(),
                inflate: None,
                closed: false,
            },
            writer: ConnWriter {
                inner: wh,
                timeout: write_timeout,
                delim,
                counters,
                deflate: None,
                closed: false,
            },
        }
    }

    pub fn counters(&self) -> Arc<ConnCounters> {
        self.reader.counters.clone()
    }

    pub fn split(self) -> (ConnReader, ConnWriter) {
        (self.reader, self.writer)
    }

    pub async fn read_frame(&mut self) -> Result<Vec<u8>> {
        self.reader.read_frame().await
    }

    pub async fn read_binary(&mut self) -> Result<Vec<u8>> {
        self.reader.read_binary().await
    }

    pub fn activate_read_zlib(&mut self) {
        self.reader.activate_zlib();
    }

    pub fn unread(&mut self, data: &[u8]) {
        self.reader.unread(data);
    }

    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        self.writer.write_frame(payload).await
    }

    pub async fn write_binary(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_binary(data).await
    }

    pub async fn set_write_zlib(&mut self, on: bool) -> Result<()> {
        self.writer.set_zlib(on).await
    }

    pub async fn close(&mut self) {
        self.reader.closed = true;
        self.writer.close().await;
    }
}

impl ConnReader {
    pub fn counters(&self) -> Arc<ConnCounters> {
        self.counters.clone()
    }

    /// Next delimited frame, without the trailing delimiter.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>> {
        if self.closed {
            return Err(DcError::ConnClosed);
        }
        loop {
            if let Some(off) = self.buf[self.pos..].iter().position(|&b| b == self.delim) {
                let line = self.buf[self.pos..self.pos + off].to_vec();
                self.pos += off + 1;
                self.compact();
                return Ok(line);
            }
            if self.buf.len() - self.pos > MAX_LINE_SIZE {
                return Err(DcError::ProtocolFraming(format!(
                    "line exceeds {} bytes",
                    MAX_LINE_SIZE
                )));
            }
            self.refill().await?;
        }
    }

    /// Whatever payload bytes are available, at most one socket read.
    pub async fn read_binary(&mut self) -> Result<Vec<u8>> {
        if self.closed {
            return Err(DcError::ConnClosed);
        }
        if self.pos == self.buf.len() {
            self.refill().await?;
        }
        let out = self.buf[self.pos..].to_vec();
        self.pos = self.buf.len();
        self.compact();
        Ok(out)
    }

    /// Hand bytes back to the reader; they are consumed before anything
    /// still on the socket. Used when the accepting side sniffs the dialect
    /// from the first bytes of a connection.
    pub fn unread(&mut self, data: &[u8]) {
        self.buf.splice(self.pos..self.pos, data.iter().copied());
    }

    /// Route subsequent input through a fresh inflater. Bytes already
    /// buffered past the activation point belong to the compressed stream
    /// and are carried into it.
    pub fn activate_zlib(&mut self) {
        let carried = self.buf.split_off(self.pos);
        self.buf.clear();
        self.pos = 0;
        let mut prior = std::mem::take(&mut self.pending);
        prior.extend_from_slice(&carried);
        self.pending = prior;
        self.inflate = Some(Box::new(Decompress::new(true)));
        self.drain_pending();
    }

    pub fn zlib_active(&self) -> bool {
        self.inflate.is_some()
    }

    fn compact(&mut self) {
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }
    }

    /// Inflate as much of `pending` as possible into `buf`. When the zlib
    /// stream ends, leftover input is plain bytes again.
    fn drain_pending(&mut self) {
        let Some(inflate) = self.inflate.as_mut() else {
            return;
        };
        let mut ended = false;
        while !self.pending.is_empty() {
            let before_in = inflate.total_in();
            self.buf.reserve(READ_CHUNK);
            let status = match inflate.decompress_vec(
                &self.pending,
                &mut self.buf,
                FlushDecompress::None,
            ) {
                Ok(s) => s,
                Err(_) => {
                    // corrupt stream surfaces as a framing error on next read
                    self.closed = true;
                    return;
                }
            };
            let consumed = (inflate.total_in() - before_in) as usize;
            self.pending.drain(..consumed);
            if status == Status::StreamEnd {
                ended = true;
                break;
            }
            if consumed == 0 {
                break;
            }
        }
        if ended {
            self.inflate = None;
            let leftover = std::mem::take(&mut self.pending);
            self.buf.extend_from_slice(&leftover);
        }
    }

    async fn refill(&mut self) -> Result<()> {
        loop {
            let mut chunk = [0u8; READ_CHUNK];
            let n = with_deadline(self.timeout, self.inner.read(&mut chunk)).await?;
            if n == 0 {
                return Err(DcError::ConnClosed);
            }
            self.counters.read.fetch_add(n as u64, Ordering::Relaxed);
            if self.inflate.is_some() {
                self.pending.extend_from_slice(&chunk[..n]);
                let before = self.buf.len();
                self.drain_pending();
                if self.closed {
                    return Err(DcError::ProtocolFraming("corrupt zlib stream".into()));
                }
                // a short compressed read may decode to nothing yet
                if self.buf.len() > before {
                    return Ok(());
                }
            } else {
                self.buf.extend_from_slice(&chunk[..n]);
                return Ok(());
            }
        }
    }
}

impl ConnWriter {
    pub fn counters(&self) -> Arc<ConnCounters> {
        self.counters.clone()
    }

    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        let mut framed = Vec::with_capacity(payload.len() + 1);
        framed.extend_from_slice(payload);
        framed.push(self.delim);
        self.write_binary(&framed).await
    }

    pub async fn write_binary(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(DcError::ConnClosed);
        }
        if self.deflate.is_some() {
            let out = self.deflate_chunk(data, FlushCompress::None)?;
            self.send_raw(&out).await
        } else {
            self.send_raw(data).await
        }
    }

    /// Turning compression on installs a fresh deflater; turning it off
    /// finishes the stream so the peer's inflater observes its end. Both
    /// directions are flush barriers: bytes written before the switch are on
    /// the wire before bytes written after it.
    pub async fn set_zlib(&mut self, on: bool) -> Result<()> {
        if on == self.deflate.is_some() {
            return Ok(());
        }
        if on {
            tracing::debug!("write zlib on");
            self.deflate = Some(Box::new(Compress::new(Compression::default(), true)));
        } else {
            tracing::debug!("write zlib off");
            let tail = self.deflate_chunk(&[], FlushCompress::Finish)?;
            self.deflate = None;
            if !tail.is_empty() {
                self.send_raw(&tail).await?;
            }
            with_deadline(self.timeout, self.inner.flush()).await?;
        }
        Ok(())
    }

    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.inner.shutdown().await;
    }

    fn deflate_chunk(&mut self, data: &[u8], flush: FlushCompress) -> Result<Vec<u8>> {
        let deflate = self
            .deflate
            .as_mut()
            .ok_or_else(|| DcError::Internal("deflate not active".into()))?;
        let mut out = Vec::with_capacity(data.len() / 2 + 64);
        let mut fed = 0usize;
        loop {
            let before_in = deflate.total_in();
            out.reserve(READ_CHUNK);
            let status = deflate
                .compress_vec(&data[fed..], &mut out, flush)
                .map_err(|e| DcError::Internal(format!("deflate: {}", e)))?;
            fed += (deflate.total_in() - before_in) as usize;
            match flush {
                FlushCompress::Finish => {
                    if status == Status::StreamEnd {
                        break;
                    }
                }
                _ => {
                    if fed == data.len() {
                        break;
                    }
                }
            }
        }
        Ok(out)
    }

    async fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        with_deadline(self.timeout, self.inner.write_all(data)).await?;
        self.counters
            .write
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair(delim: u8) -> (FramedConn, FramedConn) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (
            FramedConn::new(NetStream::Plain(client), delim),
            FramedConn::new(NetStream::Plain(server), delim),
        )
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut a, mut b) = pair(b'|').await;
        a.write_frame(b"$Hello world").await.unwrap();
        a.write_frame(b"second").await.unwrap();
        assert_eq!(b.read_frame().await.unwrap(), b"$Hello world");
        assert_eq!(b.read_frame().await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn counters_pull_and_reset() {
        let (mut a, mut b) = pair(b'\n').await;
        a.write_frame(b"12345").await.unwrap();
        b.read_frame().await.unwrap();
        let ac = a.counters();
        let bc = b.counters();
        assert_eq!(ac.pull_write(), 6);
        assert_eq!(ac.pull_write(), 0);
        assert_eq!(bc.pull_read(), 6);
        assert_eq!(bc.pull_read(), 0);
    }

    #[tokio::test]
    async fn oversized_line_is_framing_error() {
        let (mut a, mut b) = pair(b'|').await;
        let big = vec![b'x'; MAX_LINE_SIZE + 100];
        a.write_binary(&big).await.unwrap();
        match b.read_frame().await {
            Err(DcError::ProtocolFraming(_)) => {}
            other => panic!("expected framing error, got {:?}", other.map(|v| v.len())),
        }
    }

    #[tokio::test]
    async fn binary_mode_hands_out_raw_bytes() {
        let (mut a, mut b) = pair(b'|').await;
        a.write_frame(b"header").await.unwrap();
        a.write_binary(&[0u8, 1, 2, b'|', 4]).await.unwrap();
        assert_eq!(b.read_frame().await.unwrap(), b"header");
        let mut got = Vec::new();
        while got.len() < 5 {
            got.extend_from_slice(&b.read_binary().await.unwrap());
        }
        assert_eq!(got, &[0u8, 1, 2, b'|', 4]);
    }

    #[tokio::test]
    async fn zlib_switching_roundtrip() {
        // plain, zlib-on, plain, zlib-on, plain read back as written
        let (mut a, mut b) = pair(b'|').await;
        let sections: &[(bool, &[u8])] = &[
            (false, b"plain-one"),
            (true, b"compressed-first-section"),
            (false, b"plain-two"),
            (true, b"compressed-second"),
            (false, b"plain-three"),
        ];
        let writer = tokio::spawn(async move {
            for (zlib, payload) in sections {
                a.set_write_zlib(*zlib).await.unwrap();
                a.write_frame(payload).await.unwrap();
                a.set_write_zlib(false).await.unwrap();
            }
            a
        });
        for (zlib, payload) in sections {
            if *zlib {
                b.activate_read_zlib();
            }
            assert_eq!(&b.read_frame().await.unwrap(), payload);
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn zlib_activation_carries_buffered_bytes() {
        // the compressed stream begins immediately after a frame the reader
        // may already have buffered together with it
        let (mut a, mut b) = pair(b'|').await;
        let mut burst = Vec::new();
        burst.extend_from_slice(b"announce|");
        let mut z = Compress::new(Compression::default(), true);
        let payload = b"deflated payload|";
        let mut zout = Vec::with_capacity(256);
        z.compress_vec(payload, &mut zout, FlushCompress::Finish)
            .unwrap();
        burst.extend_from_slice(&zout);
        burst.extend_from_slice(b"back to plain|");
        a.write_binary(&burst).await.unwrap();

        assert_eq!(b.read_frame().await.unwrap(), b"announce");
        b.activate_read_zlib();
        assert_eq!(b.read_frame().await.unwrap(), b"deflated payload");
        assert!(!b.reader.zlib_active());
        assert_eq!(b.read_frame().await.unwrap(), b"back to plain");
    }

    #[tokio::test]
    async fn closed_conn_errors() {
        let (mut a, _b) = pair(b'|').await;
        a.close().await;
        assert!(matches!(
            a.write_frame(b"x").await,
            Err(DcError::ConnClosed)
        ));
        assert!(matches!(a.read_frame().await, Err(DcError::ConnClosed)));
    }
}
