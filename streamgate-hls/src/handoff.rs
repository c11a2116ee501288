//! Serving porter-handed-off connections through the same router as
//! locally accepted ones.
//!
//! A handed-off socket arrives with bytes the porter already consumed
//! (the rewritten request line at minimum). [`PrefixedStream`] replays
//! those bytes ahead of the socket so the HTTP stack sees the request
//! exactly as the client sent it, and [`HandoffListener`] feeds such
//! streams to `axum::serve` as if they had been accepted locally.

use axum::extract::connect_info::Connected;
use axum::serve::{IncomingStream, Listener};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use streamgate_porter::IncomingConnection;

/// A TCP stream with a chunk of already-received bytes in front.
pub struct PrefixedStream {
    prefix: Vec<u8>,
    offset: usize,
    inner: TcpStream,
}

impl PrefixedStream {
    #[must_use]
    pub fn new(prefix: Vec<u8>, inner: TcpStream) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl AsyncRead for PrefixedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.offset < self.prefix.len() {
            let remaining = &self.prefix[self.offset..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.offset += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrefixedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

/// Listener fed from the porter client instead of a bound socket.
pub struct HandoffListener {
    rx: mpsc::Receiver<IncomingConnection>,
    nominal_addr: SocketAddr,
}

impl HandoffListener {
    #[must_use]
    pub fn new(rx: mpsc::Receiver<IncomingConnection>, nominal_addr: SocketAddr) -> Self {
        Self { rx, nominal_addr }
    }
}

impl Listener for HandoffListener {
    type Io = PrefixedStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.rx.recv().await {
            Some(connection) => {
                let addr = connection.peer_addr;
                (
                    PrefixedStream::new(connection.buffered, connection.stream),
                    addr,
                )
            }
            // The porter client went away; park forever and let the
            // surrounding task be cancelled.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.nominal_addr)
    }
}

/// Client address usable as connect info for both listener kinds.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

impl Connected<IncomingStream<'_, TcpListener>> for ClientAddr {
    fn connect_info(stream: IncomingStream<'_, TcpListener>) -> Self {
        Self(*stream.remote_addr())
    }
}

impl Connected<IncomingStream<'_, HandoffListener>> for ClientAddr {
    fn connect_info(stream: IncomingStream<'_, HandoffListener>) -> Self {
        Self(*stream.remote_addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_prefix_replayed_before_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.expect("connect");
            stream.write_all(b" socket-bytes").await.expect("write");
            stream.shutdown().await.expect("shutdown");
        });

        let (accepted, _) = listener.accept().await.expect("accept");
        let mut prefixed = PrefixedStream::new(b"prefix-bytes".to_vec(), accepted);

        let mut out = String::new();
        prefixed.read_to_string(&mut out).await.expect("read");
        assert_eq!(out, "prefix-bytes socket-bytes");
        client.await.expect("client task");
    }

    #[tokio::test]
    async fn test_small_reads_drain_prefix() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.expect("connect");
            drop(stream);
        });

        let (accepted, _) = listener.accept().await.expect("accept");
        let mut prefixed = PrefixedStream::new(b"abcdef".to_vec(), accepted);

        let mut buf = [0u8; 4];
        let n = prefixed.read(&mut buf).await.expect("read");
        assert_eq!(&buf[..n], b"abcd");
        let n = prefixed.read(&mut buf).await.expect("read");
        assert_eq!(&buf[..n], b"ef");
        client.await.expect("client task");
    }
}
