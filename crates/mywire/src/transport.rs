//! Byte transports the connection runs over.
//!
//! `Connection` never touches sockets directly: it asks a `Connector` for a
//! `Transport` and then only reads and writes byte chunks. The default
//! `TcpConnector` uses asupersync's TCP stream.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::time::Duration;

use asupersync::io::{AsyncRead, AsyncWrite, ReadBuf};
use asupersync::net::{TcpStream, lookup_all};

/// Opens transports to a server address (`host:port`).
pub trait Connector {
    type Transport: Transport;

    fn connect(&self, addr: &str) -> impl Future<Output = io::Result<Self::Transport>>;
}

/// A bidirectional byte stream.
pub trait Transport {
    /// Read up to `max` bytes. An empty vector means the peer closed the stream.
    fn read(&mut self, max: usize) -> impl Future<Output = io::Result<Vec<u8>>>;

    /// Write and flush all of `data`, returning the number of bytes written.
    fn write(&mut self, data: &[u8]) -> impl Future<Output = io::Result<usize>>;
}

/// Connects over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    /// Limit for establishing each TCP connection
    pub connect_timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Connector for TcpConnector {
    type Transport = TcpTransport;

    async fn connect(&self, addr: &str) -> io::Result<TcpTransport> {
        // Resolution runs off the runtime thread.
        let candidates = lookup_all(addr.to_string()).await?;
        let mut last_err = io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{addr} did not resolve to any address"),
        );

        for socket_addr in candidates {
            match TcpStream::connect_timeout(socket_addr, self.connect_timeout).await {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    tracing::debug!(%socket_addr, "TCP connection established");
                    return Ok(TcpTransport { stream });
                }
                Err(e) => {
                    tracing::debug!(%socket_addr, error = %e, "TCP connect attempt failed");
                    last_err = e;
                }
            }
        }

        Err(last_err)
    }
}

/// A TCP stream carrying the MySQL protocol.
pub struct TcpTransport {
    stream: TcpStream,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport").finish_non_exhaustive()
    }
}

impl Transport for TcpTransport {
    async fn read(&mut self, max: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; max];
        let mut read_buf = ReadBuf::new(&mut buf);
        std::future::poll_fn(|cx| Pin::new(&mut self.stream).poll_read(cx, &mut read_buf))
            .await?;
        let n = read_buf.filled().len();
        buf.truncate(n);
        Ok(buf)
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        // poll_write may accept fewer bytes than offered
        let mut written = 0;
        while written < data.len() {
            let n = std::future::poll_fn(|cx| {
                Pin::new(&mut self.stream).poll_write(cx, &data[written..])
            })
            .await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "connection closed while writing",
                ));
            }
            written += n;
        }

        std::future::poll_fn(|cx| Pin::new(&mut self.stream).poll_flush(cx)).await?;
        Ok(written)
    }
}
