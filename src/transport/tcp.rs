use super::{classify_idle_read, MessageListener, MessageStream, LISTEN_BACKLOG};
use crate::error::{BenchError, BenchResult};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// TCP stream carrying unframed, fixed-size benchmark messages.
pub struct TcpMessageStream {
    stream: TcpStream,
}

impl TcpMessageStream {
    pub async fn connect(addr: SocketAddr) -> BenchResult<Self> {
        debug!("Connecting TCP stream to {}", addr);
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| BenchError::io(format!("TCP connect to {} failed", addr), e))?;
        Self::from_stream(stream)
    }

    fn from_stream(stream: TcpStream) -> BenchResult<Self> {
        stream
            .set_nodelay(true)
            .map_err(|e| BenchError::io("failed to set TCP_NODELAY", e))?;
        Ok(Self { stream })
    }
}

#[async_trait]
impl MessageStream for TcpMessageStream {
    async fn send_message(&mut self, buf: &[u8]) -> io::Result<()> {
        self.stream.write_all(buf).await
    }

    async fn recv_message(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.stream.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    async fn closed(&mut self) -> io::Result<()> {
        let mut peek = [0u8; 1];
        classify_idle_read(self.stream.read(&mut peek).await)
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        match self.stream.shutdown().await {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

/// Server-side TCP listener bound to all interfaces.
pub struct TcpMessageListener {
    listener: TcpListener,
    port: u16,
}

impl TcpMessageListener {
    /// Bind to the first free port at or above `base_port`.
    pub fn bind_from(base_port: u16) -> BenchResult<Self> {
        let mut port = base_port;
        loop {
            match Self::try_bind(port) {
                Ok(listener) => {
                    debug!("TCP listener bound on port {}", port);
                    return Ok(Self { listener, port });
                }
                Err(e) if e.kind() == io::ErrorKind::AddrInUse && port < u16::MAX => {
                    port += 1;
                }
                Err(e) => {
                    return Err(BenchError::io(
                        format!("failed to bind TCP listener (tried ports {}..={})", base_port, port),
                        e,
                    ))
                }
            }
        }
    }

    fn try_bind(port: u16) -> io::Result<TcpListener> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;
        TcpListener::from_std(socket.into())
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

#[async_trait]
impl MessageListener for TcpMessageListener {
    async fn accept(&self) -> io::Result<Box<dyn MessageStream>> {
        let (stream, peer) = self.listener.accept().await?;
        debug!("Accepted TCP connection from {}", peer);
        let stream = TcpMessageStream::from_stream(stream)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(Box::new(stream))
    }
}
