//! # Data-Plane Transports
//!
//! The benchmark measures a stream transport, so the data plane only needs a
//! small surface: connect, accept, write one whole message, read one whole
//! message. [`MessageStream`] and [`MessageListener`] capture that surface and
//! [`TransportFactory`] builds the concrete implementation for the selected
//! [`TransportMode`]:
//!
//! - **TCP**: portable, listener bound to all interfaces on the first free port
//!   at or above the configured base port.
//! - **TIPC**: Linux only, listener bound to the well-known service name
//!   `{18888, 0}`.
//!
//! Messages carry no framing. Both ends know the size of every message from
//! the round parameters, so a receive reads exactly that many bytes and a
//! shorter result means the peer closed mid-message.

use crate::cli::TransportMode;
use crate::error::BenchResult;
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::SocketAddr;

pub mod tcp;
#[cfg(target_os = "linux")]
pub mod tipc;

pub use tcp::{TcpMessageListener, TcpMessageStream};

/// Service type of the Server's TIPC listener.
pub const TIPC_LISTENER_TYPE: u32 = 18888;
/// Service instance of the Server's TIPC listener.
pub const TIPC_LISTENER_INSTANCE: u32 = 0;

/// Listen backlog for data-plane listeners.
pub const LISTEN_BACKLOG: i32 = 32;

/// One connected data-plane peer.
#[async_trait]
pub trait MessageStream: Send + Sync {
    /// Write the whole of `buf`.
    async fn send_message(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Fill `buf` completely unless the peer closes first. Returns the number
    /// of bytes read; anything below `buf.len()` means end of stream.
    async fn recv_message(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Resolve once the peer closes the connection.
    ///
    /// Returns an `InvalidData` error if the peer sends data instead. Must be
    /// cancel-safe: callers race it against their command channel.
    async fn closed(&mut self) -> io::Result<()>;

    /// Shut down both directions.
    async fn shutdown(&mut self) -> io::Result<()>;
}

#[async_trait]
pub trait MessageListener: Send + Sync {
    /// Accept the next peer. Must be cancel-safe.
    async fn accept(&self) -> io::Result<Box<dyn MessageStream>>;
}

/// Where a Client worker connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataEndpoint {
    Tcp(SocketAddr),
    Tipc { name_type: u32, instance: u32 },
}

impl DataEndpoint {
    /// The Server's TIPC listener name.
    pub fn tipc_listener() -> Self {
        DataEndpoint::Tipc {
            name_type: TIPC_LISTENER_TYPE,
            instance: TIPC_LISTENER_INSTANCE,
        }
    }
}

impl fmt::Display for DataEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataEndpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            DataEndpoint::Tipc {
                name_type,
                instance,
            } => write!(f, "tipc://{{{}, {}}}", name_type, instance),
        }
    }
}

/// Shared end-of-stream check for `closed()` implementations.
pub(crate) fn classify_idle_read(result: io::Result<usize>) -> io::Result<()> {
    match result {
        Ok(0) => Ok(()),
        Ok(n) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("peer sent {} unexpected byte(s)", n),
        )),
        Err(e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(()),
        Err(e) => Err(e),
    }
}

/// Builds listeners and streams for a [`TransportMode`].
pub struct TransportFactory;

impl TransportFactory {
    /// Create the Server's listener. Returns the bound TCP port, if any.
    pub fn listen(
        mode: TransportMode,
        tcp_base_port: u16,
    ) -> BenchResult<(Box<dyn MessageListener>, Option<u16>)> {
        match mode {
            TransportMode::Tcp => {
                let listener = TcpMessageListener::bind_from(tcp_base_port)?;
                let port = listener.port();
                Ok((Box::new(listener), Some(port)))
            }
            TransportMode::Tipc => Self::listen_tipc(),
        }
    }

    #[cfg(target_os = "linux")]
    fn listen_tipc() -> BenchResult<(Box<dyn MessageListener>, Option<u16>)> {
        let listener = tipc::TipcMessageListener::bind(TIPC_LISTENER_TYPE, TIPC_LISTENER_INSTANCE)?;
        Ok((Box::new(listener), None))
    }

    #[cfg(not(target_os = "linux"))]
    fn listen_tipc() -> BenchResult<(Box<dyn MessageListener>, Option<u16>)> {
        Err(crate::error::BenchError::Unsupported("TIPC transport"))
    }

    /// Connect a Client worker to the Server's listener.
    pub async fn connect(endpoint: &DataEndpoint) -> BenchResult<Box<dyn MessageStream>> {
        match *endpoint {
            DataEndpoint::Tcp(addr) => Ok(Box::new(TcpMessageStream::connect(addr).await?)),
            DataEndpoint::Tipc {
                name_type,
                instance,
            } => Self::connect_tipc(name_type, instance).await,
        }
    }

    #[cfg(target_os = "linux")]
    async fn connect_tipc(name_type: u32, instance: u32) -> BenchResult<Box<dyn MessageStream>> {
        Ok(Box::new(
            tipc::TipcMessageStream::connect(name_type, instance).await?,
        ))
    }

    #[cfg(not(target_os = "linux"))]
    async fn connect_tipc(_name_type: u32, _instance: u32) -> BenchResult<Box<dyn MessageStream>> {
        Err(crate::error::BenchError::Unsupported("TIPC transport"))
    }
}
