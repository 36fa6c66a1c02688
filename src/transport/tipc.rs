//! TIPC stream sockets.
//!
//! Neither std nor tokio know the `AF_TIPC` family, so sockets are created
//! through `socket2` with a hand-built `sockaddr_tipc` and driven by tokio's
//! [`AsyncFd`] readiness API.

use super::{classify_idle_read, MessageListener, MessageStream, LISTEN_BACKLOG};
use crate::error::{BenchError, BenchResult};
use async_trait::async_trait;
use socket2::{Domain, SockAddr, Socket, Type};
use std::io::{self, Read, Write};
use std::net::Shutdown;
use tokio::io::unix::AsyncFd;
use tracing::debug;

/// `TIPC_ADDR_NAME` from `linux/tipc.h`.
const TIPC_ADDR_NAME: u8 = 2;
/// `TIPC_ZONE_SCOPE`; current kernels treat it as cluster scope.
const TIPC_ZONE_SCOPE: i8 = 1;

/// `struct sockaddr_tipc` with the `name` arm of its address union.
#[repr(C)]
struct SockaddrTipc {
    family: libc::sa_family_t,
    addrtype: u8,
    scope: i8,
    name_type: u32,
    name_instance: u32,
    domain: u32,
}

fn service_addr(name_type: u32, instance: u32) -> SockAddr {
    let raw = SockaddrTipc {
        family: libc::AF_TIPC as libc::sa_family_t,
        addrtype: TIPC_ADDR_NAME,
        scope: TIPC_ZONE_SCOPE,
        name_type,
        name_instance: instance,
        domain: 0,
    };
    let len = std::mem::size_of::<SockaddrTipc>();
    // SAFETY: sockaddr_storage is larger than sockaddr_tipc and valid when
    // zeroed; `len` covers exactly the bytes copied in.
    unsafe {
        let mut storage: libc::sockaddr_storage = std::mem::zeroed();
        std::ptr::copy_nonoverlapping(
            &raw as *const SockaddrTipc as *const u8,
            &mut storage as *mut libc::sockaddr_storage as *mut u8,
            len,
        );
        SockAddr::new(storage, len as libc::socklen_t)
    }
}

fn new_socket() -> io::Result<Socket> {
    Socket::new(Domain::from(libc::AF_TIPC), Type::STREAM, None)
}

pub struct TipcMessageStream {
    fd: AsyncFd<Socket>,
}

impl TipcMessageStream {
    pub async fn connect(name_type: u32, instance: u32) -> BenchResult<Self> {
        debug!("Connecting TIPC stream to {{{}, {}}}", name_type, instance);
        let socket = tokio::task::spawn_blocking(move || -> io::Result<Socket> {
            let socket = new_socket()?;
            socket.connect(&service_addr(name_type, instance))?;
            socket.set_nonblocking(true)?;
            Ok(socket)
        })
        .await
        .map_err(|e| BenchError::io("TIPC connect task failed", io::Error::new(io::ErrorKind::Other, e)))?
        .map_err(|e| {
            BenchError::io(
                format!("TIPC connect to {{{}, {}}} failed", name_type, instance),
                e,
            )
        })?;
        Self::from_socket(socket).map_err(|e| BenchError::io("failed to register TIPC socket", e))
    }

    fn from_socket(socket: Socket) -> io::Result<Self> {
        Ok(Self {
            fd: AsyncFd::new(socket)?,
        })
    }

    async fn read_some(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                let mut socket: &Socket = inner.get_ref();
                socket.read(buf)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn write_some(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| {
                let mut socket: &Socket = inner.get_ref();
                socket.write(buf)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

#[async_trait]
impl MessageStream for TipcMessageStream {
    async fn send_message(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < buf.len() {
            let n = self.write_some(&buf[written..]).await?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            written += n;
        }
        Ok(())
    }

    async fn recv_message(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_some(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    async fn closed(&mut self) -> io::Result<()> {
        let mut peek = [0u8; 1];
        classify_idle_read(self.read_some(&mut peek).await)
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        match self.fd.get_ref().shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

pub struct TipcMessageListener {
    fd: AsyncFd<Socket>,
}

impl TipcMessageListener {
    pub fn bind(name_type: u32, instance: u32) -> BenchResult<Self> {
        let bind = || -> io::Result<AsyncFd<Socket>> {
            let socket = new_socket()?;
            socket.bind(&service_addr(name_type, instance))?;
            socket.listen(LISTEN_BACKLOG)?;
            socket.set_nonblocking(true)?;
            AsyncFd::new(socket)
        };
        let fd = bind().map_err(|e| {
            BenchError::io(
                format!(
                    "failed to bind TIPC listener {{{}, {}}} (is the tipc module loaded?)",
                    name_type, instance
                ),
                e,
            )
        })?;
        debug!("TIPC listener bound to {{{}, {}}}", name_type, instance);
        Ok(Self { fd })
    }
}

#[async_trait]
impl MessageListener for TipcMessageListener {
    async fn accept(&self) -> io::Result<Box<dyn MessageStream>> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| inner.get_ref().accept()) {
                Ok(Ok((socket, _peer))) => {
                    socket.set_nonblocking(true)?;
                    debug!("Accepted TIPC connection");
                    return Ok(Box::new(TipcMessageStream::from_socket(socket)?));
                }
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }
}
