//! # Control Plane
//!
//! Every control-plane wait in the benchmark, whether for a Client report, a
//! Server reply or a command at a worker, goes through [`await_message`]. It
//! races the receive future against the inactivity limit and folds the three
//! possible outcomes into [`Waited`], so callers can match explicitly on
//! timeouts instead of threading them through `?`.
//!
//! [`ControlSocket`] is the Controller↔Server datagram endpoint. Each datagram
//! carries exactly one fixed-size [`WireMessage`]; sends and receives check the
//! transferred length against the message's wire size.

use crate::error::{BenchError, BenchResult};
use crate::protocol::{ProtocolError, WireMessage};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::trace;

/// Large enough for every control message plus a margin to detect oversize.
const RECV_BUFFER_SIZE: usize = 128;

/// Outcome of a bounded control-plane wait.
#[derive(Debug)]
pub enum Waited<T> {
    Message(T),
    Timeout,
    Error(BenchError),
}

impl<T> Waited<T> {
    /// Collapse into a result, turning a timeout into [`BenchError::Timeout`].
    pub fn into_result(self, what: impl Into<String>, limit: Duration) -> BenchResult<T> {
        match self {
            Waited::Message(msg) => Ok(msg),
            Waited::Timeout => Err(BenchError::timeout(what, limit)),
            Waited::Error(e) => Err(e),
        }
    }
}

/// Wait for `fut` to produce a message, giving up after `limit`.
pub async fn await_message<T, F>(limit: Duration, fut: F) -> Waited<T>
where
    F: Future<Output = BenchResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(msg)) => Waited::Message(msg),
        Ok(Err(e)) => Waited::Error(e),
        Err(_) => Waited::Timeout,
    }
}

/// UDP endpoint exchanging fixed-size control messages.
pub struct ControlSocket {
    socket: UdpSocket,
}

impl ControlSocket {
    pub async fn bind(addr: SocketAddr) -> BenchResult<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| BenchError::io(format!("failed to bind control socket on {}", addr), e))?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> BenchResult<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| BenchError::io("failed to read control socket address", e))
    }

    pub async fn send_to<M: WireMessage>(&self, msg: &M, dest: SocketAddr) -> BenchResult<()> {
        let bytes = msg.encode()?;
        let sent = self
            .socket
            .send_to(&bytes, dest)
            .await
            .map_err(|e| BenchError::io(format!("failed to send {} to {}", M::KIND, dest), e))?;
        if sent != bytes.len() {
            return Err(ProtocolError::WrongSize {
                kind: M::KIND,
                expected: bytes.len(),
                actual: sent,
            }
            .into());
        }
        trace!("sent {} ({} bytes) to {}", M::KIND, sent, dest);
        Ok(())
    }

    /// Receive one datagram and decode it as `M`.
    ///
    /// A datagram of the wrong size is a protocol violation rather than
    /// something to skip.
    pub async fn recv_from<M: WireMessage>(&self) -> BenchResult<(M, SocketAddr)> {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let (len, from) = self
            .socket
            .recv_from(&mut buf)
            .await
            .map_err(|e| BenchError::io(format!("failed to receive {}", M::KIND), e))?;
        trace!("received {} bytes from {}", len, from);
        let msg = M::decode(&buf[..len])?;
        Ok((msg, from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClientToMaster, MasterToServer, Round};

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_await_message_times_out() {
        let waited: Waited<()> = await_message(
            Duration::from_millis(20),
            std::future::pending::<BenchResult<()>>(),
        )
        .await;
        assert!(matches!(waited, Waited::Timeout));

        let err = waited.into_result("round ack", Duration::from_millis(20));
        assert!(matches!(err, Err(BenchError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_await_message_passes_through_errors() {
        let waited: Waited<u32> = await_message(Duration::from_secs(1), async {
            Err(BenchError::RoundSync("boom".into()))
        })
        .await;
        assert!(matches!(waited, Waited::Error(BenchError::RoundSync(_))));
    }

    #[tokio::test]
    async fn test_control_socket_exchange() {
        let a = ControlSocket::bind(loopback()).await.unwrap();
        let b = ControlSocket::bind(loopback()).await.unwrap();

        let cmd = MasterToServer::SetRound(Round {
            message_size: 256,
            message_count: 40,
            bounce: false,
        });
        a.send_to(&cmd, b.local_addr().unwrap()).await.unwrap();

        let (got, from) = b.recv_from::<MasterToServer>().await.unwrap();
        assert_eq!(got, cmd);
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_wrong_sized_datagram_is_fatal() {
        let a = ControlSocket::bind(loopback()).await.unwrap();
        let b = ControlSocket::bind(loopback()).await.unwrap();

        // A 4-byte client report is not a valid 16-byte server command.
        a.send_to(&ClientToMaster::Ready, b.local_addr().unwrap())
            .await
            .unwrap();
        let err = b.recv_from::<MasterToServer>().await.unwrap_err();
        assert!(matches!(
            err,
            BenchError::Protocol(ProtocolError::WrongSize { actual: 4, .. })
        ));
    }
}
