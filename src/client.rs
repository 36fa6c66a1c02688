//! # Client Worker
//!
//! One Client worker drives one data-plane connection. It connects to the
//! Server's listener, reports `READY`, and then executes rounds on command:
//!
//! ```text
//! Init -> Connected -> Ready -> (Idle <-> Executing) -> Terminated
//! ```
//!
//! Commands arrive on the Controller's broadcast channel, so every worker sees
//! every `EXEC` and `TERMINATE`. Reports go back over a shared `mpsc` channel
//! tagged with the worker id. Any I/O failure ends the worker with an error,
//! which the Controller treats as fatal for the whole run.

use crate::control::{await_message, Waited};
use crate::error::{BenchError, BenchResult};
use crate::protocol::{ClientToMaster, MasterToClient, Round};
use crate::transport::{DataEndpoint, MessageStream, TransportFactory};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

/// Bytes a streaming Client may push before yielding to the scheduler.
pub const YIELD_BYTES: u32 = 2 * 1024 * 1024;

/// Client report tagged with the id of the worker that sent it.
pub type ClientReport = (u32, ClientToMaster);

pub struct ClientWorker {
    id: u32,
    endpoint: DataEndpoint,
    commands: broadcast::Receiver<MasterToClient>,
    reports: mpsc::Sender<ClientReport>,
    inactivity_limit: Duration,
    buffer: Vec<u8>,
}

impl ClientWorker {
    pub fn new(
        id: u32,
        endpoint: DataEndpoint,
        commands: broadcast::Receiver<MasterToClient>,
        reports: mpsc::Sender<ClientReport>,
        inactivity_limit: Duration,
        max_message_size: u32,
    ) -> Self {
        Self {
            id,
            endpoint,
            commands,
            reports,
            inactivity_limit,
            buffer: vec![0u8; max_message_size as usize],
        }
    }

    fn who(&self) -> String {
        format!("client {}", self.id)
    }

    /// Run until `TERMINATE` or the first error.
    pub async fn run(mut self) -> BenchResult<()> {
        let mut stream = TransportFactory::connect(&self.endpoint).await?;
        debug!("Client {} connected to {}", self.id, self.endpoint);
        self.report(ClientToMaster::Ready).await?;

        loop {
            match self.next_command().await? {
                MasterToClient::Exec(round) => {
                    trace!("Client {} executing {:?}", self.id, round);
                    self.execute(stream.as_mut(), &round).await?;
                    self.report(ClientToMaster::Finished).await?;
                }
                MasterToClient::Terminate => {
                    debug!("Client {} terminating", self.id);
                    stream
                        .shutdown()
                        .await
                        .map_err(|e| BenchError::io(format!("{}: shutdown failed", self.who()), e))?;
                    return Ok(());
                }
            }
        }
    }

    async fn next_command(&mut self) -> BenchResult<MasterToClient> {
        let limit = self.inactivity_limit;
        let commands = &mut self.commands;
        let waited = await_message(limit, async move {
            commands.recv().await.map_err(|e| match e {
                broadcast::error::RecvError::Lagged(n) => {
                    BenchError::RoundSync(format!("missed {} controller command(s)", n))
                }
                broadcast::error::RecvError::Closed => {
                    BenchError::RoundSync("controller command channel closed".into())
                }
            })
        })
        .await;
        match waited {
            Waited::Message(cmd) => Ok(cmd),
            Waited::Timeout => Err(BenchError::timeout(
                format!("a command at client {}", self.id),
                limit,
            )),
            Waited::Error(e) => Err(e),
        }
    }

    async fn report(&self, msg: ClientToMaster) -> BenchResult<()> {
        self.reports
            .send((self.id, msg))
            .await
            .map_err(|_| BenchError::RoundSync(format!("{}: controller is gone", self.who())))
    }

    async fn execute(&mut self, stream: &mut dyn MessageStream, round: &Round) -> BenchResult<()> {
        let len = round.message_size as usize;
        if self.buffer.len() < len {
            self.buffer.resize(len, 0);
        }
        let who = self.who();
        let buf = &mut self.buffer[..len];

        if round.bounce {
            for _ in 0..round.message_count {
                send_all(stream, buf, &who).await?;
                recv_all(stream, buf, &who).await?;
            }
        } else {
            let yield_every = (YIELD_BYTES / round.message_size.max(1)).max(1);
            for sent in 1..=round.message_count {
                send_all(stream, buf, &who).await?;
                if sent % yield_every == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }
        Ok(())
    }
}

/// Write one whole message; a failed write is a short write.
pub(crate) async fn send_all(
    stream: &mut dyn MessageStream,
    buf: &[u8],
    who: &str,
) -> BenchResult<()> {
    stream
        .send_message(buf)
        .await
        .map_err(|source| BenchError::ShortWrite {
            who: who.to_string(),
            expected: buf.len(),
            source,
        })
}

/// Read one whole message; anything less is a short read.
pub(crate) async fn recv_all(
    stream: &mut dyn MessageStream,
    buf: &mut [u8],
    who: &str,
) -> BenchResult<()> {
    let expected = buf.len();
    let actual = stream
        .recv_message(buf)
        .await
        .map_err(|e| BenchError::io(format!("{}: receive failed", who), e))?;
    if actual != expected {
        return Err(BenchError::ShortRead {
            who: who.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}
