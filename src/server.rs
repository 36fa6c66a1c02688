//! # Benchmark Server
//!
//! The Server owns the data-plane listener and one Echo worker per accepted
//! peer. It is driven entirely by Controller commands on its control socket:
//!
//! ```text
//! Init -> AwaitTransportChoice -> Listening -> (accept loop) -> Draining -> AwaitTransportChoice
//! ```
//!
//! - `USE_TIPC` / `USE_TCP` opens a listener, sizes worker buffers and answers
//!   with `INFO` (listener port plus local addresses in TCP mode).
//! - While listening every accepted connection gets an Echo worker.
//!   `SET_ROUND` is fanned out to all live workers; their `ROUND_ACK` and
//!   `ROUND_DONE` reports are forwarded to the Controller.
//! - `RESTART` or a new transport choice ends every worker session. Once the
//!   last worker is gone the listener is closed and a pending transport choice
//!   is applied.
//!
//! A failing Echo worker is logged and reaped; it never takes the Server down.

use crate::cli::{ServerConfig, TransportMode};
use crate::client::{recv_all, send_all};
use crate::control::{await_message, ControlSocket, Waited};
use crate::error::{BenchError, BenchResult};
use crate::protocol::{MasterToServer, Round, ServerInfo, ServerReply, ServerToMaster};
use crate::rendezvous::Rendezvous;
use crate::transport::{MessageListener, MessageStream, TransportFactory};
use crate::utils::{local_ipv4_addrs, own_node_id};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Transport choice received from the Controller: mode and buffer size.
type TransportChoice = (TransportMode, u32);

pub struct Server {
    control: ControlSocket,
    tcp_base_port: u16,
    inactivity_limit: Duration,
    node_id: u32,
    /// Source of the most recent Controller command; replies go here.
    reply_to: Option<SocketAddr>,
}

impl Server {
    pub async fn bind(config: &ServerConfig) -> BenchResult<Self> {
        let control = ControlSocket::bind(config.control_addr).await?;
        Ok(Self {
            control,
            tcp_base_port: config.tcp_base_port,
            inactivity_limit: config.inactivity_limit,
            node_id: own_node_id(),
            reply_to: None,
        })
    }

    pub fn local_addr(&self) -> BenchResult<SocketAddr> {
        self.control.local_addr()
    }

    /// Address to publish for discovery; see [`advertise_addr`].
    pub fn advertised_addr(&self) -> BenchResult<SocketAddr> {
        let bound = self.local_addr()?;
        if !bound.ip().is_unspecified() {
            return Ok(bound);
        }
        let local = local_ipv4_addrs().unwrap_or_else(|e| {
            warn!("Server: failed to list local addresses: {}", e);
            Vec::new()
        });
        Ok(advertise_addr(bound, &local))
    }

    /// Serve Controller sessions until an error occurs.
    pub async fn run(mut self) -> BenchResult<()> {
        info!("Benchmark server started on {}", self.local_addr()?);
        let mut next_choice = None;
        loop {
            let (mode, max_msg_len) = match next_choice.take() {
                Some(choice) => choice,
                None => self.await_transport_choice().await?,
            };
            next_choice = self.listen_session(mode, max_msg_len).await?;
        }
    }

    async fn await_transport_choice(&mut self) -> BenchResult<TransportChoice> {
        debug!("Server: awaiting transport choice");
        loop {
            let limit = self.inactivity_limit;
            let (cmd, from) = await_message(limit, self.control.recv_from::<MasterToServer>())
                .await
                .into_result("a transport choice from the controller", limit)?;
            self.reply_to = Some(from);
            match cmd {
                MasterToServer::UseTransport { mode, max_msg_len } => {
                    return Ok((mode, max_msg_len));
                }
                other => debug!("Server: ignoring {:?} while no listener is open", other),
            }
        }
    }

    async fn reply(&self, cmd: ServerReply, info: ServerInfo) -> BenchResult<()> {
        let Some(dest) = self.reply_to else {
            warn!("Server: dropping {:?}, no controller address known", cmd);
            return Ok(());
        };
        let msg = ServerToMaster {
            cmd,
            origin: self.node_id,
            info,
        };
        self.control.send_to(&msg, dest).await
    }

    /// Run one listener lifetime. Returns a transport choice that arrived
    /// while listening and still has to be applied.
    async fn listen_session(
        &mut self,
        mode: TransportMode,
        max_msg_len: u32,
    ) -> BenchResult<Option<TransportChoice>> {
        let (listener, port) = TransportFactory::listen(mode, self.tcp_base_port)?;
        let info = match port {
            Some(port) => {
                let ips = local_ipv4_addrs()
                    .map_err(|e| BenchError::io("failed to list local addresses", e))?;
                ServerInfo::new(port, ips)
            }
            None => ServerInfo::default(),
        };
        info!("{} listener created", mode);
        self.reply(ServerReply::Info, info).await?;

        let (report_tx, mut report_rx) = mpsc::channel::<ServerReply>(64);
        let mut workers: JoinSet<(u32, BenchResult<()>)> = JoinSet::new();
        let mut worker_cmds: HashMap<u32, mpsc::Sender<Round>> = HashMap::new();
        let mut next_id = 0u32;
        let mut draining = false;
        let mut pending: Option<TransportChoice> = None;

        loop {
            tokio::select! {
                biased;

                accepted = listener.accept(), if !draining => {
                    let stream = accepted
                        .map_err(|e| BenchError::io(format!("{} accept failed", mode), e))?;
                    next_id += 1;
                    let (cmd_tx, cmd_rx) = mpsc::channel(4);
                    worker_cmds.insert(next_id, cmd_tx);
                    let worker = EchoWorker::new(
                        next_id,
                        stream,
                        cmd_rx,
                        report_tx.clone(),
                        self.inactivity_limit,
                        max_msg_len,
                    );
                    let id = next_id;
                    workers.spawn(async move { (id, worker.run().await) });
                    debug!("Server: echo worker {} started ({} live)", id, workers.len());
                }

                Some(report) = report_rx.recv() => {
                    self.reply(report, ServerInfo::default()).await?;
                }

                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    match joined {
                        Ok((id, result)) => {
                            worker_cmds.remove(&id);
                            match result {
                                Ok(()) => debug!("Server: echo worker {} finished", id),
                                Err(e) => error!("Server: echo worker {} failed: {}", id, e),
                            }
                        }
                        Err(e) => error!("Server: echo worker panicked: {}", e),
                    }
                    if workers.is_empty() {
                        break;
                    }
                }

                received = self.control.recv_from::<MasterToServer>() => {
                    let (cmd, from) = received?;
                    self.reply_to = Some(from);
                    match cmd {
                        MasterToServer::SetRound(round) if !draining => {
                            debug!("Server: forwarding {:?} to {} worker(s)", round, worker_cmds.len());
                            for (id, tx) in &worker_cmds {
                                if tx.send(round).await.is_err() {
                                    debug!("Server: echo worker {} already gone", id);
                                }
                            }
                        }
                        MasterToServer::SetRound(round) => {
                            warn!("Server: ignoring {:?} while draining", round);
                        }
                        MasterToServer::Restart => {
                            debug!("Server: restart requested");
                            draining = true;
                            worker_cmds.clear();
                        }
                        MasterToServer::UseTransport { mode, max_msg_len } => {
                            debug!("Server: switching to {} once workers drain", mode);
                            draining = true;
                            worker_cmds.clear();
                            pending = Some((mode, max_msg_len));
                        }
                    }
                    if draining && workers.is_empty() {
                        break;
                    }
                }
            }
        }

        drop(listener);
        while let Ok(report) = report_rx.try_recv() {
            self.reply(report, ServerInfo::default()).await?;
        }
        info!("{} listener closed", mode);
        Ok(pending)
    }
}

/// Address a Controller on another host can reach for a socket bound to
/// `bound`.
///
/// A wildcard bind is published under the first local interface address and
/// only falls back to loopback when the host has no other IPv4 address.
pub fn advertise_addr(bound: SocketAddr, local: &[Ipv4Addr]) -> SocketAddr {
    if !bound.ip().is_unspecified() {
        return bound;
    }
    let ip = local.first().copied().unwrap_or(Ipv4Addr::LOCALHOST);
    SocketAddr::from((ip, bound.port()))
}

/// Bind, publish, serve until `shutdown` resolves, then withdraw.
pub async fn serve<F>(config: &ServerConfig, rendezvous: &dyn Rendezvous, shutdown: F) -> BenchResult<()>
where
    F: Future<Output = ()>,
{
    let server = Server::bind(config).await?;
    let advertised = server.advertised_addr()?;
    rendezvous.publish(&config.server_name, advertised).await?;
    info!("Published '{}' at {}", config.server_name, advertised);

    let result = tokio::select! {
        result = server.run() => result,
        _ = shutdown => {
            info!("Shutdown requested");
            Ok(())
        }
    };

    if let Err(e) = rendezvous.withdraw(&config.server_name).await {
        warn!("Failed to withdraw '{}': {}", config.server_name, e);
        result?;
        return Err(e);
    }
    result
}

/// Echo side of one data-plane connection.
pub struct EchoWorker {
    id: u32,
    stream: Box<dyn MessageStream>,
    commands: mpsc::Receiver<Round>,
    reports: mpsc::Sender<ServerReply>,
    inactivity_limit: Duration,
    buffer: Vec<u8>,
}

/// What ended an idle wait.
enum Idle {
    Command(Option<Round>),
    PeerClosed,
}

impl EchoWorker {
    pub fn new(
        id: u32,
        stream: Box<dyn MessageStream>,
        commands: mpsc::Receiver<Round>,
        reports: mpsc::Sender<ServerReply>,
        inactivity_limit: Duration,
        max_msg_len: u32,
    ) -> Self {
        Self {
            id,
            stream,
            commands,
            reports,
            inactivity_limit,
            buffer: vec![0u8; max_msg_len as usize],
        }
    }

    fn who(&self) -> String {
        format!("echo worker {}", self.id)
    }

    /// Serve rounds until the session ends or the peer disconnects.
    pub async fn run(mut self) -> BenchResult<()> {
        loop {
            let round = match self.wait_idle().await? {
                Idle::Command(Some(round)) => round,
                Idle::Command(None) => {
                    debug!("{}: session ended", self.who());
                    if let Err(e) = self.stream.shutdown().await {
                        debug!("{}: shutdown failed: {}", self.who(), e);
                    }
                    return Ok(());
                }
                Idle::PeerClosed => {
                    debug!("{}: peer disconnected", self.who());
                    return Ok(());
                }
            };

            self.report(ServerReply::RoundAck).await?;
            self.echo_round(&round).await?;
            self.report(ServerReply::RoundDone).await?;
        }
    }

    async fn wait_idle(&mut self) -> BenchResult<Idle> {
        let who = self.who();
        let limit = self.inactivity_limit;
        let commands = &mut self.commands;
        let stream = &mut self.stream;
        let waited = await_message(limit, async {
            tokio::select! {
                cmd = commands.recv() => Ok(Idle::Command(cmd)),
                closed = stream.closed() => match closed {
                    Ok(()) => Ok(Idle::PeerClosed),
                    Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                        Err(BenchError::UnexpectedData { who: who.clone() })
                    }
                    Err(e) => Err(BenchError::io(format!("{}: connection error", who), e)),
                },
            }
        })
        .await;

        match waited {
            Waited::Message(idle) => Ok(idle),
            Waited::Timeout => Err(BenchError::timeout(format!("a round at {}", self.who()), limit)),
            Waited::Error(e) => Err(e),
        }
    }

    async fn echo_round(&mut self, round: &Round) -> BenchResult<()> {
        let len = round.message_size as usize;
        if self.buffer.len() < len {
            self.buffer.resize(len, 0);
        }
        let who = self.who();
        let limit = self.inactivity_limit;
        let stream = self.stream.as_mut();
        let buf = &mut self.buffer[..len];

        for _ in 0..round.message_count {
            match tokio::time::timeout(limit, recv_all(stream, buf, &who)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(BenchError::timeout(format!("data at {}", who), limit));
                }
            }
            if round.bounce {
                send_all(stream, buf, &who).await?;
            }
        }
        Ok(())
    }

    async fn report(&self, reply: ServerReply) -> BenchResult<()> {
        self.reports
            .send(reply)
            .await
            .map_err(|_| BenchError::RoundSync(format!("{}: server is gone", self.who())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WireMessage;
    use crate::transport::{DataEndpoint, TcpMessageListener, TcpMessageStream};

    const LIMIT: Duration = Duration::from_secs(5);

    async fn echo_pair(
        base_port: u16,
        limit: Duration,
    ) -> (
        TcpMessageStream,
        mpsc::Sender<Round>,
        mpsc::Receiver<ServerReply>,
        tokio::task::JoinHandle<BenchResult<()>>,
    ) {
        let listener = TcpMessageListener::bind_from(base_port).unwrap();
        let addr = SocketAddr::from(([127, 0, 0, 1], listener.port()));
        let (client, server) = tokio::join!(TcpMessageStream::connect(addr), listener.accept());
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let (report_tx, report_rx) = mpsc::channel(4);
        let worker = EchoWorker::new(1, server.unwrap(), cmd_rx, report_tx, limit, 1024);
        (client.unwrap(), cmd_tx, report_rx, tokio::spawn(worker.run()))
    }

    #[tokio::test]
    async fn test_echo_round_with_echo() {
        let (mut client, cmds, mut reports, worker) = echo_pair(29711, LIMIT).await;

        cmds.send(Round {
            message_size: 256,
            message_count: 5,
            bounce: true,
        })
        .await
        .unwrap();
        assert_eq!(reports.recv().await, Some(ServerReply::RoundAck));

        let mut buf = [0u8; 256];
        for i in 0..5u8 {
            client.send_message(&[i; 256]).await.unwrap();
            assert_eq!(client.recv_message(&mut buf).await.unwrap(), 256);
            assert!(buf.iter().all(|&b| b == i));
        }
        assert_eq!(reports.recv().await, Some(ServerReply::RoundDone));

        drop(client);
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_echo_round_without_echo() {
        let (mut client, cmds, mut reports, worker) = echo_pair(29811, LIMIT).await;

        cmds.send(Round {
            message_size: 64,
            message_count: 100,
            bounce: false,
        })
        .await
        .unwrap();
        assert_eq!(reports.recv().await, Some(ServerReply::RoundAck));
        for _ in 0..100 {
            client.send_message(&[1u8; 64]).await.unwrap();
        }
        assert_eq!(reports.recv().await, Some(ServerReply::RoundDone));

        // Dropping the command channel ends the session.
        drop(cmds);
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_truncated_message_is_fatal() {
        let (mut client, cmds, mut reports, worker) = echo_pair(29911, LIMIT).await;

        cmds.send(Round {
            message_size: 64,
            message_count: 1,
            bounce: false,
        })
        .await
        .unwrap();
        assert_eq!(reports.recv().await, Some(ServerReply::RoundAck));

        client.send_message(&[0u8; 10]).await.unwrap();
        client.shutdown().await.unwrap();

        let err = worker.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            BenchError::ShortRead {
                expected: 64,
                actual: 10,
                ..
            }
        ));
        // No completion is reported for a failed round.
        assert_eq!(reports.recv().await, None);
    }

    #[tokio::test]
    async fn test_data_while_idle_is_a_violation() {
        let (mut client, _cmds, _reports, worker) = echo_pair(30011, LIMIT).await;
        client.send_message(b"early").await.unwrap();
        let err = worker.await.unwrap().unwrap_err();
        assert!(matches!(err, BenchError::UnexpectedData { .. }));
    }

    #[tokio::test]
    async fn test_idle_wait_is_bounded() {
        let (_client, _cmds, _reports, worker) = echo_pair(30111, Duration::from_millis(100)).await;
        let err = worker.await.unwrap().unwrap_err();
        assert!(matches!(err, BenchError::Timeout { .. }));
    }

    fn test_config(limit: Duration, base_port: u16) -> ServerConfig {
        ServerConfig {
            control_addr: "127.0.0.1:0".parse().unwrap(),
            tcp_base_port: base_port,
            inactivity_limit: limit,
            server_name: "test-server".into(),
        }
    }

    #[tokio::test]
    async fn test_server_negotiation_and_restart() {
        let server = Server::bind(&test_config(LIMIT, 30211)).await.unwrap();
        let server_addr = server.advertised_addr().unwrap();
        let node_id = server.node_id;
        let task = tokio::spawn(server.run());

        let master = ControlSocket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        // RESTART before any listener exists is ignored.
        master.send_to(&MasterToServer::Restart, server_addr).await.unwrap();
        master
            .send_to(
                &MasterToServer::UseTransport {
                    mode: TransportMode::Tcp,
                    max_msg_len: 4096,
                },
                server_addr,
            )
            .await
            .unwrap();
        let (info, _) = master.recv_from::<ServerToMaster>().await.unwrap();
        assert_eq!(info.cmd, ServerReply::Info);
        assert_eq!(info.origin, node_id);
        assert!(info.info.tcp_port >= 30211);

        // A connected peer gets a worker that acks rounds.
        let endpoint = DataEndpoint::Tcp(SocketAddr::from(([127, 0, 0, 1], info.info.tcp_port)));
        let mut peer = TransportFactory::connect(&endpoint).await.unwrap();
        // Justification: give the accept loop time to spawn the echo worker.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let round = Round {
            message_size: 32,
            message_count: 3,
            bounce: false,
        };
        master.send_to(&MasterToServer::SetRound(round), server_addr).await.unwrap();
        let (ack, _) = master.recv_from::<ServerToMaster>().await.unwrap();
        assert_eq!(ack.cmd, ServerReply::RoundAck);
        for _ in 0..3 {
            peer.send_message(&[9u8; 32]).await.unwrap();
        }
        let (done, _) = master.recv_from::<ServerToMaster>().await.unwrap();
        assert_eq!(done.cmd, ServerReply::RoundDone);

        // RESTART drains the worker; a new transport choice then reopens.
        master.send_to(&MasterToServer::Restart, server_addr).await.unwrap();
        peer.closed().await.unwrap();
        master
            .send_to(
                &MasterToServer::UseTransport {
                    mode: TransportMode::Tcp,
                    max_msg_len: 64,
                },
                server_addr,
            )
            .await
            .unwrap();
        let (info, _) = master.recv_from::<ServerToMaster>().await.unwrap();
        assert_eq!(info.cmd, ServerReply::Info);

        assert!(!task.is_finished());
        task.abort();
    }

    #[tokio::test]
    async fn test_server_exits_when_no_transport_choice_arrives() {
        let server = Server::bind(&test_config(Duration::from_millis(100), 30311))
            .await
            .unwrap();
        let err = server.run().await.unwrap_err();
        assert!(matches!(err, BenchError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_serve_publishes_and_withdraws() {
        let registry = crate::rendezvous::MemoryRendezvous::new();
        let config = test_config(LIMIT, 30411);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let serving = {
            let registry = registry.clone();
            tokio::spawn(async move {
                serve(&config, &registry, async {
                    let _ = stop_rx.await;
                })
                .await
            })
        };

        let addr = registry
            .wait_for("test-server", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(addr.ip(), std::net::IpAddr::from(Ipv4Addr::LOCALHOST));

        stop_tx.send(()).unwrap();
        serving.await.unwrap().unwrap();
        assert!(registry
            .wait_for("test-server", Duration::from_millis(50))
            .await
            .is_err());
    }

    #[test]
    fn test_wildcard_bind_advertises_interface_address() {
        let wildcard: SocketAddr = "0.0.0.0:17777".parse().unwrap();
        let local = [Ipv4Addr::new(192, 0, 2, 7), Ipv4Addr::new(198, 51, 100, 1)];
        assert_eq!(
            advertise_addr(wildcard, &local),
            "192.0.2.7:17777".parse::<SocketAddr>().unwrap()
        );
        // Only a host without any interface address falls back to loopback.
        assert_eq!(
            advertise_addr(wildcard, &[]),
            "127.0.0.1:17777".parse::<SocketAddr>().unwrap()
        );
        let bound: SocketAddr = "10.1.2.3:9000".parse().unwrap();
        assert_eq!(advertise_addr(bound, &local), bound);
    }

    /// Registry whose withdraw always fails.
    struct StickyRendezvous(crate::rendezvous::MemoryRendezvous);

    #[async_trait::async_trait]
    impl Rendezvous for StickyRendezvous {
        async fn publish(&self, name: &str, addr: SocketAddr) -> BenchResult<()> {
            self.0.publish(name, addr).await
        }

        async fn withdraw(&self, _name: &str) -> BenchResult<()> {
            Err(BenchError::io(
                "failed to remove registry entry",
                io::Error::new(io::ErrorKind::PermissionDenied, "read-only registry"),
            ))
        }

        async fn wait_for(&self, name: &str, limit: Duration) -> BenchResult<SocketAddr> {
            self.0.wait_for(name, limit).await
        }
    }

    #[tokio::test]
    async fn test_withdraw_failure_keeps_the_run_error() {
        let registry = StickyRendezvous(crate::rendezvous::MemoryRendezvous::new());
        let config = test_config(Duration::from_millis(100), 30511);
        let err = serve(&config, &registry, std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_withdraw_failure_after_clean_shutdown_is_reported() {
        let registry = StickyRendezvous(crate::rendezvous::MemoryRendezvous::new());
        let config = test_config(LIMIT, 30611);
        let err = serve(&config, &registry, async {}).await.unwrap_err();
        assert!(matches!(err, BenchError::Io { .. }));
    }

    #[test]
    fn test_info_reply_size() {
        assert_eq!(ServerToMaster::WIRE_SIZE, 76);
    }
}
