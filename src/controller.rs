//! # Benchmark Controller
//!
//! The Controller ("master") drives a whole run:
//!
//! ```text
//! Init -> Discovering -> NegotiatingTransport -> LatencyRounds -> SpawningPool
//!      -> ThroughputRounds -> Teardown -> Exited
//! ```
//!
//! It finds the Server through the rendezvous service, tells it which
//! transport to listen on, then runs every latency round with a single Client
//! worker and every throughput round with the full pool. Each round is a
//! two-step barrier:
//!
//! 1. `SET_ROUND` goes to the Server and one `ROUND_ACK` per participant must
//!    come back before the clock starts.
//! 2. `EXEC` is broadcast to the Clients; the round ends when every Client has
//!    sent `FINISHED` and every Echo worker has sent `ROUND_DONE`.
//!
//! Client reports carry the worker id and are matched exactly. Server acks
//! carry no worker id and are counted. Every wait is bounded by the
//! inactivity limit; any timeout, mismatch or worker failure ends the run.
//! Dropping a [`ControllerSession`] aborts whatever Client tasks remain.

use crate::address::select_address;
use crate::cli::{MasterConfig, TransportMode};
use crate::client::{ClientReport, ClientWorker};
use crate::control::{await_message, ControlSocket};
use crate::defaults;
use crate::error::{BenchError, BenchResult};
use crate::metrics::{compute_stats, elapsed_nanos, Phase, RoundStats, Timestamp};
use crate::protocol::{
    ClientToMaster, MasterToClient, MasterToServer, Round, ServerReply, ServerToMaster,
};
use crate::rendezvous::Rendezvous;
use crate::results::ResultsManager;
use crate::transport::DataEndpoint;
use crate::utils::{format_duration_ns, local_ipv4_addrs, own_node_id};
use std::collections::BTreeSet;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn};

/// Depth of the command broadcast. Commands are sent one barrier at a time,
/// so a Client never has more than one pending.
pub const COMMAND_CHANNEL_CAPACITY: usize = 16;

const REPORT_CHANNEL_CAPACITY: usize = 64;

/// Default message counts are divided by this when the Server is remote.
pub const REMOTE_COUNT_DIVISOR: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Init,
    Discovering,
    NegotiatingTransport,
    LatencyRounds,
    SpawningPool,
    ThroughputRounds,
    Teardown,
    Exited,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::Init => "init",
            ControllerState::Discovering => "discovering",
            ControllerState::NegotiatingTransport => "negotiating transport",
            ControllerState::LatencyRounds => "latency rounds",
            ControllerState::SpawningPool => "spawning pool",
            ControllerState::ThroughputRounds => "throughput rounds",
            ControllerState::Teardown => "teardown",
            ControllerState::Exited => "exited",
        };
        f.write_str(name)
    }
}

/// Anything the Controller can be woken up by.
#[derive(Debug)]
enum Event {
    Client(u32, ClientToMaster),
    Server(ServerToMaster),
    Exited(u32, BenchResult<()>),
}

/// Keep a user-supplied count, but shrink one left at its default.
fn scale_for_remote(configured: u32, default: u32) -> u32 {
    if configured == default {
        configured / REMOTE_COUNT_DIVISOR
    } else {
        configured
    }
}

fn panicked(e: tokio::task::JoinError) -> BenchError {
    BenchError::WorkerFailed {
        worker: 0,
        reason: format!("client task did not complete: {}", e),
    }
}

pub struct ControllerSession {
    config: MasterConfig,
    state: ControllerState,
    node_id: u32,
    control: ControlSocket,
    server: Option<SocketAddr>,
    endpoint: Option<DataEndpoint>,
    commands: broadcast::Sender<MasterToClient>,
    report_tx: mpsc::Sender<ClientReport>,
    reports: mpsc::Receiver<ClientReport>,
    workers: JoinSet<(u32, BenchResult<()>)>,
    live: BTreeSet<u32>,
    latency_messages: u32,
    throughput_messages: u32,
}

impl ControllerSession {
    pub async fn bind(config: MasterConfig) -> BenchResult<Self> {
        let control = ControlSocket::bind(config.control_bind).await?;
        let (commands, _) = broadcast::channel(COMMAND_CHANNEL_CAPACITY);
        let (report_tx, reports) = mpsc::channel(REPORT_CHANNEL_CAPACITY);
        Ok(Self {
            latency_messages: config.latency_messages,
            throughput_messages: config.throughput_messages,
            config,
            state: ControllerState::Init,
            node_id: own_node_id(),
            control,
            server: None,
            endpoint: None,
            commands,
            report_tx,
            reports,
            workers: JoinSet::new(),
            live: BTreeSet::new(),
        })
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Data-plane endpoint agreed with the Server, once negotiated.
    pub fn endpoint(&self) -> Option<&DataEndpoint> {
        self.endpoint.as_ref()
    }

    /// Latency and throughput totals in effect for this run.
    pub fn message_totals(&self) -> (u32, u32) {
        (self.latency_messages, self.throughput_messages)
    }

    pub fn live_clients(&self) -> usize {
        self.live.len()
    }

    fn transition(&mut self, next: ControllerState) {
        debug!("Controller: {} -> {}", self.state, next);
        self.state = next;
    }

    fn server(&self) -> BenchResult<SocketAddr> {
        self.server
            .ok_or_else(|| BenchError::RoundSync("no server has been discovered".into()))
    }

    async fn send_server(&self, msg: MasterToServer) -> BenchResult<()> {
        debug!("Controller: sending {:?} to server", msg);
        self.control.send_to(&msg, self.server()?).await
    }

    /// Look up the Server's control endpoint by name.
    pub async fn discover(&mut self, rendezvous: &dyn Rendezvous) -> BenchResult<SocketAddr> {
        self.transition(ControllerState::Discovering);
        let name = &self.config.server_name;
        let addr = rendezvous
            .wait_for(name, self.config.inactivity_limit)
            .await?;
        info!("Found server '{}' at {}", name, addr);
        self.server = Some(addr);
        Ok(addr)
    }

    /// Wait for the next report, completion or control reply.
    async fn next_event(&mut self, what: &str) -> BenchResult<Event> {
        let limit = self.config.inactivity_limit;
        let reports = &mut self.reports;
        let control = &self.control;
        let workers = &mut self.workers;
        await_message(limit, async move {
            tokio::select! {
                Some((id, msg)) = reports.recv() => Ok(Event::Client(id, msg)),
                received = control.recv_from::<ServerToMaster>() => {
                    received.map(|(msg, _)| Event::Server(msg))
                }
                Some(joined) = workers.join_next() => match joined {
                    Ok((id, result)) => Ok(Event::Exited(id, result)),
                    Err(e) => Err(panicked(e)),
                },
            }
        })
        .await
        .into_result(what, limit)
    }

    /// Turn an event that does not fit the current wait into an error.
    fn unexpected(&mut self, event: Event, expecting: &str) -> BenchError {
        match event {
            Event::Exited(id, result) => {
                self.live.remove(&id);
                let reason = match result {
                    Ok(()) => "exited before teardown".to_string(),
                    Err(e) => e.to_string(),
                };
                BenchError::WorkerFailed { worker: id, reason }
            }
            Event::Client(id, msg) => BenchError::RoundSync(format!(
                "unexpected {:?} from client {} while waiting for {}",
                msg, id, expecting
            )),
            Event::Server(msg) => BenchError::RoundSync(format!(
                "unexpected {:?} from server while waiting for {}",
                msg.cmd, expecting
            )),
        }
    }

    /// Reset the Server, choose the transport and learn where to connect.
    pub async fn negotiate_transport(&mut self) -> BenchResult<DataEndpoint> {
        self.transition(ControllerState::NegotiatingTransport);
        let mode = self.config.transport;

        self.send_server(MasterToServer::Restart).await?;
        sleep(self.config.settle_delay).await;
        self.send_server(MasterToServer::UseTransport {
            mode,
            max_msg_len: self.config.max_message_size,
        })
        .await?;

        let reply = match self.next_event("server info").await? {
            Event::Server(msg) if msg.cmd == ServerReply::Info => msg,
            other => return Err(self.unexpected(other, "INFO")),
        };

        if reply.origin != self.node_id {
            self.latency_messages =
                scale_for_remote(self.config.latency_messages, defaults::LATENCY_MESSAGES);
            self.throughput_messages =
                scale_for_remote(self.config.throughput_messages, defaults::THROUGHPUT_MESSAGES);
            info!(
                "Server runs on node {:#010x}, using {} latency and {} throughput messages",
                reply.origin, self.latency_messages, self.throughput_messages
            );
        }

        let endpoint = match mode {
            TransportMode::Tcp => {
                let own_ips = local_ipv4_addrs()
                    .map_err(|e| BenchError::io("failed to list local addresses", e))?;
                let ip = select_address(&reply.info.ips, &own_ips)
                    .or_else(|| reply.info.ips.first().copied())
                    .unwrap_or_else(|| {
                        warn!("Server reported no usable address, falling back to loopback");
                        Ipv4Addr::LOCALHOST
                    });
                DataEndpoint::Tcp(SocketAddr::from((ip, reply.info.tcp_port)))
            }
            TransportMode::Tipc => DataEndpoint::tipc_listener(),
        };
        info!("Using {} server endpoint {}", mode, endpoint);
        self.endpoint = Some(endpoint);
        Ok(endpoint)
    }

    /// Start Client `id` and wait until it has connected.
    pub async fn spawn_client(&mut self, id: u32) -> BenchResult<()> {
        let endpoint = self.endpoint.ok_or_else(|| BenchError::Spawn {
            worker: id,
            reason: "no data endpoint negotiated".into(),
        })?;
        let worker = ClientWorker::new(
            id,
            endpoint,
            self.commands.subscribe(),
            self.report_tx.clone(),
            self.config.inactivity_limit,
            self.config.max_message_size,
        );
        self.workers.spawn(async move { (id, worker.run().await) });
        self.live.insert(id);

        let what = format!("READY from client {}", id);
        match self.next_event(&what).await? {
            Event::Client(from, ClientToMaster::Ready) if from == id => {
                debug!("Client {} ready, {} live", id, self.live.len());
                Ok(())
            }
            Event::Exited(from, result) if from == id => {
                self.live.remove(&id);
                let reason = match result {
                    Ok(()) => "exited before reporting READY".to_string(),
                    Err(e) => e.to_string(),
                };
                Err(BenchError::Spawn { worker: id, reason })
            }
            other => Err(self.unexpected(other, "READY")),
        }
    }

    /// Run one synchronized round across every live Client.
    pub async fn run_round(&mut self, phase: Phase, round: Round) -> BenchResult<RoundStats> {
        let participants = self.live.len() as u32;
        debug!(
            "Controller: {} round, {} x {} bytes, {} participant(s)",
            phase, round.message_count, round.message_size, participants
        );

        self.send_server(MasterToServer::SetRound(round)).await?;
        let mut acks = 0;
        while acks < participants {
            match self.next_event("ROUND_ACK from the server").await? {
                Event::Server(msg) if msg.cmd == ServerReply::RoundAck => acks += 1,
                other => return Err(self.unexpected(other, "ROUND_ACK")),
            }
        }

        let start = Timestamp::now();
        self.commands
            .send(MasterToClient::Exec(round))
            .map_err(|_| BenchError::RoundSync("no client is listening for commands".into()))?;

        let mut finished = BTreeSet::new();
        let mut done = 0;
        while finished.len() < participants as usize || done < participants {
            match self.next_event("round completion").await? {
                Event::Client(id, ClientToMaster::Finished) => {
                    if !self.live.contains(&id) {
                        return Err(BenchError::RoundSync(format!(
                            "FINISHED from unknown client {}",
                            id
                        )));
                    }
                    if !finished.insert(id) {
                        return Err(BenchError::RoundSync(format!(
                            "duplicate FINISHED from client {}",
                            id
                        )));
                    }
                }
                Event::Server(msg) if msg.cmd == ServerReply::RoundDone => {
                    done += 1;
                    if done > participants {
                        return Err(BenchError::RoundSync(format!(
                            "{} ROUND_DONE acks for {} participant(s)",
                            done, participants
                        )));
                    }
                }
                other => return Err(self.unexpected(other, "round completion")),
            }
        }
        let elapsed = elapsed_nanos(start, Timestamp::now());

        let stats = compute_stats(phase, &round, elapsed, participants);
        debug!(
            "Controller: {} round of {} bytes took {}",
            phase,
            round.message_size,
            format_duration_ns(elapsed)
        );
        Ok(stats)
    }

    /// Terminate every Client and reap it before the deadline.
    pub async fn teardown(&mut self) -> BenchResult<()> {
        self.transition(ControllerState::Teardown);
        if self.commands.send(MasterToClient::Terminate).is_err() {
            debug!("Controller: no clients left to terminate");
        }

        let limit = self.config.inactivity_limit;
        let deadline = Instant::now() + limit;
        loop {
            match timeout_at(deadline, self.workers.join_next()).await {
                Err(_) => {
                    return Err(BenchError::Teardown {
                        pending: self.workers.len(),
                        limit,
                    })
                }
                Ok(None) => break,
                Ok(Some(Ok((id, Ok(()))))) => {
                    self.live.remove(&id);
                    debug!("Client {} reaped", id);
                }
                Ok(Some(Ok((id, Err(e))))) => {
                    return Err(BenchError::WorkerFailed {
                        worker: id,
                        reason: e.to_string(),
                    })
                }
                Ok(Some(Err(e))) => return Err(panicked(e)),
            }
        }
        self.transition(ControllerState::Exited);
        Ok(())
    }

    /// Latency phase, pool growth, throughput phase and teardown.
    ///
    /// A phase whose message total is zero is skipped. Without a latency
    /// phase the pool is spawned from Client 1.
    pub async fn run_phases(
        &mut self,
        mut results: Option<&mut ResultsManager>,
    ) -> BenchResult<Vec<RoundStats>> {
        let plan = self.config.plan();
        let settle = self.config.settle_delay;
        let mut all = Vec::new();
        let mut next_id = 1;

        if self.latency_messages > 0 {
            self.transition(ControllerState::LatencyRounds);
            self.spawn_client(next_id).await?;
            next_id += 1;
            sleep(settle).await;
            if let Some(manager) = results.as_deref_mut() {
                manager.begin_phase(Phase::Latency, self.latency_messages);
            }
            for round in plan.rounds(self.latency_messages, true) {
                let stats = self.run_round(Phase::Latency, round).await?;
                if let Some(manager) = results.as_deref_mut() {
                    manager.add_round(&stats);
                }
                all.push(stats);
            }
            if let Some(manager) = results.as_deref_mut() {
                manager.end_phase();
            }
        } else {
            info!("Latency benchmark skipped (0 messages)");
        }

        if self.throughput_messages > 0 {
            self.transition(ControllerState::SpawningPool);
            for id in next_id..=self.config.connections {
                self.spawn_client(id).await?;
            }
            info!("All {} clients connected", self.live.len());
            sleep(settle).await;

            self.transition(ControllerState::ThroughputRounds);
            if let Some(manager) = results.as_deref_mut() {
                manager.begin_phase(Phase::Throughput, self.throughput_messages);
            }
            for round in plan.rounds(self.throughput_messages, false) {
                let stats = self.run_round(Phase::Throughput, round).await?;
                if let Some(manager) = results.as_deref_mut() {
                    manager.add_round(&stats);
                }
                all.push(stats);
            }
            if let Some(manager) = results.as_deref_mut() {
                manager.end_phase();
            }
        } else {
            info!("Throughput benchmark skipped (0 messages)");
        }

        self.teardown().await?;
        Ok(all)
    }
}

/// Discover the Server, negotiate, run the phases and tear down.
pub async fn run_master(
    config: MasterConfig,
    rendezvous: &dyn Rendezvous,
    mut results: Option<&mut ResultsManager>,
) -> BenchResult<Vec<RoundStats>> {
    let mut session = ControllerSession::bind(config).await?;
    session.discover(rendezvous).await?;
    let endpoint = session.negotiate_transport().await?;
    if let Some(manager) = results.as_deref_mut() {
        manager.set_endpoint(&endpoint);
    }
    session.run_phases(results).await
}
