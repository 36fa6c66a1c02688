//! # Control-Plane Wire Protocol
//!
//! The Controller, Client workers and Server exchange four fixed-size control
//! messages. Every field is an unsigned integer transmitted in network byte
//! order with no padding and no length prefix, so each message kind has a
//! single valid size:
//!
//! | Message          | Fields                                           | Bytes |
//! |------------------|--------------------------------------------------|-------|
//! | `MasterToClient` | cmd, msglen, msgcount, bounce                    | 16    |
//! | `ClientToMaster` | cmd                                              | 4     |
//! | `MasterToServer` | cmd, msglen, msgcount, echo                      | 16    |
//! | `ServerToMaster` | cmd, origin, tcp_port(u16), num_ips(u16), ips[16] | 76    |
//!
//! Encoding goes through bincode configured for fixed-width big-endian
//! integers. Decoding checks the exact size first; anything else is a
//! protocol violation.

use crate::cli::TransportMode;
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use thiserror::Error;

/// Maximum number of interface addresses carried in a `ServerInfo`.
pub const MAX_SERVER_IPS: usize = 16;

/// Largest message size a Server accepts for buffers and rounds (16 MiB).
pub const MAX_MESSAGE_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid {kind} message: expected {expected} bytes, got {actual}")]
    WrongSize {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid {kind} message: unknown command code {code}")]
    UnknownCommand { kind: &'static str, code: u32 },

    #[error("server info lists {0} addresses (maximum {MAX_SERVER_IPS})")]
    TooManyAddresses(usize),

    #[error("{kind} message size {size} exceeds the 16 MiB limit")]
    MessageTooLarge { kind: &'static str, size: u32 },

    #[error("wire codec error: {0}")]
    Codec(#[from] bincode::Error),
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_big_endian()
}

/// A control message with a fixed wire representation.
pub trait WireMessage: Sized {
    /// Human-readable message kind used in diagnostics.
    const KIND: &'static str;
    /// Exact encoded size in bytes.
    const WIRE_SIZE: usize;

    fn encode(&self) -> Result<Vec<u8>, ProtocolError>;

    fn decode(bytes: &[u8]) -> Result<Self, ProtocolError>;
}

fn check_size(kind: &'static str, expected: usize, bytes: &[u8]) -> Result<(), ProtocolError> {
    if bytes.len() != expected {
        return Err(ProtocolError::WrongSize {
            kind,
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

/// One unit of measurement: `message_count` messages of `message_size` bytes.
///
/// `bounce` selects closed-loop mode (the Server echoes every message and the
/// Client waits for it) and doubles as the Server's echo flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    pub message_size: u32,
    pub message_count: u32,
    pub bounce: bool,
}

#[derive(Serialize, Deserialize)]
struct RawCommand {
    cmd: u32,
    msglen: u32,
    msgcount: u32,
    flag: u32,
}

const COMMAND_SIZE: usize = 16;

impl RawCommand {
    fn round(&self) -> Round {
        Round {
            message_size: self.msglen,
            message_count: self.msgcount,
            bounce: self.flag != 0,
        }
    }

    fn from_round(cmd: u32, round: &Round) -> Self {
        Self {
            cmd,
            msglen: round.message_size,
            msgcount: round.message_count,
            flag: u32::from(round.bounce),
        }
    }
}

/// Controller → Client group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterToClient {
    Exec(Round),
    Terminate,
}

impl MasterToClient {
    const EXEC: u32 = 3;
    const TERMINATE: u32 = 4;
}

impl WireMessage for MasterToClient {
    const KIND: &'static str = "master-to-client";
    const WIRE_SIZE: usize = COMMAND_SIZE;

    fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let raw = match self {
            MasterToClient::Exec(round) => RawCommand::from_round(Self::EXEC, round),
            MasterToClient::Terminate => RawCommand {
                cmd: Self::TERMINATE,
                msglen: 0,
                msgcount: 0,
                flag: 0,
            },
        };
        Ok(wire_options().serialize(&raw)?)
    }

    fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        check_size(Self::KIND, Self::WIRE_SIZE, bytes)?;
        let raw: RawCommand = wire_options().deserialize(bytes)?;
        match raw.cmd {
            Self::EXEC => Ok(MasterToClient::Exec(raw.round())),
            Self::TERMINATE => Ok(MasterToClient::Terminate),
            code => Err(ProtocolError::UnknownCommand {
                kind: Self::KIND,
                code,
            }),
        }
    }
}

/// Client → Controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientToMaster {
    Ready,
    Finished,
}

#[derive(Serialize, Deserialize)]
struct RawClientReport {
    cmd: u32,
}

impl ClientToMaster {
    const READY: u32 = 1;
    const FINISHED: u32 = 2;
}

impl WireMessage for ClientToMaster {
    const KIND: &'static str = "client-to-master";
    const WIRE_SIZE: usize = 4;

    fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let cmd = match self {
            ClientToMaster::Ready => Self::READY,
            ClientToMaster::Finished => Self::FINISHED,
        };
        Ok(wire_options().serialize(&RawClientReport { cmd })?)
    }

    fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        check_size(Self::KIND, Self::WIRE_SIZE, bytes)?;
        let raw: RawClientReport = wire_options().deserialize(bytes)?;
        match raw.cmd {
            Self::READY => Ok(ClientToMaster::Ready),
            Self::FINISHED => Ok(ClientToMaster::Finished),
            code => Err(ProtocolError::UnknownCommand {
                kind: Self::KIND,
                code,
            }),
        }
    }
}

/// Controller → Server group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterToServer {
    /// Open a listener for `mode` and size worker buffers to `max_msg_len`.
    UseTransport { mode: TransportMode, max_msg_len: u32 },
    SetRound(Round),
    Restart,
}

impl MasterToServer {
    const USE_TIPC: u32 = 0;
    const USE_TCP: u32 = 1;
    const SET_ROUND: u32 = 2;
    const RESTART: u32 = 3;
}

impl WireMessage for MasterToServer {
    const KIND: &'static str = "master-to-server";
    const WIRE_SIZE: usize = COMMAND_SIZE;

    fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let raw = match self {
            MasterToServer::UseTransport { mode, max_msg_len } => RawCommand {
                cmd: match mode {
                    TransportMode::Tipc => Self::USE_TIPC,
                    TransportMode::Tcp => Self::USE_TCP,
                },
                msglen: *max_msg_len,
                msgcount: 0,
                flag: 0,
            },
            MasterToServer::SetRound(round) => RawCommand::from_round(Self::SET_ROUND, round),
            MasterToServer::Restart => RawCommand {
                cmd: Self::RESTART,
                msglen: 0,
                msgcount: 0,
                flag: 0,
            },
        };
        Ok(wire_options().serialize(&raw)?)
    }

    fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        check_size(Self::KIND, Self::WIRE_SIZE, bytes)?;
        let raw: RawCommand = wire_options().deserialize(bytes)?;
        if raw.msglen > MAX_MESSAGE_LEN
            && matches!(raw.cmd, Self::USE_TIPC | Self::USE_TCP | Self::SET_ROUND)
        {
            return Err(ProtocolError::MessageTooLarge {
                kind: Self::KIND,
                size: raw.msglen,
            });
        }
        match raw.cmd {
            Self::USE_TIPC => Ok(MasterToServer::UseTransport {
                mode: TransportMode::Tipc,
                max_msg_len: raw.msglen,
            }),
            Self::USE_TCP => Ok(MasterToServer::UseTransport {
                mode: TransportMode::Tcp,
                max_msg_len: raw.msglen,
            }),
            Self::SET_ROUND => Ok(MasterToServer::SetRound(raw.round())),
            Self::RESTART => Ok(MasterToServer::Restart),
            code => Err(ProtocolError::UnknownCommand {
                kind: Self::KIND,
                code,
            }),
        }
    }
}

/// Listener details a Server reports with `INFO`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub tcp_port: u16,
    pub ips: Vec<Ipv4Addr>,
}

impl ServerInfo {
    /// Build from an interface list, keeping at most [`MAX_SERVER_IPS`] entries.
    pub fn new(tcp_port: u16, ips: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        Self {
            tcp_port,
            ips: ips.into_iter().take(MAX_SERVER_IPS).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerReply {
    Info,
    RoundAck,
    RoundDone,
}

impl ServerReply {
    const INFO: u32 = 0;
    const ROUND_ACK: u32 = 1;
    const ROUND_DONE: u32 = 2;

    fn code(self) -> u32 {
        match self {
            ServerReply::Info => Self::INFO,
            ServerReply::RoundAck => Self::ROUND_ACK,
            ServerReply::RoundDone => Self::ROUND_DONE,
        }
    }
}

/// Server → Controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerToMaster {
    pub cmd: ServerReply,
    /// Node identity of the replying Server.
    pub origin: u32,
    pub info: ServerInfo,
}

#[derive(Serialize, Deserialize)]
struct RawServerReport {
    cmd: u32,
    origin: u32,
    tcp_port: u16,
    num_ips: u16,
    ips: [u32; MAX_SERVER_IPS],
}

impl WireMessage for ServerToMaster {
    const KIND: &'static str = "server-to-master";
    const WIRE_SIZE: usize = 4 + 4 + 2 + 2 + 4 * MAX_SERVER_IPS;

    fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.info.ips.len() > MAX_SERVER_IPS {
            return Err(ProtocolError::TooManyAddresses(self.info.ips.len()));
        }
        let mut ips = [0u32; MAX_SERVER_IPS];
        for (slot, ip) in ips.iter_mut().zip(&self.info.ips) {
            *slot = u32::from(*ip);
        }
        let raw = RawServerReport {
            cmd: self.cmd.code(),
            origin: self.origin,
            tcp_port: self.info.tcp_port,
            num_ips: self.info.ips.len() as u16,
            ips,
        };
        Ok(wire_options().serialize(&raw)?)
    }

    fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        check_size(Self::KIND, Self::WIRE_SIZE, bytes)?;
        let raw: RawServerReport = wire_options().deserialize(bytes)?;
        let cmd = match raw.cmd {
            ServerReply::INFO => ServerReply::Info,
            ServerReply::ROUND_ACK => ServerReply::RoundAck,
            ServerReply::ROUND_DONE => ServerReply::RoundDone,
            code => {
                return Err(ProtocolError::UnknownCommand {
                    kind: Self::KIND,
                    code,
                })
            }
        };
        let count = usize::from(raw.num_ips);
        if count > MAX_SERVER_IPS {
            return Err(ProtocolError::TooManyAddresses(count));
        }
        Ok(ServerToMaster {
            cmd,
            origin: raw.origin,
            info: ServerInfo {
                tcp_port: raw.tcp_port,
                ips: raw.ips[..count].iter().map(|&ip| Ipv4Addr::from(ip)).collect(),
            },
        })
    }
}
