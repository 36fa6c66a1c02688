//! Error taxonomy shared by the Controller, Server and worker tasks.
//!
//! Every variant is fatal for the party that observes it. The benchmark has
//! no retry or partial-result path: a run either completes or reports one of
//! these errors and exits with status 1.

use crate::protocol::ProtocolError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BenchError {
    /// The rendezvous service never saw the requested name.
    #[error("service '{name}' was not published within {limit:?}")]
    Discovery { name: String, limit: Duration },

    /// A worker could not be started or never reported READY.
    #[error("client {worker} failed to start: {reason}")]
    Spawn { worker: u32, reason: String },

    /// A bounded control-plane wait elapsed.
    #[error("timed out after {limit:?} waiting for {what}")]
    Timeout { what: String, limit: Duration },

    /// A reply arrived that does not fit the current barrier.
    #[error("round synchronization failed: {0}")]
    RoundSync(String),

    #[error("{who}: short read ({actual} of {expected} bytes)")]
    ShortRead {
        who: String,
        expected: usize,
        actual: usize,
    },

    #[error("{who}: short write of a {expected}-byte message")]
    ShortWrite {
        who: String,
        expected: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("{who}: unexpected data outside of a round")]
    UnexpectedData { who: String },

    /// Workers still running when the teardown deadline passed.
    #[error("{pending} worker(s) did not exit within {limit:?}")]
    Teardown { pending: usize, limit: Duration },

    #[error("worker {worker} failed: {reason}")]
    WorkerFailed { worker: u32, reason: String },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

impl BenchError {
    /// Wrap an I/O error with a short description of what was attempted.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        BenchError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn timeout(what: impl Into<String>, limit: Duration) -> Self {
        BenchError::Timeout {
            what: what.into(),
            limit,
        }
    }
}

pub type BenchResult<T> = Result<T, BenchError>;
