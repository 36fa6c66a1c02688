//! # Round Statistics
//!
//! A round is timed as a whole: the Controller stamps the wall clock once
//! before fanning out `EXEC` and once after the last completion ack. From that
//! single interval it derives
//!
//! - **latency**: elapsed / message_count (per round-trip in bounce mode),
//! - **message rate**: message_count × participants × 10⁹ / elapsed,
//! - **bit rate**: message rate × message_size × 8.
//!
//! All arithmetic is integer and widened to `u128` so that large counts over
//! short intervals cannot overflow. A zero divisor yields zero rather than a
//! panic.

use crate::protocol::Round;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Wall-clock instant split into whole seconds and nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: u64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: since_epoch.as_secs(),
            nanos: since_epoch.subsec_nanos(),
        }
    }
}

/// Nanoseconds from `start` to `end`, borrowing a second when the nanosecond
/// field of `end` is smaller. Never negative: an `end` before `start` (the
/// wall clock stepped back) gives 0.
pub fn elapsed_nanos(start: Timestamp, end: Timestamp) -> u64 {
    if end <= start {
        return 0;
    }
    let mut secs = end.secs - start.secs;
    let nanos = if end.nanos >= start.nanos {
        u64::from(end.nanos - start.nanos)
    } else {
        // `end > start` guarantees at least one whole second to borrow.
        secs -= 1;
        u64::from(end.nanos) + NANOS_PER_SEC - u64::from(start.nanos)
    };
    secs.saturating_mul(NANOS_PER_SEC).saturating_add(nanos)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Latency,
    Throughput,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Latency => write!(f, "latency"),
            Phase::Throughput => write!(f, "throughput"),
        }
    }
}

/// Results of one completed round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundStats {
    pub phase: Phase,
    pub message_size: u32,
    /// Messages sent by each participant.
    pub message_count: u32,
    pub participants: u32,
    pub elapsed_ns: u64,
    pub avg_latency_ns: u64,
    pub messages_per_second: u64,
    pub bits_per_second: u64,
}

fn saturate(value: u128) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

/// Derive latency and throughput figures for a round that took `elapsed_ns`.
pub fn compute_stats(phase: Phase, round: &Round, elapsed_ns: u64, participants: u32) -> RoundStats {
    let count = u128::from(round.message_count);
    let elapsed = u128::from(elapsed_ns);

    let avg_latency_ns = elapsed.checked_div(count).unwrap_or(0);
    let messages_per_second = (count * u128::from(participants) * u128::from(NANOS_PER_SEC))
        .checked_div(elapsed)
        .unwrap_or(0);
    let bits_per_second = messages_per_second
        .saturating_mul(u128::from(round.message_size))
        .saturating_mul(8);

    RoundStats {
        phase,
        message_size: round.message_size,
        message_count: round.message_count,
        participants,
        elapsed_ns,
        avg_latency_ns: saturate(avg_latency_ns),
        messages_per_second: saturate(messages_per_second),
        bits_per_second: saturate(bits_per_second),
    }
}

impl RoundStats {
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ns / 1_000_000
    }

    /// Average round-trip in microseconds, fractional.
    pub fn avg_round_trip_us(&self) -> f64 {
        self.avg_latency_ns as f64 / 1_000.0
    }

    pub fn total_mbps(&self) -> u64 {
        self.bits_per_second / 1_000_000
    }

    pub fn per_connection_mbps(&self) -> u64 {
        self.total_mbps()
            .checked_div(u64::from(self.participants))
            .unwrap_or(0)
    }
}
