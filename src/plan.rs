//! Round planning.
//!
//! Each phase sweeps message sizes from `first_size`, multiplying by four
//! while the size stays within `max_size`. Round `k` (1-indexed) sends
//! `total_messages / k` messages, so larger messages get proportionally
//! fewer repetitions.

use crate::protocol::Round;

/// Size multiplier between consecutive rounds.
pub const SIZE_STEP: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundPlan {
    pub first_size: u32,
    pub max_size: u32,
}

impl RoundPlan {
    pub fn new(first_size: u32, max_size: u32) -> Self {
        Self {
            first_size,
            max_size,
        }
    }

    /// A plan with exactly one round of `size` bytes.
    pub fn single(size: u32) -> Self {
        Self::new(size, size)
    }

    /// Message sizes in execution order.
    pub fn sizes(&self) -> Vec<u32> {
        let mut sizes = Vec::new();
        let mut size = self.first_size;
        while size <= self.max_size && size > 0 {
            sizes.push(size);
            match size.checked_mul(SIZE_STEP) {
                Some(next) => size = next,
                None => break,
            }
        }
        sizes
    }

    /// Rounds for one phase; `bounce` selects latency (echo) mode.
    pub fn rounds(&self, total_messages: u32, bounce: bool) -> Vec<Round> {
        self.sizes()
            .into_iter()
            .enumerate()
            .map(|(i, message_size)| Round {
                message_size,
                message_count: message_count(total_messages, i as u32 + 1),
                bounce,
            })
            .collect()
    }
}

/// Messages sent in round `k` (1-indexed).
pub fn message_count(total_messages: u32, k: u32) -> u32 {
    total_messages.checked_div(k).unwrap_or(0)
}
