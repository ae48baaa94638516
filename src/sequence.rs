//! Sequence Number Sources
//!
//! A stream transport needs unpredictable 32-bit values for initial sequence
//! numbers. The source is injected rather than kept as process-wide mutable
//! state, and every implementation here is safe to share between tasks.
//!
//! ## Thread-Safety Contract
//!
//! `SequenceSource` requires `Send + Sync`. Implementations must either be
//! internally synchronized (as both types below are) or be confined to a
//! single caller by construction.
//!
//! ## Implementations
//!
//! - [`RandomSequence`]: thread-local CSPRNG from `rand`; the default
//! - [`LcgSequence`]: a small linear congruential generator with 15-bit
//!   output, deterministic for a given seed. Useful for reproducible tests,
//!   NOT suitable for production sequence numbers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};

/// A source of unpredictable 32-bit values.
pub trait SequenceSource: Send + Sync {
    /// Returns the next value.
    fn next_u32(&self) -> u32;

    /// Returns an initial sequence number for a connection between `local`
    /// and `remote`.
    ///
    /// The endpoints are the inputs RFC 6528 hashes over. The provided
    /// implementation ignores them and draws a fresh value.
    fn initial_sequence_number(&self, local: SocketAddr, remote: SocketAddr) -> u32 {
        let _ = (local, remote);
        self.next_u32()
    }
}

/// Sequence numbers from the thread-local CSPRNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomSequence;

impl SequenceSource for RandomSequence {
    fn next_u32(&self) -> u32 {
        rand::random()
    }
}

/// Linear congruential generator: `state = state * 0x015a4e35 + 1`, output
/// bits 16..31 of the new state.
///
/// The state is advanced with an atomic compare-exchange loop, so concurrent
/// callers each observe a distinct step of the sequence.
#[derive(Debug)]
pub struct LcgSequence {
    state: AtomicU32,
}

impl LcgSequence {
    pub const MULTIPLIER: u32 = 0x015a_4e35;
    pub const INCREMENT: u32 = 1;

    pub fn new(seed: u32) -> Self {
        Self {
            state: AtomicU32::new(seed),
        }
    }

    #[inline]
    fn step(state: u32) -> u32 {
        state
            .wrapping_mul(Self::MULTIPLIER)
            .wrapping_add(Self::INCREMENT)
    }
}

impl Default for LcgSequence {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SequenceSource for LcgSequence {
    fn next_u32(&self) -> u32 {
        let previous = match self
            .state
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |s| Some(Self::step(s)))
        {
            Ok(previous) | Err(previous) => previous,
        };

        (Self::step(previous) >> 16) & 0x7fff
    }
}
