//! Wrapping sequence-number source for call correlation.
//!
//! Sequence numbers are positive `u32`s starting at 1. SN 0 is reserved on
//! the wire to mean "not tied to any specific call", so the generator never
//! hands it out: above [`SN_CEILING`] the counter wraps back to 1.

use std::sync::atomic::{AtomicU32, Ordering};

/// Largest sequence number issued before wrapping back to 1.
pub const SN_CEILING: u32 = i32::MAX as u32;

/// Lock-free source of successive sequence numbers.
#[derive(Debug, Default)]
pub struct SeqGenerator {
    last: AtomicU32,
}

impl SeqGenerator {
    pub fn new() -> Self {
        Self {
            last: AtomicU32::new(0),
        }
    }

    /// Advance and return the next sequence number.
    pub fn next(&self) -> u32 {
        let mut cur = self.last.load(Ordering::Relaxed);
        loop {
            let next = if cur >= SN_CEILING { 1 } else { cur + 1 };
            match self
                .last
                .compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Return the upcoming sequence number without advancing.
    pub fn peek(&self) -> u32 {
        let cur = self.last.load(Ordering::Relaxed);
        if cur >= SN_CEILING {
            1
        } else {
            cur + 1
        }
    }
}
