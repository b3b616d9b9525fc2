//! Time-ordered span identifiers.
//!
//! A [`SpanId`] is a version 7 UUID: 48 bits of Unix milliseconds, a 12-bit
//! sequence counter which keeps identifiers created within one millisecond in
//! creation order, and 62 random bits.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::RngCore;

/// A 128-bit, time-ordered, globally unique correlation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpanId(u128);

const SEQUENCE_MAX: u16 = 0x0fff;

struct Generator {
    last_ms: u64,
    sequence: u16,
}

static GENERATOR: Mutex<Generator> = Mutex::new(Generator {
    last_ms: 0,
    sequence: 0,
});

impl SpanId {
    /// Generate a new identifier.
    pub fn new() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0);

        let (ms, sequence) = {
            let mut generator = GENERATOR.lock();
            if now > generator.last_ms {
                generator.last_ms = now;
                generator.sequence = 0;
            } else if generator.sequence == SEQUENCE_MAX {
                // Counter exhausted: borrow the next millisecond.
                generator.last_ms += 1;
                generator.sequence = 0;
            } else {
                generator.sequence += 1;
            }
            (generator.last_ms, generator.sequence)
        };

        let random = rand::thread_rng().next_u64() & ((1 << 62) - 1);

        let value = (u128::from(ms & 0xffff_ffff_ffff) << 80)
            | (0x7 << 76)
            | (u128::from(sequence) << 64)
            | (0b10 << 62)
            | u128::from(random);
        SpanId(value)
    }

    /// The raw 128-bit value.
    pub fn as_u128(&self) -> u128 {
        self.0
    }

    /// Milliseconds since the Unix epoch at creation.
    pub fn timestamp_ms(&self) -> u64 {
        (self.0 >> 80) as u64
    }
}

impl Default for SpanId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
            (v >> 96) as u32,
            (v >> 80) as u16,
            (v >> 64) as u16,
            (v >> 48) as u16,
            v & 0xffff_ffff_ffff,
        )
    }
}
