//! Small generic helpers shared across modules.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonically increasing id generator, used for job ids, channel ids,
/// and flow collector ids. Never reused within a process lifetime.
#[derive(Debug, Default)]
pub struct IdGenerator(AtomicU64);

impl IdGenerator {
    pub const fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    /// Returns the next id. Ids start at 1 so that 0 can be used as a
    /// sentinel "no id" value where needed.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generator_is_monotonic_and_starts_at_one() {
        let gen = IdGenerator::new();
        assert_eq!(gen.next(), 1);
        assert_eq!(gen.next(), 2);
        assert_eq!(gen.next(), 3);
    }
}
