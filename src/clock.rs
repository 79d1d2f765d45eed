//! Monotonic timestamp source.
//!
//! Stamps order same-origin nodes across buffers, so the only requirements
//! are monotonicity across threads and a reserved zero value for
//! linked-but-unstamped nodes.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds since the first call, never zero.
#[inline]
pub(crate) fn now() -> u64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    (epoch.elapsed().as_nanos() as u64).max(1)
}

#[cfg(test)]
mod tests {
    use super::now;

    #[test]
    fn nonzero_and_monotone() {
        let a = now();
        let b = now();
        assert!(a >= 1);
        assert!(b >= a);
    }
}
