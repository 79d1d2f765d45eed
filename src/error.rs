use std::error;
use std::fmt;

/// Failure surfaced by deque operations.
///
/// Transient CAS losses are retried internally and an empty deque is a
/// normal `Ok(None)` pop result, so the only error left is a thread that
/// cannot be bound to a buffer at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// More threads touched the deque than the hazard-pointer domain has
    /// records for. The calling thread cannot use this deque.
    ThreadSlotsExhausted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ThreadSlotsExhausted => {
                write!(f, "no free thread slot in the hazard-pointer domain")
            }
        }
    }
}

impl error::Error for Error {}
