//! A lock-free deque ordered by per-item timestamps.
//!
//! Every thread pushes into its own doubly-linked buffer; pops scan all
//! buffers and pick the best candidate by comparing insertion timestamps,
//! so both ends stay active without a global lock. Unlinked nodes are
//! reclaimed through a hazard-pointer domain after a per-buffer delay.

mod buffer;
mod clock;
mod deque;
mod error;
mod node;
mod registry;
mod stats;

pub use deque::Deque;
pub use error::Error;
pub use stats::StatsSnapshot;
