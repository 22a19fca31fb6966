//! Boundary timeout semantics shared by every blocking operation in the
//! engine: `-1` waits forever, `0` never blocks, and a positive duration
//! returns no later than the wall-clock deadline (plus one scheduling
//! quantum).

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Timeout {
    /// Wait until cancellation (`-1`).
    Forever,
    /// Never block (`0`).
    NonBlocking,
    /// Block for at most the given duration.
    After(Duration),
}

impl Timeout {
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            i64::MIN..=-1 => Timeout::Forever,
            0 => Timeout::NonBlocking,
            ms => Timeout::After(Duration::from_millis(ms as u64)),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self {
            Timeout::Forever => None,
            Timeout::NonBlocking => Some(Instant::now()),
            Timeout::After(d) => Some(Instant::now() + *d),
        }
    }

    pub fn is_non_blocking(&self) -> bool {
        matches!(self, Timeout::NonBlocking)
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Timeout::After(d)
    }
}
