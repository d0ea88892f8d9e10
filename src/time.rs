use tokio::time::Instant;

/// Source of monotonic time. Everything time-driven in the engine asks the clock rather than
///  calling `Instant::now()` directly.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Based on tokio's clock, so tests can pause and advance time.
pub struct SystemClock;
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
