use lazy_static::lazy_static;
use std::time::Instant;

lazy_static! {
    static ref CLOCK_EPOCH: Instant = Instant::now();
}

/// Returns the process-relative monotonic clock in milliseconds. All protocol timing
/// (send periods, retry budgets, puzzle refresh) is expressed against this clock.
#[inline]
pub fn clock_millis() -> u64 {
    CLOCK_EPOCH.elapsed().as_millis() as u64
}
