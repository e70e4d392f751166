//! Polling assertions for asynchronous state.

use std::time::Duration;

use tokio::time::{Instant, sleep};

/// Poll interval between condition checks.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Polls `condition` until it returns true or `timeout` expires.
///
/// Returns whether the condition held before the deadline; assert on the
/// returned bool with a message naming what was awaited.
pub async fn assert_eventually(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(POLL_INTERVAL).await;
    }
}
