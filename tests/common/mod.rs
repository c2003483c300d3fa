//! Common helpers for integration tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Guard that aborts the process if a test outlives its deadline
///
/// A lost wakeup makes a blocking-acquire test hang rather than fail; the
/// guard turns that hang into an abort with a message instead of a stuck CI
/// job. Dropping the guard (test finished) disarms it.
pub struct TestTimeoutGuard {
    finished: Arc<AtomicBool>,
}

impl Drop for TestTimeoutGuard {
    fn drop(&mut self) {
        self.finished.store(true, Ordering::SeqCst);
    }
}

pub fn test_timeout_guard(duration: Duration) -> TestTimeoutGuard {
    let finished = Arc::new(AtomicBool::new(false));
    let finished_clone = Arc::clone(&finished);
    std::thread::spawn(move || {
        std::thread::sleep(duration);
        if !finished_clone.load(Ordering::SeqCst) {
            eprintln!("Test timeout exceeded ({}s). Aborting.", duration.as_secs());
            std::process::abort();
        }
    });
    TestTimeoutGuard { finished }
}

/// Install the fmt subscriber so `RUST_LOG` surfaces the semaphore's trace
/// events during a test run. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}
