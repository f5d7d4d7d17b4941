//! Polling waits with a deadline.
//!
//! The client under test reports progress only through accessors (open
//! socket count, file on disk), so the lifecycle driver polls them.  Each
//! wait fails with [`HarnessError::Timeout`] naming what it waited for.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::error::{HarnessError, Result};

/// Poll `probe` every `interval` until it returns `Ok(true)` or `limit`
/// elapses.  An error from the probe aborts the wait.  The probe is always
/// evaluated at least once.
pub async fn wait_for<F, Fut>(
    limit: Duration,
    interval: Duration,
    what: &str,
    mut probe: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + limit;
    loop {
        if probe().await? {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(HarnessError::timeout(what));
        }
        sleep(interval.min(deadline - now)).await;
    }
}

/// Infallible form of [`wait_for`].
pub async fn wait_until<F, Fut>(
    limit: Duration,
    interval: Duration,
    what: &str,
    mut predicate: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    wait_for(limit, interval, what, || {
        let ready = predicate();
        async move { Ok(ready.await) }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn returns_once_predicate_holds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        wait_until(Duration::from_secs(1), Duration::from_millis(1), "three calls", || {
            let c = c.clone();
            async move { c.fetch_add(1, Ordering::SeqCst) >= 2 }
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn times_out_with_name() {
        let err = wait_until(Duration::from_millis(30), Duration::from_millis(5), "never", || async {
            false
        })
        .await
        .unwrap_err();
        assert!(matches!(err, HarnessError::Timeout(ref what) if what == "never"));
    }

    #[tokio::test]
    async fn zero_limit_still_checks_once() {
        wait_until(Duration::ZERO, Duration::from_millis(5), "ready", || async { true })
            .await
            .unwrap();
        let err = wait_until(Duration::ZERO, Duration::from_millis(5), "idle", || async { false })
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn probe_error_aborts() {
        let err = wait_for(Duration::from_secs(1), Duration::from_millis(5), "probe", || async {
            Err(HarnessError::NotConnected)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, HarnessError::NotConnected));
    }
}
