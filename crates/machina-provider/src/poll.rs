use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::ProviderError;

/// Bounded readiness polling: invoke `check` every `period` until it yields
/// `Some(value)`, an error, or `timeout` elapses.
///
/// `check` returning `Ok(None)` means "not ready yet"; a hard error aborts
/// the wait immediately. Cancellation is inherited from the caller — dropping
/// the returned future stops the wait between checks.
pub async fn poll_until<T, F, Fut>(
    period: Duration,
    timeout: Duration,
    what: &str,
    mut check: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, ProviderError>>,
{
    let deadline = Instant::now() + timeout;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if let Some(value) = check().await? {
            return Ok(value);
        }

        if Instant::now() + period > deadline {
            return Err(ProviderError::Timeout(format!(
                "{} not ready after {:?} ({} checks)",
                what, timeout, attempt
            )));
        }

        debug!(attempt, what, "not ready, polling again");
        tokio::time::sleep(period).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn returns_as_soon_as_ready() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_check = calls.clone();
        let got = poll_until(
            Duration::from_millis(1),
            Duration::from_secs(1),
            "instance",
            move || {
                let calls = calls_in_check.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok(if n >= 3 { Some(n) } else { None })
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(got, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn times_out_when_never_ready() {
        let err = poll_until(
            Duration::from_millis(5),
            Duration::from_millis(20),
            "instance",
            || async { Ok(None::<()>) },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProviderError::Timeout(_)));
        assert!(!err.is_terminal());
    }

    #[tokio::test]
    async fn check_errors_abort_immediately() {
        let err = poll_until(
            Duration::from_millis(1),
            Duration::from_secs(5),
            "instance",
            || async { Err::<Option<()>, _>(ProviderError::Upstream("boom".into())) },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProviderError::Upstream(_)));
    }
}
