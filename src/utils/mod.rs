use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use tokio::select;
use tokio::task::JoinHandle;
use tracing::error;

use crate::shutdown::Shutdown;

pub mod secret;

/// Run `$body` against a transaction named `$tx` on `$pool`, retrying the
/// whole block when either the body or the commit fails. Under the pool's
/// SERIALIZABLE default, commit-time serialization conflicts are expected
/// and resolve on a later attempt; after `MAX_TX_ATTEMPTS` tries the last
/// error surfaces to the caller. A failed body is rolled back before the
/// next attempt, so no attempt ever observes a previous attempt's writes.
///
/// # Example
/// ```ignore
/// let res = retry_tx!(db.pool, tx, {
///     tx.claim_mining_job(job_id).await?;
///     Ok::<_, Error>(())
/// }).await;
/// ```
#[macro_export]
macro_rules! retry_tx {
    ($pool:expr, $tx:ident, $body:expr) => {
        async {
            const MAX_TX_ATTEMPTS: u32 = 10;
            let mut attempt = 1;
            loop {
                let mut $tx = $pool.begin().await?;
                match async { $body }.await {
                    Ok(value) => match $tx.commit().await {
                        Ok(()) => break Ok(value),
                        Err(error) if attempt < MAX_TX_ATTEMPTS => {
                            tracing::warn!(
                                attempt,
                                ?error,
                                "transaction commit failed, retrying"
                            );
                        }
                        Err(error) => break Err(error.into()),
                    },
                    Err(error) if attempt < MAX_TX_ATTEMPTS => {
                        $tx.rollback().await?;
                        tracing::warn!(
                            attempt,
                            ?error,
                            "transaction rolled back, retrying"
                        );
                    }
                    // The transaction drops unfinished, which rolls it back.
                    Err(error) => break Err(error),
                }
                attempt += 1;
            }
        }
    };
}

/// Keep re-running `spawn_attempt` until one attempt returns `Ok`.
///
/// A failed or panicked attempt is logged and retried after `backoff`,
/// except once `draining` is set, at which point the supervisor gives up
/// instead of sleeping into a shutdown.
async fn supervise<S, F>(spawn_attempt: S, backoff: Duration, draining: &AtomicBool)
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
    S: Fn() -> F + Send + Sync + 'static,
{
    loop {
        // `catch_unwind` needs the unwind-safety assertion; the attempt owns
        // all of its state, so a panic cannot leave anything torn here.
        let attempt = std::panic::AssertUnwindSafe(spawn_attempt()).catch_unwind();

        let failure = match attempt.await {
            Ok(Ok(())) => return,
            Ok(Err(error)) => format!("{error:?}"),
            Err(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "opaque panic payload".to_string()),
        };
        error!(%failure, "background task attempt failed");

        if draining.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(backoff).await;
    }
}

/// Supervise `spawn_attempt` in a background task, dropping it on the spot
/// when shutdown begins. Use for loops whose persistent state lives in the
/// database and needs no in-process cleanup.
pub fn spawn_with_backoff_cancel_on_shutdown<S, F>(
    spawn_attempt: S,
    backoff: Duration,
    shutdown: Shutdown,
) -> JoinHandle<()>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
    S: Fn() -> F + Send + Sync + 'static,
{
    tokio::spawn(async move {
        // Never set: cancellation here is dropping the future, not draining.
        let draining = AtomicBool::new(false);
        select! {
            () = supervise(spawn_attempt, backoff, &draining) => {}
            () = shutdown.await_shutdown_begin() => {}
        }
    })
}

/// Supervise `spawn_attempt` in a background task, letting the in-flight
/// attempt finish when shutdown begins so its cleanup logic runs.
pub fn spawn_with_backoff<S, F>(
    spawn_attempt: S,
    backoff: Duration,
    shutdown: Shutdown,
) -> JoinHandle<()>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
    S: Fn() -> F + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let draining = AtomicBool::new(false);
        let work = supervise(spawn_attempt, backoff, &draining);
        tokio::pin!(work);

        select! {
            () = &mut work => return,
            () = async {
                shutdown.await_shutdown_begin().await;
                draining.store(true, Ordering::SeqCst);
            } => {}
        }

        // Shutdown has begun; the current attempt winds down on its own.
        work.await;
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use super::*;

    fn test_shutdown() -> Shutdown {
        Shutdown::new(Duration::from_secs(30), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn failing_attempts_are_retried_until_one_succeeds() {
        let attempts = Arc::new(AtomicUsize::new(0));

        let handle = {
            let attempts = attempts.clone();
            spawn_with_backoff(
                move || {
                    let attempts = attempts.clone();
                    async move {
                        if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                            anyhow::bail!("not yet");
                        }
                        Ok(())
                    }
                },
                Duration::from_millis(10),
                test_shutdown(),
            )
        };

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("retries succeed well within the timeout")
            .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn a_panicking_attempt_is_caught_and_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));

        let handle = {
            let attempts = attempts.clone();
            spawn_with_backoff(
                move || {
                    let attempts = attempts.clone();
                    async move {
                        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                            panic!("first attempt blows up");
                        }
                        Ok(())
                    }
                },
                Duration::from_millis(10),
                test_shutdown(),
            )
        };

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("the panic is contained and retried")
            .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancelling_variant_stops_a_hopeless_task_at_shutdown() {
        let shutdown = test_shutdown();

        let handle = spawn_with_backoff_cancel_on_shutdown(
            || async { anyhow::bail!("always failing") },
            Duration::from_millis(10),
            shutdown.clone(),
        );

        shutdown.shutdown();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("cancellation is immediate at shutdown")
            .unwrap();
    }
}
