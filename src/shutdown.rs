use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

struct Inner {
    sender: watch::Sender<bool>,
    receiver: watch::Receiver<bool>,
    timeout: Duration,
    delay: Duration,
}

/// Process-wide graceful-shutdown handle.
///
/// Cheap to clone; every long-running task holds one. `shutdown` begins the
/// drain: tasks observe it through `await_shutdown_begin`, the HTTP server
/// through `await_shutdown` (which additionally waits out the configured
/// delay so cancelled tasks reach an await point before the listener drops).
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Shutdown {
    pub fn new(timeout: Duration, delay: Duration) -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                sender,
                receiver,
                timeout,
                delay,
            }),
        }
    }

    /// Create a handle with SIGINT/SIGTERM wired to it.
    pub fn spawn(timeout: Duration, delay: Duration) -> Self {
        let shutdown = Self::new(timeout, delay);

        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                if let Err(error) = signal_shutdown().await {
                    tracing::error!(?error, "error listening for shutdown signals");
                }
                shutdown.shutdown();
            }
        });

        shutdown
    }

    /// Send the signal to shut down the process.
    pub fn shutdown(&self) {
        // Does not fail because the channel never closes.
        self.inner.sender.send(true).unwrap();
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.inner.receiver.borrow()
    }

    /// Maximum time tasks are given to finish after the drain begins.
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Resolves as soon as shutdown is requested. Safe to cancel by
    /// dropping.
    pub async fn await_shutdown_begin(&self) {
        let mut watch = self.inner.receiver.clone();
        if *watch.borrow_and_update() {
            return;
        }
        // Does not fail because the channel never closes.
        watch.changed().await.unwrap();
    }

    /// Resolves `delay` after shutdown is requested.
    pub async fn await_shutdown(&self) {
        self.await_shutdown_begin().await;
        tokio::time::sleep(self.inner.delay).await;
    }
}

#[cfg(unix)]
async fn signal_shutdown() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let sigint = signal(SignalKind::interrupt())?;
    let sigterm = signal(SignalKind::terminate())?;
    tokio::pin!(sigint);
    tokio::pin!(sigterm);
    tokio::select! {
        _ = sigint.recv() => { info!("SIGINT received, shutting down"); }
        _ = sigterm.recv() => { info!("SIGTERM received, shutting down"); }
    };
    Ok(())
}

#[cfg(not(unix))]
async fn signal_shutdown() -> anyhow::Result<()> {
    use tokio::signal::ctrl_c;

    ctrl_c().await?;
    info!("Ctrl-C received, shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::time::{sleep, Duration};

    use super::*;

    #[tokio::test]
    async fn shutdown_signal() {
        let shutdown = Shutdown::new(Duration::from_secs(30), Duration::ZERO);
        let start = tokio::time::Instant::now();

        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                sleep(Duration::from_millis(100)).await;
                shutdown.shutdown();
            }
        });

        shutdown.await_shutdown_begin().await;

        let elapsed = start.elapsed();
        assert!(elapsed > Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(200));
        assert!(shutdown.is_shutting_down());
    }

    #[tokio::test]
    async fn await_shutdown_resolves_immediately_when_already_down() {
        let shutdown = Shutdown::new(Duration::from_secs(30), Duration::ZERO);
        shutdown.shutdown();
        shutdown.await_shutdown().await;
    }
}
