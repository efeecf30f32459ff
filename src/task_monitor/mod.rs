use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use once_cell::sync::Lazy;
use prometheus::{exponential_buckets, register_gauge, register_histogram, Gauge, Histogram};
use tokio::select;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::app::{App, TaskQueues};
use crate::database::methods::DbMethods as _;
use crate::shutdown::Shutdown;
use crate::utils::spawn_with_backoff_cancel_on_shutdown;

pub mod tasks;

use tasks::run_mining_jobs::StoreLocks;

const MINING_WORKER_BACKOFF: Duration = Duration::from_secs(5);
const ROUND_COORDINATOR_BACKOFF: Duration = Duration::from_secs(5);
const SESSION_SWEEP_BACKOFF: Duration = Duration::from_secs(5);
const JOB_REAPER_BACKOFF: Duration = Duration::from_secs(5);

static PENDING_MINING_JOBS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("pending_mining_jobs", "Mining jobs awaiting a worker").unwrap()
});

static ACTIVE_STORES: Lazy<Gauge> =
    Lazy::new(|| register_gauge!("active_stores", "Stores with a live session").unwrap());

static MINING_JOB_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "mining_job_seconds",
        "Mining job execution time",
        exponential_buckets(0.01, 2.0, 14).unwrap()
    )
    .unwrap()
});

/// A task manager for all long running tasks
///
/// It's assumed that there is only one instance at a time.
/// Spawning multiple `TaskMonitor`s will result in undefined behavior,
/// including data duplication.
pub struct TaskMonitor;

impl TaskMonitor {
    /// Initialize and run the task monitor: the mining worker pool, the
    /// round coordinator, the liveness sweep and the staleness reaper.
    #[instrument(level = "debug", skip_all)]
    pub async fn init(
        main_app: Arc<App>,
        queues: TaskQueues,
        shutdown: Shutdown,
    ) -> anyhow::Result<()> {
        // A `running` round cannot survive a restart. Reap before the
        // server starts accepting new round requests.
        let reaped = main_app
            .database
            .pool
            .reap_running_rounds("server_restarted")
            .await?;
        if reaped > 0 {
            warn!(reaped, "failed rounds left running by a previous process");
        }

        let job_receiver = Arc::new(Mutex::new(queues.jobs));
        let round_receiver = Arc::new(Mutex::new(queues.rounds));
        let store_locks = Arc::new(StoreLocks::new());

        let handles = FuturesUnordered::new();

        // Mining worker pool
        for _ in 0..main_app.config.app.mining_worker_pool_size.max(1) {
            let app = main_app.clone();
            let queue = job_receiver.clone();
            let locks = store_locks.clone();
            let run_mining_jobs = move || {
                tasks::run_mining_jobs::run_mining_jobs(
                    app.clone(),
                    queue.clone(),
                    locks.clone(),
                )
            };
            handles.push(spawn_with_backoff_cancel_on_shutdown(
                run_mining_jobs,
                MINING_WORKER_BACKOFF,
                shutdown.clone(),
            ));
        }

        // Round coordinator, single consumer by construction
        let app = main_app.clone();
        let queue = round_receiver.clone();
        let run_federated_rounds = move || {
            tasks::run_federated_rounds::run_federated_rounds(app.clone(), queue.clone())
        };
        handles.push(spawn_with_backoff_cancel_on_shutdown(
            run_federated_rounds,
            ROUND_COORDINATOR_BACKOFF,
            shutdown.clone(),
        ));

        // Session liveness sweep
        let app = main_app.clone();
        let sweep_sessions = move || tasks::sweep_sessions::sweep_sessions(app.clone());
        handles.push(spawn_with_backoff_cancel_on_shutdown(
            sweep_sessions,
            SESSION_SWEEP_BACKOFF,
            shutdown.clone(),
        ));

        // Stale job reaper (also refills the worker queue)
        let app = main_app.clone();
        let reap_stale_jobs = move || tasks::reap_stale_jobs::reap_stale_jobs(app.clone());
        handles.push(spawn_with_backoff_cancel_on_shutdown(
            reap_stale_jobs,
            JOB_REAPER_BACKOFF,
            shutdown.clone(),
        ));

        tokio::spawn(Self::monitor_shutdown(handles, shutdown.clone()));

        Ok(())
    }

    async fn monitor_shutdown(mut handles: FuturesUnordered<JoinHandle<()>>, shutdown: Shutdown) {
        select! {
            // Wait for the shutdown signal
            _ = shutdown.await_shutdown_begin() => {}
            // Or wait for a task to panic
            _ = Self::await_task_panic(&mut handles, shutdown.clone()) => {}
        };
    }

    async fn await_task_panic(handles: &mut FuturesUnordered<JoinHandle<()>>, shutdown: Shutdown) {
        while let Some(result) = handles.next().await {
            if !shutdown.is_shutting_down() {
                match result {
                    Ok(()) => {
                        info!("task exited");
                    }
                    Err(error) => {
                        error!(?error, "task panicked");
                        // Instruct the rest of the app to shutdown
                        shutdown.shutdown();
                        return;
                    }
                }
            }
        }
        warn!("all tasks have returned unexpectedly");
    }

    pub(crate) fn log_pending_jobs(count: usize) {
        #[allow(clippy::cast_precision_loss)]
        PENDING_MINING_JOBS.set(count as f64);
    }

    pub(crate) fn log_active_stores(count: usize) {
        #[allow(clippy::cast_precision_loss)]
        ACTIVE_STORES.set(count as f64);
    }

    pub(crate) fn log_job_duration(seconds: f64) {
        MINING_JOB_SECONDS.observe(seconds);
    }
}
