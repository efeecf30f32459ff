use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, instrument, warn};

use crate::app::App;
use crate::database::methods::DbMethods as _;
use crate::database::types::NewLocalPattern;
use crate::mining::{self, MiningParams, Transaction};
use crate::retry_tx;
use crate::task_monitor::TaskMonitor;

/// Per-store exclusive locks: jobs for distinct stores run in parallel,
/// jobs for the same store serialize.
#[derive(Default)]
pub struct StoreLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl StoreLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn for_store(&self, store_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .expect("store lock registry is never poisoned")
            .entry(store_id.to_string())
            .or_default()
            .clone()
    }
}

/// One worker of the mining pool. Workers share the queue receiver; a job is
/// dispatched to exactly one of them.
pub async fn run_mining_jobs(
    app: Arc<App>,
    queue: Arc<Mutex<mpsc::Receiver<i64>>>,
    locks: Arc<StoreLocks>,
) -> anyhow::Result<()> {
    loop {
        let job_id = { queue.lock().await.recv().await };
        let Some(job_id) = job_id else {
            // Queue closed; the process is going down.
            return Ok(());
        };

        if let Err(job_error) = execute_job(&app, &locks, job_id).await {
            error!(job_id, ?job_error, "mining job did not run to completion");
            // Capture the failure on the row the job owns. A job that was
            // never claimed is untouched and will be re-enqueued.
            if let Err(error) = app
                .database
                .pool
                .fail_mining_job(job_id, &format!("{job_error:#}"))
                .await
            {
                error!(job_id, ?error, "failed to record mining job failure");
            }
        }
    }
}

#[instrument(skip(app, locks), level = "info")]
async fn execute_job(app: &Arc<App>, locks: &StoreLocks, job_id: i64) -> anyhow::Result<()> {
    let Some(job) = app.database.pool.get_mining_job(job_id).await? else {
        warn!(job_id, "queued mining job no longer exists");
        return Ok(());
    };

    let store_lock = locks.for_store(&job.store_id);
    let _guard = store_lock.lock().await;

    // The claim is compare-and-set, so duplicate queue entries and
    // cancelled jobs fall out here.
    if !app.database.pool.claim_mining_job(job_id).await? {
        return Ok(());
    }

    info!(job_id, store_id = %job.store_id, min_utility = job.min_utility, "mining job started");
    let started = Instant::now();

    let rows = app
        .database
        .pool
        .get_all_store_transactions(&job.store_id)
        .await?;
    let database_size = rows.len();

    let transactions: Vec<Transaction> = rows
        .into_iter()
        .map(|row| Transaction {
            items: row.items,
            quantities: row.quantities,
            unit_utilities: row.unit_utilities,
        })
        .collect();

    let params = MiningParams {
        min_utility: job.min_utility,
        min_support: job.min_support,
        max_length: job.max_pattern_length.map(|length| length as usize),
        use_pruning: job.use_pruning,
        cache_sizes: app.config.cache.clone().into(),
    };

    // The engine is synchronous and can run for a while; keep it off the
    // I/O pool.
    let mined = tokio::task::spawn_blocking(move || mining::mine(&transactions, &params)).await?;
    let elapsed = started.elapsed().as_secs_f64();

    match mined {
        Ok(mut patterns) => {
            patterns.sort_by(|a, b| {
                b.utility
                    .total_cmp(&a.utility)
                    .then_with(|| a.items.cmp(&b.items))
            });

            let pattern_rows: Vec<NewLocalPattern> = patterns
                .into_iter()
                .map(|pattern| NewLocalPattern {
                    items: pattern.items,
                    utility: pattern.utility,
                    support: if database_size > 0 {
                        pattern.support as f64 / database_size as f64
                    } else {
                        0.0
                    },
                    confidence: None,
                })
                .collect();

            let store_id = job.store_id.clone();
            let found = pattern_rows.len() as i64;

            // Pattern writes and the terminal job update are one
            // transaction; a reader never observes a half-written result.
            retry_tx!(app.database.pool, tx, {
                tx.insert_local_patterns(job_id, &store_id, &pattern_rows)
                    .await?;
                tx.complete_mining_job(job_id, found, elapsed).await?;
                Ok::<_, crate::database::Error>(())
            })
            .await?;

            TaskMonitor::log_job_duration(elapsed);
            info!(job_id, found, elapsed, "mining job completed");
        }
        Err(mining_error) => {
            warn!(job_id, %mining_error, "mining engine rejected the job input");
            app.database
                .pool
                .fail_mining_job(job_id, &mining_error.to_string())
                .await?;
        }
    }

    Ok(())
}
