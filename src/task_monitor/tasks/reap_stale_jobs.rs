use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;
use tracing::warn;

use crate::app::App;
use crate::database::methods::DbMethods as _;
use crate::task_monitor::TaskMonitor;

const REAP_INTERVAL: Duration = Duration::from_secs(30);

/// Staleness reaper. A worker that dies mid-job leaves the row `running`;
/// once `stale_job_timeout` passes the row is failed so the store can mine
/// again. The same pass re-enqueues `pending` jobs (including those left
/// over from a previous process); the worker claim is compare-and-set, so
/// the duplicates this produces are harmless.
pub async fn reap_stale_jobs(app: Arc<App>) -> anyhow::Result<()> {
    loop {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(app.config.app.stale_job_timeout)
                .expect("stale job timeout fits in chrono's range");

        let reaped = app.database.pool.reap_stale_jobs(cutoff).await?;
        if reaped > 0 {
            warn!(reaped, "failed mining jobs abandoned by their worker");
        }

        let pending = app.database.pool.pending_job_ids().await?;
        TaskMonitor::log_pending_jobs(pending.len());
        for job_id in pending {
            app.enqueue_job(job_id);
        }

        sleep(REAP_INTERVAL).await;
    }
}
