use std::sync::Arc;

use tokio::time::sleep;

use crate::app::App;
use crate::task_monitor::TaskMonitor;

/// Periodic liveness sweep: stores quiet for longer than the inactivity
/// timeout flip to `inactive` and stop counting toward round eligibility.
pub async fn sweep_sessions(app: Arc<App>) -> anyhow::Result<()> {
    let period = app.config.app.liveness_sweep_period;

    loop {
        app.registry.sweep().await?;

        let active = app.registry.active_store_ids().await?.len();
        TaskMonitor::log_active_stores(active);

        sleep(period).await;
    }
}
