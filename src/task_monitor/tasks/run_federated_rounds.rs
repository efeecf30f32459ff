use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, instrument};

use crate::app::App;
use crate::database::methods::DbMethods as _;
use crate::database::types::RoundStatus;
use crate::federation::privacy::{self, NoiseMechanism};
use crate::federation::{AggregatedPattern, AggregationState, ContributedPattern, StoreContribution};
use crate::retry_tx;

/// The round coordinator: a single consumer so rounds execute strictly
/// serialized in `round_number` order.
pub async fn run_federated_rounds(
    app: Arc<App>,
    queue: Arc<Mutex<mpsc::Receiver<i64>>>,
) -> anyhow::Result<()> {
    loop {
        let round_id = { queue.lock().await.recv().await };
        let Some(round_id) = round_id else {
            return Ok(());
        };

        if let Err(round_error) = execute_round(&app, round_id).await {
            error!(round_id, ?round_error, "federated round did not run to completion");
            if let Err(error) = app
                .database
                .pool
                .fail_round(round_id, "internal_error")
                .await
            {
                error!(round_id, ?error, "failed to record round failure");
            }
        }
    }
}

#[instrument(skip(app), level = "info")]
async fn execute_round(app: &Arc<App>, round_id: i64) -> anyhow::Result<()> {
    let Some(round) = app.database.pool.get_round(round_id).await? else {
        error!(round_id, "queued round no longer exists");
        return Ok(());
    };
    if round.status != RoundStatus::Running {
        return Ok(());
    }

    // Collect: the liveness snapshot is taken once, then the attribution
    // set is fixed for the whole round.
    let active_stores = app.registry.active_store_ids().await?;
    let jobs = app.database.pool.collectible_jobs(&active_stores).await?;

    if (jobs.len() as i64) < round.min_clients_required {
        info!(
            round_id,
            round_number = round.round_number,
            contributing = jobs.len(),
            required = round.min_clients_required,
            "round failed: not enough active stores with fresh patterns"
        );
        app.database
            .pool
            .fail_round(round_id, "insufficient_clients")
            .await?;
        return Ok(());
    }

    let mut contributions = Vec::with_capacity(jobs.len());
    for (job_id, store_id) in &jobs {
        let patterns = app.database.pool.unattributed_job_patterns(*job_id).await?;
        let database_size = app.database.pool.count_store_transactions(store_id).await?;

        contributions.push(StoreContribution {
            store_id: store_id.clone(),
            database_size: database_size as u64,
            patterns: patterns
                .into_iter()
                .map(|pattern| ContributedPattern {
                    items: pattern.items,
                    utility: pattern.utility,
                    support: pattern.support,
                })
                .collect(),
        });
    }

    // Aggregate.
    let mut state = AggregationState::new();
    for contribution in &contributions {
        state.fold(contribution);
    }
    let aggregated = state.finish();

    // Privatize. The RNG is seeded from the row, so a commit retry reuses
    // identical noise.
    let mechanism =
        NoiseMechanism::for_round(round.privacy_budget, app.config.privacy.sensitivity);
    let mut rng = privacy::round_rng(round.noise_seed);
    let released: Vec<AggregatedPattern> = aggregated
        .into_iter()
        .filter_map(|mut pattern| {
            mechanism
                .apply(&mut rng, pattern.aggregated_utility)
                .map(|utility| {
                    pattern.aggregated_utility = utility;
                    pattern
                })
        })
        .collect();

    // Commit: released patterns, attribution and the round's terminal state
    // land atomically.
    let participating = jobs.len() as i64;
    let released_count = released.len() as i64;
    retry_tx!(app.database.pool, tx, {
        tx.insert_global_patterns(round_id, &released).await?;
        for (job_id, _) in &jobs {
            tx.attribute_job_patterns(*job_id, round_id).await?;
        }
        tx.complete_round(round_id, participating, released_count)
            .await?;
        Ok::<_, crate::database::Error>(())
    })
    .await?;

    info!(
        round_id,
        round_number = round.round_number,
        participating,
        patterns = released_count,
        "federated round completed"
    );
    Ok(())
}
