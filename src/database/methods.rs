use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Acquire, Postgres, QueryBuilder, Row};
use tracing::instrument;

use super::types::{
    ConnectionStatus, FederatedRoundRow, GlobalPatternRow, JobStatus, LocalPatternRow,
    MiningJobRow, NewLocalPattern, NewMiningJob, NewStoreTransaction, RoundStatus,
    StoreRow, StoreTransactionRow,
};
use super::Error;
use crate::federation::AggregatedPattern;

const DEFAULT_TRANSACTION_FETCH_LIMIT: i64 = 100;

/// The individual, composable queries of the persistence layer.
///
/// Every method is a single atomic statement (or a tightly-coupled pair) over
/// an `Acquire`, so it runs equally against the pool or inside an open
/// transaction.
#[async_trait]
pub trait DbMethods<'c>: Acquire<'c, Database = Postgres> + Send + Sized {
    // ---------------------------------------------------------------- stores

    /// Register a store. Idempotent on the id: re-registration refreshes
    /// name, ip and liveness.
    #[instrument(skip(self), level = "debug")]
    async fn upsert_store(
        self,
        store_id: &str,
        name: &str,
        ip: Option<&str>,
    ) -> Result<StoreRow, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query_as::<_, StoreRow>(
            r#"
            INSERT INTO stores (id, name, ip, connection_status, last_seen)
            VALUES ($1, $2, $3, $4, CURRENT_TIMESTAMP)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name,
                ip = COALESCE(EXCLUDED.ip, stores.ip),
                connection_status = EXCLUDED.connection_status,
                last_seen = CURRENT_TIMESTAMP
            RETURNING *
            "#,
        )
        .bind(store_id)
        .bind(name)
        .bind(ip)
        .bind(<&str>::from(ConnectionStatus::Active))
        .fetch_one(&mut *conn)
        .await?;

        Ok(row)
    }

    /// Refresh a store's liveness. Returns `false` for an unknown id.
    #[instrument(skip(self), level = "debug")]
    async fn heartbeat_store(self, store_id: &str, ip: &str) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;

        let result = sqlx::query(
            r#"
            UPDATE stores
            SET last_seen = CURRENT_TIMESTAMP, connection_status = $2, ip = $3
            WHERE id = $1
            "#,
        )
        .bind(store_id)
        .bind(<&str>::from(ConnectionStatus::Active))
        .bind(ip)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_store(self, store_id: &str) -> Result<Option<StoreRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(
            sqlx::query_as::<_, StoreRow>("SELECT * FROM stores WHERE id = $1")
                .bind(store_id)
                .fetch_optional(&mut *conn)
                .await?,
        )
    }

    async fn list_stores(self) -> Result<Vec<StoreRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(
            sqlx::query_as::<_, StoreRow>("SELECT * FROM stores ORDER BY registered_at")
                .fetch_all(&mut *conn)
                .await?,
        )
    }

    /// Authoritative liveness snapshot consumed by round collection.
    async fn active_store_ids(self) -> Result<Vec<String>, Error> {
        let mut conn = self.acquire().await?;

        let rows = sqlx::query("SELECT id FROM stores WHERE connection_status = $1 ORDER BY id")
            .bind(<&str>::from(ConnectionStatus::Active))
            .fetch_all(&mut *conn)
            .await?;

        Ok(rows.into_iter().map(|row| row.get(0)).collect())
    }

    /// Flip stores unseen since `cutoff` to inactive; returns how many
    /// flipped.
    #[instrument(skip(self), level = "debug")]
    async fn sweep_inactive_stores(self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
        let mut conn = self.acquire().await?;

        let result = sqlx::query(
            r#"
            UPDATE stores
            SET connection_status = $2
            WHERE connection_status = $1 AND last_seen < $3
            "#,
        )
        .bind(<&str>::from(ConnectionStatus::Active))
        .bind(<&str>::from(ConnectionStatus::Inactive))
        .bind(cutoff)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected())
    }

    // ---------------------------------------------------------- transactions

    async fn insert_store_transactions(
        self,
        store_id: &str,
        transactions: &[NewStoreTransaction],
    ) -> Result<u64, Error> {
        if transactions.is_empty() {
            return Ok(0);
        }

        let mut conn = self.acquire().await?;

        let mut query_builder = QueryBuilder::new(
            "INSERT INTO store_transactions (store_id, items, quantities, unit_utilities) ",
        );
        query_builder.push_values(transactions, |mut b, transaction| {
            b.push_bind(store_id)
                .push_bind(transaction.items.clone())
                .push_bind(transaction.quantities.clone())
                .push_bind(transaction.unit_utilities.clone());
        });

        let result = query_builder.build().execute(&mut *conn).await?;

        Ok(result.rows_affected())
    }

    /// Transactions of a store, oldest first.
    async fn get_store_transactions(
        self,
        store_id: &str,
        limit: Option<i64>,
    ) -> Result<Vec<StoreTransactionRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, StoreTransactionRow>(
            r#"
            SELECT * FROM store_transactions
            WHERE store_id = $1
            ORDER BY store_id, transaction_date, id
            LIMIT $2
            "#,
        )
        .bind(store_id)
        .bind(limit.unwrap_or(DEFAULT_TRANSACTION_FETCH_LIMIT))
        .fetch_all(&mut *conn)
        .await?)
    }

    /// The full transaction set a mining job snapshots, in upload order.
    async fn get_all_store_transactions(
        self,
        store_id: &str,
    ) -> Result<Vec<StoreTransactionRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, StoreTransactionRow>(
            r#"
            SELECT * FROM store_transactions
            WHERE store_id = $1
            ORDER BY store_id, transaction_date, id
            "#,
        )
        .bind(store_id)
        .fetch_all(&mut *conn)
        .await?)
    }

    async fn count_store_transactions(self, store_id: &str) -> Result<i64, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query("SELECT COUNT(*) FROM store_transactions WHERE store_id = $1")
            .bind(store_id)
            .fetch_one(&mut *conn)
            .await?;

        Ok(row.get::<i64, _>(0))
    }

    // ----------------------------------------------------------- mining jobs

    async fn insert_mining_job(self, job: &NewMiningJob) -> Result<i64, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO mining_jobs
                (store_id, status, min_utility, min_support, max_pattern_length,
                 use_pruning, batch_size)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(&job.store_id)
        .bind(<&str>::from(JobStatus::Pending))
        .bind(job.min_utility)
        .bind(job.min_support)
        .bind(job.max_pattern_length)
        .bind(job.use_pruning)
        .bind(job.batch_size)
        .fetch_one(&mut *conn)
        .await?;

        Ok(row.get::<i64, _>(0))
    }

    async fn get_mining_job(self, job_id: i64) -> Result<Option<MiningJobRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(
            sqlx::query_as::<_, MiningJobRow>("SELECT * FROM mining_jobs WHERE id = $1")
                .bind(job_id)
                .fetch_optional(&mut *conn)
                .await?,
        )
    }

    /// Compare-and-set `pending -> running`. Returns `false` when the job
    /// was already claimed, finished or cancelled.
    #[instrument(skip(self), level = "debug")]
    async fn claim_mining_job(self, job_id: i64) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;

        let result = sqlx::query(
            r#"
            UPDATE mining_jobs
            SET status = $2, started_at = CURRENT_TIMESTAMP
            WHERE id = $1 AND status = $3 AND NOT cancelled
            "#,
        )
        .bind(job_id)
        .bind(<&str>::from(JobStatus::Running))
        .bind(<&str>::from(JobStatus::Pending))
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Cancel a job that has not started. Jobs already `running` are not
    /// cancellable; they are only reaped on staleness.
    async fn cancel_pending_job(self, job_id: i64) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;

        let result = sqlx::query(
            r#"
            UPDATE mining_jobs
            SET status = $2, cancelled = TRUE, error_message = 'cancelled',
                completed_at = CURRENT_TIMESTAMP
            WHERE id = $1 AND status = $3
            "#,
        )
        .bind(job_id)
        .bind(<&str>::from(JobStatus::Failed))
        .bind(<&str>::from(JobStatus::Pending))
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Compare-and-set `running -> completed` with the run's bookkeeping.
    async fn complete_mining_job(
        self,
        job_id: i64,
        patterns_found: i64,
        execution_time_seconds: f64,
    ) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;

        let result = sqlx::query(
            r#"
            UPDATE mining_jobs
            SET status = $2, patterns_found = $4, execution_time_seconds = $5,
                completed_at = CURRENT_TIMESTAMP
            WHERE id = $1 AND status = $3
            "#,
        )
        .bind(job_id)
        .bind(<&str>::from(JobStatus::Completed))
        .bind(<&str>::from(JobStatus::Running))
        .bind(patterns_found)
        .bind(execution_time_seconds)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Compare-and-set `running -> failed`, capturing the failure message.
    async fn fail_mining_job(self, job_id: i64, error_message: &str) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;

        let result = sqlx::query(
            r#"
            UPDATE mining_jobs
            SET status = $2, error_message = $4, completed_at = CURRENT_TIMESTAMP
            WHERE id = $1 AND status = $3
            "#,
        )
        .bind(job_id)
        .bind(<&str>::from(JobStatus::Failed))
        .bind(<&str>::from(JobStatus::Running))
        .bind(error_message)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Jobs awaiting a worker, oldest first. Used by the startup sweep to
    /// refill the in-memory queue.
    async fn pending_job_ids(self) -> Result<Vec<i64>, Error> {
        let mut conn = self.acquire().await?;

        let rows = sqlx::query(
            "SELECT id FROM mining_jobs WHERE status = $1 AND NOT cancelled ORDER BY id",
        )
        .bind(<&str>::from(JobStatus::Pending))
        .fetch_all(&mut *conn)
        .await?;

        Ok(rows.into_iter().map(|row| row.get(0)).collect())
    }

    /// Fail `running` jobs whose worker has not reported since `cutoff`.
    #[instrument(skip(self), level = "debug")]
    async fn reap_stale_jobs(self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
        let mut conn = self.acquire().await?;

        let result = sqlx::query(
            r#"
            UPDATE mining_jobs
            SET status = $2, error_message = 'worker timed out',
                completed_at = CURRENT_TIMESTAMP
            WHERE status = $1 AND started_at < $3
            "#,
        )
        .bind(<&str>::from(JobStatus::Running))
        .bind(<&str>::from(JobStatus::Failed))
        .bind(cutoff)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected())
    }

    // -------------------------------------------------------- local patterns

    async fn insert_local_patterns(
        self,
        job_id: i64,
        store_id: &str,
        patterns: &[NewLocalPattern],
    ) -> Result<u64, Error> {
        if patterns.is_empty() {
            return Ok(0);
        }

        let mut conn = self.acquire().await?;

        let mut query_builder = QueryBuilder::new(
            "INSERT INTO local_patterns (job_id, store_id, items, utility, support, confidence) ",
        );
        query_builder.push_values(patterns, |mut b, pattern| {
            b.push_bind(job_id)
                .push_bind(store_id)
                .push_bind(pattern.items.clone())
                .push_bind(pattern.utility)
                .push_bind(pattern.support)
                .push_bind(pattern.confidence);
        });

        let result = query_builder.build().execute(&mut *conn).await?;

        Ok(result.rows_affected())
    }

    /// A job's patterns, strongest first.
    async fn get_job_patterns(self, job_id: i64) -> Result<Vec<LocalPatternRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, LocalPatternRow>(
            r#"
            SELECT * FROM local_patterns
            WHERE job_id = $1
            ORDER BY utility DESC, items
            "#,
        )
        .bind(job_id)
        .fetch_all(&mut *conn)
        .await?)
    }

    /// For each given store, its most recent completed job that still has
    /// patterns unattributed to any round. These are the jobs a round
    /// collects from.
    async fn collectible_jobs(self, store_ids: &[String]) -> Result<Vec<(i64, String)>, Error> {
        let mut conn = self.acquire().await?;

        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (store_id) id, store_id
            FROM mining_jobs
            WHERE status = $1
              AND store_id = ANY($2)
              AND EXISTS (
                  SELECT 1 FROM local_patterns
                  WHERE local_patterns.job_id = mining_jobs.id
                    AND local_patterns.round_id IS NULL
              )
            ORDER BY store_id, completed_at DESC, id DESC
            "#,
        )
        .bind(<&str>::from(JobStatus::Completed))
        .bind(store_ids)
        .fetch_all(&mut *conn)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get(0), row.get(1)))
            .collect())
    }

    async fn unattributed_job_patterns(
        self,
        job_id: i64,
    ) -> Result<Vec<LocalPatternRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, LocalPatternRow>(
            "SELECT * FROM local_patterns WHERE job_id = $1 AND round_id IS NULL",
        )
        .bind(job_id)
        .fetch_all(&mut *conn)
        .await?)
    }

    /// Attribute a job's patterns to a committed round. Runs inside the
    /// round commit transaction.
    async fn attribute_job_patterns(self, job_id: i64, round_id: i64) -> Result<u64, Error> {
        let mut conn = self.acquire().await?;

        let result = sqlx::query(
            "UPDATE local_patterns SET round_id = $2 WHERE job_id = $1 AND round_id IS NULL",
        )
        .bind(job_id)
        .bind(round_id)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected())
    }

    // ------------------------------------------------------ federated rounds

    /// Open the next round: allocates `max(round_number) + 1` and writes the
    /// row as `running`. The partial unique index on `running` guarantees at
    /// most one open round.
    #[instrument(skip(self), level = "debug")]
    async fn open_round(
        self,
        min_clients_required: i64,
        privacy_budget: f64,
        noise_seed: i64,
    ) -> Result<FederatedRoundRow, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query_as::<_, FederatedRoundRow>(
            r#"
            INSERT INTO federated_rounds
                (round_number, status, min_clients_required, privacy_budget, noise_seed)
            SELECT COALESCE(MAX(round_number), 0) + 1, $1, $2, $3, $4
            FROM federated_rounds
            RETURNING *
            "#,
        )
        .bind(<&str>::from(RoundStatus::Running))
        .bind(min_clients_required)
        .bind(privacy_budget)
        .bind(noise_seed)
        .fetch_one(&mut *conn)
        .await?;

        Ok(row)
    }

    async fn get_round(self, round_id: i64) -> Result<Option<FederatedRoundRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, FederatedRoundRow>(
            "SELECT * FROM federated_rounds WHERE id = $1",
        )
        .bind(round_id)
        .fetch_optional(&mut *conn)
        .await?)
    }

    async fn list_rounds(self) -> Result<Vec<FederatedRoundRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, FederatedRoundRow>(
            "SELECT * FROM federated_rounds ORDER BY round_number DESC",
        )
        .fetch_all(&mut *conn)
        .await?)
    }

    async fn running_round_exists(self) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM federated_rounds WHERE status = $1)",
        )
        .bind(<&str>::from(RoundStatus::Running))
        .fetch_one(&mut *conn)
        .await?;

        Ok(row.get::<bool, _>(0))
    }

    /// Epsilon consumed so far: completed rounds plus the round currently
    /// running, if any.
    async fn consumed_epsilon(self) -> Result<f64, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(privacy_budget), 0)
            FROM federated_rounds
            WHERE status = $1 OR status = $2
            "#,
        )
        .bind(<&str>::from(RoundStatus::Completed))
        .bind(<&str>::from(RoundStatus::Running))
        .fetch_one(&mut *conn)
        .await?;

        Ok(row.get::<f64, _>(0))
    }

    /// Compare-and-set `running -> completed` with the round's bookkeeping.
    async fn complete_round(
        self,
        round_id: i64,
        participating_clients: i64,
        patterns_aggregated: i64,
    ) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;

        let result = sqlx::query(
            r#"
            UPDATE federated_rounds
            SET status = $2, participating_clients = $4, patterns_aggregated = $5,
                completed_at = CURRENT_TIMESTAMP
            WHERE id = $1 AND status = $3
            "#,
        )
        .bind(round_id)
        .bind(<&str>::from(RoundStatus::Completed))
        .bind(<&str>::from(RoundStatus::Running))
        .bind(participating_clients)
        .bind(patterns_aggregated)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Compare-and-set `running -> failed` with a machine-readable reason.
    async fn fail_round(self, round_id: i64, reason: &str) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;

        let result = sqlx::query(
            r#"
            UPDATE federated_rounds
            SET status = $2, failure_reason = $4, completed_at = CURRENT_TIMESTAMP
            WHERE id = $1 AND status = $3
            "#,
        )
        .bind(round_id)
        .bind(<&str>::from(RoundStatus::Failed))
        .bind(<&str>::from(RoundStatus::Running))
        .bind(reason)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Startup sweep: a `running` round cannot survive a process restart.
    async fn reap_running_rounds(self, reason: &str) -> Result<u64, Error> {
        let mut conn = self.acquire().await?;

        let result = sqlx::query(
            r#"
            UPDATE federated_rounds
            SET status = $2, failure_reason = $3, completed_at = CURRENT_TIMESTAMP
            WHERE status = $1
            "#,
        )
        .bind(<&str>::from(RoundStatus::Running))
        .bind(<&str>::from(RoundStatus::Failed))
        .bind(reason)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected())
    }

    // ------------------------------------------------------- global patterns

    async fn insert_global_patterns(
        self,
        round_id: i64,
        patterns: &[AggregatedPattern],
    ) -> Result<u64, Error> {
        if patterns.is_empty() {
            return Ok(0);
        }

        let mut conn = self.acquire().await?;

        let mut query_builder = QueryBuilder::new(
            "INSERT INTO global_patterns \
             (round_id, items, aggregated_utility, global_support, contributing_stores) ",
        );
        query_builder.push_values(patterns, |mut b, pattern| {
            b.push_bind(round_id)
                .push_bind(pattern.items.clone())
                .push_bind(pattern.aggregated_utility)
                .push_bind(pattern.global_support)
                .push_bind(pattern.contributing_stores as i64);
        });

        let result = query_builder.build().execute(&mut *conn).await?;

        Ok(result.rows_affected())
    }

    /// A round's released patterns, strongest first.
    async fn get_round_patterns(self, round_id: i64) -> Result<Vec<GlobalPatternRow>, Error> {
        let mut conn = self.acquire().await?;

        Ok(sqlx::query_as::<_, GlobalPatternRow>(
            r#"
            SELECT * FROM global_patterns
            WHERE round_id = $1
            ORDER BY aggregated_utility DESC, items
            "#,
        )
        .bind(round_id)
        .fetch_all(&mut *conn)
        .await?)
    }
}

impl<'c, T> DbMethods<'c> for T where T: Acquire<'c, Database = Postgres> + Send + Sized {}
