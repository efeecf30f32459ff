use std::sync::Arc;

use rand::Rng;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::database::methods::DbMethods as _;
use crate::database::types::{
    FederatedRoundRow, GlobalPatternRow, LocalPatternRow, MiningJobRow, NewMiningJob,
    NewStoreTransaction, StoreRow, StoreTransactionRow,
};
use crate::database::Database;
use crate::federation::privacy;
use crate::registry::SessionRegistry;
use crate::server::error::Error as ServerError;

/// Receiving halves of the work queues, handed to the task monitor.
pub struct TaskQueues {
    pub jobs: mpsc::Receiver<i64>,
    pub rounds: mpsc::Receiver<i64>,
}

/// The application: owns the database handle, the session registry and the
/// sending halves of the work queues. One method per API operation; request
/// handlers never block on mining or aggregation work, they enqueue and
/// return.
pub struct App {
    pub database: Arc<Database>,
    pub registry: SessionRegistry,
    pub config: Config,
    job_sender: mpsc::Sender<i64>,
    round_sender: mpsc::Sender<i64>,
}

impl App {
    #[instrument(name = "App::new", level = "debug", skip_all)]
    pub async fn new(config: Config) -> anyhow::Result<(Arc<Self>, TaskQueues)> {
        let database = Arc::new(Database::new(&config.database).await?);
        let registry = SessionRegistry::new(
            database.clone(),
            config.app.heartbeat_inactive_timeout,
        );

        let (job_sender, job_receiver) = mpsc::channel(config.app.job_queue_capacity);
        let (round_sender, round_receiver) = mpsc::channel(config.app.round_queue_capacity);

        let app = Arc::new(Self {
            database,
            registry,
            config,
            job_sender,
            round_sender,
        });

        Ok((
            app,
            TaskQueues {
                jobs: job_receiver,
                rounds: round_receiver,
            },
        ))
    }

    // -------------------------------------------------------------- sessions

    pub async fn register_store(
        &self,
        store_id: &str,
        store_name: &str,
        ip: Option<String>,
    ) -> Result<StoreRow, ServerError> {
        if store_id.is_empty() || store_name.is_empty() {
            return Err(ServerError::InvalidStoreRegistration);
        }

        let store = self
            .registry
            .register(store_id, store_name, ip.as_deref())
            .await?;

        info!(store_id, store_name, "store registered");
        Ok(store)
    }

    pub async fn heartbeat(&self, store_id: &str, ip: &str) -> Result<(), ServerError> {
        if self.registry.heartbeat(store_id, ip).await? {
            Ok(())
        } else {
            Err(ServerError::UnknownStore)
        }
    }

    pub async fn list_stores(&self) -> Result<Vec<StoreRow>, ServerError> {
        Ok(self.registry.list().await?)
    }

    // ---------------------------------------------------------- transactions

    pub async fn upload_transactions(
        &self,
        store_id: &str,
        transactions: &[NewStoreTransaction],
    ) -> Result<u64, ServerError> {
        if self.database.pool.get_store(store_id).await?.is_none() {
            return Err(ServerError::UnknownStore);
        }

        validate_upload(transactions)?;

        let added = self
            .database
            .pool
            .insert_store_transactions(store_id, transactions)
            .await?;

        info!(store_id, added, "transactions uploaded");
        Ok(added)
    }

    pub async fn list_transactions(
        &self,
        store_id: &str,
        limit: Option<i64>,
    ) -> Result<Vec<StoreTransactionRow>, ServerError> {
        if self.database.pool.get_store(store_id).await?.is_none() {
            return Err(ServerError::UnknownStore);
        }

        Ok(self
            .database
            .pool
            .get_store_transactions(store_id, limit)
            .await?)
    }

    // ---------------------------------------------------------------- mining

    /// Create a mining job and hand it to the worker pool. The job row is
    /// the source of truth: if the in-memory queue is full the job stays
    /// `pending` and the reaper's next pass re-enqueues it.
    pub async fn start_mining(
        &self,
        store_id: &str,
        min_utility: f64,
        min_support: Option<f64>,
        max_pattern_length: Option<i64>,
        use_pruning: Option<bool>,
        batch_size: Option<i64>,
    ) -> Result<i64, ServerError> {
        if !min_utility.is_finite() || min_utility < 0.0 {
            return Err(ServerError::InvalidMinUtility);
        }
        if let Some(min_support) = min_support {
            if !min_support.is_finite() || !(0.0..=1.0).contains(&min_support) {
                return Err(ServerError::InvalidMinSupport);
            }
        }
        if self.database.pool.get_store(store_id).await?.is_none() {
            return Err(ServerError::UnknownStore);
        }

        let job = NewMiningJob {
            store_id: store_id.to_string(),
            min_utility,
            min_support,
            max_pattern_length: max_pattern_length.filter(|&l| l > 0),
            use_pruning: use_pruning.unwrap_or(true),
            batch_size: batch_size.filter(|&b| b > 0),
        };

        let job_id = self.database.pool.insert_mining_job(&job).await?;
        self.enqueue_job(job_id);

        info!(job_id, store_id, min_utility, "mining job enqueued");
        Ok(job_id)
    }

    /// Best-effort enqueue; claim is compare-and-set so duplicates are
    /// harmless.
    pub fn enqueue_job(&self, job_id: i64) {
        if self.job_sender.try_send(job_id).is_err() {
            warn!(job_id, "job queue full, leaving job pending for the reaper");
        }
    }

    pub async fn job_status(&self, job_id: i64) -> Result<MiningJobRow, ServerError> {
        self.database
            .pool
            .get_mining_job(job_id)
            .await?
            .ok_or(ServerError::JobNotFound)
    }

    pub async fn job_results(&self, job_id: i64) -> Result<Vec<LocalPatternRow>, ServerError> {
        if self.database.pool.get_mining_job(job_id).await?.is_none() {
            return Err(ServerError::JobNotFound);
        }

        Ok(self.database.pool.get_job_patterns(job_id).await?)
    }

    // ------------------------------------------------------------ federation

    /// Open the next federated round and hand it to the coordinator.
    ///
    /// Fails when another round is running or when the requested epsilon
    /// would push the cumulative consumption past the configured cap.
    #[instrument(skip(self), level = "debug")]
    pub async fn start_round(
        &self,
        min_clients: Option<i64>,
        privacy_budget: Option<f64>,
    ) -> Result<FederatedRoundRow, ServerError> {
        let min_clients = min_clients.unwrap_or(self.config.app.min_clients_required_default);
        if min_clients < 1 {
            return Err(ServerError::InvalidMinClients);
        }

        let epsilon = privacy_budget.unwrap_or(self.config.privacy.epsilon_default);
        if !epsilon.is_finite() || epsilon < 0.0 {
            return Err(ServerError::InvalidPrivacyBudget);
        }

        if self.database.pool.running_round_exists().await? {
            return Err(ServerError::RoundAlreadyRunning);
        }

        let consumed = self.database.pool.consumed_epsilon().await?;
        if privacy::budget_exhausted(consumed, epsilon, self.config.privacy.budget_cap) {
            return Err(ServerError::PrivacyBudgetExhausted);
        }

        let noise_seed: i64 = rand::thread_rng().gen();
        let round = match self
            .database
            .pool
            .open_round(min_clients, epsilon, noise_seed)
            .await
        {
            Ok(round) => round,
            // Lost the race on the single-running-round index.
            Err(error) if is_single_running_violation(&error) => {
                return Err(ServerError::RoundAlreadyRunning);
            }
            Err(error) => return Err(error.into()),
        };

        if self.round_sender.try_send(round.id).is_err() {
            self.database
                .pool
                .fail_round(round.id, "coordinator_unavailable")
                .await?;
            return Err(ServerError::Other(anyhow::anyhow!(
                "round coordinator queue is full"
            )));
        }

        info!(
            round_id = round.id,
            round_number = round.round_number,
            min_clients,
            epsilon,
            "federated round opened"
        );
        Ok(round)
    }

    pub async fn list_rounds(&self) -> Result<Vec<FederatedRoundRow>, ServerError> {
        Ok(self.database.pool.list_rounds().await?)
    }

    pub async fn round_patterns(
        &self,
        round_id: i64,
    ) -> Result<Vec<GlobalPatternRow>, ServerError> {
        if self.database.pool.get_round(round_id).await?.is_none() {
            return Err(ServerError::RoundNotFound);
        }

        Ok(self.database.pool.get_round_patterns(round_id).await?)
    }
}

fn is_single_running_violation(error: &crate::database::Error) -> bool {
    let crate::database::Error::InternalError(sqlx::Error::Database(db_error)) = error else {
        return false;
    };
    db_error.constraint() == Some("federated_rounds_single_running")
}

/// Upload payload invariants: parallel arrays of equal, non-zero length;
/// quantities and unit utilities strictly positive finite numbers.
fn validate_upload(transactions: &[NewStoreTransaction]) -> Result<(), ServerError> {
    for (index, transaction) in transactions.iter().enumerate() {
        if transaction.items.is_empty()
            || transaction.items.len() != transaction.quantities.len()
            || transaction.items.len() != transaction.unit_utilities.len()
        {
            return Err(ServerError::InvalidTransactionShape { index });
        }

        let values = transaction
            .quantities
            .iter()
            .chain(&transaction.unit_utilities);
        for &value in values {
            if !value.is_finite() || value <= 0.0 {
                return Err(ServerError::InvalidTransactionValue { index });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transaction(items: Vec<i64>, quantities: Vec<f64>, utilities: Vec<f64>) -> NewStoreTransaction {
        NewStoreTransaction {
            items,
            quantities,
            unit_utilities: utilities,
        }
    }

    #[test]
    fn upload_validation_accepts_well_formed_payloads() {
        let transactions = vec![
            transaction(vec![1, 2], vec![1.0, 2.0], vec![3.0, 0.5]),
            transaction(vec![3], vec![4.0], vec![1.0]),
        ];

        assert!(validate_upload(&transactions).is_ok());
    }

    #[test]
    fn upload_validation_rejects_ragged_arrays() {
        let transactions = vec![transaction(vec![1, 2], vec![1.0], vec![3.0, 0.5])];

        assert!(matches!(
            validate_upload(&transactions),
            Err(ServerError::InvalidTransactionShape { index: 0 })
        ));
    }

    #[test]
    fn upload_validation_rejects_empty_transactions() {
        let transactions = vec![
            transaction(vec![1], vec![1.0], vec![1.0]),
            transaction(vec![], vec![], vec![]),
        ];

        assert!(matches!(
            validate_upload(&transactions),
            Err(ServerError::InvalidTransactionShape { index: 1 })
        ));
    }

    #[test]
    fn upload_validation_rejects_non_positive_values() {
        let zero_quantity = vec![transaction(vec![1], vec![0.0], vec![1.0])];
        assert!(matches!(
            validate_upload(&zero_quantity),
            Err(ServerError::InvalidTransactionValue { index: 0 })
        ));

        let negative_utility = vec![transaction(vec![1], vec![1.0], vec![-2.0])];
        assert!(validate_upload(&negative_utility).is_err());

        let nan_utility = vec![transaction(vec![1], vec![1.0], vec![f64::NAN])];
        assert!(validate_upload(&nan_utility).is_err());
    }
}
