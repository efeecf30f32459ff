use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("unknown status")]
pub struct UnknownStatus;

/// Mining job lifecycle. Transitions are compare-and-set on the status
/// column: `pending -> running -> {completed, failed}`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(UnknownStatus),
        }
    }
}

impl From<JobStatus> for &str {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// Federated round lifecycle. A round is written as `running` and settles
/// into exactly one of the terminal states.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl FromStr for RoundStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(UnknownStatus),
        }
    }
}

impl From<RoundStatus> for &str {
    fn from(status: RoundStatus) -> Self {
        match status {
            RoundStatus::Pending => "pending",
            RoundStatus::Running => "running",
            RoundStatus::Completed => "completed",
            RoundStatus::Failed => "failed",
        }
    }
}

/// Materialized projection of `last_seen`; written only by the heartbeat
/// handler and the liveness sweep.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Active,
    Inactive,
}

impl FromStr for ConnectionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            _ => Err(UnknownStatus),
        }
    }
}

impl From<ConnectionStatus> for &str {
    fn from(status: ConnectionStatus) -> Self {
        match status {
            ConnectionStatus::Active => "active",
            ConnectionStatus::Inactive => "inactive",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StoreRow {
    pub id: String,
    pub name: String,
    pub ip: Option<String>,
    pub connection_status: ConnectionStatus,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for StoreRow {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            ip: row.try_get("ip")?,
            connection_status: row
                .try_get::<&str, _>("connection_status")?
                .parse()
                .expect("connection status is unreadable, database is corrupt"),
            registered_at: row.try_get("registered_at")?,
            last_seen: row.try_get("last_seen")?,
        })
    }
}

#[derive(Clone, Debug, Serialize, FromRow)]
pub struct StoreTransactionRow {
    pub id: i64,
    pub store_id: String,
    pub items: Vec<i64>,
    pub quantities: Vec<f64>,
    pub unit_utilities: Vec<f64>,
    pub transaction_date: DateTime<Utc>,
}

/// Upload payload row, validated at the API boundary before insertion.
#[derive(Clone, Debug, Deserialize)]
pub struct NewStoreTransaction {
    pub items: Vec<i64>,
    pub quantities: Vec<f64>,
    pub unit_utilities: Vec<f64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct MiningJobRow {
    pub id: i64,
    pub store_id: String,
    pub status: JobStatus,
    pub min_utility: f64,
    pub min_support: Option<f64>,
    pub max_pattern_length: Option<i64>,
    pub use_pruning: bool,
    pub batch_size: Option<i64>,
    pub cancelled: bool,
    pub error_message: Option<String>,
    pub patterns_found: Option<i64>,
    pub execution_time_seconds: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for MiningJobRow {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            store_id: row.try_get("store_id")?,
            status: row
                .try_get::<&str, _>("status")?
                .parse()
                .expect("job status is unreadable, database is corrupt"),
            min_utility: row.try_get("min_utility")?,
            min_support: row.try_get("min_support")?,
            max_pattern_length: row.try_get("max_pattern_length")?,
            use_pruning: row.try_get("use_pruning")?,
            batch_size: row.try_get("batch_size")?,
            cancelled: row.try_get("cancelled")?,
            error_message: row.try_get("error_message")?,
            patterns_found: row.try_get("patterns_found")?,
            execution_time_seconds: row.try_get("execution_time_seconds")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

/// Parameters of a job at creation time.
#[derive(Clone, Debug)]
pub struct NewMiningJob {
    pub store_id: String,
    pub min_utility: f64,
    pub min_support: Option<f64>,
    pub max_pattern_length: Option<i64>,
    pub use_pruning: bool,
    pub batch_size: Option<i64>,
}

#[derive(Clone, Debug, Serialize, FromRow)]
pub struct LocalPatternRow {
    pub id: i64,
    pub job_id: i64,
    pub store_id: String,
    pub items: Vec<i64>,
    pub utility: f64,
    pub support: f64,
    pub confidence: Option<f64>,
    pub round_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// A pattern as the mining worker persists it.
#[derive(Clone, Debug)]
pub struct NewLocalPattern {
    pub items: Vec<i64>,
    pub utility: f64,
    pub support: f64,
    pub confidence: Option<f64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct FederatedRoundRow {
    pub id: i64,
    pub round_number: i64,
    pub status: RoundStatus,
    pub min_clients_required: i64,
    pub privacy_budget: f64,
    #[serde(skip)]
    pub noise_seed: i64,
    pub failure_reason: Option<String>,
    pub participating_clients: Option<i64>,
    pub patterns_aggregated: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for FederatedRoundRow {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            round_number: row.try_get("round_number")?,
            status: row
                .try_get::<&str, _>("status")?
                .parse()
                .expect("round status is unreadable, database is corrupt"),
            min_clients_required: row.try_get("min_clients_required")?,
            privacy_budget: row.try_get("privacy_budget")?,
            noise_seed: row.try_get("noise_seed")?,
            failure_reason: row.try_get("failure_reason")?,
            participating_clients: row.try_get("participating_clients")?,
            patterns_aggregated: row.try_get("patterns_aggregated")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

#[derive(Clone, Debug, Serialize, FromRow)]
pub struct GlobalPatternRow {
    pub id: i64,
    pub round_id: i64,
    pub items: Vec<i64>,
    pub aggregated_utility: f64,
    pub global_support: f64,
    pub contributing_stores: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            let text: &str = status.into();
            assert_eq!(text.parse::<JobStatus>().unwrap(), status);
        }

        for status in [ConnectionStatus::Active, ConnectionStatus::Inactive] {
            let text: &str = status.into();
            assert_eq!(text.parse::<ConnectionStatus>().unwrap(), status);
        }
    }

    #[test]
    fn unknown_status_text_is_rejected() {
        assert!("done".parse::<JobStatus>().is_err());
        assert!("".parse::<RoundStatus>().is_err());
    }

    #[test]
    fn statuses_serialize_in_snake_case() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Completed).unwrap(),
            "\"completed\""
        );
        assert_eq!(
            serde_json::to_string(&ConnectionStatus::Inactive).unwrap(),
            "\"inactive\""
        );
    }
}
