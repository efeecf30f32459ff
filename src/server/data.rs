use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::database::types::{
    ConnectionStatus, FederatedRoundRow, GlobalPatternRow, LocalPatternRow, MiningJobRow,
    StoreRow, StoreTransactionRow,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterStoreRequest {
    pub store_id: String,
    pub store_name: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterStoreResponse {
    pub status: ConnectionStatus,
    pub store_id: String,
    pub store_name: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub status: ConnectionStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ListStoresResponse {
    pub stores: Vec<StoreRow>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct UploadTransactionsResponse {
    pub transactions_added: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionsQuery {
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ListTransactionsResponse {
    pub store_id: String,
    pub transactions: Vec<StoreTransactionRow>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartMiningRequest {
    pub store_id: String,
    pub min_utility: f64,
    #[serde(default)]
    pub min_support: Option<f64>,
    #[serde(default)]
    pub max_pattern_length: Option<i64>,
    #[serde(default)]
    pub use_pruning: Option<bool>,
    #[serde(default)]
    pub batch_size: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct StartMiningResponse {
    pub job_id: i64,
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    #[serde(flatten)]
    pub job: MiningJobRow,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct MiningResultsResponse {
    pub job_id: i64,
    pub patterns: Vec<LocalPatternRow>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartRoundRequest {
    #[serde(default)]
    pub min_clients: Option<i64>,
    #[serde(default)]
    pub privacy_budget: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct StartRoundResponse {
    pub round_id: i64,
    pub round_number: i64,
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ListRoundsResponse {
    pub rounds: Vec<FederatedRoundRow>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct RoundPatternsResponse {
    pub round_id: i64,
    pub patterns: Vec<GlobalPatternRow>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_mining_request_accepts_minimal_payload() {
        let request: StartMiningRequest =
            serde_json::from_str(r#"{"store_id": "s1", "min_utility": 20.0}"#).unwrap();

        assert_eq!(request.store_id, "s1");
        assert_eq!(request.min_utility, 20.0);
        assert_eq!(request.min_support, None);
        assert_eq!(request.use_pruning, None);
    }

    #[test]
    fn start_round_request_defaults_to_empty() {
        let request: StartRoundRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(request.min_clients, None);
        assert_eq!(request.privacy_budget, None);
    }

    #[test]
    fn unknown_request_fields_are_rejected() {
        let result: Result<StartMiningRequest, _> =
            serde_json::from_str(r#"{"store_id": "s1", "min_utility": 1, "bogus": true}"#);
        assert!(result.is_err());
    }
}
