use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use hyper::StatusCode;
use serde::Serialize;
use thiserror::Error;

use crate::database;

#[derive(Debug, Error)]
pub enum Error {
    // Validation errors: the request itself is malformed.
    #[error(
        "transaction {index}: items, quantities and unit_utilities must be \
         equal-length and non-empty"
    )]
    InvalidTransactionShape { index: usize },
    #[error(
        "transaction {index}: quantities and unit utilities must be strictly \
         positive finite numbers"
    )]
    InvalidTransactionValue { index: usize },
    #[error("min_utility must be a non-negative finite number")]
    InvalidMinUtility,
    #[error("min_support must be a fraction between 0 and 1")]
    InvalidMinSupport,
    #[error("privacy_budget must be a non-negative finite number")]
    InvalidPrivacyBudget,
    #[error("min_clients must be at least 1")]
    InvalidMinClients,
    #[error("store id and name must be non-empty")]
    InvalidStoreRegistration,

    // Precondition errors: the request is well-formed but the state refuses
    // it.
    #[error("provided store is not registered")]
    UnknownStore,
    #[error("provided mining job not found")]
    JobNotFound,
    #[error("provided federated round not found")]
    RoundNotFound,
    #[error("cumulative privacy budget exhausted")]
    PrivacyBudgetExhausted,

    // Conflict.
    #[error("a federated round is already running")]
    RoundAlreadyRunning,

    #[error(transparent)]
    Database(#[from] database::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    timestamp: chrono::DateTime<Utc>,
}

impl Error {
    /// Stable machine-readable code, independent of the human message.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidTransactionShape { .. } => "invalid_transaction_shape",
            Self::InvalidTransactionValue { .. } => "invalid_transaction_value",
            Self::InvalidMinUtility => "invalid_min_utility",
            Self::InvalidMinSupport => "invalid_min_support",
            Self::InvalidPrivacyBudget => "invalid_privacy_budget",
            Self::InvalidMinClients => "invalid_min_clients",
            Self::InvalidStoreRegistration => "invalid_store_registration",
            Self::UnknownStore => "unknown_store",
            Self::JobNotFound => "job_not_found",
            Self::RoundNotFound => "round_not_found",
            Self::PrivacyBudgetExhausted => "privacy_budget_exhausted",
            Self::RoundAlreadyRunning => "round_already_running",
            Self::Database(_) => "database_error",
            Self::Other(_) => "internal_error",
        }
    }

    fn to_status_code(&self) -> StatusCode {
        match self {
            Self::InvalidTransactionShape { .. }
            | Self::InvalidTransactionValue { .. }
            | Self::InvalidMinUtility
            | Self::InvalidMinSupport
            | Self::InvalidPrivacyBudget
            | Self::InvalidMinClients
            | Self::InvalidStoreRegistration => StatusCode::BAD_REQUEST,
            Self::UnknownStore | Self::JobNotFound | Self::RoundNotFound => {
                StatusCode::NOT_FOUND
            }
            Self::PrivacyBudgetExhausted => StatusCode::UNPROCESSABLE_ENTITY,
            Self::RoundAlreadyRunning => StatusCode::CONFLICT,
            Self::Database(_) | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let status_code = self.to_status_code();

        let message = if let Self::Other(ref err) = self {
            format!("{err:?}")
        } else {
            self.to_string()
        };

        let body = ErrorBody {
            error: self.code(),
            message,
            timestamp: Utc::now(),
        };

        (status_code, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_snake_case() {
        let errors = [
            Error::InvalidMinUtility,
            Error::UnknownStore,
            Error::PrivacyBudgetExhausted,
            Error::RoundAlreadyRunning,
        ];

        for error in errors {
            let code = error.code();
            assert!(!code.is_empty());
            assert!(code
                .chars()
                .all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }

    #[test]
    fn validation_maps_to_bad_request() {
        assert_eq!(
            Error::InvalidMinUtility.to_status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::InvalidTransactionShape { index: 3 }.to_status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn preconditions_and_conflicts_keep_their_own_codes() {
        assert_eq!(Error::UnknownStore.to_status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            Error::RoundAlreadyRunning.to_status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::PrivacyBudgetExhausted.to_status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }
}
