use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use hyper::header::CONTENT_TYPE;
use prometheus::{Encoder, TextEncoder};
use tower_http::catch_panic::CatchPanicLayer;
use tracing::info;

use crate::app::App;
use crate::config::ServerConfig;
use crate::database::types::{ConnectionStatus, NewStoreTransaction};
use crate::shutdown::Shutdown;

pub mod data;
pub mod error;

use self::data::{
    HeartbeatResponse, JobStatusResponse, ListRoundsResponse, ListStoresResponse,
    ListTransactionsResponse, MiningResultsResponse, RegisterStoreRequest,
    RegisterStoreResponse, RoundPatternsResponse, StartMiningRequest, StartMiningResponse,
    StartRoundRequest, StartRoundResponse, TransactionsQuery, UploadTransactionsResponse,
};
use self::error::Error;

async fn register_store(
    State(app): State<Arc<App>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<RegisterStoreRequest>,
) -> Result<Json<RegisterStoreResponse>, Error> {
    let store = app
        .register_store(
            &request.store_id,
            &request.store_name,
            Some(addr.ip().to_string()),
        )
        .await?;

    Ok(Json(RegisterStoreResponse {
        status: store.connection_status,
        store_id: store.id,
        store_name: store.name,
        timestamp: Utc::now(),
    }))
}

async fn heartbeat(
    State(app): State<Arc<App>>,
    Path(store_id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Json<HeartbeatResponse>, Error> {
    app.heartbeat(&store_id, &addr.ip().to_string()).await?;

    Ok(Json(HeartbeatResponse {
        status: ConnectionStatus::Active,
        timestamp: Utc::now(),
    }))
}

async fn list_stores(
    State(app): State<Arc<App>>,
) -> Result<Json<ListStoresResponse>, Error> {
    let stores = app.list_stores().await?;

    Ok(Json(ListStoresResponse {
        stores,
        timestamp: Utc::now(),
    }))
}

async fn upload_transactions(
    State(app): State<Arc<App>>,
    Path(store_id): Path<String>,
    Json(transactions): Json<Vec<NewStoreTransaction>>,
) -> Result<Json<UploadTransactionsResponse>, Error> {
    let transactions_added = app.upload_transactions(&store_id, &transactions).await?;

    Ok(Json(UploadTransactionsResponse {
        transactions_added,
        timestamp: Utc::now(),
    }))
}

async fn list_transactions(
    State(app): State<Arc<App>>,
    Path(store_id): Path<String>,
    Query(query): Query<TransactionsQuery>,
) -> Result<Json<ListTransactionsResponse>, Error> {
    let transactions = app.list_transactions(&store_id, query.limit).await?;

    Ok(Json(ListTransactionsResponse {
        store_id,
        transactions,
        timestamp: Utc::now(),
    }))
}

async fn start_mining(
    State(app): State<Arc<App>>,
    Json(request): Json<StartMiningRequest>,
) -> Result<Json<StartMiningResponse>, Error> {
    let job_id = app
        .start_mining(
            &request.store_id,
            request.min_utility,
            request.min_support,
            request.max_pattern_length,
            request.use_pruning,
            request.batch_size,
        )
        .await?;

    Ok(Json(StartMiningResponse {
        job_id,
        status: "started",
        timestamp: Utc::now(),
    }))
}

async fn mining_status(
    State(app): State<Arc<App>>,
    Path(job_id): Path<i64>,
) -> Result<Json<JobStatusResponse>, Error> {
    let job = app.job_status(job_id).await?;

    Ok(Json(JobStatusResponse {
        job,
        timestamp: Utc::now(),
    }))
}

async fn mining_results(
    State(app): State<Arc<App>>,
    Path(job_id): Path<i64>,
) -> Result<Json<MiningResultsResponse>, Error> {
    let patterns = app.job_results(job_id).await?;

    Ok(Json(MiningResultsResponse {
        job_id,
        patterns,
        timestamp: Utc::now(),
    }))
}

async fn start_round(
    State(app): State<Arc<App>>,
    Json(request): Json<StartRoundRequest>,
) -> Result<Json<StartRoundResponse>, Error> {
    let round = app
        .start_round(request.min_clients, request.privacy_budget)
        .await?;

    Ok(Json(StartRoundResponse {
        round_id: round.id,
        round_number: round.round_number,
        status: "started",
        timestamp: Utc::now(),
    }))
}

async fn list_rounds(
    State(app): State<Arc<App>>,
) -> Result<Json<ListRoundsResponse>, Error> {
    let rounds = app.list_rounds().await?;

    Ok(Json(ListRoundsResponse {
        rounds,
        timestamp: Utc::now(),
    }))
}

async fn round_patterns(
    State(app): State<Arc<App>>,
    Path(round_id): Path<i64>,
) -> Result<Json<RoundPatternsResponse>, Error> {
    let patterns = app.round_patterns(round_id).await?;

    Ok(Json(RoundPatternsResponse {
        round_id,
        patterns,
        timestamp: Utc::now(),
    }))
}

// Health check, return 200 OK
async fn health() -> Result<(), Error> {
    Ok(())
}

async fn metrics() -> Result<Response<Body>, Error> {
    let encoder = TextEncoder::new();

    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| Error::Other(e.into()))?;

    let response = Response::builder()
        .status(200)
        .header(CONTENT_TYPE, encoder.format_type())
        .body(Body::from(buffer))
        .map_err(|e| Error::Other(e.into()))?;

    Ok(response)
}

pub fn router(app: Arc<App>) -> Router {
    Router::new()
        // Store sessions
        .route("/api/stores/register", post(register_store))
        .route("/api/stores/:id/heartbeat", post(heartbeat))
        .route("/api/stores", get(list_stores))
        // Transactions
        .route("/api/transactions/upload/:store_id", post(upload_transactions))
        .route("/api/transactions/:store_id", get(list_transactions))
        // Local mining
        .route("/api/mining/start", post(start_mining))
        .route("/api/mining/status/:job_id", get(mining_status))
        .route("/api/mining/results/:job_id", get(mining_results))
        // Federated rounds
        .route("/api/federated/start-round", post(start_round))
        .route("/api/federated/rounds", get(list_rounds))
        .route("/api/federated/rounds/:id/patterns", get(round_patterns))
        // Operational surface
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(CatchPanicLayer::new())
        .with_state(app)
}

/// # Errors
///
/// Will return `Err` if the server cannot bind to the configured address or
/// if serving fails.
pub async fn run(
    app: Arc<App>,
    config: ServerConfig,
    shutdown: Shutdown,
) -> anyhow::Result<()> {
    info!("Will listen on {}", config.address);
    let listener = tokio::net::TcpListener::bind(config.address).await?;

    bind_from_listener(app, listener, shutdown).await?;

    Ok(())
}

/// # Errors
///
/// Will return `Err` if the provided `listener` cannot be served from.
pub async fn bind_from_listener(
    app: Arc<App>,
    listener: tokio::net::TcpListener,
    shutdown: Shutdown,
) -> anyhow::Result<()> {
    let router = router(app);

    let server = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.await_shutdown().await });

    server.await?;

    Ok(())
}
