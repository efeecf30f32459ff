pub mod reap_stale_jobs;
pub mod run_federated_rounds;
pub mod run_mining_jobs;
pub mod sweep_sessions;
