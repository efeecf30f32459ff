//! Session registry: which stores are live.
//!
//! Registration is idempotent on the store id. Liveness is a materialized
//! projection of `last_seen`: heartbeats flip a store to `active`, the
//! periodic sweep flips stores past the inactivity cutoff to `inactive`.
//! Readers tolerate staleness bounded by the sweep period.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use crate::database::methods::DbMethods as _;
use crate::database::types::StoreRow;
use crate::database::{Database, Error};

/// The sweep's cutoff: stores last seen before this instant are inactive.
pub fn inactivity_cutoff(now: DateTime<Utc>, inactive_timeout: Duration) -> DateTime<Utc> {
    now - chrono::Duration::from_std(inactive_timeout)
        .expect("inactivity timeout fits in chrono's range")
}

/// Whether a store with the given `last_seen` counts as live at `now`.
pub fn is_live(last_seen: DateTime<Utc>, now: DateTime<Utc>, inactive_timeout: Duration) -> bool {
    last_seen >= inactivity_cutoff(now, inactive_timeout)
}

pub struct SessionRegistry {
    database: Arc<Database>,
    inactive_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(database: Arc<Database>, inactive_timeout: Duration) -> Self {
        Self {
            database,
            inactive_timeout,
        }
    }

    /// Register or re-register a store. Re-registration refreshes the name,
    /// ip and liveness of the existing row.
    #[instrument(skip(self), level = "debug")]
    pub async fn register(
        &self,
        store_id: &str,
        name: &str,
        ip: Option<&str>,
    ) -> Result<StoreRow, Error> {
        self.database.pool.upsert_store(store_id, name, ip).await
    }

    /// Record a heartbeat. Returns `false` for unknown stores.
    pub async fn heartbeat(&self, store_id: &str, ip: &str) -> Result<bool, Error> {
        self.database.pool.heartbeat_store(store_id, ip).await
    }

    pub async fn list(&self) -> Result<Vec<StoreRow>, Error> {
        self.database.pool.list_stores().await
    }

    /// Authoritative snapshot of live stores, used at round collection time.
    pub async fn active_store_ids(&self) -> Result<Vec<String>, Error> {
        self.database.pool.active_store_ids().await
    }

    /// One liveness sweep: flip every store quiet for longer than the
    /// inactivity timeout. This is the only writer of `inactive`.
    pub async fn sweep(&self) -> Result<u64, Error> {
        let cutoff = inactivity_cutoff(Utc::now(), self.inactive_timeout);
        let flipped = self.database.pool.sweep_inactive_stores(cutoff).await?;
        if flipped > 0 {
            debug!(flipped, "marked quiet stores inactive");
        }
        Ok(flipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(60);

    #[test]
    fn stores_within_the_timeout_are_live() {
        let now = Utc::now();

        assert!(is_live(now, now, TIMEOUT));
        assert!(is_live(now - chrono::Duration::seconds(59), now, TIMEOUT));
        assert!(is_live(now - chrono::Duration::seconds(60), now, TIMEOUT));
    }

    #[test]
    fn stores_past_the_timeout_are_not_live() {
        let now = Utc::now();

        assert!(!is_live(now - chrono::Duration::seconds(61), now, TIMEOUT));
        assert!(!is_live(now - chrono::Duration::hours(2), now, TIMEOUT));
    }

    #[test]
    fn cutoff_moves_with_the_clock() {
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(30);

        // A heartbeat that keeps a store live now no longer does 30s later.
        let last_seen = now - chrono::Duration::seconds(45);
        assert!(is_live(last_seen, now, TIMEOUT));
        assert!(!is_live(last_seen, later, TIMEOUT));
    }
}
