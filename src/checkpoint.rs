//! Checkpoint manager (§4.8): periodically persists the most recently
//! processed oplog position into the `moresql_metadata` table, and reads it
//! back on startup so a restarted tail can resume close to where it left off.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use deadpool_postgres::Pool;
use tokio_postgres::types::ToSql;

use crate::error::{MoresqlError, Result};
use crate::oplog::OpTimestamp;

/// How often the checkpoint is flushed to Postgres, matching the original's
/// `checkpointFrequency`.
pub const CHECKPOINT_FREQUENCY: Duration = Duration::from_secs(30);

/// DDL for the checkpoint table, carried verbatim from the original
/// implementation's bootstrap script (printed by `--create-table-sql`).
pub const CREATE_METADATA_TABLE_SQL: &str = r#"
-- create the moresql_metadata table for checkpoint persistance
CREATE TABLE public.moresql_metadata
(
    app_name TEXT NOT NULL,
    last_epoch INT NOT NULL,
    processed_at TIMESTAMP WITH TIME ZONE DEFAULT NOW() NOT NULL
);
-- Setup mandatory unique index
CREATE UNIQUE INDEX moresql_metadata_app_name_uindex ON public.moresql_metadata (app_name);

-- Grant permissions to this user, replace $USERNAME with moresql's user
GRANT SELECT, UPDATE, DELETE ON TABLE public.moresql_metadata TO $USERNAME;

COMMENT ON COLUMN public.moresql_metadata.app_name IS 'Name of application. Used for circumstances where multiple apps stream to same PG instance.';
COMMENT ON COLUMN public.moresql_metadata.last_epoch IS 'Most recent epoch processed from Mongo';
COMMENT ON COLUMN public.moresql_metadata.processed_at IS 'Timestamp for when the last epoch was processed at';
COMMENT ON TABLE public.moresql_metadata IS 'Stores checkpoint data for MoreSQL (mongo->pg) streaming';
"#;

const SELECT_METADATA_SQL: &str = "SELECT last_epoch FROM moresql_metadata WHERE app_name=$1 ORDER BY last_epoch DESC LIMIT 1;";

/// Does this Postgres error text match "relation does not exist" for the
/// `moresql_metadata` table specifically? Mirrors `fullsync`'s identical
/// string-match against the driver's error text (no structured SQLSTATE
/// check is available through `tokio_postgres::Error`'s public API here).
fn is_missing_metadata_table(err: &tokio_postgres::Error) -> bool {
    err.to_string().contains("relation \"moresql_metadata\" does not exist")
}

const UPSERT_METADATA_SQL: &str = r#"INSERT INTO "moresql_metadata" ("app_name", "last_epoch", "processed_at")
VALUES ($1, $2, $3)
ON CONFLICT ("app_name")
DO UPDATE SET "last_epoch" = $2, "processed_at" = $3;"#;

/// A single checkpoint record: the last epoch second processed, and when.
#[derive(Debug, Clone, Copy)]
pub struct Checkpoint {
    pub last_epoch: i32,
    pub processed_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn from_timestamp(ts: OpTimestamp, now: DateTime<Utc>) -> Self {
        Self {
            last_epoch: ts.seconds as i32,
            processed_at: now,
        }
    }
}

/// Tracks the single most-recently-seen checkpoint candidate and flushes it
/// to Postgres on a fixed interval. Only ever holds the latest value — older
/// candidates are overwritten, matching the original's single `"latest"` slot
/// in its concurrent map rather than a queue of pending checkpoints.
pub struct CheckpointManager {
    app_name: String,
    latest: Arc<DashMap<&'static str, Checkpoint>>,
}

const LATEST_KEY: &str = "latest";

impl CheckpointManager {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            latest: Arc::new(DashMap::new()),
        }
    }

    /// Record a new checkpoint candidate, replacing whatever was previously latest.
    pub fn record(&self, checkpoint: Checkpoint) {
        self.latest.insert(LATEST_KEY, checkpoint);
    }

    fn peek(&self) -> Option<Checkpoint> {
        self.latest.get(LATEST_KEY).map(|entry| *entry)
    }

    /// Flush the current latest checkpoint to Postgres, if one has been recorded.
    pub async fn flush(&self, pool: &Pool) -> Result<()> {
        let Some(checkpoint) = self.peek() else {
            return Ok(());
        };
        let client = pool.get().await.map_err(MoresqlError::PostgresPool)?;
        let params: [&(dyn ToSql + Sync); 3] = [&self.app_name, &checkpoint.last_epoch, &checkpoint.processed_at];
        client.execute(UPSERT_METADATA_SQL, &params).await?;
        Ok(())
    }

    /// Read back the most recently persisted epoch for this app, or `None`
    /// if no row exists yet (first run).
    ///
    /// Per §4.8: "If the table is missing, the process aborts with
    /// instructions to run the create-table-sql helper" — a missing
    /// `moresql_metadata` relation surfaces as [`MoresqlError::MetadataTableMissing`]
    /// rather than being swallowed into "no checkpoint found", which would
    /// otherwise silently fall through to starting the tail at `now` and
    /// skip everything since the last durable checkpoint. Any other
    /// Postgres error (a transient connection failure, say) propagates
    /// unchanged for the same reason: resetting the start position to `now`
    /// on an unrelated error would violate §7's no-loss contract.
    pub async fn load(&self, pool: &Pool) -> Result<Option<i32>> {
        let client = pool.get().await.map_err(MoresqlError::PostgresPool)?;
        match client.query_opt(SELECT_METADATA_SQL, &[&self.app_name]).await {
            Ok(row) => Ok(row.map(|r| r.get::<_, i32>("last_epoch"))),
            Err(err) if is_missing_metadata_table(&err) => Err(MoresqlError::MetadataTableMissing),
            Err(err) => Err(err.into()),
        }
    }

    /// Run the periodic flush loop until `shutdown` is signalled. Mirrors the
    /// original's `time.Tick(checkpointFrequency)` loop inside `Checkpoints()`.
    pub async fn run(&self, pool: Pool, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(CHECKPOINT_FREQUENCY);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.flush(&pool).await {
                        tracing::error!(error = %err, "unable to save checkpoint");
                    } else {
                        tracing::debug!("saved checkpoint");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_replace_rather_than_queue() {
        let manager = CheckpointManager::new("moresql");
        let now = chrono::Utc::now();
        manager.record(Checkpoint::from_timestamp(OpTimestamp::new(1, 1), now));
        manager.record(Checkpoint::from_timestamp(OpTimestamp::new(2, 1), now));
        assert_eq!(manager.peek().unwrap().last_epoch, 2);
    }

    #[test]
    fn ddl_mentions_expected_objects() {
        assert!(CREATE_METADATA_TABLE_SQL.contains("CREATE TABLE public.moresql_metadata"));
        assert!(CREATE_METADATA_TABLE_SQL.contains("moresql_metadata_app_name_uindex"));
    }
}
