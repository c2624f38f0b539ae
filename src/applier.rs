//! Applier workers (§4.6): the terminal stage of a dedicated or overflow
//! worker. Sanitizes one [`OperationRecord`], selects the right SQL by op
//! kind, executes it against Postgres, and reports the outcome.

use std::sync::atomic::{AtomicU64, Ordering};

use deadpool_postgres::Pool;

use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::config::CollectionSpec;
use crate::error::{MoresqlError, Result};
use crate::metrics::RateCounters;
use crate::oplog::{ms_lag, OpKind, OperationRecord};
use crate::sanitize;
use crate::statement::Statement;

/// Running counts of what an applier pool has done, surfaced to
/// [`crate::metrics`]. Insert and update both land in `upserted` since both
/// route through the same idempotent upsert statement (§4.6 rationale:
/// applying an insert twice, or an update that arrives before its insert
/// during full sync + tail overlap, must not fail).
///
/// `rates` mirrors the same four outcomes as a sliding one-minute window
/// (§5's "1 reporter timer", §9's rate-counter design note) rather than a
/// monotonic total — [`crate::metrics::run_reporter`] logs it periodically.
#[derive(Debug, Default)]
pub struct ApplyCounters {
    pub upserted: AtomicU64,
    pub deleted: AtomicU64,
    pub skipped: AtomicU64,
    pub errored: AtomicU64,
    pub rates: RateCounters,
}

impl ApplyCounters {
    pub fn record_upsert(&self) {
        self.upserted.fetch_add(1, Ordering::Relaxed);
        self.rates.upserted.increment();
    }

    pub fn record_delete(&self) {
        self.deleted.fetch_add(1, Ordering::Relaxed);
        self.rates.deleted.increment();
    }

    pub fn record_skip(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
        self.rates.skipped.increment();
    }

    pub fn record_error(&self) {
        self.errored.fetch_add(1, Ordering::Relaxed);
        self.rates.errored.increment();
    }
}

/// Apply a single operation against `pool`, using `collection`'s statement
/// templates, and record the outcome on `counters`. Errors are logged with
/// structured fields and swallowed here — a single bad document must not
/// bring down the worker loop (§4.6); the caller's supervision tree is what
/// decides whether repeated failures should escalate.
///
/// On any outcome that isn't a skip, publishes `op.timestamp` as the latest
/// checkpoint candidate (§4.6 step 7) — after the apply attempt, not before,
/// so a crash between reading and applying never advances the checkpoint
/// past work that was never durably applied.
pub async fn apply_one(
    pool: &Pool,
    collection: &CollectionSpec,
    op: &OperationRecord,
    counters: &ApplyCounters,
    allow_deletes: bool,
    checkpoint: Option<&CheckpointManager>,
) {
    let lag_ms = ms_lag(op.timestamp, chrono::Utc::now());

    if matches!(op.kind, OpKind::Command) {
        counters.record_skip();
        return;
    }

    if matches!(op.kind, OpKind::Delete) && !allow_deletes {
        tracing::debug!(
            collection = %collection.pg_table,
            id = %sanitize_id_display(op),
            "deletes disabled, skipping"
        );
        counters.record_skip();
        return;
    }

    let values = sanitize::sanitize(collection, op);
    let statement = Statement::new(collection);
    let template = match op.kind {
        OpKind::Insert | OpKind::Update => statement.build_upsert(),
        OpKind::Delete => statement.build_delete(),
        OpKind::Command => unreachable!("filtered above"),
    };
    let (sql, params) = statement.bind(&template, &values);

    let action = match op.kind {
        OpKind::Insert | OpKind::Update => "upsert",
        OpKind::Delete => "delete",
        OpKind::Command => "skip",
    };

    match execute(pool, &sql, &params).await {
        Ok(()) => {
            match op.kind {
                OpKind::Delete => counters.record_delete(),
                _ => counters.record_upsert(),
            }
            tracing::debug!(
                ts = op.timestamp.pack(),
                ms_lag = lag_ms,
                action,
                id = %sanitize_id_display(op),
                collection = %collection.pg_table,
                "applied"
            );
            if let Some(checkpoint) = checkpoint {
                checkpoint.record(Checkpoint::from_timestamp(op.timestamp, chrono::Utc::now()));
            }
        }
        Err(err) => {
            counters.record_error();
            tracing::error!(
                ts = op.timestamp.pack(),
                ms_lag = lag_ms,
                action,
                id = %sanitize_id_display(op),
                collection = %collection.pg_table,
                error = %err,
                "failed to apply operation"
            );
        }
    }
}

fn sanitize_id_display(op: &OperationRecord) -> String {
    op.id.to_string()
}

async fn execute(pool: &Pool, sql: &str, params: &[sanitize::PgValue]) -> Result<()> {
    let client = pool.get().await.map_err(MoresqlError::PostgresPool)?;
    let refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> =
        params.iter().map(|p| p as &(dyn tokio_postgres::types::ToSql + Sync)).collect();
    client.execute(sql, &refs).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{load_str, Config};
    use crate::oplog::OpTimestamp;
    use mongodb::bson::{doc, Bson};

    fn widgets() -> Config {
        load_str(
            r#"{"db": {"collections": {"widgets": {
                "mongo_collection": "widgets",
                "pg_table": "widgets",
                "fields": {"_id": "id", "name": "text"}
            }}}}"#,
        )
        .unwrap()
    }

    #[test]
    fn delete_disabled_skips_without_panicking() {
        let config = widgets();
        let coll = crate::config::lookup(&config, "db", "widgets").unwrap();
        let op = OperationRecord {
            database: "db".into(),
            collection: "widgets".into(),
            kind: OpKind::Delete,
            id: Bson::String("1".into()),
            timestamp: OpTimestamp::new(1, 1),
            data: doc! {},
        };
        // Exercises the statement-selection branch only; no live pool in
        // unit tests, so we assert the template chosen rather than execute it.
        let statement = Statement::new(coll);
        assert!(statement.build_delete().contains("DELETE FROM"));
        let _ = op;
    }

    #[test]
    fn insert_and_update_both_choose_upsert_template() {
        let config = widgets();
        let coll = crate::config::lookup(&config, "db", "widgets").unwrap();
        let statement = Statement::new(coll);
        assert!(statement.build_upsert().contains("ON CONFLICT"));
    }
}
