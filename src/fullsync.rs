//! Full-sync pipeline (§4.7): a one-shot bulk scan of every configured
//! collection, synthesized as insert operations and applied through a shared
//! worker pool. Run to seed a destination before tailing begins, or any time
//! a full re-copy is wanted.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use deadpool_postgres::Pool;
use futures::stream::TryStreamExt;
use mongodb::bson::Document;
use tokio::sync::mpsc;

use crate::applier::ApplyCounters;
use crate::config::{fan_key, Config};
use crate::error::Result;
use crate::oplog::{OpKind, OperationRecord, OpTimestamp};
use crate::sanitize;
use crate::statement::Statement;

/// Size of the shared worker pool that applies full-sync rows, matching the
/// original's use of `workerCountOverflow` for the full-sync write side.
pub const FULL_SYNC_WORKER_COUNT: usize = crate::dispatcher::WORKER_COUNT_OVERFLOW;

/// Tracks, per `(database, collection)`, whether its destination table is
/// known to exist. Starts with every configured pair assumed present; a
/// worker marks a pair absent the first time it sees Postgres report the
/// table missing, after which further rows for that pair are skipped rather
/// than repeatedly failing (§4.7).
pub struct TableExistence {
    present: DashMap<String, bool>,
}

impl TableExistence {
    pub fn from_config(config: &Config) -> Self {
        let present = DashMap::new();
        for (db_name, db) in config {
            for coll_name in db.collections.keys() {
                present.insert(fan_key(db_name, coll_name), true);
            }
        }
        Self { present }
    }

    pub fn is_present(&self, key: &str) -> bool {
        self.present.get(key).map(|v| *v).unwrap_or(true)
    }

    pub fn mark_missing(&self, key: &str) {
        self.present.insert(key.to_string(), false);
    }
}

/// Does this Postgres error text match "relation does not exist" for the
/// given table? Mirrors the original's literal string comparison against
/// `pq: relation "%s" does not exist`.
fn is_missing_relation_error(err: &tokio_postgres::Error, table: &str) -> bool {
    let expected = format!("relation \"{}\" does not exist", table);
    err.to_string().contains(&expected)
}

/// Read every document out of every configured collection with no filter,
/// synthesizing an [`OperationRecord`] with `kind = Insert` for each one, and
/// send it to `out`. Matches the original's unconditional `coll.Find(nil)`
/// scan with no batching or resumability: a full sync is meant to be rerun
/// from scratch, not resumed.
pub async fn read_all(client: &mongodb::Client, config: &Config, out: mpsc::Sender<OperationRecord>) -> Result<()> {
    for (db_name, db) in config {
        let mongo_db = client.database(db_name);
        for coll_name in db.collections.keys() {
            let collection = mongo_db.collection::<Document>(coll_name);
            let mut cursor = collection.find(None, None).await?;
            while let Some(doc) = cursor.try_next().await? {
                let id = doc.get("_id").cloned().unwrap_or(mongodb::bson::Bson::Null);
                let op = OperationRecord {
                    database: db_name.clone(),
                    collection: coll_name.clone(),
                    kind: OpKind::Insert,
                    id,
                    timestamp: OpTimestamp::new(chrono::Utc::now().timestamp().max(0) as u32, 1),
                    data: doc,
                };
                if out.send(op).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

/// One full-sync writer: pulls ops off the shared channel until it's empty
/// and closed, applying upserts while skipping any `(database, collection)`
/// pair already known to be missing its table, and marking a pair missing
/// the moment Postgres reports as much. Several of these run concurrently
/// against the same `shared` receiver, mirroring the original's
/// `workerCountOverflow` writer goroutines draining one shared channel.
async fn run_writer(
    shared: Arc<tokio::sync::Mutex<mpsc::Receiver<OperationRecord>>>,
    config: Arc<Config>,
    pool: Pool,
    tables: Arc<TableExistence>,
    counters: Arc<ApplyCounters>,
) {
    loop {
        let op = {
            let mut guard = shared.lock().await;
            guard.recv().await
        };
        let Some(op) = op else { break };

        let key = fan_key(&op.database, &op.collection);
        if !tables.is_present(&key) {
            continue;
        }
        let Some(collection) = crate::config::lookup(&config, &op.database, &op.collection) else {
            continue;
        };

        let values = sanitize::sanitize(collection, &op);
        let statement = Statement::new(collection);
        let (sql, params) = statement.bind(&statement.build_upsert(), &values);

        tracing::info!(collection = %op.collection, id = %op.id, "syncing record");

        match execute(&pool, &sql, &params).await {
            Ok(()) => {
                counters.record_upsert();
            }
            Err(crate::error::MoresqlError::Postgres(ref pg_err)) if is_missing_relation_error(pg_err, &collection.pg_table) => {
                tracing::error!(table = %collection.pg_table, "relation does not exist, skipping remaining rows for this collection");
                tables.mark_missing(&key);
            }
            Err(err) => {
                counters.record_error();
                tracing::error!(error = %err, "full sync write failed");
            }
        }
    }
}

async fn execute(pool: &Pool, sql: &str, params: &[sanitize::PgValue]) -> Result<()> {
    let client = pool.get().await.map_err(crate::error::MoresqlError::PostgresPool)?;
    let refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> =
        params.iter().map(|p| p as &(dyn tokio_postgres::types::ToSql + Sync)).collect();
    client.execute(sql, &refs).await?;
    Ok(())
}

/// Run a full sync to completion: spawn the writer pool, stream every
/// configured collection through it, then wait for the channel to drain.
pub async fn run(mongo: mongodb::Client, config: Config, pool: Pool) -> Result<()> {
    let config = Arc::new(config);
    let tables = Arc::new(TableExistence::from_config(&config));
    let counters = Arc::new(ApplyCounters::default());
    let (tx, rx) = mpsc::channel::<OperationRecord>(FULL_SYNC_WORKER_COUNT);

    let mut handles = Vec::with_capacity(FULL_SYNC_WORKER_COUNT);
    let shared_rx = Arc::new(tokio::sync::Mutex::new(rx));
    for _ in 0..FULL_SYNC_WORKER_COUNT {
        handles.push(tokio::spawn(run_writer(
            shared_rx.clone(),
            config.clone(),
            pool.clone(),
            tables.clone(),
            counters.clone(),
        )));
    }

    read_all(&mongo, &config, tx).await?;

    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

/// The distinct `(database, collection)` fan keys a config defines, used to
/// size progress reporting and to validate full-sync coverage.
pub fn fan_keys(config: &Config) -> HashSet<String> {
    let mut keys = HashSet::new();
    for (db_name, db) in config {
        for coll_name in db.collections.keys() {
            keys.insert(fan_key(db_name, coll_name));
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_str;

    fn sample_config() -> Config {
        load_str(
            r#"{"db": {"collections": {"widgets": {
                "mongo_collection": "widgets",
                "pg_table": "widgets",
                "fields": {"_id": "id"}
            }}}}"#,
        )
        .unwrap()
    }

    #[test]
    fn table_existence_starts_all_present() {
        let config = sample_config();
        let tables = TableExistence::from_config(&config);
        assert!(tables.is_present(&fan_key("db", "widgets")));
    }

    #[test]
    fn marking_missing_persists() {
        let config = sample_config();
        let tables = TableExistence::from_config(&config);
        let key = fan_key("db", "widgets");
        tables.mark_missing(&key);
        assert!(!tables.is_present(&key));
    }

    #[test]
    fn unknown_pair_defaults_present() {
        let config = sample_config();
        let tables = TableExistence::from_config(&config);
        assert!(tables.is_present("unconfigured.pair"));
    }

    #[test]
    fn fan_keys_cover_every_collection() {
        let config = sample_config();
        assert_eq!(fan_keys(&config), HashSet::from([fan_key("db", "widgets")]));
    }
}
