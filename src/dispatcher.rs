//! Fan-out dispatcher (§4.5): routes each oplog operation to a per-collection
//! bounded channel, then within each collection to one of `workerCount`
//! dedicated workers via consistent hashing on `_id`, spilling to a shared
//! overflow pool under pressure.

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::{self, Config};
use crate::oplog::OperationRecord;
use crate::sanitize;

/// Dedicated workers per collection (§5).
pub const WORKER_COUNT: usize = 5;
/// Size of the shared overflow pool (§5).
pub const WORKER_COUNT_OVERFLOW: usize = 500;
/// Capacity of each per-collection inbound channel (§4.5).
pub const INBOUND_CAPACITY: usize = 1000;

/// A consistent-hash ring over a fixed set of worker identifiers.
///
/// Virtual nodes are placed on a 64-bit ring; a key is routed to the first
/// node clockwise from its hash. This gives §8 property 8 (routing
/// stability) for free: the mapping only depends on the fixed worker set and
/// the key, never on arrival order or time.
#[derive(Debug, Clone)]
pub struct HashRing {
    /// virtual-node hash -> worker id
    ring: BTreeMap<u64, String>,
}

const VIRTUAL_NODES_PER_WORKER: usize = 32;

fn hash_str(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

impl HashRing {
    /// Build a ring over the given worker identifiers.
    pub fn new(worker_ids: impl IntoIterator<Item = String>) -> Self {
        let mut ring = BTreeMap::new();
        for id in worker_ids {
            for replica in 0..VIRTUAL_NODES_PER_WORKER {
                let point = hash_str(&format!("{}-{}", id, replica));
                ring.insert(point, id.clone());
            }
        }
        Self { ring }
    }

    /// Route `key` to a worker id, or `None` if the ring is empty.
    pub fn get_node(&self, key: &str) -> Option<&str> {
        if self.ring.is_empty() {
            return None;
        }
        let point = hash_str(key);
        self.ring
            .range(point..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, id)| id.as_str())
    }
}

/// Render a Mongo `_id` the same way the routing key is computed:
/// `format!("{}", op.id)`, i.e. its display/debug textual form, matching the
/// original's `fmt.Sprintf("%s", op.Id)`.
pub fn route_key(op: &OperationRecord) -> String {
    match &op.id {
        mongodb::bson::Bson::String(s) => s.clone(),
        mongodb::bson::Bson::ObjectId(oid) => oid.to_hex(),
        other => other.to_string(),
    }
}

/// One inbound, per-collection queue plus its dedicated worker pool.
struct CollectionRoute {
    inbound_tx: mpsc::Sender<OperationRecord>,
    inbound_rx: Option<mpsc::Receiver<OperationRecord>>,
    worker_senders: BTreeMap<String, mpsc::Sender<OperationRecord>>,
    worker_receivers: Vec<(String, mpsc::Receiver<OperationRecord>)>,
    ring: HashRing,
}

/// Rate counters published by the dispatcher as it routes (or drops) ops.
#[derive(Debug, Default)]
pub struct DispatchCounters {
    pub skipped: std::sync::atomic::AtomicU64,
}

/// The fan-out dispatcher: one inbound channel + hash-ring broker + worker
/// pool per configured collection, plus one shared overflow pool.
pub struct Dispatcher {
    routes: BTreeMap<String, CollectionRoute>,
    overflow_tx: mpsc::Sender<OperationRecord>,
    overflow_rx: Option<mpsc::Receiver<OperationRecord>>,
    counters: Arc<DispatchCounters>,
}

impl Dispatcher {
    /// Build the dispatcher's channel topology from the configured
    /// collections (§4.5's `NewFan`): one entry per `(database, collection)`.
    pub fn new(config: &Config) -> Self {
        let mut routes = BTreeMap::new();
        for (db_name, db) in config {
            for (coll_name, _spec) in &db.collections {
                let key = config::fan_key(db_name, coll_name);
                let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

                let mut worker_senders = BTreeMap::new();
                let mut worker_receivers = Vec::with_capacity(WORKER_COUNT);
                for i in 0..WORKER_COUNT {
                    let id = i.to_string();
                    // Dedicated workers are unbuffered in the original
                    // (direct handoff); a capacity-1 channel is the closest
                    // Tokio equivalent that still applies backpressure.
                    let (tx, rx) = mpsc::channel(1);
                    worker_senders.insert(id.clone(), tx);
                    worker_receivers.push((id, rx));
                }
                let ring = HashRing::new(worker_senders.keys().cloned());

                routes.insert(
                    key,
                    CollectionRoute {
                        inbound_tx,
                        inbound_rx: Some(inbound_rx),
                        worker_senders,
                        worker_receivers,
                        ring,
                    },
                );
            }
        }

        let (overflow_tx, overflow_rx) = mpsc::channel(WORKER_COUNT_OVERFLOW);

        Self {
            routes,
            overflow_tx,
            overflow_rx: Some(overflow_rx),
            counters: Arc::new(DispatchCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<DispatchCounters> {
        self.counters.clone()
    }

    /// Dispatching step for one incoming op (§4.5 steps 1-4): resolve the fan
    /// key, drop if unconfigured, fill missing fields, then hand off to the
    /// per-collection channel. Applies backpressure by blocking on a full
    /// channel — the intended mechanism for slowing the oplog reader.
    pub async fn dispatch(&self, config: &Config, mut op: OperationRecord) {
        let key = config::fan_key(&op.database, &op.collection);
        let Some(route) = self.routes.get(&key) else {
            self.counters.skipped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            tracing::debug!(collection = %key, "missing channel for this collection, dropping");
            return;
        };
        if let Some(spec) = config::lookup(config, &op.database, &op.collection) {
            let keys: Vec<&String> = spec.sorted_keys();
            sanitize::ensure_all_fields(&mut op.data, &keys);
        }
        if route.inbound_tx.send(op).await.is_err() {
            tracing::warn!(collection = %key, "inbound channel closed, dropping op");
        }
    }

    /// Take ownership of the per-collection inbound receiver and its worker
    /// pool, for use by [`crate::supervisor`] when it spawns consistent-hash
    /// brokers and dedicated workers. Returns `None` once already taken.
    pub fn take_route(&mut self, key: &str) -> Option<(mpsc::Receiver<OperationRecord>, HashRing, BTreeMap<String, mpsc::Sender<OperationRecord>>, Vec<(String, mpsc::Receiver<OperationRecord>)>)> {
        let route = self.routes.get_mut(key)?;
        let inbound_rx = route.inbound_rx.take()?;
        let workers = std::mem::take(&mut route.worker_receivers);
        Some((inbound_rx, route.ring.clone(), route.worker_senders.clone(), workers))
    }

    pub fn fan_keys(&self) -> Vec<String> {
        self.routes.keys().cloned().collect()
    }

    pub fn overflow_sender(&self) -> mpsc::Sender<OperationRecord> {
        self.overflow_tx.clone()
    }

    pub fn take_overflow_receiver(&mut self) -> Option<mpsc::Receiver<OperationRecord>> {
        self.overflow_rx.take()
    }
}

/// The consistent-hash broker (§4.5): reads from one collection's inbound
/// channel and forwards each op to the worker its `_id` hashes to.
pub async fn run_broker(mut inbound: mpsc::Receiver<OperationRecord>, ring: HashRing, workers: BTreeMap<String, mpsc::Sender<OperationRecord>>) {
    while let Some(op) = inbound.recv().await {
        let key = route_key(&op);
        match ring.get_node(&key) {
            Some(node) => {
                if let Some(sender) = workers.get(node) {
                    if sender.send(op).await.is_err() {
                        tracing::warn!(worker = %node, "worker channel closed");
                    }
                } else {
                    tracing::error!(node = %node, "hash ring returned unknown worker");
                }
            }
            None => tracing::error!("failed at getting worker node from hashring"),
        }
    }
}

/// A dedicated worker's overflow rule (§4.5): if its inbound channel already
/// holds more than `WORKER_COUNT` ops, peel the next one off and forward it
/// to the overflow pool instead of applying it, to relieve a hot worker.
/// `Tokio`'s bounded channels don't expose a live length the way Go's
/// buffered channels do `len(ch)`, so this is approximated with
/// [`mpsc::Receiver::len`] where available, exposed here as a parameter so
/// callers (the applier loop) can make the same decision per §9's "hot
/// worker spills" design note.
pub fn should_spill(inbound_len: usize) -> bool {
    inbound_len > WORKER_COUNT
}
