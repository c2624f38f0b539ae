//! Supervision (§4.9): wires the oplog source, dispatcher, applier workers,
//! and checkpoint manager into a running tail pipeline, and restarts that
//! pipeline if it dies from a fatal error — the same role `suture.Supervisor`
//! plays around the original's `Tailer`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use deadpool_postgres::Pool;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};

use crate::applier::{self, ApplyCounters};
use crate::checkpoint::CheckpointManager;
use crate::config::Config;
use crate::dispatcher::{self, Dispatcher};
use crate::error::Result;
use crate::oplog::{start_timestamp, OplogError, OplogSource};

/// Lifecycle states a supervised tail run moves through. Mirrors the
/// `suture` state names the original process embeds its `Tailer` service in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Backoff applied between restart attempts after a fatal error, so a
/// persistently broken connection doesn't spin the CPU.
const RESTART_BACKOFF: Duration = Duration::from_secs(2);

/// Options controlling one supervised tail run, gathered from the CLI/env
/// layer (§4.9, §6).
pub struct TailOptions {
    pub app_name: String,
    pub allow_deletes: bool,
    pub checkpoint_enabled: bool,
    pub replay_epoch: Option<i64>,
    pub replay_duration: Duration,
}

/// Owns the current lifecycle state and coordinates shutdown across every
/// spawned task.
pub struct Supervisor {
    state: Arc<std::sync::RwLock<State>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    counters: Arc<ApplyCounters>,
}

impl Supervisor {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            state: Arc::new(std::sync::RwLock::new(State::Starting)),
            shutdown_tx,
            shutdown_rx,
            counters: Arc::new(ApplyCounters::default()),
        }
    }

    pub fn state(&self) -> State {
        *self.state.read().expect("state lock poisoned")
    }

    /// The counters this run's applier workers update, shared so a metrics
    /// endpoint (`--enable-monitor`) can read live figures instead of a
    /// disconnected, always-zero snapshot.
    pub fn counters(&self) -> Arc<ApplyCounters> {
        self.counters.clone()
    }

    fn set_state(&self, state: State) {
        *self.state.write().expect("state lock poisoned") = state;
    }

    /// Request a clean shutdown; in-flight ops finish, then every spawned
    /// task exits.
    pub fn stop(&self) {
        self.set_state(State::Stopping);
        let _ = self.shutdown_tx.send(true);
    }

    fn is_shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Run the tail pipeline under supervision: build the dispatcher and
    /// worker pools once, then repeatedly (re)open the oplog source,
    /// restarting from the last durable checkpoint whenever a fatal error
    /// ends a run, until [`Supervisor::stop`] is called.
    pub async fn run_tail(
        &self,
        source: Arc<dyn OplogSource>,
        config: Config,
        pool: Pool,
        options: TailOptions,
    ) -> Result<()> {
        self.set_state(State::Starting);
        let config = Arc::new(config);
        let mut dispatcher = Dispatcher::new(&config);
        let counters = self.counters.clone();
        let checkpoint = Arc::new(CheckpointManager::new(options.app_name.clone()));

        // A missing `moresql_metadata` table or any other load failure must
        // abort the run rather than be treated as "no checkpoint yet" — see
        // `CheckpointManager::load`'s doc comment and §4.8/§7.
        let starting_epoch = if options.checkpoint_enabled {
            checkpoint.load(&pool).await?
        } else {
            None
        };

        let checkpoint_for_workers = options.checkpoint_enabled.then(|| checkpoint.clone());
        spawn_collection_workers(&mut dispatcher, &config, &pool, &counters, options.allow_deletes, checkpoint_for_workers.clone());
        spawn_overflow_workers(&mut dispatcher, &config, &pool, &counters, options.allow_deletes, checkpoint_for_workers);

        if options.checkpoint_enabled {
            let checkpoint = checkpoint.clone();
            let pool = pool.clone();
            let shutdown_rx = self.shutdown_rx.clone();
            tokio::spawn(async move {
                checkpoint.run(pool, shutdown_rx).await;
            });
        }

        // §5: "1 reporter timer, 1 checkpoint timer" — the reporter runs
        // unconditionally, independent of whether checkpointing is enabled.
        {
            let counters = counters.clone();
            let shutdown_rx = self.shutdown_rx.clone();
            tokio::spawn(async move {
                crate::metrics::run_reporter(counters, shutdown_rx).await;
            });
        }

        self.set_state(State::Running);

        let mut next_epoch = starting_epoch.map(|e| e as i64).or(options.replay_epoch);

        while !self.is_shutdown_requested() {
            let start = start_timestamp(next_epoch, options.replay_duration, chrono::Utc::now());
            tracing::info!(epoch = start.seconds, "starting tailing from epoch");

            match self.run_once(&source, &dispatcher, &config, start).await {
                Ok(()) => break,
                Err(err) => {
                    tracing::error!(error = %err, "tail run ended, restarting");
                    next_epoch = None;
                    tokio::time::sleep(RESTART_BACKOFF).await;
                }
            }
        }

        self.set_state(State::Stopped);
        Ok(())
    }

    /// One (re)start attempt: open the oplog source from `start`, dispatch
    /// every op it yields, and return once the op stream ends (clean) or a
    /// fatal error arrives (the caller restarts). I/O timeouts are logged
    /// and absorbed here without ending the run.
    async fn run_once(
        &self,
        source: &Arc<dyn OplogSource>,
        dispatcher: &Dispatcher,
        config: &Arc<Config>,
        start: crate::oplog::OpTimestamp,
    ) -> Result<()> {
        let (mut ops, mut errors) = source.open(start).await?;
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                maybe_op = ops.next() => {
                    match maybe_op {
                        Some(op) => {
                            dispatcher.dispatch(config, op).await;
                        }
                        None => return Ok(()),
                    }
                }
                maybe_err = errors.next() => {
                    match maybe_err {
                        Some(OplogError::IoTimeout(message)) => {
                            tracing::error!(error = %message, "problem connecting to mongo, continuing");
                        }
                        Some(OplogError::Fatal(message)) => {
                            return Err(crate::error::MoresqlError::MissingConfiguration(message));
                        }
                        None => return Ok(()),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the consistent-hash broker and dedicated workers for every
/// configured collection, wiring each dedicated worker's inbound channel to
/// spill into the shared overflow pool once its queue depth exceeds
/// `WORKER_COUNT` (§4.5).
fn spawn_collection_workers(
    dispatcher: &mut Dispatcher,
    config: &Arc<Config>,
    pool: &Pool,
    counters: &Arc<ApplyCounters>,
    allow_deletes: bool,
    checkpoint: Option<Arc<CheckpointManager>>,
) {
    let overflow_tx = dispatcher.overflow_sender();
    for key in dispatcher.fan_keys() {
        let Some((inbound_rx, ring, worker_senders, worker_receivers)) = dispatcher.take_route(&key) else {
            continue;
        };

        tokio::spawn(dispatcher::run_broker(inbound_rx, ring, worker_senders.clone()));

        for (_id, receiver) in worker_receivers {
            let config = config.clone();
            let pool = pool.clone();
            let counters = counters.clone();
            let overflow_tx = overflow_tx.clone();
            let checkpoint = checkpoint.clone();
            tokio::spawn(run_dedicated_worker(receiver, overflow_tx, config, pool, counters, allow_deletes, checkpoint));
        }
    }
}

fn spawn_overflow_workers(
    dispatcher: &mut Dispatcher,
    config: &Arc<Config>,
    pool: &Pool,
    counters: &Arc<ApplyCounters>,
    allow_deletes: bool,
    checkpoint: Option<Arc<CheckpointManager>>,
) {
    let Some(receiver) = dispatcher.take_overflow_receiver() else {
        return;
    };
    // A single shared overflow pool, `WORKER_COUNT_OVERFLOW` consumers wide,
    // draining the one channel concurrently.
    let shared = Arc::new(tokio::sync::Mutex::new(receiver));
    for _ in 0..dispatcher::WORKER_COUNT_OVERFLOW {
        let shared = shared.clone();
        let config = config.clone();
        let pool = pool.clone();
        let counters = counters.clone();
        let checkpoint = checkpoint.clone();
        tokio::spawn(async move {
            loop {
                let op = {
                    let mut guard = shared.lock().await;
                    guard.recv().await
                };
                match op {
                    Some(op) => {
                        if let Some(collection) = crate::config::lookup(&config, &op.database, &op.collection) {
                            applier::apply_one(&pool, collection, &op, &counters, allow_deletes, checkpoint.as_deref()).await;
                        }
                    }
                    None => break,
                }
            }
        });
    }
}

/// A dedicated worker: applies ops from its own channel, siphoning any that
/// arrive while the channel is already backed up past `WORKER_COUNT` off to
/// the shared overflow pool instead (§4.5's spill rule).
async fn run_dedicated_worker(
    mut inbound: mpsc::Receiver<crate::oplog::OperationRecord>,
    overflow_tx: mpsc::Sender<crate::oplog::OperationRecord>,
    config: Arc<Config>,
    pool: Pool,
    counters: Arc<ApplyCounters>,
    allow_deletes: bool,
    checkpoint: Option<Arc<CheckpointManager>>,
) {
    let spilled = AtomicUsize::new(0);
    while let Some(op) = inbound.recv().await {
        if dispatcher::should_spill(inbound.len()) {
            spilled.fetch_add(1, Ordering::Relaxed);
            if overflow_tx.send(op).await.is_err() {
                tracing::warn!("overflow channel closed while spilling");
            }
            continue;
        }
        if let Some(collection) = crate::config::lookup(&config, &op.database, &op.collection) {
            applier::apply_one(&pool, collection, &op, &counters, allow_deletes, checkpoint.as_deref()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_in_starting_state() {
        let supervisor = Supervisor::new();
        assert_eq!(supervisor.state(), State::Starting);
    }

    #[test]
    fn stop_transitions_to_stopping_and_signals_shutdown() {
        let supervisor = Supervisor::new();
        supervisor.stop();
        assert_eq!(supervisor.state(), State::Stopping);
        assert!(supervisor.is_shutdown_requested());
    }
}
