//! Rate counters, the reporter timer, and the `--enable-monitor` runtime
//! metrics surface.
//!
//! §9's design note re-expresses the original's concurrent "rate counter"
//! (a sliding-window increment-per-interval map in the Go codebase, via
//! `github.com/paulbellamy/ratecounter`) as "a sliding-window counter (count
//! increments in the last T)". §4.6/§4.7 increment it on every apply
//! outcome; §5 calls for "1 reporter timer" alongside the checkpoint timer,
//! matching the original's `Report()`/`ReportCounters()` loop on
//! `reportFrequency`, which logs per-minute rates. This module holds the
//! sliding window, the reporter loop that logs it, and the thin HTTP surface
//! that reports the *cumulative* totals — the one piece of §1's "metrics
//! export surface" that remains in scope as ambient plumbing once trimmed to
//! a minimal form (§1 marks the *exporter* itself out of scope; the counters
//! underneath are core).

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A count of events in a trailing window of `window` duration, matching the
/// original's per-second/per-minute rate counters used for the `--enable-monitor`
/// surface.
#[derive(Debug)]
pub struct RateCounter {
    window: Duration,
    events: Mutex<VecDeque<Instant>>,
}

impl RateCounter {
    pub fn new(window: Duration) -> Self {
        Self { window, events: Mutex::new(VecDeque::new()) }
    }

    /// Record one event at `now`.
    pub fn increment(&self) {
        let mut events = self.events.lock().expect("rate counter lock poisoned");
        events.push_back(Instant::now());
        self.evict(&mut events);
    }

    /// Count of events still inside the trailing window.
    pub fn rate(&self) -> usize {
        let mut events = self.events.lock().expect("rate counter lock poisoned");
        self.evict(&mut events);
        events.len()
    }

    fn evict(&self, events: &mut VecDeque<Instant>) {
        let cutoff = Instant::now().checked_sub(self.window).unwrap_or_else(Instant::now);
        while matches!(events.front(), Some(ts) if *ts < cutoff) {
            events.pop_front();
        }
    }
}

/// The window each [`RateCounter`] reports over, and the interval the
/// reporter timer ticks at — both one minute, matching the original's
/// per-minute rate report (`reportFrequency`).
pub const REPORT_WINDOW: Duration = Duration::from_secs(60);

/// One sliding-window [`RateCounter`] per apply outcome (§4.6/§4.7), separate
/// from [`crate::applier::ApplyCounters`]'s monotonic totals: these report
/// recent throughput, not a cumulative count.
#[derive(Debug)]
pub struct RateCounters {
    pub upserted: RateCounter,
    pub deleted: RateCounter,
    pub skipped: RateCounter,
    pub errored: RateCounter,
}

impl Default for RateCounters {
    fn default() -> Self {
        Self {
            upserted: RateCounter::new(REPORT_WINDOW),
            deleted: RateCounter::new(REPORT_WINDOW),
            skipped: RateCounter::new(REPORT_WINDOW),
            errored: RateCounter::new(REPORT_WINDOW),
        }
    }
}

impl RateCounters {
    pub fn snapshot(&self) -> RateSnapshot {
        RateSnapshot {
            upserted: self.upserted.rate() as u64,
            deleted: self.deleted.rate() as u64,
            skipped: self.skipped.rate() as u64,
            errored: self.errored.rate() as u64,
        }
    }
}

/// A snapshot of the last [`REPORT_WINDOW`]'s apply rate, one field per
/// outcome.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RateSnapshot {
    pub upserted: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub errored: u64,
}

/// A JSON-serializable snapshot of the applier's cumulative counters (§4.6),
/// used for the `--enable-monitor` HTTP surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CountersSnapshot {
    pub upserted: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub errored: u64,
}

impl CountersSnapshot {
    pub fn from_applier(counters: &crate::applier::ApplyCounters) -> Self {
        use std::sync::atomic::Ordering;
        Self {
            upserted: counters.upserted.load(Ordering::Relaxed),
            deleted: counters.deleted.load(Ordering::Relaxed),
            skipped: counters.skipped.load(Ordering::Relaxed),
            errored: counters.errored.load(Ordering::Relaxed),
        }
    }
}

/// The reporter timer (§5: "1 reporter timer"): every [`REPORT_WINDOW`], logs
/// the last-minute apply rate at info level. Mirrors the original's
/// `time.Tick(reportFrequency)` loop inside `Report()`/`ReportCounters()`.
pub async fn run_reporter(counters: std::sync::Arc<crate::applier::ApplyCounters>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(REPORT_WINDOW);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let rates = counters.rates.snapshot();
                tracing::info!(
                    upserted_per_min = rates.upserted,
                    deleted_per_min = rates.deleted,
                    skipped_per_min = rates.skipped,
                    errored_per_min = rates.errored,
                    "apply rate"
                );
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Serve `counters` as a JSON text response on `port` until the process
/// exits. Built directly on `tokio::net::TcpListener` with no web framework:
/// the original's `expvar` is itself a bare stdlib debug surface, and §1
/// marks the metrics export surface explicitly out of scope, so this is
/// deliberately minimal rather than a Prometheus-style exporter.
pub async fn serve(port: u16, counters: std::sync::Arc<crate::applier::ApplyCounters>) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "monitor endpoint listening");

    loop {
        let (mut socket, _) = listener.accept().await?;
        let counters = counters.clone();
        tokio::spawn(async move {
            let snapshot = CountersSnapshot::from_applier(&counters);
            let body = serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string());
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_counter_counts_recent_events() {
        let counter = RateCounter::new(Duration::from_secs(60));
        counter.increment();
        counter.increment();
        assert_eq!(counter.rate(), 2);
    }

    #[test]
    fn rate_counter_evicts_events_older_than_window() {
        let counter = RateCounter::new(Duration::from_millis(1));
        counter.increment();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(counter.rate(), 0);
    }

    #[test]
    fn snapshot_reads_applier_counters() {
        let counters = crate::applier::ApplyCounters::default();
        counters.upserted.fetch_add(3, std::sync::atomic::Ordering::Relaxed);
        let snapshot = CountersSnapshot::from_applier(&counters);
        assert_eq!(snapshot.upserted, 3);
    }

    #[test]
    fn rate_counters_reflect_recorded_events() {
        let counters = crate::applier::ApplyCounters::default();
        counters.record_upsert();
        counters.record_upsert();
        counters.record_delete();
        let rates = counters.rates.snapshot();
        assert_eq!(rates.upserted, 2);
        assert_eq!(rates.deleted, 1);
        assert_eq!(rates.skipped, 0);
    }
}
