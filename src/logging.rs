//! Log-formatter setup (§1: out of scope as an algorithm, but a concrete
//! wiring is still needed for a runnable binary).
//!
//! The original switches between a JSON and a text `logrus` formatter based
//! on whether `DYNO` is set (Heroku-style PaaS environments export it), with
//! `LOG_LEVEL` controlling verbosity. `tracing` + `tracing-subscriber` is the
//! idiomatic equivalent this pack reaches for repeatedly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Initialize the global `tracing` subscriber: JSON formatting when `DYNO`
/// is set in the environment, pretty/compact formatting otherwise, filtered
/// by `LOG_LEVEL` (default `info`). `error_reporting_sink` names the
/// `--error-reporting` sink (e.g. `rollbar`), if any, and installs
/// [`ErrorReportingLayer`] as a seam for it.
pub fn init(error_reporting_sink: Option<&str>) {
    let filter = EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"));
    let on_dyno = std::env::var("DYNO").is_ok();
    let error_layer = error_reporting_sink.map(ErrorReportingLayer::new);

    let registry = tracing_subscriber::registry().with(filter).with(error_layer);
    if on_dyno {
        registry.with(fmt::layer().json().with_current_span(false)).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// A no-op error-reporting seam (§C): the original wires a Rollbar hook
/// (`rollrus`) into `logrus`; no such crate appears in the retrieved pack, so
/// this counts `ERROR`-level events instead of forwarding them anywhere. A
/// real sink can later replace the counter increment with a network call
/// without touching `init`'s layering.
#[derive(Clone)]
pub struct ErrorReportingLayer {
    sink_name: String,
    reported: Arc<AtomicU64>,
}

impl ErrorReportingLayer {
    pub fn new(sink_name: impl Into<String>) -> Self {
        Self { sink_name: sink_name.into(), reported: Arc::new(AtomicU64::new(0)) }
    }

    pub fn sink_name(&self) -> &str {
        &self.sink_name
    }

    pub fn reported_count(&self) -> u64 {
        self.reported.load(Ordering::Relaxed)
    }
}

impl<S: tracing::Subscriber> Layer<S> for ErrorReportingLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == Level::ERROR {
            self.reported.fetch_add(1, Ordering::Relaxed);
        }
    }
}
