//! CLI flag parsing (§1: out of scope as an algorithm, specified in §6 as
//! the set of flags implementers must support). A `clap::Parser` derive,
//! matching the pack's CLI conventions.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Mirrors MongoDB collections into PostgreSQL via full sync and oplog tailing.
#[derive(Debug, Parser)]
#[command(name = "moresql", version, about)]
pub struct Cli {
    /// Path to the JSON configuration file (§3).
    #[arg(long = "config-file", default_value = "moresql.json")]
    pub config_file: PathBuf,

    /// Run a one-shot full sync of every configured collection (§4.7).
    #[arg(long = "full-sync")]
    pub full_sync: bool,

    /// Tail the oplog indefinitely (§4.4-§4.6).
    #[arg(long = "tail")]
    pub tail: bool,

    /// Apply deletes observed on the oplog; when false, deletes are skipped (§4.6).
    ///
    /// A bare `bool` field defaults to `ArgAction::SetTrue` under clap's
    /// derive, which can only ever turn the flag on — there would be no way
    /// to pass `--allow-deletes=false`, matching the original's
    /// `flag.BoolVar(&e.allowDeletes, "allow-deletes", true, ...)` only by
    /// accident. `ArgAction::Set` makes it a value-taking flag instead, so
    /// `--allow-deletes=false` parses as expected.
    #[arg(long = "allow-deletes", action = clap::ArgAction::Set, default_value_t = true)]
    pub allow_deletes: bool,

    /// Persist and resume from a checkpoint of the last processed oplog timestamp (§4.8).
    #[arg(long = "checkpoint")]
    pub checkpoint: bool,

    /// Application name the checkpoint row is keyed by (§3).
    #[arg(long = "app-name", default_value = "moresql")]
    pub app_name: String,

    /// Start tailing this far before now, e.g. `10m`, `2h` (§4.4).
    #[arg(long = "replay-duration", value_parser = humantime::parse_duration)]
    pub replay_duration: Option<Duration>,

    /// Start tailing from this epoch-seconds timestamp (§4.4).
    #[arg(long = "replay-second")]
    pub replay_second: Option<i64>,

    /// Path to a CA certificate for Mongo TLS (§6).
    #[arg(long = "ssl-cert")]
    pub ssl_cert: Option<PathBuf>,

    /// Skip TLS certificate verification when connecting to Mongo (§6; testing only).
    #[arg(long = "ssl-insecure-skip-verify")]
    pub ssl_insecure_skip_verify: bool,

    /// Print the `moresql_metadata` bootstrap DDL and exit (§4.8, §6).
    #[arg(long = "create-table-sql")]
    pub create_table_sql: bool,

    /// Introspect Postgres against the configured collections and exit (§1, §6).
    #[arg(long = "validate")]
    pub validate: bool,

    /// Expose runtime counters on `:1234` (§6, §B.7).
    #[arg(long = "enable-monitor")]
    pub enable_monitor: bool,

    /// Error-reporting sink, e.g. `rollbar` (§1: wiring out of scope; accepted and logged).
    #[arg(long = "error-reporting")]
    pub error_reporting: Option<String>,

    /// Periodically log allocator stats to this file (§C: simplified from the
    /// original's heap-profile sampling; no binary pprof-format output).
    #[arg(long = "memprofile")]
    pub memprofile: Option<PathBuf>,

    /// Mongo connection string. Falls back to `MONGO_URL`.
    #[arg(long = "mongo-url", env = "MONGO_URL")]
    pub mongo_url: Option<String>,

    /// Postgres connection string. Falls back to `POSTGRES_URL`.
    #[arg(long = "postgres-url", env = "POSTGRES_URL")]
    pub postgres_url: Option<String>,
}

impl Cli {
    /// §6: exit non-zero if neither `--full-sync` nor `--tail` is given and
    /// `--validate` is absent (and neither is `--create-table-sql`, which
    /// prints and exits before any mode is needed).
    pub fn mode_is_selected(&self) -> bool {
        self.full_sync || self.tail || self.validate || self.create_table_sql
    }
}
