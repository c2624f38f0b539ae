//! `moresql` mirrors MongoDB collections into PostgreSQL tables: a one-shot
//! full sync (§4.7) and an indefinite oplog tail (§4.4-§4.6, §4.9), sharing
//! a field schema & statement builder (§4.1), document sanitizer (§4.2-4.3),
//! and checkpoint manager (§4.8).

pub mod applier;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod fullsync;
pub mod logging;
pub mod metrics;
pub mod oplog;
pub mod sanitize;
pub mod statement;
pub mod supervisor;
pub mod validate;

pub use error::{MoresqlError, Result};

/// Common imports for wiring a tail or full-sync run from `main`.
pub mod prelude {
    pub use crate::config::{CollectionSpec, Config};
    pub use crate::error::{MoresqlError, Result};
    pub use crate::oplog::{OperationRecord, OpTimestamp, OplogSource};
    pub use crate::supervisor::{Supervisor, TailOptions};
}
