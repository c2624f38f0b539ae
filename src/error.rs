//! Crate-wide error type.

use thiserror::Error;

/// A `Result` type alias using `MoresqlError` as the error variant.
pub type Result<T> = std::result::Result<T, MoresqlError>;

/// Error variants surfaced anywhere in the replication pipeline.
#[derive(Debug, Error)]
pub enum MoresqlError {
    /// An error from the underlying `mongodb` driver.
    #[error("mongo error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    /// An error from the underlying Postgres driver.
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// An error building or borrowing a Postgres connection from the pool.
    #[error("postgres pool error: {0}")]
    PostgresPool(#[from] deadpool_postgres::PoolError),

    /// Error constructing the deadpool configuration.
    #[error("postgres pool config error: {0}")]
    PostgresPoolConfig(#[from] deadpool_postgres::CreatePoolError),

    /// JSON (de)serialization error, surfaced while loading the config file.
    #[error("config decode error: {0}")]
    ConfigDecode(#[from] serde_json::Error),

    /// Filesystem error while reading the config file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A `CollectionSpec` was declared without an `_id` field mapping.
    #[error("collection '{0}' is missing a required '_id' field mapping")]
    MissingIdField(String),

    /// A field spec could not be decoded as either long-form or shorthand.
    #[error("field '{field}' in collection '{collection}' could not be decoded as either long-form {{mongo,postgres}} or a shorthand type string")]
    FieldDecode { collection: String, field: String },

    /// No epoch second could be determined to start tailing from.
    #[error("unable to calculate tailing start time")]
    StartTimeUndecidable,

    /// The `moresql_metadata` checkpoint table does not exist.
    #[error("the moresql_metadata table does not exist; run with --create-table-sql and execute the printed DDL")]
    MetadataTableMissing,

    /// A configured collection has no channel registered (should be unreachable).
    #[error("no dispatch channel registered for '{0}'")]
    UnknownFanKey(String),

    /// Required environment/CLI configuration was missing.
    #[error("missing required configuration: {0}")]
    MissingConfiguration(String),
}
