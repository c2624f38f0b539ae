//! Configuration data model (§3): which Mongo databases/collections are
//! mirrored, and for each collection, which (possibly dotted) fields map to
//! which typed Postgres columns.
//!
//! Field-map iteration order must be lexicographic by logical key so that
//! generated SQL is byte-identical across processes (§3 invariant, §8
//! property 1). `BTreeMap` gives us that for free.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MoresqlError, Result};

/// The Mongo side of a field mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MongoField {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// The Postgres side of a field mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgresField {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl PostgresField {
    /// This column name, double-quoted for use as a SQL identifier.
    pub fn quoted_name(&self) -> String {
        format!("\"{}\"", self.name)
    }
}

/// A single logical-key -> (mongo, postgres) field mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub mongo: MongoField,
    pub postgres: PostgresField,
}

/// Field map, keyed by logical key (e.g. `"address.home"`). Kept as a
/// `BTreeMap` specifically so iteration is always lexicographic by key.
pub type Fields = BTreeMap<String, FieldSpec>;

/// Mongo's `id` type has no Postgres analogue; it is represented as hex text.
fn mongo_to_postgres_type(mongo_type: &str) -> String {
    match mongo_type.to_lowercase().as_str() {
        "id" => "text".to_string(),
        other => other.to_string(),
    }
}

/// Dotted logical keys become underscore-joined Postgres column names.
fn normalize_dotted_key(key: &str) -> String {
    key.replace('.', "_")
}

/// Decode a single field value, which may be long-form (`{mongo, postgres}`)
/// or shorthand (a bare type string, e.g. `"text"`).
fn decode_field(collection: &str, key: &str, value: &Value) -> Result<FieldSpec> {
    if let Ok(long_form) = serde_json::from_value::<FieldSpec>(value.clone()) {
        return Ok(long_form);
    }
    if let Some(type_str) = value.as_str() {
        return Ok(FieldSpec {
            mongo: MongoField {
                name: key.to_string(),
                kind: type_str.to_string(),
            },
            postgres: PostgresField {
                name: normalize_dotted_key(key),
                kind: mongo_to_postgres_type(type_str),
            },
        });
    }
    Err(MoresqlError::FieldDecode {
        collection: collection.to_string(),
        field: key.to_string(),
    })
}

/// Raw, pre-validation shape of a collection entry in the config file.
#[derive(Debug, Clone, Deserialize)]
struct CollectionSpecRaw {
    mongo_collection: String,
    pg_table: String,
    fields: BTreeMap<String, Value>,
}

/// The per-collection mapping from Mongo documents to Postgres rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSpec {
    /// Source Mongo collection name.
    pub mongo_collection: String,
    /// Destination Postgres table name.
    pub pg_table: String,
    /// Logical-key -> field mapping, sorted lexicographically by construction.
    pub fields: Fields,
}

impl CollectionSpec {
    fn from_raw(name: &str, raw: CollectionSpecRaw) -> Result<Self> {
        let mut fields = Fields::new();
        for (key, value) in raw.fields {
            let spec = decode_field(name, &key, &value)?;
            fields.insert(key, spec);
        }
        if !fields.contains_key("_id") {
            return Err(MoresqlError::MissingIdField(name.to_string()));
        }
        Ok(Self {
            mongo_collection: raw.mongo_collection,
            pg_table: raw.pg_table,
            fields,
        })
    }

    /// The Postgres column quoted name backing `_id`, the primary/unique key.
    pub fn id_field(&self) -> &FieldSpec {
        // `from_raw` guarantees `_id` is present; any `CollectionSpec` in
        // circulation was constructed through it.
        self.fields.get("_id").expect("CollectionSpec invariant: '_id' present")
    }

    /// Logical keys in lexicographic order.
    pub fn sorted_keys(&self) -> Vec<&String> {
        self.fields.keys().collect()
    }

    /// The fully-qualified, quoted table name.
    pub fn quoted_table(&self) -> String {
        format!("\"{}\"", self.pg_table)
    }
}

/// Collections within a single Mongo database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbSpec {
    pub collections: BTreeMap<String, CollectionSpec>,
}

/// The full configuration: database name -> { collection name -> spec }.
pub type Config = BTreeMap<String, DbSpec>;

#[derive(Debug, Deserialize)]
struct DbSpecRaw {
    collections: BTreeMap<String, CollectionSpecRaw>,
}

/// Parse a moresql configuration document from its JSON text.
pub fn load_str(contents: &str) -> Result<Config> {
    let raw: BTreeMap<String, DbSpecRaw> = serde_json::from_str(contents)?;
    let mut config = Config::new();
    for (db_name, db_raw) in raw {
        let mut collections = BTreeMap::new();
        for (coll_name, coll_raw) in db_raw.collections {
            collections.insert(coll_name, CollectionSpec::from_raw(&db_name, coll_raw)?);
        }
        config.insert(db_name, DbSpec { collections });
    }
    Ok(config)
}

/// Parse a moresql configuration document from a file path.
pub fn load_path(path: impl AsRef<Path>) -> Result<Config> {
    let contents = std::fs::read_to_string(path)?;
    load_str(&contents)
}

/// The `"{database}.{collection}"` string used to key per-collection channels (§3).
pub fn fan_key(database: &str, collection: &str) -> String {
    format!("{}.{}", database, collection)
}

/// Inverse of [`fan_key`].
pub fn split_fan_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('.')
}

/// Look up a `CollectionSpec` for a `(database, mongo_collection)` pair.
///
/// Collections are keyed by their Mongo collection name within each database,
/// matching how the dispatcher receives `(database, collection)` from the
/// oplog.
pub fn lookup<'c>(config: &'c Config, database: &str, collection: &str) -> Option<&'c CollectionSpec> {
    config.get(database)?.collections.get(collection)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shorthand_expands_to_longhand() {
        let json = r#"{
            "mydb": {
                "collections": {
                    "widgets": {
                        "mongo_collection": "widgets",
                        "pg_table": "widgets",
                        "fields": {
                            "_id": "id",
                            "bio": "text"
                        }
                    }
                }
            }
        }"#;
        let config = load_str(json).unwrap();
        let coll = lookup(&config, "mydb", "widgets").unwrap();
        let id = coll.fields.get("_id").unwrap();
        assert_eq!(id.mongo.name, "_id");
        assert_eq!(id.mongo.kind, "id");
        assert_eq!(id.postgres.name, "_id");
        assert_eq!(id.postgres.kind, "text");
        let bio = coll.fields.get("bio").unwrap();
        assert_eq!(bio.postgres.kind, "text");
    }

    #[test]
    fn longhand_and_shorthand_are_equivalent() {
        let shorthand = r#"{"_id":"id","bio":"text"}"#;
        let longhand = r#"{
            "_id": {"mongo": {"name": "_id", "type": "id"}, "postgres": {"name": "_id", "type": "text"}},
            "bio": {"mongo": {"name": "bio", "type": "text"}, "postgres": {"name": "bio", "type": "text"}}
        }"#;
        let s: BTreeMap<String, Value> = serde_json::from_str(shorthand).unwrap();
        let l: BTreeMap<String, Value> = serde_json::from_str(longhand).unwrap();
        let mut fields_s = Fields::new();
        let mut fields_l = Fields::new();
        for (k, v) in s {
            fields_s.insert(k.clone(), decode_field("c", &k, &v).unwrap());
        }
        for (k, v) in l {
            fields_l.insert(k.clone(), decode_field("c", &k, &v).unwrap());
        }
        assert_eq!(fields_s, fields_l);
    }

    #[test]
    fn dotted_key_normalizes_to_underscore() {
        let field = decode_field("c", "name.first", &Value::String("text".into())).unwrap();
        assert_eq!(field.postgres.name, "name_first");
        assert_eq!(field.mongo.name, "name.first");
    }

    #[test]
    fn missing_id_field_is_rejected() {
        let json = r#"{
            "mydb": {
                "collections": {
                    "widgets": {
                        "mongo_collection": "widgets",
                        "pg_table": "widgets",
                        "fields": { "bio": "text" }
                    }
                }
            }
        }"#;
        let err = load_str(json).unwrap_err();
        assert!(matches!(err, MoresqlError::MissingIdField(_)));
    }

    #[test]
    fn fan_key_round_trips() {
        let key = fan_key("app", "users");
        assert_eq!(key, "app.users");
        assert_eq!(split_fan_key(&key), Some(("app", "users")));
    }
}
