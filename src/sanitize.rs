//! Document sanitizer (§4.2) and missing-field policy (§4.3).
//!
//! Flattens a (possibly nested) document against a [`CollectionSpec`]'s field
//! map into a flat parameter map keyed by **logical key** — the same key
//! used by the statement builder's placeholders (§4.1's parenthetical: "the
//! binding layer resolves uniformly" against the logical-key placeholder
//! text). See DESIGN.md for why this crate keys the sanitizer's output by
//! logical key rather than the literal Postgres column name §4.2 names.

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;

use bytes::BytesMut;
use mongodb::bson::{Bson, Document};
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};

use crate::config::CollectionSpec;
use crate::oplog::{OpKind, OperationRecord};

/// A scalar value ready for parameter binding against Postgres. This is the
/// full range of shapes the sanitizer ever produces: Mongo has no native
/// relational type system, so everything collapses to one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Text(String),
    Integer(i64),
    Double(f64),
    Boolean(bool),
    /// A JSON-encoded document or array, stored as text (bind against a
    /// `json`/`jsonb` column, or a plain `text` column if that's what the
    /// operator configured).
    Json(String),
}

impl fmt::Display for PgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PgValue::Null => write!(f, "NULL"),
            PgValue::Text(s) => write!(f, "{}", s),
            PgValue::Integer(i) => write!(f, "{}", i),
            PgValue::Double(d) => write!(f, "{}", d),
            PgValue::Boolean(b) => write!(f, "{}", b),
            PgValue::Json(j) => write!(f, "{}", j),
        }
    }
}

impl ToSql for PgValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            PgValue::Null => Ok(IsNull::Yes),
            PgValue::Text(s) => s.to_sql(ty, out),
            PgValue::Integer(i) => i.to_sql(ty, out),
            PgValue::Double(d) => d.to_sql(ty, out),
            PgValue::Boolean(b) => b.to_sql(ty, out),
            PgValue::Json(j) => j.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Descend `doc` along a dotted logical key (`"name.first"` means
/// `doc["name"]["first"]`). Returns `None` if any segment is absent along
/// the way, per §4.2 rule 3.
fn extract_dotted<'d>(doc: &'d Document, key: &str) -> Option<&'d Bson> {
    let mut segments = key.split('.');
    let first = segments.next()?;
    let mut current = doc.get(first)?;
    for segment in segments {
        current = current.as_document()?.get(segment)?;
    }
    Some(current)
}

fn hex_coerce(value: &Bson) -> String {
    match value {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(s) => s.clone(),
        Bson::Binary(bin) => bin.bytes.iter().map(|b| format!("{:02x}", b)).collect(),
        other => other.to_string(),
    }
}

fn json_encode(value: &Bson) -> String {
    let json = value.clone().into_relaxed_extjson();
    serde_json::to_string(&json).unwrap_or_else(|_| "null".to_string())
}

/// Coerce an extracted Mongo value into a Postgres-bindable scalar,
/// following the same precedence the original implementation used (§4.2
/// rule 4): declared `id` type wins first, then Mongo's own dynamic type
/// (`ObjectId`, `Symbol`, `Document`/`Array`), then declared `object` type
/// as a catch-all, then plain pass-through.
fn coerce(value: &Bson, mongo_type: &str) -> PgValue {
    let declared_id = mongo_type.eq_ignore_ascii_case("id");
    let declared_object = mongo_type.eq_ignore_ascii_case("object");

    if declared_id && !matches!(value, Bson::Null) {
        return PgValue::Text(hex_coerce(value));
    }
    match value {
        Bson::ObjectId(oid) => PgValue::Text(oid.to_hex()),
        Bson::Symbol(s) => PgValue::Text(s.clone()),
        Bson::Document(_) | Bson::Array(_) => PgValue::Json(json_encode(value)),
        _ if declared_object => PgValue::Json(json_encode(value)),
        Bson::Null => PgValue::Null,
        Bson::Boolean(b) => PgValue::Boolean(*b),
        Bson::Int32(i) => PgValue::Integer(*i as i64),
        Bson::Int64(i) => PgValue::Integer(*i),
        Bson::Double(d) => PgValue::Double(*d),
        Bson::String(s) => PgValue::Text(s.clone()),
        other => PgValue::Text(other.to_string()),
    }
}

fn coerce_id_bson(value: &Bson) -> PgValue {
    match value {
        Bson::Null => PgValue::Null,
        other => PgValue::Text(hex_coerce(other)),
    }
}

/// Flatten `op` against `collection`'s field map into a
/// `logical_key -> PgValue` parameter map (§4.2).
pub fn sanitize(collection: &CollectionSpec, op: &OperationRecord) -> BTreeMap<String, PgValue> {
    let mut out = BTreeMap::new();
    if !op.is_insert_update_or_delete() {
        return out;
    }

    // Seed with `_id` from the operation record itself; overridden below if
    // the field-map walk produces its own `_id` (§4.2 rule 2).
    out.insert("_id".to_string(), coerce_id_bson(&op.id));

    if matches!(op.kind, OpKind::Delete) {
        return out;
    }

    for (key, spec) in &collection.fields {
        if let Some(value) = extract_dotted(&op.data, key) {
            out.insert(key.clone(), coerce(value, &spec.mongo.kind));
        }
    }
    out
}

/// Ensure every configured logical key is present in `doc`, inserting
/// `null` for any that are missing (§4.3). Dotted keys are ensured at the
/// top level, matching their literal string form — nested descent happens
/// later, in [`sanitize`]; this step exists so that flat (non-dotted) keys
/// are guaranteed present before sanitizing, and so downstream binding never
/// needs to special-case "key entirely absent" versus "key present as null".
pub fn ensure_all_fields(doc: &mut Document, keys: &[&String]) {
    for key in keys {
        if !doc.contains_key(key.as_str()) {
            doc.insert(key.as_str(), Bson::Null);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_str;
    use crate::oplog::OpTimestamp;
    use mongodb::bson::doc;

    fn widgets_collection(fields_json: &str) -> crate::config::Config {
        let json = format!(
            r#"{{"db": {{"collections": {{"widgets": {{
                "mongo_collection": "widgets",
                "pg_table": "widgets",
                "fields": {}
            }}}}}}}}"#,
            fields_json
        );
        load_str(&json).unwrap()
    }

    fn op(kind: OpKind, id: Bson, data: Document) -> OperationRecord {
        OperationRecord {
            database: "db".into(),
            collection: "widgets".into(),
            kind,
            id,
            timestamp: OpTimestamp::new(1, 1),
            data,
        }
    }

    /// §8 S3 — nested sanitize.
    #[test]
    fn s3_nested_sanitize() {
        let config = widgets_collection(r#"{"_id":"id","name.first":"text"}"#);
        let coll = crate::config::lookup(&config, "db", "widgets").unwrap();
        let data = doc! { "name": { "first": "John", "last": "Doe" } };
        let record = op(OpKind::Insert, Bson::String("abc".into()), data);
        let result = sanitize(coll, &record);
        assert!(matches!(result.get("name.first"), Some(PgValue::Text(s)) if s == "John"));
    }

    /// §8 S6 — missing field coercion.
    #[test]
    fn s6_missing_field_is_null_after_ensure() {
        let config = widgets_collection(r#"{"_id":"id","name":"text","age":"integer"}"#);
        let coll = crate::config::lookup(&config, "db", "widgets").unwrap();
        let mut data = doc! { "_id": "123", "name": "Alice" };
        let keys: Vec<&String> = coll.sorted_keys();
        ensure_all_fields(&mut data, &keys);
        let record = op(OpKind::Insert, Bson::String("123".into()), data);
        let result = sanitize(coll, &record);
        assert!(matches!(result.get("age"), Some(PgValue::Null)));
    }

    /// §8 property 4 — ID coercion.
    #[test]
    fn id4_object_id_hex_coercion() {
        let oid = mongodb::bson::oid::ObjectId::from_bytes([
            0x31, 0x32, 0x33, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        ]);
        let hex = oid.to_hex();
        // The raw bytes 0x31 0x32 0x33 followed by zero padding hex-encode
        // deterministically; we assert the coercion path, not a literal
        // fixed value, since ObjectId is always 12 bytes.
        assert_eq!(hex_coerce(&Bson::ObjectId(oid)), hex);
    }

    #[test]
    fn object_type_json_encodes_even_null() {
        let config = widgets_collection(r#"{"_id":"id","meta":"object"}"#);
        let coll = crate::config::lookup(&config, "db", "widgets").unwrap();
        let data = doc! { "_id": "1", "meta": Bson::Null };
        let record = op(OpKind::Insert, Bson::String("1".into()), data);
        let result = sanitize(coll, &record);
        assert!(matches!(result.get("meta"), Some(PgValue::Json(j)) if j == "null"));
    }

    #[test]
    fn delete_only_populates_id() {
        let config = widgets_collection(r#"{"_id":"id","name":"text"}"#);
        let coll = crate::config::lookup(&config, "db", "widgets").unwrap();
        let record = op(OpKind::Delete, Bson::String("1".into()), Document::new());
        let result = sanitize(coll, &record);
        assert_eq!(result.len(), 1);
        assert!(result.contains_key("_id"));
    }

    /// §8 property 3 — sanitizer totality: exactly present keys + `_id`.
    #[test]
    fn sanitizer_totality() {
        let config = widgets_collection(r#"{"_id":"id","name":"text","age":"integer"}"#);
        let coll = crate::config::lookup(&config, "db", "widgets").unwrap();
        let data = doc! { "_id": "1", "name": "Alice" };
        let record = op(OpKind::Insert, Bson::String("1".into()), data);
        let result = sanitize(coll, &record);
        let mut keys: Vec<&String> = result.keys().collect();
        keys.sort();
        assert_eq!(keys, vec![&"_id".to_string(), &"name".to_string()]);
    }

    #[test]
    fn command_ops_sanitize_to_empty() {
        let config = widgets_collection(r#"{"_id":"id"}"#);
        let coll = crate::config::lookup(&config, "db", "widgets").unwrap();
        let record = op(OpKind::Command, Bson::Null, Document::new());
        assert!(sanitize(coll, &record).is_empty());
    }
}
