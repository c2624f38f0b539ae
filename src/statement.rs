//! Field schema & statement builder (§4.1).
//!
//! Given a [`CollectionSpec`], emits the four SQL templates (insert, upsert,
//! update, delete) with deterministic, lexicographic-by-logical-key column
//! ordering and named placeholders bound to the Mongo logical key.
//!
//! The builder is a pure function over `CollectionSpec`: it cannot fail. If
//! `_id` is missing, that failure already happened earlier, at config load
//! ([`CollectionSpec::from_raw`]).

use crate::config::CollectionSpec;

/// A column, ready for SQL rendering: its Postgres name (quoted) and the
/// logical key used for its bind placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub logical_key: String,
    pub postgres_quoted: String,
}

/// Builds the four SQL templates for a single collection.
#[derive(Debug, Clone)]
pub struct Statement<'c> {
    collection: &'c CollectionSpec,
}

impl<'c> Statement<'c> {
    pub fn new(collection: &'c CollectionSpec) -> Self {
        Self { collection }
    }

    fn prefix_colon(key: &str) -> String {
        format!(":{}", key)
    }

    /// Columns in lexicographic-by-logical-key order.
    pub fn columns(&self) -> Vec<Column> {
        self.collection
            .sorted_keys()
            .into_iter()
            .map(|key| {
                let field = &self.collection.fields[key];
                Column {
                    logical_key: key.clone(),
                    postgres_quoted: field.postgres.quoted_name(),
                }
            })
            .collect()
    }

    fn joined_placeholders(&self) -> String {
        self.columns()
            .iter()
            .map(|c| Self::prefix_colon(&c.logical_key))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn joined_postgres_names(&self) -> String {
        self.columns()
            .iter()
            .map(|c| c.postgres_quoted.clone())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `"c2" = :k2, "c3" = :k3, ...` — omits `_id`.
    fn build_assignment(&self) -> String {
        self.columns()
            .iter()
            .filter(|c| c.logical_key != "_id")
            .map(|c| format!("{} = {}", c.postgres_quoted, Self::prefix_colon(&c.logical_key)))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn id_column(&self) -> Column {
        let field = self.collection.id_field();
        Column {
            logical_key: "_id".to_string(),
            postgres_quoted: field.postgres.quoted_name(),
        }
    }

    fn where_by_id(&self) -> String {
        let id = self.id_column();
        format!("WHERE {} = {}", id.postgres_quoted, Self::prefix_colon(&id.logical_key))
    }

    /// `INSERT INTO "table" (...) VALUES (...)`.
    pub fn build_insert(&self) -> String {
        let insert_into = format!("INSERT INTO {} ({})", self.collection.quoted_table(), self.joined_postgres_names());
        let values = format!("VALUES ({})", self.joined_placeholders());
        [insert_into, values].join("\n")
    }

    /// Insert, plus `ON CONFLICT ("id_col") DO UPDATE SET ...` (assignment omits `_id`).
    pub fn build_upsert(&self) -> String {
        let insert = self.build_insert();
        let on_conflict = format!("ON CONFLICT ({})", self.id_column().postgres_quoted);
        let do_update = format!("DO UPDATE SET {};", self.build_assignment());
        [insert, on_conflict, do_update].join("\n")
    }

    /// `UPDATE "table" SET ... WHERE "id_col" = :_id;` (assignment omits `_id`).
    pub fn build_update(&self) -> String {
        let update = format!("UPDATE {}", self.collection.quoted_table());
        let set = format!("SET {}", self.build_assignment());
        let where_clause = format!("{};", self.where_by_id());
        [update, set, where_clause].join("\n")
    }

    /// `DELETE FROM "table" WHERE "id_col" = :_id;`.
    pub fn build_delete(&self) -> String {
        format!("DELETE FROM {} {};", self.collection.quoted_table(), self.where_by_id())
    }

    /// Translate one of the named-placeholder templates above into
    /// Postgres's positional (`$1`, `$2`, ...) form, plus the ordered
    /// parameter list to execute it with.
    ///
    /// `tokio_postgres` has no named-bind support, unlike the Go driver this
    /// system was originally built on (`sqlx.NamedExec`); the templates
    /// themselves stay named-placeholder text (§4.1 is explicit about this,
    /// and it's what §8's golden tests assert against), so this translation
    /// lives at the execution boundary instead. A column may appear more
    /// than once in a template (e.g. the upsert's `VALUES` and `SET`
    /// clauses both reference the same field) — both occurrences get the
    /// same `$N`, which Postgres allows.
    pub fn bind(&self, template: &str, values: &std::collections::BTreeMap<String, crate::sanitize::PgValue>) -> (String, Vec<crate::sanitize::PgValue>) {
        let mut columns = self.columns();
        // Longest-key-first avoids a short key's placeholder being replaced
        // as a prefix of a longer one that shares it.
        columns.sort_by_key(|c| std::cmp::Reverse(c.logical_key.len()));

        let mut sql = template.to_string();
        let mut params = Vec::with_capacity(columns.len());
        for (index, column) in columns.iter().enumerate() {
            let placeholder = Self::prefix_colon(&column.logical_key);
            let positional = format!("${}", index + 1);
            sql = sql.replace(&placeholder, &positional);
            params.push(values.get(&column.logical_key).cloned().unwrap_or(crate::sanitize::PgValue::Null));
        }
        (sql, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_str;

    fn categories_spec(extra_fields: &str) -> crate::config::Config {
        let json = format!(
            r#"{{
                "db": {{
                    "collections": {{
                        "categories": {{
                            "mongo_collection": "categories",
                            "pg_table": "categories",
                            "fields": {{ "_id": "id", "count": "text"{} }}
                        }}
                    }}
                }}
            }}"#,
            extra_fields
        );
        load_str(&json).unwrap()
    }

    /// §8 S1 — Upsert SQL.
    #[test]
    fn s1_upsert_sql() {
        let config = categories_spec("");
        let coll = crate::config::lookup(&config, "db", "categories").unwrap();
        let stmt = Statement::new(coll);
        let expected = "INSERT INTO \"categories\" (\"_id\", \"count\")\nVALUES (:_id, :count)\nON CONFLICT (\"_id\")\nDO UPDATE SET \"count\" = :count;";
        assert_eq!(stmt.build_upsert(), expected);
    }

    /// §8 S2 — Update SQL.
    #[test]
    fn s2_update_sql() {
        let config = categories_spec(r#", "avg": "text""#);
        let coll = crate::config::lookup(&config, "db", "categories").unwrap();
        let stmt = Statement::new(coll);
        let expected = "UPDATE \"categories\"\nSET \"avg\" = :avg, \"count\" = :count\nWHERE \"_id\" = :_id;";
        assert_eq!(stmt.build_update(), expected);
    }

    #[test]
    fn delete_sql() {
        let config = categories_spec("");
        let coll = crate::config::lookup(&config, "db", "categories").unwrap();
        let stmt = Statement::new(coll);
        assert_eq!(stmt.build_delete(), "DELETE FROM \"categories\" WHERE \"_id\" = :_id;");
    }

    /// §8 property 1 — template determinism: repeated builds are byte-identical.
    #[test]
    fn templates_are_deterministic() {
        let config = categories_spec(r#", "avg": "text""#);
        let coll = crate::config::lookup(&config, "db", "categories").unwrap();
        let stmt = Statement::new(coll);
        assert_eq!(stmt.build_upsert(), stmt.build_upsert());
        assert_eq!(stmt.build_insert(), stmt.build_insert());
        assert_eq!(stmt.build_update(), stmt.build_update());
        assert_eq!(stmt.build_delete(), stmt.build_delete());
    }

    #[test]
    fn columns_are_lexicographic() {
        let config = categories_spec(r#", "avg": "text""#);
        let coll = crate::config::lookup(&config, "db", "categories").unwrap();
        let stmt = Statement::new(coll);
        let keys: Vec<String> = stmt.columns().into_iter().map(|c| c.logical_key).collect();
        assert_eq!(keys, vec!["_id".to_string(), "avg".to_string(), "count".to_string()]);
    }
}
