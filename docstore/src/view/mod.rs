//! Map-function views: secondary index tables derived from documents.
//!
//! A [`View`] declares its index columns and a map function projecting a
//! document into zero or more rows. Once the owning store materializes its
//! schema, each view becomes a [`ViewTable`] with two extra system columns:
//! `_id` (indexed) and `_key`, identifying the document a row came from.
//!
//! Maintenance is full-replace: every write of a document deletes all of its
//! rows and reinserts whatever the map function yields now.

use crate::backend::{
    from_sql_value, placeholders, quote_ident, to_sql_value, Column, ColumnType, TableSchema,
    MAX_IN_PARAMS,
};
use crate::document::Data;
use crate::error::{DocStoreError, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;
use std::collections::HashSet;

/// An index row: column name to value.
pub type Row = Data;

/// Column holding the owning document's surrogate id.
pub const ID_COLUMN: &str = "_id";
/// Column holding the owning document's key.
pub const KEY_COLUMN: &str = "_key";

/// A secondary index definition.
pub trait View: Send + Sync {
    /// Name of the backing table.
    fn table_name(&self) -> &str;

    /// The view's own columns. `_id` and `_key` are appended by the engine.
    fn columns(&self) -> Vec<Column>;

    /// Project a document into index rows.
    ///
    /// `doc` is the document payload with `_id` and `_key` added. The
    /// returned iterator is consumed once per maintenance pass.
    fn map<'a>(&'a self, doc: &'a Data) -> Box<dyn Iterator<Item = Row> + 'a>;
}

type MapFn = Box<dyn Fn(&Data) -> Vec<Row> + Send + Sync>;

/// A view defined by a table name, columns, and a closure.
///
/// ```ignore
/// let view = MapView::new(
///     "docs_lname",
///     vec![Column::new("lname", ColumnType::Text).indexed()],
///     |doc| match doc.get("name").and_then(|v| v.as_str()) {
///         Some(name) => vec![row(&[("lname", name.to_lowercase().into())])],
///         None => vec![],
///     },
/// );
/// ```
pub struct MapView {
    table: String,
    columns: Vec<Column>,
    map_fn: MapFn,
}

impl MapView {
    pub fn new<F>(table: &str, columns: Vec<Column>, map_fn: F) -> Self
    where
        F: Fn(&Data) -> Vec<Row> + Send + Sync + 'static,
    {
        MapView {
            table: table.to_string(),
            columns,
            map_fn: Box::new(map_fn),
        }
    }
}

impl View for MapView {
    fn table_name(&self) -> &str {
        &self.table
    }

    fn columns(&self) -> Vec<Column> {
        self.columns.clone()
    }

    fn map<'a>(&'a self, doc: &'a Data) -> Box<dyn Iterator<Item = Row> + 'a> {
        Box::new((self.map_fn)(doc).into_iter())
    }
}

/// Build a row from `(column, value)` pairs.
pub fn row(fields: &[(&str, Value)]) -> Row {
    fields
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

/// The set of views registered with a store, in registration order.
#[derive(Default)]
pub struct Views {
    entries: Vec<(String, Box<dyn View>)>,
}

impl Views {
    pub fn new() -> Self {
        Views::default()
    }

    pub fn with(mut self, name: &str, view: impl View + 'static) -> Self {
        self.add(name, view);
        self
    }

    pub fn add(&mut self, name: &str, view: impl View + 'static) {
        self.entries.push((name.to_string(), Box::new(view)));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn into_entries(self) -> Vec<(String, Box<dyn View>)> {
        self.entries
    }
}

/// A predicate on one view column. Filters in a query combine with AND.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterOp {
    /// Exact equality. `null` matches SQL NULL.
    Eq(Value),
    /// Membership. An empty set matches nothing.
    In(Vec<Value>),
}

impl Filter {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Filter {
            column: column.to_string(),
            op: FilterOp::Eq(value.into()),
        }
    }

    pub fn is_in<I, V>(column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Filter {
            column: column.to_string(),
            op: FilterOp::In(values.into_iter().map(Into::into).collect()),
        }
    }

    /// Arrays become membership filters; every other value is equality.
    pub fn from_value(column: &str, value: Value) -> Self {
        let op = match value {
            Value::Array(items) => FilterOp::In(items),
            other => FilterOp::Eq(other),
        };
        Filter {
            column: column.to_string(),
            op,
        }
    }
}

/// A view bound to its backing table.
pub struct ViewTable {
    name: String,
    schema: TableSchema,
    view: Box<dyn View>,
}

impl ViewTable {
    pub(crate) fn new(name: String, view: Box<dyn View>) -> Result<Self> {
        let mut columns = view.columns();
        if let Some(reserved) = columns
            .iter()
            .find(|c| c.name == ID_COLUMN || c.name == KEY_COLUMN)
        {
            return Err(DocStoreError::Schema(format!(
                "view '{name}' declares reserved column '{}'",
                reserved.name
            )));
        }
        if columns
            .iter()
            .any(|c| c.column_type == ColumnType::AutoIncrementId)
        {
            return Err(DocStoreError::Schema(format!(
                "view '{name}' declares an auto-increment column"
            )));
        }
        columns.push(Column::new(ID_COLUMN, ColumnType::Integer).indexed());
        columns.push(Column::new(KEY_COLUMN, ColumnType::Text));

        let schema = TableSchema::new(view.table_name(), columns);
        schema.validate()?;

        Ok(ViewTable { name, schema, view })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Replace the index rows of every document in `docs`.
    ///
    /// Each document must carry `_id` and `_key`. Runs on the caller's
    /// transaction; any error leaves rollback to the caller.
    pub fn update(&self, tx: &Connection, docs: &[Data]) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }

        let ids = docs
            .iter()
            .map(|doc| doc_identity(doc).map(|(id, _)| id))
            .collect::<Result<Vec<i64>>>()?;

        let mut deleted = 0;
        for chunk in ids.chunks(MAX_IN_PARAMS) {
            let sql = format!(
                "DELETE FROM {} WHERE {} IN ({})",
                quote_ident(&self.schema.name),
                quote_ident(ID_COLUMN),
                placeholders(chunk.len())
            );
            deleted += tx.execute(&sql, params_from_iter(chunk.iter()))?;
        }

        let inserted = self.insert_rows(tx, docs)?;
        log::debug!(
            "view '{}': {} documents, deleted {} rows, inserted {} rows",
            self.name,
            docs.len(),
            deleted,
            inserted
        );
        Ok(())
    }

    /// Clear the table and reinsert the projection of every document.
    pub fn rebuild(&self, tx: &Connection, docs: &[Data]) -> Result<usize> {
        tx.execute(&format!("DELETE FROM {}", quote_ident(&self.schema.name)), [])?;
        self.insert_rows(tx, docs)
    }

    fn insert_rows(&self, tx: &Connection, docs: &[Data]) -> Result<usize> {
        let columns: Vec<String> = self
            .schema
            .columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(&self.schema.name),
            columns.join(", "),
            placeholders(columns.len())
        );
        let mut stmt = tx.prepare_cached(&sql)?;
        let known: HashSet<&str> = self.schema.columns.iter().map(|c| c.name.as_str()).collect();

        let mut inserted = 0;
        for doc in docs {
            let (id, key) = doc_identity(doc)?;
            for row in self.view.map(doc) {
                if let Some(unknown) = row.keys().find(|k| !known.contains(k.as_str())) {
                    return Err(DocStoreError::Schema(format!(
                        "map function of view '{}' produced unknown column '{unknown}'",
                        self.name
                    )));
                }

                let values = self
                    .schema
                    .columns
                    .iter()
                    .map(|column| match column.name.as_str() {
                        ID_COLUMN => Ok(SqlValue::Integer(id)),
                        KEY_COLUMN => Ok(SqlValue::Text(key.to_string())),
                        name => match row.get(name) {
                            Some(value) => to_sql_value(column, value),
                            None => Ok(SqlValue::Null),
                        },
                    })
                    .collect::<Result<Vec<SqlValue>>>()?;

                stmt.execute(params_from_iter(values))?;
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    /// Select rows matching every filter, in insertion order.
    pub fn query(&self, conn: &Connection, filters: &[Filter]) -> Result<Vec<Row>> {
        let mut clauses = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();

        for filter in filters {
            let column =
                self.schema
                    .column(&filter.column)
                    .ok_or_else(|| DocStoreError::UnknownColumn {
                        view: self.name.clone(),
                        column: filter.column.clone(),
                    })?;
            let ident = quote_ident(&column.name);

            match &filter.op {
                FilterOp::Eq(Value::Null) => clauses.push(format!("{ident} IS NULL")),
                FilterOp::Eq(value) => {
                    clauses.push(format!("{ident} = ?"));
                    params.push(to_sql_value(column, value)?);
                }
                FilterOp::In(values) if values.is_empty() => clauses.push("0".to_string()),
                FilterOp::In(values) => {
                    clauses.push(format!("{ident} IN ({})", placeholders(values.len())));
                    for value in values {
                        params.push(to_sql_value(column, value)?);
                    }
                }
            }
        }

        let columns: Vec<String> = self
            .schema
            .columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect();
        let mut sql = format!(
            "SELECT {} FROM {}",
            columns.join(", "),
            quote_ident(&self.schema.name)
        );
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY rowid");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), |sql_row| {
            let mut row = Row::new();
            for (i, column) in self.schema.columns.iter().enumerate() {
                let value: SqlValue = sql_row.get(i)?;
                row.insert(column.name.clone(), from_sql_value(column.column_type, value));
            }
            Ok(row)
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn row_count(&self, conn: &Connection) -> Result<u64> {
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(&self.schema.name)),
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

fn doc_identity(doc: &Data) -> Result<(i64, &str)> {
    let id = doc.get(ID_COLUMN).and_then(Value::as_i64);
    let key = doc.get(KEY_COLUMN).and_then(Value::as_str);
    match (id, key) {
        (Some(id), Some(key)) => Ok((id, key)),
        _ => Err(DocStoreError::InvalidValue {
            column: ID_COLUMN.to_string(),
            reason: "document passed to view maintenance lacks _id/_key".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Database;
    use crate::document::augment;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    /// One row per tag, carrying the tag and the document's year.
    struct TagView;

    impl View for TagView {
        fn table_name(&self) -> &str {
            "docs_tags"
        }

        fn columns(&self) -> Vec<Column> {
            vec![
                Column::new("tag", ColumnType::Text).indexed(),
                Column::new("year", ColumnType::Integer),
            ]
        }

        fn map<'a>(&'a self, doc: &'a Data) -> Box<dyn Iterator<Item = Row> + 'a> {
            let year = doc.get("year").cloned().unwrap_or(Value::Null);
            let tags = doc
                .get("tags")
                .and_then(Value::as_array)
                .into_iter()
                .flatten();
            Box::new(tags.map(move |tag| row(&[("tag", tag.clone()), ("year", year.clone())])))
        }
    }

    fn setup() -> (Database, ViewTable) {
        let db = Database::open_in_memory().unwrap();
        let table = ViewTable::new("tags".into(), Box::new(TagView)).unwrap();
        db.create_all(&[table.schema()]).unwrap();
        (db, table)
    }

    fn doc(id: i64, key: &str, value: Value) -> Data {
        augment(value.as_object().unwrap(), id, key)
    }

    fn tags_of(rows: &[Row]) -> Vec<String> {
        rows.iter()
            .map(|r| r["tag"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_schema_appends_system_columns() {
        let (_db, table) = setup();
        assert_eq!(table.schema().column_names(), vec!["tag", "year", "_id", "_key"]);
        assert!(table.schema().column("_id").unwrap().indexed);
    }

    #[test]
    fn test_reserved_column_rejected() {
        let view = MapView::new(
            "bad",
            vec![Column::new("_key", ColumnType::Text)],
            |_| vec![],
        );
        let result = ViewTable::new("bad".into(), Box::new(view));
        assert!(matches!(result, Err(DocStoreError::Schema(_))));
    }

    #[test]
    fn test_update_inserts_all_mapped_rows() {
        let (db, table) = setup();
        let docs = vec![
            doc(1, "a", json!({"tags": ["x", "y"], "year": 2001})),
            doc(2, "b", json!({"tags": ["y"]})),
            doc(3, "c", json!({})),
        ];
        let tx = db.transaction().unwrap();
        table.update(&tx, &docs).unwrap();
        tx.commit().unwrap();

        let rows = table.query(db.connection(), &[]).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(
            rows[0],
            row(&[
                ("tag", json!("x")),
                ("year", json!(2001)),
                ("_id", json!(1)),
                ("_key", json!("a")),
            ])
        );
        assert_eq!(rows[2]["year"], Value::Null);
    }

    #[test]
    fn test_update_replaces_previous_rows() {
        let (db, table) = setup();
        let tx = db.transaction().unwrap();
        table
            .update(&tx, &[doc(1, "a", json!({"tags": ["old1", "old2"]}))])
            .unwrap();
        table
            .update(&tx, &[doc(1, "a", json!({"tags": ["new"]}))])
            .unwrap();
        tx.commit().unwrap();

        let rows = table.query(db.connection(), &[]).unwrap();
        assert_eq!(tags_of(&rows), vec!["new"]);
    }

    #[test]
    fn test_update_leaves_other_documents_alone() {
        let (db, table) = setup();
        let tx = db.transaction().unwrap();
        table
            .update(
                &tx,
                &[
                    doc(1, "a", json!({"tags": ["a1"]})),
                    doc(2, "b", json!({"tags": ["b1"]})),
                ],
            )
            .unwrap();
        table.update(&tx, &[doc(1, "a", json!({"tags": []}))]).unwrap();
        tx.commit().unwrap();

        let rows = table.query(db.connection(), &[]).unwrap();
        assert_eq!(tags_of(&rows), vec!["b1"]);
    }

    #[test]
    fn test_update_empty_batch_is_noop() {
        let (db, table) = setup();
        let tx = db.transaction().unwrap();
        table.update(&tx, &[]).unwrap();
        tx.commit().unwrap();
        assert_eq!(table.row_count(db.connection()).unwrap(), 0);
    }

    #[test]
    fn test_update_rejects_unknown_row_column() {
        let view = MapView::new(
            "docs_bad",
            vec![Column::new("a", ColumnType::Text)],
            |_| vec![row(&[("b", json!("x"))])],
        );
        let table = ViewTable::new("bad".into(), Box::new(view)).unwrap();
        let db = Database::open_in_memory().unwrap();
        db.create_all(&[table.schema()]).unwrap();

        let tx = db.transaction().unwrap();
        let result = table.update(&tx, &[doc(1, "a", json!({}))]);
        assert!(matches!(result, Err(DocStoreError::Schema(_))));
    }

    #[test]
    fn test_update_requires_identity() {
        let (db, table) = setup();
        let tx = db.transaction().unwrap();
        let bare = json!({"tags": ["x"]}).as_object().unwrap().clone();
        assert!(table.update(&tx, &[bare]).is_err());
    }

    #[test]
    fn test_query_equality_and_membership() {
        let (db, table) = setup();
        let tx = db.transaction().unwrap();
        table
            .update(
                &tx,
                &[
                    doc(1, "a", json!({"tags": ["x", "y"], "year": 2001})),
                    doc(2, "b", json!({"tags": ["y", "z"], "year": 2002})),
                ],
            )
            .unwrap();
        tx.commit().unwrap();
        let conn = db.connection();

        let rows = table.query(conn, &[Filter::eq("tag", "y")]).unwrap();
        assert_eq!(rows.len(), 2);

        let rows = table
            .query(conn, &[Filter::is_in("tag", ["x", "z"])])
            .unwrap();
        assert_eq!(tags_of(&rows), vec!["x", "z"]);

        let rows = table
            .query(conn, &[Filter::eq("tag", "y"), Filter::eq("year", 2002)])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["_key"], "b");

        let rows = table.query(conn, &[Filter::eq("_key", "a")]).unwrap();
        assert_eq!(tags_of(&rows), vec!["x", "y"]);

        let rows = table
            .query(conn, &[Filter::is_in("tag", Vec::<String>::new())])
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_query_null_equality() {
        let (db, table) = setup();
        let tx = db.transaction().unwrap();
        table
            .update(
                &tx,
                &[
                    doc(1, "a", json!({"tags": ["x"]})),
                    doc(2, "b", json!({"tags": ["x"], "year": 1999})),
                ],
            )
            .unwrap();
        tx.commit().unwrap();

        let rows = table
            .query(db.connection(), &[Filter::eq("year", Value::Null)])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["_key"], "a");
    }

    #[test]
    fn test_query_unknown_column() {
        let (db, table) = setup();
        let result = table.query(db.connection(), &[Filter::eq("nope", 1)]);
        assert!(matches!(result, Err(DocStoreError::UnknownColumn { .. })));
    }

    #[test]
    fn test_filter_from_value() {
        assert_eq!(
            Filter::from_value("tag", json!(["a", "b"])),
            Filter::is_in("tag", ["a", "b"])
        );
        assert_eq!(Filter::from_value("tag", json!("a")), Filter::eq("tag", "a"));
    }

    #[test]
    fn test_rebuild_recomputes_table() {
        let (db, table) = setup();
        let tx = db.transaction().unwrap();
        table
            .update(&tx, &[doc(1, "a", json!({"tags": ["stale"]}))])
            .unwrap();
        let inserted = table
            .rebuild(
                &tx,
                &[
                    doc(1, "a", json!({"tags": ["fresh"]})),
                    doc(2, "b", json!({"tags": ["other"]})),
                ],
            )
            .unwrap();
        tx.commit().unwrap();

        assert_eq!(inserted, 2);
        let rows = table.query(db.connection(), &[]).unwrap();
        assert_eq!(tags_of(&rows), vec!["fresh", "other"]);
    }

    #[test]
    fn test_large_batch_delete_is_chunked() {
        let (db, table) = setup();
        let docs: Vec<Data> = (0..(MAX_IN_PARAMS as i64 * 2 + 7))
            .map(|i| doc(i + 1, &format!("k{i}"), json!({"tags": ["t"]})))
            .collect();
        let tx = db.transaction().unwrap();
        table.update(&tx, &docs).unwrap();
        table.update(&tx, &docs).unwrap();
        tx.commit().unwrap();

        assert_eq!(table.row_count(db.connection()).unwrap(), docs.len() as u64);
    }
}
