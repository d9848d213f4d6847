use crate::backend::{
    format_timestamp, placeholders, quote_ident, Column, ColumnType, Database, TableSchema,
    MAX_IN_PARAMS,
};
use crate::codec::Codec;
use crate::config::StoreConfig;
use crate::document::{augment, strip_reserved, Data, Document, PutResult, PLACEHOLDER_REV};
use crate::error::{DocStoreError, Result};
use crate::view::{Filter, Row, ViewTable, Views, KEY_COLUMN};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

/// A document store: one primary table of encoded documents plus the index
/// tables of every registered view.
///
/// Every write runs in a single transaction covering the primary row(s) and
/// all view maintenance. Reads run outside any explicit transaction.
pub struct Store {
    db: Database,
    table: TableSchema,
    codec: Codec,
    views: Vec<ViewTable>,
}

impl Store {
    /// Open a store with the codec selected by `config.compression`.
    pub fn open(config: &StoreConfig, views: Views) -> Result<Self> {
        let codec = Codec::from_compression(&config.compression);
        Self::open_with_codec(config, views, codec)
    }

    /// Open a throwaway in-memory store.
    pub fn open_in_memory(table: &str, views: Views) -> Result<Self> {
        Self::open(&StoreConfig::in_memory(table), views)
    }

    /// Open a store with a caller-supplied codec.
    ///
    /// Creates the primary table and every view table that does not exist yet.
    /// The set of views is fixed for the lifetime of the store.
    pub fn open_with_codec(config: &StoreConfig, views: Views, codec: Codec) -> Result<Self> {
        let table = document_table(&config.table);
        table.validate()?;

        let mut names = HashSet::new();
        let mut tables = HashSet::from([table.name.clone()]);
        let mut view_tables = Vec::with_capacity(views.len());
        for (name, view) in views.into_entries() {
            let view_table = ViewTable::new(name, view)?;
            if !names.insert(view_table.name().to_string()) {
                return Err(DocStoreError::Schema(format!(
                    "view '{}' registered twice",
                    view_table.name()
                )));
            }
            if !tables.insert(view_table.schema().name.clone()) {
                return Err(DocStoreError::Schema(format!(
                    "view '{}' uses table '{}', which is already taken",
                    view_table.name(),
                    view_table.schema().name
                )));
            }
            view_tables.push(view_table);
        }

        let db = match &config.database {
            Some(path) => Database::open(path)?,
            None => Database::open_in_memory()?,
        };

        let mut schemas = vec![&table];
        schemas.extend(view_tables.iter().map(ViewTable::schema));
        db.create_all(&schemas)?;

        log::info!(
            "Opened store '{}' ({}) with {} views, compression: {}",
            table.name,
            config
                .database
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| ":memory:".to_string()),
            view_tables.len(),
            codec.compressor_name()
        );

        Ok(Store {
            db,
            table,
            codec,
            views: view_tables,
        })
    }

    /// Fetch one document by key. `None` if absent.
    pub fn get(&self, key: &str) -> Result<Option<Document>> {
        let sql = format!(
            "SELECT id, rev, updated, key, data FROM {} WHERE key = ?1",
            self.ident()
        );
        let record = self
            .db
            .connection()
            .query_row(&sql, params![key], DocumentRecord::from_row)
            .optional()?;
        record.map(|r| self.decode_record(r)).transpose()
    }

    /// Insert or replace the document stored under `key`.
    ///
    /// An existing document keeps its id. Reserved metadata fields in `data`
    /// are dropped. The document and its index rows commit together or not
    /// at all.
    pub fn put(&self, key: &str, mut data: Data) -> Result<PutResult> {
        if strip_reserved(&mut data) > 0 {
            log::debug!("Dropped reserved fields from payload of '{key}'");
        }
        let blob = self.codec.encode(&data)?;
        let updated = Utc::now();
        let updated_text = format_timestamp(&updated);

        let tx = self.db.transaction()?;
        let existing: Option<i64> = tx
            .query_row(
                &format!("SELECT id FROM {} WHERE key = ?1", self.ident()),
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        let id = match existing {
            Some(id) => {
                tx.execute(
                    &format!(
                        "UPDATE {} SET rev = ?1, updated = ?2, data = ?3 WHERE key = ?4",
                        self.ident()
                    ),
                    params![PLACEHOLDER_REV, updated_text, blob, key],
                )?;
                id
            }
            None => {
                tx.execute(
                    &format!(
                        "INSERT INTO {} (rev, updated, key, data) VALUES (?1, ?2, ?3, ?4)",
                        self.ident()
                    ),
                    params![PLACEHOLDER_REV, updated_text, key, blob],
                )?;
                tx.last_insert_rowid()
            }
        };

        self.update_views(&tx, &[augment(&data, id, key)])?;
        tx.commit()?;

        log::debug!(
            "Put '{key}' (id {id}, {})",
            if existing.is_some() { "updated" } else { "inserted" }
        );

        Ok(PutResult {
            id,
            key: key.to_string(),
            rev: PLACEHOLDER_REV.to_string(),
            updated,
        })
    }

    /// Fetch many documents at once. Keys without a document are omitted.
    pub fn get_many<I, K>(&self, keys: I) -> Result<HashMap<String, Document>>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let keys: Vec<String> = keys
            .into_iter()
            .map(|k| k.as_ref().to_string())
            .filter(|k| seen.insert(k.clone()))
            .collect();

        let mut docs = HashMap::with_capacity(keys.len());
        for chunk in keys.chunks(MAX_IN_PARAMS) {
            let sql = format!(
                "SELECT id, rev, updated, key, data FROM {} WHERE key IN ({})",
                self.ident(),
                placeholders(chunk.len())
            );
            let mut stmt = self.db.connection().prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), DocumentRecord::from_row)?;
            for row in rows {
                let doc = self.decode_record(row?)?;
                docs.insert(doc.key.clone(), doc);
            }
        }
        Ok(docs)
    }

    /// Insert or replace many documents in one transaction.
    ///
    /// Final state is the same as calling [`Store::put`] once per document.
    /// If a key appears more than once, the last payload wins.
    pub fn put_many<I, K>(&self, docs: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, Data)>,
        K: Into<String>,
    {
        let mut batch: BTreeMap<String, Data> = BTreeMap::new();
        for (key, mut data) in docs {
            strip_reserved(&mut data);
            batch.insert(key.into(), data);
        }
        if batch.is_empty() {
            return Ok(());
        }

        let encoded = batch
            .iter()
            .map(|(key, data)| Ok((key.as_str(), self.codec.encode(data)?)))
            .collect::<Result<Vec<(&str, Vec<u8>)>>>()?;
        let keys: Vec<&str> = batch.keys().map(String::as_str).collect();
        let updated = format_timestamp(&Utc::now());

        let tx = self.db.transaction()?;
        let existing = self.lookup_ids(&tx, &keys)?;

        let (mut updated_count, mut inserted_count) = (0, 0);
        {
            let mut update = tx.prepare_cached(&format!(
                "UPDATE {} SET rev = ?1, updated = ?2, data = ?3 WHERE key = ?4",
                self.ident()
            ))?;
            let mut insert = tx.prepare_cached(&format!(
                "INSERT INTO {} (rev, updated, key, data) VALUES (?1, ?2, ?3, ?4)",
                self.ident()
            ))?;
            for (key, blob) in &encoded {
                if existing.contains_key(*key) {
                    update.execute(params![PLACEHOLDER_REV, updated, blob, key])?;
                    updated_count += 1;
                } else {
                    insert.execute(params![PLACEHOLDER_REV, updated, key, blob])?;
                    inserted_count += 1;
                }
            }
        }

        let ids = self.lookup_ids(&tx, &keys)?;
        let augmented = batch
            .iter()
            .map(|(key, data)| {
                ids.get(key)
                    .map(|id| augment(data, *id, key))
                    .ok_or_else(|| {
                        DocStoreError::CorruptData(format!("no id assigned to '{key}' after write"))
                    })
            })
            .collect::<Result<Vec<Data>>>()?;

        self.update_views(&tx, &augmented)?;
        tx.commit()?;

        log::debug!(
            "Put {} documents ({updated_count} updated, {inserted_count} inserted)",
            batch.len()
        );
        Ok(())
    }

    /// Query a view by equality/membership filters.
    ///
    /// With `include_docs`, each row gains a `_doc` field holding the full
    /// document (metadata injected) it was derived from.
    pub fn query(&self, view: &str, filters: &[Filter], include_docs: bool) -> Result<Vec<Row>> {
        let table = self.view(view)?;
        let mut rows = table.query(self.db.connection(), filters)?;

        if include_docs {
            let keys: Vec<String> = rows
                .iter()
                .filter_map(|row| row.get(KEY_COLUMN).and_then(Value::as_str))
                .map(str::to_string)
                .collect();
            let docs = self.get_many(&keys)?;
            for row in &mut rows {
                let doc = row
                    .get(KEY_COLUMN)
                    .and_then(Value::as_str)
                    .and_then(|key| docs.get(key))
                    .map(Document::to_value)
                    .unwrap_or(Value::Null);
                row.insert("_doc".to_string(), doc);
            }
        }
        Ok(rows)
    }

    /// Recompute one view's index table from the primary table.
    pub fn rebuild_view(&self, name: &str) -> Result<usize> {
        let table = self.view(name)?;
        let tx = self.db.transaction()?;
        let docs = self.load_all(&tx)?;
        let rows = table.rebuild(&tx, &docs)?;
        tx.commit()?;
        log::info!("Rebuilt view '{name}': {rows} rows from {} documents", docs.len());
        Ok(rows)
    }

    /// Recompute every view's index table from the primary table.
    pub fn rebuild_views(&self) -> Result<()> {
        let tx = self.db.transaction()?;
        let docs = self.load_all(&tx)?;
        for table in &self.views {
            let rows = table.rebuild(&tx, &docs)?;
            log::info!("Rebuilt view '{}': {rows} rows", table.name());
        }
        tx.commit()?;
        Ok(())
    }

    /// Number of stored documents.
    pub fn count(&self) -> Result<u64> {
        let count: i64 = self.db.connection().query_row(
            &format!("SELECT COUNT(*) FROM {}", self.ident()),
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Table name, document count, and per-view row counts.
    pub fn status(&self) -> Result<Value> {
        let mut views = serde_json::Map::new();
        for table in &self.views {
            views.insert(
                table.name().to_string(),
                serde_json::json!({
                    "table": table.schema().name,
                    "columns": table.schema().column_names(),
                    "rows": table.row_count(self.db.connection())?,
                }),
            );
        }

        Ok(serde_json::json!({
            "table": self.table.name,
            "documents": self.count()?,
            "compression": self.codec.compressor_name(),
            "views": views,
        }))
    }

    pub fn view_names(&self) -> Vec<&str> {
        self.views.iter().map(ViewTable::name).collect()
    }

    pub fn table_name(&self) -> &str {
        &self.table.name
    }

    fn view(&self, name: &str) -> Result<&ViewTable> {
        self.views
            .iter()
            .find(|v| v.name() == name)
            .ok_or_else(|| DocStoreError::UnknownView(name.to_string()))
    }

    fn ident(&self) -> String {
        quote_ident(&self.table.name)
    }

    fn update_views(&self, tx: &Connection, docs: &[Data]) -> Result<()> {
        for view in &self.views {
            view.update(tx, docs)?;
        }
        Ok(())
    }

    /// Map each stored key in `keys` to its id.
    fn lookup_ids(&self, conn: &Connection, keys: &[&str]) -> Result<HashMap<String, i64>> {
        let mut ids = HashMap::with_capacity(keys.len());
        for chunk in keys.chunks(MAX_IN_PARAMS) {
            let sql = format!(
                "SELECT key, id FROM {} WHERE key IN ({})",
                self.ident(),
                placeholders(chunk.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (key, id) = row?;
                ids.insert(key, id);
            }
        }
        Ok(ids)
    }

    /// Every document as an augmented payload, in id order.
    fn load_all(&self, conn: &Connection) -> Result<Vec<Data>> {
        let sql = format!("SELECT id, key, data FROM {} ORDER BY id", self.ident());
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?;

        let mut docs = Vec::new();
        for row in rows {
            let (id, key, blob) = row?;
            let data = self.codec.decode(&blob)?;
            docs.push(augment(&data, id, &key));
        }
        Ok(docs)
    }

    fn decode_record(&self, record: DocumentRecord) -> Result<Document> {
        let data = self.codec.decode(&record.data).map_err(|e| match e {
            DocStoreError::CorruptData(msg) => {
                DocStoreError::CorruptData(format!("document '{}': {msg}", record.key))
            }
            other => other,
        })?;
        let updated = record
            .updated
            .as_deref()
            .map(|text| {
                DateTime::parse_from_rfc3339(text)
                    .map(|ts| ts.with_timezone(&Utc))
                    .map_err(|e| {
                        DocStoreError::CorruptData(format!(
                            "document '{}': bad timestamp '{text}': {e}",
                            record.key
                        ))
                    })
            })
            .transpose()?;

        Ok(Document {
            id: record.id,
            key: record.key,
            rev: record.rev.unwrap_or_else(|| PLACEHOLDER_REV.to_string()),
            updated,
            data,
        })
    }
}

/// The primary table layout.
fn document_table(name: &str) -> TableSchema {
    TableSchema::new(
        name,
        vec![
            Column::new("id", ColumnType::AutoIncrementId),
            Column::new("rev", ColumnType::Text),
            Column::new("updated", ColumnType::Timestamp),
            Column::new("key", ColumnType::Text).not_null().unique(),
            Column::new("data", ColumnType::Blob).not_null(),
        ],
    )
}

/// A raw row from the primary table
struct DocumentRecord {
    id: i64,
    rev: Option<String>,
    updated: Option<String>,
    key: String,
    data: Vec<u8>,
}

impl DocumentRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(DocumentRecord {
            id: row.get(0)?,
            rev: row.get(1)?,
            updated: row.get(2)?,
            key: row.get(3)?,
            data: row.get(4)?,
        })
    }
}
