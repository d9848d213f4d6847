//! Document storage on top of SQLite with CouchDB-style map-function views.
//!
//! Documents are JSON objects stored by string key in a primary table, encoded
//! and compressed by a [`Codec`]. Each registered [`View`] projects documents
//! into rows of its own index table; the [`Store`] keeps those tables in step
//! with every write inside the same transaction.
//!
//! ```no_run
//! use docstore::{row, Column, ColumnType, Filter, MapView, Store, Views};
//! use serde_json::json;
//!
//! let lname = MapView::new(
//!     "docs_lname",
//!     vec![Column::new("lname", ColumnType::Text).indexed()],
//!     |doc| match doc.get("name").and_then(|v| v.as_str()) {
//!         Some(name) => vec![row(&[("lname", json!(name.to_lowercase()))])],
//!         None => vec![],
//!     },
//! );
//! let store = Store::open_in_memory("docs", Views::new().with("lname", lname)).unwrap();
//!
//! let doc = json!({"name": "Foo"}).as_object().unwrap().clone();
//! store.put("a", doc).unwrap();
//!
//! let rows = store.query("lname", &[Filter::eq("lname", "foo")], true).unwrap();
//! assert_eq!(rows[0]["_key"], "a");
//! ```

pub mod backend;
pub mod codec;
pub mod config;
pub mod document;
pub mod error;
pub mod store;
pub mod view;

pub use backend::{Column, ColumnType, TableSchema};
pub use codec::{Codec, Compressor, Encoder, JsonEncoder, NoCompression, ZstdCompressor};
pub use config::{Compression, StoreConfig};
pub use document::{Data, Document, PutResult};
pub use error::{DocStoreError, Result};
pub use store::Store;
pub use view::{row, Filter, FilterOp, MapView, Row, View, Views};
