// Views over Open Library edition records

use docstore::{row, Column, ColumnType, Data, Row, View, Views};
use serde_json::Value;

/// Every identifier of an edition as `<scheme>:<value>`:
/// `olid:` from the record key, `isbn:` from `isbn_10`/`isbn_13` (hyphens
/// removed), and one entry per value under `identifiers`.
pub struct IdentifierView;

impl View for IdentifierView {
    fn table_name(&self) -> &str {
        "editions_identifiers"
    }

    fn columns(&self) -> Vec<Column> {
        vec![Column::new("value", ColumnType::Text).indexed()]
    }

    fn map<'a>(&'a self, doc: &'a Data) -> Box<dyn Iterator<Item = Row> + 'a> {
        let olid = doc
            .get("key")
            .and_then(Value::as_str)
            .and_then(|key| key.rsplit('/').next())
            .filter(|id| !id.is_empty())
            .map(|id| format!("olid:{id}"));

        let isbns = ["isbn_10", "isbn_13"]
            .into_iter()
            .flat_map(move |field| strings(doc.get(field)))
            .map(|isbn| format!("isbn:{}", isbn.trim().replace('-', "")));

        let identifiers = doc
            .get("identifiers")
            .and_then(Value::as_object)
            .into_iter()
            .flatten()
            .flat_map(|(scheme, values)| {
                strings(Some(values)).map(move |v| format!("{scheme}:{}", v.trim()))
            });

        Box::new(
            olid.into_iter()
                .chain(isbns)
                .chain(identifiers)
                .map(|value| row(&[("value", Value::String(value))])),
        )
    }
}

fn strings(value: Option<&Value>) -> impl Iterator<Item = &str> {
    value
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
}

/// The views registered by the CLI.
pub fn views() -> Views {
    Views::new().with("ids", IdentifierView)
}
