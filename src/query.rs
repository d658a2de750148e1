use serde_json::{Map, Value};
use tracing::warn;

/// Translates the RAPI query response format into field-keyed records.
///
/// The response looks like:
/// {
///   "fields": [{"name": "name", ...}, {"name": "tags", ...}],
///   "data": [
///     [[0, "vm1.example.org"], [0, ["gnt:user:alice"]]],
///     ...
///   ]
/// }
/// Each data cell is a [type, value] pair; only the value is kept. A row
/// whose length does not match the field list is rejected rather than
/// mis-indexed.
pub fn parse_query(response: &Value) -> Vec<Map<String, Value>> {
    let fields: Vec<&str> = response
        .get("fields")
        .and_then(Value::as_array)
        .map(|fs| {
            fs.iter()
                .filter_map(|f| f.get("name").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    let data = match response.get("data").and_then(Value::as_array) {
        Some(d) => d,
        None => return Vec::new(),
    };

    let mut records = Vec::with_capacity(data.len());
    for row in data {
        let cells = match row.as_array() {
            Some(c) if c.len() == fields.len() => c,
            _ => {
                warn!("query row arity does not match field list, rejecting row");
                continue;
            }
        };
        let mut record = Map::new();
        for (name, cell) in fields.iter().zip(cells) {
            let value = cell.get(1).cloned().unwrap_or(Value::Null);
            record.insert((*name).to_owned(), value);
        }
        records.push(record);
    }
    records
}

/// Like [`parse_query`] but keeps rows as plain value vectors.
pub fn parse_query_simple(response: &Value) -> Vec<Vec<Value>> {
    let data = match response.get("data").and_then(Value::as_array) {
        Some(d) => d,
        None => return Vec::new(),
    };
    data.iter()
        .filter_map(|row| row.as_array())
        .map(|cells| {
            cells
                .iter()
                .map(|cell| cell.get(1).cloned().unwrap_or(Value::Null))
                .collect()
        })
        .collect()
}
