//! Result sets and row mapping.

use indexmap::IndexMap;
use pgstencil_template::Record;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// A row without a target type: output column name to value, in column
/// order.
pub type Row = IndexMap<String, Value>;

/// Rows returned by one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    /// Output column names, in order.
    pub columns: Vec<String>,
    /// One value per column for each row.
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    /// Create a result set.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    /// A result set with columns but no rows.
    pub fn empty(columns: Vec<String>) -> Self {
        Self::new(columns, Vec::new())
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if there are no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Convert into column maps. A repeated column name keeps the last value.
    pub fn into_rows(self) -> Vec<Row> {
        let columns = self.columns;
        self.rows
            .into_iter()
            .map(|values| columns.iter().cloned().zip(values).collect())
            .collect()
    }

    /// Decode every row into `T`, failing on the first row that does not fit.
    pub fn decode<T: Record>(self) -> Result<Vec<T>> {
        let columns = self.columns;
        self.rows
            .into_iter()
            .enumerate()
            .map(|(row, values)| {
                let object: Map<String, Value> = columns.iter().cloned().zip(values).collect();
                serde_json::from_value(Value::Object(object)).map_err(|source| Error::RowMapping {
                    row,
                    type_name: std::any::type_name::<T>(),
                    source,
                })
            })
            .collect()
    }
}
