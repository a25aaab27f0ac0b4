//! Column-oriented batch shared by the transform, validation and load stages.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Int,
    Float,
    Bool,
    Timestamp,
    TagSet,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Tags(BTreeSet<String>),
    /// Raw text that could not be coerced to the column's declared type.
    Invalid(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view; integers widen to float.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_tags(&self) -> Option<&BTreeSet<String>> {
        match self {
            Value::Tags(v) => Some(v),
            _ => None,
        }
    }

    /// Whether the value can live in a column of `kind`. Nulls fit anywhere.
    pub fn fits(&self, kind: ColumnType) -> bool {
        match (self, kind) {
            (Value::Null, _) => true,
            (Value::Text(_), ColumnType::Text) => true,
            (Value::Int(_), ColumnType::Int | ColumnType::Float) => true,
            (Value::Float(_), ColumnType::Float) => true,
            (Value::Bool(_), ColumnType::Bool) => true,
            (Value::Timestamp(_), ColumnType::Timestamp) => true,
            (Value::Tags(_), ColumnType::TagSet) => true,
            _ => false,
        }
    }

    /// Human-readable rendering used for keys, reports and text casts.
    pub fn render(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Text(s) | Value::Invalid(s) => s.clone(),
            Value::Int(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Bool(v) => v.to_string(),
            Value::Timestamp(v) => v.to_rfc3339(),
            Value::Tags(v) => v.iter().cloned().collect::<Vec<_>>().join(";"),
        }
    }
}

/// Where a row came from: caller-given source index and data-row number within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowOrdinal {
    pub source: u32,
    pub row: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnType,
    pub values: Vec<Value>,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnType, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            kind,
            values,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum BatchError {
    #[error("column {column} has {actual} values, batch has {expected} rows")]
    LengthMismatch {
        column: String,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnBatch {
    columns: Vec<Column>,
    ordinals: Vec<RowOrdinal>,
}

impl ColumnBatch {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(columns: Vec<Column>, ordinals: Vec<RowOrdinal>) -> Result<Self, BatchError> {
        for column in &columns {
            if column.values.len() != ordinals.len() {
                return Err(BatchError::LengthMismatch {
                    column: column.name.clone(),
                    expected: ordinals.len(),
                    actual: column.values.len(),
                });
            }
        }
        Ok(Self { columns, ordinals })
    }

    /// Untyped batch straight off a raw reader: every cell is text, empty cells are null,
    /// short rows are padded with nulls.
    pub fn from_text_rows(
        headers: &[String],
        rows: Vec<Vec<String>>,
        ordinals: Vec<RowOrdinal>,
    ) -> Result<Self, BatchError> {
        let mut columns = headers
            .iter()
            .map(|h| Column::new(h.clone(), ColumnType::Text, Vec::with_capacity(rows.len())))
            .collect::<Vec<_>>();
        for row in rows {
            let mut cells = row.into_iter();
            for column in columns.iter_mut() {
                let value = match cells.next() {
                    Some(cell) if !cell.trim().is_empty() => Value::Text(cell),
                    _ => Value::Null,
                };
                column.values.push(value);
            }
        }
        Self::new(columns, ordinals)
    }

    pub fn num_rows(&self) -> usize {
        self.ordinals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordinals.is_empty()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn ordinals(&self) -> &[RowOrdinal] {
        &self.ordinals
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut Column> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    pub fn value(&self, column: &str, row: usize) -> Option<&Value> {
        self.column(column).and_then(|c| c.values.get(row))
    }

    /// Adds `column`, replacing any existing column of the same name in place.
    pub fn put_column(&mut self, column: Column) -> Result<(), BatchError> {
        if column.values.len() != self.num_rows() {
            return Err(BatchError::LengthMismatch {
                column: column.name,
                expected: self.num_rows(),
                actual: column.values.len(),
            });
        }
        match self.columns.iter_mut().find(|c| c.name == column.name) {
            Some(existing) => *existing = column,
            None => self.columns.push(column),
        }
        Ok(())
    }

    /// Returns false when `from` is absent. When `to` already exists the two are coalesced:
    /// `to` keeps its non-null cells, takes `from`'s cell where it is null, and `from` is
    /// dropped. Alias chains therefore keep the first alias present.
    pub fn rename(&mut self, from: &str, to: &str) -> bool {
        if from == to {
            return self.column(from).is_some();
        }
        let Some(source) = self.columns.iter().position(|c| c.name == from) else {
            return false;
        };
        if self.column(to).is_none() {
            self.columns[source].name = to.to_string();
            return true;
        }
        let source = self.columns.remove(source);
        if let Some(target) = self.column_mut(to) {
            for (cell, incoming) in target.values.iter_mut().zip(source.values) {
                if cell.is_null() {
                    *cell = incoming;
                }
            }
        }
        true
    }

    /// Projection in the given order; absent columns become all-null text columns.
    pub fn select(&self, names: &[String]) -> ColumnBatch {
        let columns = names
            .iter()
            .map(|name| match self.column(name) {
                Some(c) => c.clone(),
                None => Column::new(name.clone(), ColumnType::Text, vec![Value::Null; self.num_rows()]),
            })
            .collect();
        ColumnBatch {
            columns,
            ordinals: self.ordinals.clone(),
        }
    }

    pub fn filter(&self, keep: &[bool]) -> ColumnBatch {
        let indices = keep
            .iter()
            .enumerate()
            .filter_map(|(i, k)| k.then_some(i))
            .collect::<Vec<_>>();
        self.take(&indices)
    }

    pub fn take(&self, indices: &[usize]) -> ColumnBatch {
        let columns = self
            .columns
            .iter()
            .map(|c| Column {
                name: c.name.clone(),
                kind: c.kind,
                values: indices.iter().map(|&i| c.values[i].clone()).collect(),
            })
            .collect();
        ColumnBatch {
            columns,
            ordinals: indices.iter().map(|&i| self.ordinals[i]).collect(),
        }
    }

    /// Row `i` laid out in `layout` order; columns missing from this batch yield nulls.
    pub fn row_values(&self, i: usize, layout: &[String]) -> Vec<Value> {
        layout
            .iter()
            .map(|name| self.value(name, i).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Concatenates batches using the first batch's column layout.
    pub fn concat(batches: Vec<ColumnBatch>) -> ColumnBatch {
        let mut iter = batches.into_iter().filter(|b| !b.columns.is_empty());
        let Some(mut out) = iter.next() else {
            return ColumnBatch::empty();
        };
        let layout = out.column_names();
        for batch in iter {
            for i in 0..batch.num_rows() {
                for (column, value) in out.columns.iter_mut().zip(batch.row_values(i, &layout)) {
                    column.values.push(value);
                }
            }
            out.ordinals.extend_from_slice(&batch.ordinals);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ordinals(n: u64) -> Vec<RowOrdinal> {
        (0..n).map(|row| RowOrdinal { source: 0, row }).collect()
    }

    #[test]
    fn text_rows_pad_short_rows_and_null_empty_cells() {
        let headers = vec!["a".to_string(), "b".to_string()];
        let rows = vec![vec!["1".into(), "".into()], vec!["2".into()]];
        let batch = ColumnBatch::from_text_rows(&headers, rows, ordinals(2)).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.value("a", 1), Some(&Value::Text("2".into())));
        assert_eq!(batch.value("b", 0), Some(&Value::Null));
        assert_eq!(batch.value("b", 1), Some(&Value::Null));
    }

    #[test]
    fn rename_coalesces_into_existing_target() {
        let headers = vec!["Tags".to_string(), "steamspy_tags".to_string(), "AppID".to_string()];
        let rows = vec![
            vec!["RPG,Indie".into(), "Action".into(), "7".into()],
            vec!["".into(), "Puzzle".into(), "8".into()],
        ];
        let mut batch = ColumnBatch::from_text_rows(&headers, rows, ordinals(2)).unwrap();
        assert!(batch.rename("Tags", "tags_raw"));
        assert!(batch.rename("steamspy_tags", "tags_raw"));
        assert_eq!(batch.column_names(), vec!["tags_raw".to_string(), "AppID".to_string()]);
        assert_eq!(batch.value("tags_raw", 0), Some(&Value::Text("RPG,Indie".into())));
        assert_eq!(batch.value("tags_raw", 1), Some(&Value::Text("Puzzle".into())));

        assert!(batch.rename("AppID", "game_id"));
        assert_eq!(batch.value("game_id", 1), Some(&Value::Text("8".into())));
        assert!(!batch.rename("missing", "x"));
    }

    #[test]
    fn concat_aligns_by_name() {
        let a = ColumnBatch::from_text_rows(
            &["x".to_string(), "y".to_string()],
            vec![vec!["1".into(), "2".into()]],
            ordinals(1),
        )
        .unwrap();
        let b = ColumnBatch::from_text_rows(
            &["y".to_string()],
            vec![vec!["3".into()]],
            vec![RowOrdinal { source: 1, row: 0 }],
        )
        .unwrap();
        let joined = ColumnBatch::concat(vec![a, b]);
        assert_eq!(joined.num_rows(), 2);
        assert_eq!(joined.value("x", 1), Some(&Value::Null));
        assert_eq!(joined.value("y", 1), Some(&Value::Text("3".into())));
        assert_eq!(joined.ordinals()[1].source, 1);
    }

    #[test]
    fn put_column_rejects_wrong_length() {
        let mut batch = ColumnBatch::from_text_rows(&["x".to_string()], vec![vec!["1".into()]], ordinals(1)).unwrap();
        let err = batch
            .put_column(Column::new("y", ColumnType::Int, vec![]))
            .unwrap_err();
        assert!(matches!(err, BatchError::LengthMismatch { .. }));
    }
}
