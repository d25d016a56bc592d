//! Fixed-schema tabular values handed across component boundaries.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// Fixed-width codes and labels; never coerced to numbers.
    Text,
    /// Numeric with explicit missing.
    Number,
    Flag,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Column {
    pub name: String,
    pub kind: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Text)
    }

    pub fn number(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Number)
    }

    pub fn flag(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Flag)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Text(String),
    Number(f64),
    Flag(bool),
    Missing,
}

impl Value {
    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Value::Flag(v) => Some(*v),
            _ => None,
        }
    }

    fn fits(&self, kind: ColumnType) -> bool {
        matches!(
            (self, kind),
            (Value::Missing, _)
                | (Value::Text(_), ColumnType::Text)
                | (Value::Number(_), ColumnType::Number)
                | (Value::Flag(_), ColumnType::Flag)
        )
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Text(_) => "text",
            Value::Number(_) => "number",
            Value::Flag(_) => "flag",
            Value::Missing => "missing",
        }
    }
}

impl From<Option<f64>> for Value {
    fn from(value: Option<f64>) -> Self {
        match value {
            Some(v) if v.is_finite() => Value::Number(v),
            _ => Value::Missing,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("duplicate column {0:?}")]
    DuplicateColumn(String),
    #[error("unknown column {0:?}")]
    UnknownColumn(String),
    #[error("row has {found} values but the table has {expected} columns")]
    ArityMismatch { expected: usize, found: usize },
    #[error("column {column:?} expects {expected:?} but got {found}")]
    TypeMismatch {
        column: String,
        expected: ColumnType,
        found: &'static str,
    },
}

/// Ordered columns with declared types; one row per geographic unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Table {
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(columns: Vec<Column>) -> Result<Self, TableError> {
        for (idx, column) in columns.iter().enumerate() {
            if columns[..idx].iter().any(|c| c.name == column.name) {
                return Err(TableError::DuplicateColumn(column.name.clone()));
            }
        }
        Ok(Self {
            columns,
            rows: Vec::new(),
        })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> Result<(), TableError> {
        if row.len() != self.columns.len() {
            return Err(TableError::ArityMismatch {
                expected: self.columns.len(),
                found: row.len(),
            });
        }
        let mut row = row;
        for (value, column) in row.iter_mut().zip(&self.columns) {
            if let Value::Number(v) = value {
                if !v.is_finite() {
                    *value = Value::Missing;
                }
            }
            if !value.fits(column.kind) {
                return Err(TableError::TypeMismatch {
                    column: column.name.clone(),
                    expected: column.kind,
                    found: value.type_name(),
                });
            }
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn rows(&self) -> impl Iterator<Item = RowRef<'_>> {
        self.rows.iter().map(move |values| RowRef {
            table: self,
            values,
        })
    }

    pub fn row(&self, idx: usize) -> Option<RowRef<'_>> {
        self.rows.get(idx).map(|values| RowRef {
            table: self,
            values,
        })
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let col = self.column_index(column)?;
        self.rows.get(row).map(|r| &r[col])
    }

    pub fn column_values(&self, column: &str) -> Result<Vec<&Value>, TableError> {
        let col = self
            .column_index(column)
            .ok_or_else(|| TableError::UnknownColumn(column.to_string()))?;
        Ok(self.rows.iter().map(|r| &r[col]).collect())
    }

    /// Rows matching `predicate`, same schema.
    pub fn filter<F>(&self, predicate: F) -> Table
    where
        F: Fn(&RowRef<'_>) -> bool,
    {
        let rows = self
            .rows()
            .filter(|row| predicate(row))
            .map(|row| row.values.to_vec())
            .collect();
        Table {
            columns: self.columns.clone(),
            rows,
        }
    }

    /// Projection onto `names`, in the given order.
    pub fn select(&self, names: &[&str]) -> Result<Table, TableError> {
        let indices = names
            .iter()
            .map(|name| {
                self.column_index(name)
                    .ok_or_else(|| TableError::UnknownColumn(name.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let columns = indices.iter().map(|&i| self.columns[i].clone()).collect();
        let mut table = Table::new(columns)?;
        table.rows = self
            .rows
            .iter()
            .map(|r| indices.iter().map(|&i| r[i].clone()).collect())
            .collect();
        Ok(table)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RowRef<'a> {
    table: &'a Table,
    values: &'a [Value],
}

impl<'a> RowRef<'a> {
    pub fn get(&self, column: &str) -> Option<&'a Value> {
        self.table.column_index(column).map(|i| &self.values[i])
    }

    pub fn number(&self, column: &str) -> Option<f64> {
        self.get(column).and_then(Value::as_number)
    }

    pub fn text(&self, column: &str) -> Option<&'a str> {
        self.get(column).and_then(Value::as_text)
    }

    pub fn flag(&self, column: &str) -> Option<bool> {
        self.get(column).and_then(Value::as_flag)
    }

    pub fn values(&self) -> &'a [Value] {
        self.values
    }
}
