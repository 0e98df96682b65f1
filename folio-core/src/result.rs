//! Typed tabular execution results.
//!
//! Whatever the dataset stores, results reach the document (and the
//! visualization layer behind it) as a table of typed columns.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

use crate::document::CellId;

/// A single typed value in a result row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// The column type this value naturally belongs to.
    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::Null => ColumnType::Null,
            Value::Bool(_) => ColumnType::Bool,
            Value::Int(_) => ColumnType::Int,
            Value::Float(_) => ColumnType::Float,
            Value::Text(_) => ColumnType::Text,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view used by arithmetic and aggregates.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// SQL-ish truthiness for WHERE clauses. NULL is false.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Text(s) => !s.is_empty(),
        }
    }

    /// Total order used for sorting and comparisons.
    ///
    /// NULL sorts first; numbers compare numerically across Int/Float;
    /// mixed kinds fall back to a fixed kind rank.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                _ => a.rank().cmp(&b.rank()),
            },
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::Text(_) => 3,
        }
    }

    /// Convert into the given column type, widening where needed.
    pub fn coerce(self, ty: ColumnType) -> Value {
        match (ty, self) {
            (_, Value::Null) => Value::Null,
            (ColumnType::Float, Value::Int(i)) => Value::Float(i as f64),
            (ColumnType::Float, Value::Bool(b)) => Value::Float(if b { 1.0 } else { 0.0 }),
            (ColumnType::Int, Value::Bool(b)) => Value::Int(i64::from(b)),
            (ColumnType::Text, v @ (Value::Bool(_) | Value::Int(_) | Value::Float(_))) => {
                Value::Text(v.to_string())
            }
            (_, v) => v,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => write!(f, "{s}"),
        }
    }
}

/// Column type after coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    /// Every value in the column was NULL.
    Null,
    Bool,
    Int,
    Float,
    Text,
}

impl ColumnType {
    /// Smallest type able to hold values of both `self` and `other`.
    pub fn widen(self, other: ColumnType) -> ColumnType {
        use ColumnType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Null, t) | (t, Null) => t,
            (Bool, Int) | (Int, Bool) => Int,
            (Int, Float) | (Float, Int) | (Bool, Float) | (Float, Bool) => Float,
            _ => Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Success,
    Error,
    Timeout,
    Rejected,
}

/// Resources consumed by one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub rows_scanned: u64,
    pub wall_time_ms: u64,
}

/// Outcome of executing one query cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub request_id: Uuid,
    pub cell_id: CellId,
    pub status: ExecutionStatus,
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Value>>,
    /// Rows beyond the configured limit were dropped.
    pub truncated: bool,
    pub error: Option<String>,
    pub usage: ResourceUsage,
}

impl ExecutionResult {
    pub fn success(
        request_id: Uuid,
        cell_id: CellId,
        columns: Vec<Column>,
        rows: Vec<Vec<Value>>,
        truncated: bool,
        usage: ResourceUsage,
    ) -> Self {
        Self {
            request_id,
            cell_id,
            status: ExecutionStatus::Success,
            columns,
            rows,
            truncated,
            error: None,
            usage,
        }
    }

    /// A result carrying no rows, only a status and a description.
    pub fn failure(
        request_id: Uuid,
        cell_id: CellId,
        status: ExecutionStatus,
        error: impl Into<String>,
        usage: ResourceUsage,
    ) -> Self {
        Self {
            request_id,
            cell_id,
            status,
            columns: Vec::new(),
            rows: Vec::new(),
            truncated: false,
            error: Some(error.into()),
            usage,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}
