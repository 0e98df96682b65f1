//! The dataset collaborator seen by the sandbox, plus an in-memory
//! implementation.
//!
//! Any storage engine can sit behind [`Dataset`] as long as it honours the
//! request's row bound and checks the [`CancelFlag`] between work units.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use folio_core::Value;
use thiserror::Error;

use super::eval;
use super::sql::Select;

/// Cooperative cancellation shared between the scheduler, the sandbox and
/// the dataset call. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    cancelled: Arc<AtomicBool>,
    parent: Option<Arc<CancelFlag>>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// A flag that is cancelled with `self` but can also be cancelled on its
    /// own without touching `self`.
    pub fn child(&self) -> Self {
        Self {
            cancelled: Arc::default(),
            parent: Some(Arc::new(self.clone())),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// Yield point for long-running work.
    pub fn checkpoint(&self) -> Result<(), DatasetError> {
        if self.is_cancelled() {
            Err(DatasetError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// One read-only query handed to a dataset.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub text: String,
    pub statement: Select,
    /// Maximum rows to return
    pub row_limit: usize,
    pub time_limit: Duration,
    pub cancel: CancelFlag,
    /// Rows processed between cancellation checks
    pub cancel_check_rows: usize,
}

/// Untyped rows as produced by the dataset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub rows_scanned: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatasetError {
    /// Worth one retry (lock contention, connection reset)
    #[error("transient dataset failure: {0}")]
    Transient(String),
    #[error("query failed: {0}")]
    Failed(String),
    #[error("query cancelled")]
    Cancelled,
}

/// Read access to the shared dataset.
///
/// Called from a blocking thread; implementations may block.
pub trait Dataset: Send + Sync + 'static {
    fn run_read_only_query(&self, request: &QueryRequest) -> Result<RawTable, DatasetError>;
}

/// An immutable table.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn with_row(mut self, row: Vec<Value>) -> Self {
        self.rows.push(row);
        self
    }
}

/// Tables held in memory. Each query reads an `Arc` snapshot of its table,
/// so concurrent queries share nothing mutable.
#[derive(Debug, Clone, Default)]
pub struct MemoryDataset {
    tables: HashMap<String, Arc<Table>>,
}

impl MemoryDataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: Table) -> Self {
        self.tables.insert(table.name.to_ascii_lowercase(), Arc::new(table));
        self
    }

    pub fn table(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.get(&name.to_ascii_lowercase()).cloned()
    }

    /// The `sales` demo table.
    pub fn demo() -> Self {
        let rows: [(&str, &str, &str, f64); 6] = [
            ("2025-01-01", "US", "A", 120.50),
            ("2025-01-02", "US", "B", 80.00),
            ("2025-01-03", "FR", "A", 75.00),
            ("2025-02-01", "US", "A", 200.00),
            ("2025-02-05", "FR", "B", 150.00),
            ("2025-03-01", "MA", "A", 50.00),
        ];
        let table = rows.iter().enumerate().fold(
            Table::new("sales", &["id", "date", "country", "product", "amount"]),
            |table, (i, (date, country, product, amount))| {
                table.with_row(vec![
                    Value::Int(i as i64 + 1),
                    Value::Text(date.to_string()),
                    Value::Text(country.to_string()),
                    Value::Text(product.to_string()),
                    Value::Float(*amount),
                ])
            },
        );
        Self::new().with_table(table)
    }
}

impl Dataset for MemoryDataset {
    fn run_read_only_query(&self, request: &QueryRequest) -> Result<RawTable, DatasetError> {
        let table = match &request.statement.from {
            Some(name) => Some(
                self.table(name)
                    .ok_or_else(|| DatasetError::Failed(format!("no such table: {name}")))?,
            ),
            None => None,
        };
        eval::evaluate(&request.statement, table.as_deref(), request)
    }
}
