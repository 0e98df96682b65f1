//! # Query sandbox
//!
//! Runs read-only queries against the shared [`Dataset`] under row and
//! wall-clock bounds, and turns whatever happens into a typed
//! [`ExecutionResult`].
//!
//! ```text
//! query ──► check() ──► spawn_blocking(dataset) ──► coerce ──► ExecutionResult
//!             │               │ timeout                          (Success)
//!             │               └──► cancel flag set ──► Timeout
//!             └──► Rejected (mutation, unsupported, syntax)
//! ```
//!
//! Mutating statements are refused before a dataset is ever called.

pub mod dataset;
mod eval;
pub mod sql;

use std::sync::Arc;
use std::time::Instant;

use folio_core::{
    CellId, Column, ColumnType, DocId, ExecutionResult, ExecutionStatus, ResourceUsage, SessionId,
    Value,
};
use thiserror::Error;
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::protocol::ErrorKind;

pub use dataset::{CancelFlag, Dataset, DatasetError, MemoryDataset, QueryRequest, RawTable, Table};
pub use sql::{Select, SqlError, Statement};

/// One accepted request to execute a query cell.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub request_id: Uuid,
    pub doc_id: DocId,
    pub cell_id: CellId,
    pub query: String,
    pub session: SessionId,
    pub submitted_at: Instant,
}

impl ExecutionRequest {
    pub fn new(doc_id: DocId, cell_id: CellId, session: SessionId, query: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            doc_id,
            cell_id,
            query: query.into(),
            session,
            submitted_at: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SandboxError {
    #[error("query is {len} bytes, limit is {max}")]
    QueryTooLong { len: usize, max: usize },

    #[error("syntax error: {0}")]
    Syntax(#[from] SqlError),

    #[error("{keyword} statements are not allowed; only read-only SELECT queries can run")]
    MutationRejected { keyword: String },

    #[error("{keyword} statements are not supported; only SELECT queries can run")]
    Unsupported { keyword: String },

    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

impl SandboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::Dataset(_) => ErrorKind::ExecutionError,
            _ => ErrorKind::RejectedQuery,
        }
    }

    fn status(&self) -> ExecutionStatus {
        match self {
            SandboxError::Dataset(_) => ExecutionStatus::Error,
            _ => ExecutionStatus::Rejected,
        }
    }
}

enum Attempt {
    Done(Result<RawTable, SandboxError>),
    TimedOut,
}

/// Bounded, read-only query executor.
pub struct QuerySandbox {
    dataset: Arc<dyn Dataset>,
    config: SandboxConfig,
}

impl QuerySandbox {
    pub fn new(dataset: Arc<dyn Dataset>, config: SandboxConfig) -> Self {
        Self { dataset, config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Parse and classify a query without running it.
    pub fn check(&self, query: &str) -> Result<Select, SandboxError> {
        if query.len() > self.config.max_query_len {
            return Err(SandboxError::QueryTooLong {
                len: query.len(),
                max: self.config.max_query_len,
            });
        }
        match sql::parse(query)? {
            Statement::Select(select) => Ok(select),
            Statement::Mutation { keyword } => Err(SandboxError::MutationRejected { keyword }),
            Statement::Other { keyword } => Err(SandboxError::Unsupported { keyword }),
        }
    }

    /// Execute `request`, never exceeding the configured bounds. Setting
    /// `cancel` stops the dataset call at its next check. A timeout only
    /// cancels this call, never the caller's flag.
    pub async fn execute(&self, request: &ExecutionRequest, cancel: CancelFlag) -> ExecutionResult {
        let cancel = cancel.child();
        let started = Instant::now();
        let failure = |status, message: String, rows_scanned| {
            ExecutionResult::failure(
                request.request_id,
                request.cell_id,
                status,
                message,
                ResourceUsage {
                    rows_scanned,
                    wall_time_ms: started.elapsed().as_millis() as u64,
                },
            )
        };

        let statement = match self.check(&request.query) {
            Ok(statement) => statement,
            Err(e) => {
                log::info!("Rejected query for cell {}: {e}", request.cell_id);
                return failure(e.status(), e.to_string(), 0);
            }
        };

        let query = QueryRequest {
            text: request.query.clone(),
            statement,
            // One extra row tells us whether the result was cut.
            row_limit: self.config.row_limit.saturating_add(1),
            time_limit: self.config.time_limit,
            cancel: cancel.clone(),
            cancel_check_rows: self.config.cancel_check_rows,
        };
        let deadline = started + self.config.time_limit;

        let mut retried = false;
        let attempt = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let dataset = Arc::clone(&self.dataset);
            let q = query.clone();
            let mut task = tokio::task::spawn_blocking(move || dataset.run_read_only_query(&q));
            match tokio::time::timeout(remaining, &mut task).await {
                Err(_) => {
                    // Dropping the handle would not stop the thread. Wait for
                    // it so callers holding permits keep them until it ends.
                    cancel.cancel();
                    if let Err(join) = task.await {
                        log::warn!("Cancelled query task for cell {} failed: {join}", request.cell_id);
                    }
                    break Attempt::TimedOut;
                }
                Ok(Err(join)) => {
                    let message = format!("query task failed: {join}");
                    break Attempt::Done(Err(DatasetError::Failed(message).into()));
                }
                Ok(Ok(Err(DatasetError::Transient(reason)))) if !retried => {
                    log::debug!("Transient failure on cell {}, retrying: {reason}", request.cell_id);
                    retried = true;
                    tokio::time::sleep(self.config.retry_backoff.min(remaining)).await;
                }
                Ok(Ok(result)) => break Attempt::Done(result.map_err(SandboxError::from)),
            }
        };

        match attempt {
            Attempt::TimedOut => {
                log::warn!(
                    "Query for cell {} exceeded {} ms",
                    request.cell_id,
                    self.config.time_limit.as_millis()
                );
                let message = format!(
                    "query exceeded time limit of {} ms",
                    self.config.time_limit.as_millis()
                );
                failure(ExecutionStatus::Timeout, message, 0)
            }
            Attempt::Done(Err(e)) => failure(e.status(), e.to_string(), 0),
            Attempt::Done(Ok(raw)) => {
                let rows_scanned = raw.rows_scanned;
                let (columns, rows, truncated) = typed(raw, self.config.row_limit);
                let usage = ResourceUsage {
                    rows_scanned,
                    wall_time_ms: started.elapsed().as_millis() as u64,
                };
                log::debug!(
                    "Executed cell {}: {} rows in {} ms{}",
                    request.cell_id,
                    rows.len(),
                    usage.wall_time_ms,
                    if truncated { " (truncated)" } else { "" }
                );
                ExecutionResult::success(request.request_id, request.cell_id, columns, rows, truncated, usage)
            }
        }
    }
}

/// Cut to `row_limit` rows, infer one type per column and coerce every
/// value into it.
fn typed(raw: RawTable, row_limit: usize) -> (Vec<Column>, Vec<Vec<Value>>, bool) {
    let RawTable { columns, mut rows, .. } = raw;
    let truncated = rows.len() > row_limit;
    rows.truncate(row_limit);

    let mut types = vec![ColumnType::Null; columns.len()];
    for row in &rows {
        for (ty, value) in types.iter_mut().zip(row) {
            *ty = ty.widen(value.column_type());
        }
    }
    let rows = rows
        .into_iter()
        .map(|row| row.into_iter().zip(&types).map(|(v, ty)| v.coerce(*ty)).collect())
        .collect();
    let columns = columns
        .into_iter()
        .zip(&types)
        .map(|(name, ty)| Column { name, ty: *ty })
        .collect();
    (columns, rows, truncated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn sandbox(dataset: impl Dataset) -> QuerySandbox {
        QuerySandbox::new(Arc::new(dataset), SandboxConfig::for_testing())
    }

    fn request(query: &str) -> ExecutionRequest {
        ExecutionRequest::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), query)
    }

    #[derive(Clone, Default)]
    struct CountingDataset {
        calls: Arc<AtomicUsize>,
    }

    impl Dataset for CountingDataset {
        fn run_read_only_query(&self, _request: &QueryRequest) -> Result<RawTable, DatasetError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RawTable::default())
        }
    }

    /// Spins until cancelled, recording that it saw the cancellation.
    #[derive(Clone, Default)]
    struct SlowDataset {
        observed_cancel: Arc<AtomicBool>,
    }

    impl Dataset for SlowDataset {
        fn run_read_only_query(&self, request: &QueryRequest) -> Result<RawTable, DatasetError> {
            loop {
                if let Err(e) = request.cancel.checkpoint() {
                    self.observed_cancel.store(true, Ordering::SeqCst);
                    return Err(e);
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }

    /// Fails transiently on the first call only.
    #[derive(Clone, Default)]
    struct FlakyDataset {
        calls: Arc<AtomicUsize>,
    }

    impl Dataset for FlakyDataset {
        fn run_read_only_query(&self, request: &QueryRequest) -> Result<RawTable, DatasetError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(DatasetError::Transient("connection reset".into()));
            }
            MemoryDataset::demo().run_read_only_query(request)
        }
    }

    #[test]
    fn test_check_classifies() {
        let sandbox = sandbox(MemoryDataset::demo());
        assert!(sandbox.check("select * from sales").is_ok());
        assert_eq!(
            sandbox.check("DELETE FROM sales"),
            Err(SandboxError::MutationRejected { keyword: "DELETE".into() })
        );
        assert!(matches!(sandbox.check("EXPLAIN SELECT 1"), Err(SandboxError::Unsupported { .. })));
        assert!(matches!(sandbox.check("SELECT FROM"), Err(SandboxError::Syntax(_))));
        let long = format!("SELECT {}", "1 + ".repeat(400));
        assert!(matches!(sandbox.check(&long), Err(SandboxError::QueryTooLong { .. })));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            SandboxError::MutationRejected { keyword: "DROP".into() }.kind(),
            ErrorKind::RejectedQuery
        );
        assert_eq!(SandboxError::Dataset(DatasetError::Cancelled).kind(), ErrorKind::ExecutionError);
    }

    #[tokio::test]
    async fn test_mutation_never_reaches_dataset() {
        let dataset = CountingDataset::default();
        let calls = Arc::clone(&dataset.calls);
        let sandbox = sandbox(dataset);

        for query in ["DROP TABLE sales", "select 1; delete from sales", "UPDATE sales SET amount = 0"] {
            let result = sandbox.execute(&request(query), CancelFlag::new()).await;
            assert_ne!(result.status, ExecutionStatus::Success, "{query}");
        }
        let result = sandbox.execute(&request("WITH x AS (SELECT 1) INSERT INTO t SELECT 1"), CancelFlag::new()).await;
        assert_eq!(result.status, ExecutionStatus::Rejected);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        sandbox.execute(&request("SELECT 1"), CancelFlag::new()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deeply_nested_query_rejected() {
        let dataset = CountingDataset::default();
        let calls = Arc::clone(&dataset.calls);
        let sandbox = sandbox(dataset);

        let query = format!("SELECT {}1{}", "(".repeat(400), ")".repeat(400));
        let result = sandbox.execute(&request(&query), CancelFlag::new()).await;
        assert_eq!(result.status, ExecutionStatus::Rejected);
        assert!(result.error.unwrap().contains("nests deeper"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_string_literal_keyword_is_allowed() {
        let sandbox = sandbox(MemoryDataset::demo());
        let result = sandbox
            .execute(&request("SELECT id FROM sales WHERE product = 'DELETE'"), CancelFlag::new())
            .await;
        assert!(result.is_success(), "{:?}", result.error);
        assert!(result.rows.is_empty());
    }

    #[tokio::test]
    async fn test_rows_truncated_at_limit() {
        let sandbox = sandbox(MemoryDataset::demo());

        let result = sandbox.execute(&request("SELECT * FROM sales"), CancelFlag::new()).await;
        assert!(result.is_success());
        assert_eq!(result.rows.len(), 3);
        assert!(result.truncated);

        let result = sandbox.execute(&request("SELECT id FROM sales LIMIT 3"), CancelFlag::new()).await;
        assert_eq!(result.rows.len(), 3);
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn test_demo_aggregate_is_typed() {
        let sandbox = sandbox(MemoryDataset::demo());
        let result = sandbox
            .execute(
                &request("SELECT country, SUM(amount) AS total FROM sales GROUP BY country ORDER BY total DESC"),
                CancelFlag::new(),
            )
            .await;
        assert!(result.is_success());
        assert_eq!(
            result.columns,
            vec![
                Column { name: "country".into(), ty: ColumnType::Text },
                Column { name: "total".into(), ty: ColumnType::Float },
            ]
        );
        assert_eq!(result.rows[0], vec![Value::Text("US".into()), Value::Float(400.5)]);
        assert_eq!(result.usage.rows_scanned, 6);
    }

    #[tokio::test]
    async fn test_mixed_column_widened() {
        let table = Table::new("t", &["x"])
            .with_row(vec![Value::Int(1)])
            .with_row(vec![Value::Float(2.5)])
            .with_row(vec![Value::Null]);
        let sandbox = sandbox(MemoryDataset::new().with_table(table));
        let result = sandbox.execute(&request("SELECT x FROM t"), CancelFlag::new()).await;
        assert_eq!(result.columns[0].ty, ColumnType::Float);
        assert_eq!(
            result.rows,
            vec![vec![Value::Float(1.0)], vec![Value::Float(2.5)], vec![Value::Null]]
        );
    }

    #[tokio::test]
    async fn test_timeout_cancels_dataset() {
        let dataset = SlowDataset::default();
        let observed = Arc::clone(&dataset.observed_cancel);
        let sandbox = sandbox(dataset);

        let caller = CancelFlag::new();
        let started = Instant::now();
        let result = sandbox.execute(&request("SELECT 1"), caller.clone()).await;
        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert!(!caller.is_cancelled());
        assert!(result.rows.is_empty());
        assert!(started.elapsed() < Duration::from_secs(2));
        // The dataset thread has stopped by the time the result exists.
        assert!(observed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_external_cancel() {
        let sandbox = sandbox(SlowDataset::default());
        let cancel = CancelFlag::new();
        cancel.cancel();
        let result = sandbox.execute(&request("SELECT 1"), cancel).await;
        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(result.error.as_deref(), Some("query cancelled"));
    }

    #[tokio::test]
    async fn test_transient_failure_retried_once() {
        let dataset = FlakyDataset::default();
        let calls = Arc::clone(&dataset.calls);
        let sandbox = sandbox(dataset);

        let result = sandbox.execute(&request("SELECT COUNT(*) FROM sales"), CancelFlag::new()).await;
        assert!(result.is_success());
        assert_eq!(result.rows, vec![vec![Value::Int(6)]]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dataset_error_reported() {
        let sandbox = sandbox(MemoryDataset::demo());
        let result = sandbox.execute(&request("SELECT nope FROM sales"), CancelFlag::new()).await;
        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(result.error.as_deref(), Some("query failed: no such column: nope"));
    }
}
