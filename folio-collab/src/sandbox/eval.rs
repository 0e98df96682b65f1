//! Evaluation of a parsed [`Select`] against one in-memory table.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use folio_core::Value;

use super::dataset::{DatasetError, QueryRequest, RawTable, Table};
use super::sql::{AggFunc, BinaryOp, Expr, Select, SelectItem};

/// Row values compared with [`Value::total_cmp`], usable as a map key.
#[derive(Debug, Clone)]
struct RowKey(Vec<Value>);

impl PartialEq for RowKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RowKey {}

impl PartialOrd for RowKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RowKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(&other.0) {
            match a.total_cmp(b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

enum Scope<'a> {
    Row(&'a [Value]),
    Group(&'a [&'a [Value]]),
}

struct Evaluator<'a> {
    schema: &'a [String],
}

fn failed(message: impl Into<String>) -> DatasetError {
    DatasetError::Failed(message.into())
}

impl Evaluator<'_> {
    fn column(&self, name: &str) -> Result<usize, DatasetError> {
        self.schema
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .ok_or_else(|| failed(format!("no such column: {name}")))
    }

    /// Resolve every column reference up front so unknown names fail even
    /// on an empty table.
    fn check(&self, expr: &Expr) -> Result<(), DatasetError> {
        match expr {
            Expr::Column(name) => self.column(name).map(|_| ()),
            Expr::Literal(_) | Expr::Aggregate { arg: None, .. } => Ok(()),
            Expr::Aggregate { arg: Some(e), .. } | Expr::Not(e) | Expr::Neg(e) => self.check(e),
            Expr::IsNull { expr, .. } => self.check(expr),
            Expr::Binary { left, right, .. } => {
                self.check(left)?;
                self.check(right)
            }
            Expr::Like { expr, pattern, .. } => {
                self.check(expr)?;
                self.check(pattern)
            }
        }
    }

    fn eval(&self, expr: &Expr, scope: &Scope<'_>) -> Result<Value, DatasetError> {
        match expr {
            Expr::Column(name) => {
                let index = self.column(name)?;
                Ok(match scope {
                    Scope::Row(row) => row[index].clone(),
                    Scope::Group(rows) => rows.first().map(|r| r[index].clone()).unwrap_or(Value::Null),
                })
            }
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Not(inner) => Ok(match self.eval(inner, scope)? {
                Value::Null => Value::Null,
                v => Value::Bool(!v.is_truthy()),
            }),
            Expr::Neg(inner) => match self.eval(inner, scope)? {
                Value::Null => Ok(Value::Null),
                Value::Int(i) => Ok(i.checked_neg().map(Value::Int).unwrap_or(Value::Float(-(i as f64)))),
                Value::Float(x) => Ok(Value::Float(-x)),
                other => Err(failed(format!("cannot negate {other}"))),
            },
            Expr::Binary { op: BinaryOp::And, left, right } => {
                let (l, r) = (self.eval(left, scope)?, self.eval(right, scope)?);
                Ok(match (truth(&l), truth(&r)) {
                    (Some(false), _) | (_, Some(false)) => Value::Bool(false),
                    (Some(true), Some(true)) => Value::Bool(true),
                    _ => Value::Null,
                })
            }
            Expr::Binary { op: BinaryOp::Or, left, right } => {
                let (l, r) = (self.eval(left, scope)?, self.eval(right, scope)?);
                Ok(match (truth(&l), truth(&r)) {
                    (Some(true), _) | (_, Some(true)) => Value::Bool(true),
                    (Some(false), Some(false)) => Value::Bool(false),
                    _ => Value::Null,
                })
            }
            Expr::Binary { op, left, right } => {
                binary(*op, self.eval(left, scope)?, self.eval(right, scope)?)
            }
            Expr::Like { expr, pattern, negated } => {
                let (value, pattern) = (self.eval(expr, scope)?, self.eval(pattern, scope)?);
                if value.is_null() || pattern.is_null() {
                    return Ok(Value::Null);
                }
                Ok(Value::Bool(like(&value.to_string(), &pattern.to_string()) != *negated))
            }
            Expr::IsNull { expr, negated } => {
                Ok(Value::Bool(self.eval(expr, scope)?.is_null() != *negated))
            }
            Expr::Aggregate { func, arg } => match scope {
                Scope::Row(_) => Err(failed(format!("aggregate {expr} is not allowed here"))),
                Scope::Group(rows) => self.aggregate(*func, arg.as_deref(), rows),
            },
        }
    }

    fn aggregate(&self, func: AggFunc, arg: Option<&Expr>, rows: &[&[Value]]) -> Result<Value, DatasetError> {
        let Some(arg) = arg else {
            return Ok(Value::Int(rows.len() as i64));
        };
        let mut values = Vec::with_capacity(rows.len());
        for row in rows {
            let value = self.eval(arg, &Scope::Row(row))?;
            if !value.is_null() {
                values.push(value);
            }
        }
        match func {
            AggFunc::Count => Ok(Value::Int(values.len() as i64)),
            AggFunc::Min => Ok(values.into_iter().min_by(|a, b| a.total_cmp(b)).unwrap_or(Value::Null)),
            AggFunc::Max => Ok(values.into_iter().max_by(|a, b| a.total_cmp(b)).unwrap_or(Value::Null)),
            AggFunc::Sum | AggFunc::Avg if values.is_empty() => Ok(Value::Null),
            AggFunc::Sum => {
                let ints: Option<i64> = values.iter().try_fold(0i64, |acc, v| match v {
                    Value::Int(i) => acc.checked_add(*i),
                    _ => None,
                });
                match ints {
                    Some(total) => Ok(Value::Int(total)),
                    None => numeric_sum(&values).map(Value::Float),
                }
            }
            AggFunc::Avg => Ok(Value::Float(numeric_sum(&values)? / values.len() as f64)),
        }
    }

    fn project(&self, items: &[SelectItem], scope: &Scope<'_>) -> Result<Vec<Value>, DatasetError> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match (item, scope) {
                (SelectItem::Wildcard, Scope::Row(row)) => out.extend(row.iter().cloned()),
                (SelectItem::Wildcard, Scope::Group(_)) => {
                    return Err(failed("* cannot be combined with GROUP BY or aggregates"));
                }
                (SelectItem::Expr { expr, .. }, _) => out.push(self.eval(expr, scope)?),
            }
        }
        Ok(out)
    }
}

fn truth(value: &Value) -> Option<bool> {
    match value {
        Value::Null => None,
        v => Some(v.is_truthy()),
    }
}

fn numeric_sum(values: &[Value]) -> Result<f64, DatasetError> {
    values.iter().try_fold(0.0, |acc, v| {
        v.as_f64().map(|x| acc + x).ok_or_else(|| failed(format!("cannot aggregate non-numeric value {v}")))
    })
}

fn binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, DatasetError> {
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }
    let ordering = || left.total_cmp(&right);
    match op {
        BinaryOp::Eq => Ok(Value::Bool(ordering() == Ordering::Equal)),
        BinaryOp::NotEq => Ok(Value::Bool(ordering() != Ordering::Equal)),
        BinaryOp::Lt => Ok(Value::Bool(ordering() == Ordering::Less)),
        BinaryOp::LtEq => Ok(Value::Bool(ordering() != Ordering::Greater)),
        BinaryOp::Gt => Ok(Value::Bool(ordering() == Ordering::Greater)),
        BinaryOp::GtEq => Ok(Value::Bool(ordering() != Ordering::Less)),
        BinaryOp::And | BinaryOp::Or => Err(failed("logical operator evaluated as arithmetic")),
        _ => arithmetic(op, &left, &right),
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, DatasetError> {
    if let (Value::Int(a), Value::Int(b)) = (left, right) {
        let (a, b) = (*a, *b);
        let exact = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Div | BinaryOp::Mod if b == 0 => return Ok(Value::Null),
            BinaryOp::Div => a.checked_div(b),
            BinaryOp::Mod => a.checked_rem(b),
            _ => None,
        };
        if let Some(v) = exact {
            return Ok(Value::Int(v));
        }
    }
    let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) else {
        return Err(failed(format!("cannot apply arithmetic to {left} and {right}")));
    };
    Ok(match op {
        BinaryOp::Add => Value::Float(a + b),
        BinaryOp::Sub => Value::Float(a - b),
        BinaryOp::Mul => Value::Float(a * b),
        BinaryOp::Div | BinaryOp::Mod if b == 0.0 => Value::Null,
        BinaryOp::Div => Value::Float(a / b),
        BinaryOp::Mod => Value::Float(a % b),
        _ => Value::Null,
    })
}

/// Case-insensitive LIKE with `%` and `_` wildcards.
fn like(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.to_lowercase().chars().collect();
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let (mut t, mut p) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '_' || pattern[p] == text[t]) {
            t += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, consumed)) = backtrack {
            p = star + 1;
            t = consumed + 1;
            backtrack = Some((star, consumed + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '%')
}

/// Run `select` over `table` (or a single empty row without FROM).
pub(crate) fn evaluate(select: &Select, table: Option<&Table>, request: &QueryRequest) -> Result<RawTable, DatasetError> {
    let no_table = [Vec::new()];
    let (schema, source): (&[String], &[Vec<Value>]) = match table {
        Some(t) => (&t.columns, &t.rows),
        None => (&[], &no_table),
    };
    let evaluator = Evaluator { schema };
    let aggregate = select.is_aggregate();

    let mut columns = Vec::new();
    for item in &select.items {
        match item {
            SelectItem::Wildcard => columns.extend(schema.iter().cloned()),
            SelectItem::Expr { expr, alias } => {
                evaluator.check(expr)?;
                columns.push(alias.clone().unwrap_or_else(|| expr.to_string()));
            }
        }
    }
    if let Some(filter) = &select.filter {
        evaluator.check(filter)?;
        if filter.has_aggregate() {
            return Err(failed("aggregates are not allowed in WHERE"));
        }
    }
    for expr in &select.group_by {
        evaluator.check(expr)?;
    }

    let cap = select
        .limit
        .map(|l| usize::try_from(l).unwrap_or(usize::MAX))
        .unwrap_or(usize::MAX)
        .min(request.row_limit);
    let check_every = request.cancel_check_rows.max(1) as u64;
    let streaming = !aggregate && !select.distinct && select.order_by.is_empty();

    // Scan and filter.
    let mut scanned = 0u64;
    let mut matched: Vec<&[Value]> = Vec::new();
    let mut rows: Vec<Vec<Value>> = Vec::new();
    for row in source {
        if streaming && rows.len() >= cap {
            break;
        }
        if scanned % check_every == 0 {
            request.cancel.checkpoint()?;
        }
        scanned += 1;
        if let Some(filter) = &select.filter {
            if !evaluator.eval(filter, &Scope::Row(row))?.is_truthy() {
                continue;
            }
        }
        if streaming {
            rows.push(evaluator.project(&select.items, &Scope::Row(row))?);
        } else {
            matched.push(row);
        }
    }
    if table.is_none() {
        scanned = 0;
    }
    if streaming {
        return Ok(RawTable { columns, rows, rows_scanned: scanned });
    }

    // Project, grouping first when aggregating. Each output row carries
    // its sort key.
    let mut keyed: Vec<(Vec<Value>, Vec<Value>)> = Vec::new();
    let sort_key = |projected: &[Value], scope: &Scope<'_>| -> Result<Vec<Value>, DatasetError> {
        select
            .order_by
            .iter()
            .map(|key| match order_target(&key.expr, &columns) {
                Some(index) => Ok(projected[index].clone()),
                None => evaluator.eval(&key.expr, scope),
            })
            .collect()
    };
    if aggregate {
        let mut groups: BTreeMap<RowKey, Vec<&[Value]>> = BTreeMap::new();
        for (i, &row) in matched.iter().enumerate() {
            if i as u64 % check_every == 0 {
                request.cancel.checkpoint()?;
            }
            let key = select
                .group_by
                .iter()
                .map(|expr| evaluator.eval(expr, &Scope::Row(row)))
                .collect::<Result<Vec<_>, _>>()?;
            groups.entry(RowKey(key)).or_default().push(row);
        }
        if groups.is_empty() && select.group_by.is_empty() {
            groups.insert(RowKey(Vec::new()), Vec::new());
        }
        for members in groups.values() {
            let scope = Scope::Group(members);
            let projected = evaluator.project(&select.items, &scope)?;
            keyed.push((sort_key(&projected, &scope)?, projected));
        }
    } else {
        for (i, &row) in matched.iter().enumerate() {
            if i as u64 % check_every == 0 {
                request.cancel.checkpoint()?;
            }
            let scope = Scope::Row(row);
            let projected = evaluator.project(&select.items, &scope)?;
            keyed.push((sort_key(&projected, &scope)?, projected));
        }
    }

    if !select.order_by.is_empty() {
        keyed.sort_by(|(a, _), (b, _)| {
            for ((x, y), key) in a.iter().zip(b).zip(&select.order_by) {
                let ord = x.total_cmp(y);
                let ord = if key.descending { ord.reverse() } else { ord };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
    }

    let mut seen = BTreeSet::new();
    for (_, projected) in keyed {
        if rows.len() >= cap {
            break;
        }
        if select.distinct && !seen.insert(RowKey(projected.clone())) {
            continue;
        }
        rows.push(projected);
    }
    Ok(RawTable { columns, rows, rows_scanned: scanned })
}

/// ORDER BY may name an output column (alias or default name) or a
/// 1-based position.
fn order_target(expr: &Expr, columns: &[String]) -> Option<usize> {
    match expr {
        Expr::Column(name) => columns.iter().position(|c| c.eq_ignore_ascii_case(name)),
        Expr::Literal(Value::Int(n)) if *n >= 1 && (*n as usize) <= columns.len() => Some(*n as usize - 1),
        other => {
            let rendered = other.to_string();
            columns.iter().position(|c| c.eq_ignore_ascii_case(&rendered))
        }
    }
}
