//! Tokenizer and recursive-descent parser for the read-only SQL subset.
//!
//! Grammar:
//!
//! ```text
//! select   := SELECT [DISTINCT] item {, item} [FROM ident] [WHERE expr]
//!             [GROUP BY expr {, expr}] [ORDER BY key {, key}] [LIMIT int] [;]
//! item     := * | expr [[AS] ident]
//! key      := expr [ASC | DESC]
//! expr     := or
//! or       := and {OR and}
//! and      := not {AND not}
//! not      := NOT not | cmp
//! cmp      := sum [(= | != | <> | < | <= | > | >=) sum
//!                 | [NOT] LIKE sum | IS [NOT] NULL]
//! sum      := term {(+ | -) term}
//! term     := unary {(* | / | %) unary}
//! unary    := - unary | primary
//! primary  := literal | ident[.ident] | agg ( * | expr ) | ( expr )
//! ```
//!
//! Anything else parses to [`Statement::Other`] or fails, and the sandbox
//! rejects it before a dataset is touched.

use std::fmt;

use folio_core::Value;
use thiserror::Error;

/// Keywords that mutate data or schema. Seeing one anywhere in a query
/// makes it a [`Statement::Mutation`].
pub const MUTATING_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "REPLACE", "TRUNCATE", "MERGE",
    "GRANT", "REVOKE", "ATTACH", "DETACH", "PRAGMA", "VACUUM",
];

/// Words that end an expression or a select item.
const RESERVED: &[&str] = &[
    "SELECT", "DISTINCT", "FROM", "WHERE", "GROUP", "BY", "ORDER", "LIMIT", "AS", "AND", "OR",
    "NOT", "LIKE", "IS", "NULL", "ASC", "DESC", "JOIN", "ON", "HAVING", "UNION", "OFFSET",
    "TRUE", "FALSE",
];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SqlError {
    #[error("empty query")]
    Empty,
    #[error("unterminated {0}")]
    Unterminated(&'static str),
    #[error("unexpected character '{0}'")]
    UnexpectedChar(char),
    #[error("expected {expected}, found {found}")]
    Expected { expected: String, found: String },
    #[error("multiple statements are not allowed")]
    MultipleStatements,
    #[error("unsupported syntax: {0}")]
    Unsupported(String),
    #[error("expression nests deeper than {0} levels")]
    TooDeep(usize),
    #[error("expression has more than {0} operators")]
    TooManyOperators(usize),
}

// ─── Tokens ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Unquoted word: keyword or identifier
    Word(String),
    /// Double-quoted identifier
    Quoted(String),
    Int(i64),
    Float(f64),
    Str(String),
    Symbol(&'static str),
}

impl Token {
    fn is_word(&self, keyword: &str) -> bool {
        matches!(self, Token::Word(w) if w.eq_ignore_ascii_case(keyword))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Word(w) => write!(f, "'{w}'"),
            Token::Quoted(w) => write!(f, "\"{w}\""),
            Token::Int(i) => write!(f, "{i}"),
            Token::Float(x) => write!(f, "{x}"),
            Token::Str(s) => write!(f, "string '{s}'"),
            Token::Symbol(s) => write!(f, "'{s}'"),
        }
    }
}

const SYMBOLS: &[&str] = &["<=", ">=", "<>", "!=", "=", "<", ">", "(", ")", ",", ";", "*", "+", "-", "/", "%", "."];

/// Split query text into tokens. Comments are dropped.
pub fn tokenize(text: &str) -> Result<Vec<Token>, SqlError> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '-' && chars.get(i + 1) == Some(&'-') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '/' && chars.get(i + 1) == Some(&'*') {
            let end = (i + 2..chars.len().saturating_sub(1))
                .find(|&j| chars[j] == '*' && chars[j + 1] == '/')
                .ok_or(SqlError::Unterminated("comment"))?;
            i = end + 2;
        } else if c == '\'' || c == '"' {
            let (literal, next) = read_quoted(&chars, i)?;
            tokens.push(if c == '\'' { Token::Str(literal) } else { Token::Quoted(literal) });
            i = next;
        } else if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let raw: String = chars[start..i].iter().collect();
            tokens.push(if raw.contains('.') {
                Token::Float(raw.parse().map_err(|_| SqlError::Unsupported(format!("number {raw}")))?)
            } else {
                Token::Int(raw.parse().map_err(|_| SqlError::Unsupported(format!("number {raw}")))?)
            });
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Word(chars[start..i].iter().collect()));
        } else {
            let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
            let symbol = SYMBOLS
                .iter()
                .copied()
                .find(|s| rest.starts_with(*s))
                .ok_or(SqlError::UnexpectedChar(c))?;
            tokens.push(Token::Symbol(symbol));
            i += symbol.len();
        }
    }
    Ok(tokens)
}

/// Read a quoted literal starting at `start`; a doubled quote escapes itself.
fn read_quoted(chars: &[char], start: usize) -> Result<(String, usize), SqlError> {
    let quote = chars[start];
    let mut out = String::new();
    let mut i = start + 1;
    loop {
        match chars.get(i) {
            None => return Err(SqlError::Unterminated("quoted literal")),
            Some(&c) if c == quote => {
                if chars.get(i + 1) == Some(&quote) {
                    out.push(quote);
                    i += 2;
                } else {
                    return Ok((out, i + 1));
                }
            }
            Some(&c) => {
                out.push(c);
                i += 1;
            }
        }
    }
}

// ─── AST ──────────────────────────────────────────────────────────────

/// A classified statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(Select),
    /// Contains a data or schema mutating keyword
    Mutation { keyword: String },
    /// Any other statement kind (WITH, EXPLAIN, BEGIN, ...)
    Other { keyword: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub distinct: bool,
    pub items: Vec<SelectItem>,
    pub from: Option<String>,
    pub filter: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub order_by: Vec<OrderKey>,
    pub limit: Option<u64>,
}

impl Select {
    /// Whether any output column aggregates rows.
    pub fn is_aggregate(&self) -> bool {
        !self.group_by.is_empty()
            || self.items.iter().any(|item| match item {
                SelectItem::Expr { expr, .. } => expr.has_aggregate(),
                SelectItem::Wildcard => false,
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Wildcard,
    Expr { expr: Expr, alias: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderKey {
    pub expr: Expr,
    pub descending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggFunc {
    fn from_word(word: &str) -> Option<Self> {
        match word.to_ascii_uppercase().as_str() {
            "COUNT" => Some(AggFunc::Count),
            "SUM" => Some(AggFunc::Sum),
            "AVG" => Some(AggFunc::Avg),
            "MIN" => Some(AggFunc::Min),
            "MAX" => Some(AggFunc::Max),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            AggFunc::Count => "COUNT",
            AggFunc::Sum => "SUM",
            AggFunc::Avg => "AVG",
            AggFunc::Min => "MIN",
            AggFunc::Max => "MAX",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinaryOp {
    fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(String),
    Literal(Value),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr> },
    Like { expr: Box<Expr>, pattern: Box<Expr>, negated: bool },
    IsNull { expr: Box<Expr>, negated: bool },
    /// `arg = None` is `COUNT(*)`
    Aggregate { func: AggFunc, arg: Option<Box<Expr>> },
}

impl Expr {
    pub fn has_aggregate(&self) -> bool {
        match self {
            Expr::Aggregate { .. } => true,
            Expr::Column(_) | Expr::Literal(_) => false,
            Expr::Not(e) | Expr::Neg(e) => e.has_aggregate(),
            Expr::Binary { left, right, .. } => left.has_aggregate() || right.has_aggregate(),
            Expr::Like { expr, pattern, .. } => expr.has_aggregate() || pattern.has_aggregate(),
            Expr::IsNull { expr, .. } => expr.has_aggregate(),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(name) => write!(f, "{name}"),
            Expr::Literal(Value::Text(s)) => write!(f, "'{s}'"),
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::Not(e) => write!(f, "NOT {e}"),
            Expr::Neg(e) => write!(f, "-{e}"),
            Expr::Binary { op, left, right } => write!(f, "{left} {} {right}", op.symbol()),
            Expr::Like { expr, pattern, negated } => {
                write!(f, "{expr} {}LIKE {pattern}", if *negated { "NOT " } else { "" })
            }
            Expr::IsNull { expr, negated } => {
                write!(f, "{expr} IS {}NULL", if *negated { "NOT " } else { "" })
            }
            Expr::Aggregate { func, arg: None } => write!(f, "{}(*)", func.name()),
            Expr::Aggregate { func, arg: Some(arg) } => write!(f, "{}({arg})", func.name()),
        }
    }
}

// ─── Parser ───────────────────────────────────────────────────────────

/// Parse and classify one statement.
pub fn parse(text: &str) -> Result<Statement, SqlError> {
    let tokens = tokenize(text)?;
    if tokens.is_empty() {
        return Err(SqlError::Empty);
    }

    if let Some(keyword) = tokens.iter().find_map(|t| match t {
        Token::Word(w) if MUTATING_KEYWORDS.iter().any(|k| w.eq_ignore_ascii_case(k)) => {
            Some(w.to_ascii_uppercase())
        }
        _ => None,
    }) {
        return Ok(Statement::Mutation { keyword });
    }

    match &tokens[0] {
        Token::Word(w) if w.eq_ignore_ascii_case("SELECT") => {
            let mut parser = Parser::new(tokens);
            let select = parser.select()?;
            parser.finish()?;
            Ok(Statement::Select(select))
        }
        Token::Word(w) => Ok(Statement::Other { keyword: w.to_ascii_uppercase() }),
        other => Err(SqlError::Expected {
            expected: "SELECT".into(),
            found: other.to_string(),
        }),
    }
}

/// Parenthesis, NOT and unary minus nesting allowed in one expression.
const MAX_NESTING: usize = 64;
/// Binary operators allowed in one statement. Expression trees are walked
/// recursively, so their depth has to stay bounded too.
const MAX_OPERATORS: usize = 1024;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    operators: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0, depth: 0, operators: 0 }
    }

    /// Run `f` one nesting level deeper.
    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, SqlError>) -> Result<T, SqlError> {
        if self.depth >= MAX_NESTING {
            return Err(SqlError::TooDeep(MAX_NESTING));
        }
        self.depth += 1;
        let out = f(self);
        self.depth -= 1;
        out
    }

    fn binary(&mut self, op: BinaryOp, left: Expr, right: Expr) -> Result<Expr, SqlError> {
        self.operators += 1;
        if self.operators > MAX_OPERATORS {
            return Err(SqlError::TooManyOperators(MAX_OPERATORS));
        }
        Ok(binary(op, left, right))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn found(&self) -> String {
        self.peek().map_or_else(|| "end of query".to_string(), |t| t.to_string())
    }

    fn expected(&self, what: &str) -> SqlError {
        SqlError::Expected {
            expected: what.to_string(),
            found: self.found(),
        }
    }

    fn at_word(&self, keyword: &str) -> bool {
        self.peek().is_some_and(|t| t.is_word(keyword))
    }

    fn eat_word(&mut self, keyword: &str) -> bool {
        if self.at_word(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_word(&mut self, keyword: &str) -> Result<(), SqlError> {
        if self.eat_word(keyword) {
            Ok(())
        } else {
            Err(self.expected(keyword))
        }
    }

    fn eat_symbol(&mut self, symbol: &'static str) -> bool {
        if self.peek() == Some(&Token::Symbol(symbol)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_symbol(&mut self, symbol: &'static str) -> Result<(), SqlError> {
        if self.eat_symbol(symbol) {
            Ok(())
        } else {
            Err(self.expected(&format!("'{symbol}'")))
        }
    }

    /// Optional `;` then end of input.
    fn finish(&mut self) -> Result<(), SqlError> {
        if self.eat_symbol(";") && self.peek().is_some() {
            return Err(SqlError::MultipleStatements);
        }
        match self.peek() {
            None => Ok(()),
            Some(t) if t.is_word("JOIN") || t.is_word("HAVING") || t.is_word("UNION") || t.is_word("OFFSET") => {
                Err(SqlError::Unsupported(t.to_string()))
            }
            Some(_) => Err(self.expected("end of query")),
        }
    }

    fn identifier(&mut self) -> Result<String, SqlError> {
        match self.peek() {
            Some(Token::Word(w)) if !is_reserved(w) => {
                let name = w.clone();
                self.pos += 1;
                Ok(name)
            }
            Some(Token::Quoted(w)) => {
                let name = w.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.expected("identifier")),
        }
    }

    fn select(&mut self) -> Result<Select, SqlError> {
        self.expect_word("SELECT")?;
        let distinct = self.eat_word("DISTINCT");

        let mut items = vec![self.select_item()?];
        while self.eat_symbol(",") {
            items.push(self.select_item()?);
        }

        let from = if self.eat_word("FROM") {
            if self.peek() == Some(&Token::Symbol("(")) {
                return Err(SqlError::Unsupported("subquery".into()));
            }
            let table = self.identifier()?;
            if self.peek().is_some_and(|t| matches!(t, Token::Symbol(",")) || t.is_word("JOIN")) {
                return Err(SqlError::Unsupported("joins".into()));
            }
            Some(table)
        } else {
            None
        };

        let filter = if self.eat_word("WHERE") { Some(self.expr()?) } else { None };

        let mut group_by = Vec::new();
        if self.eat_word("GROUP") {
            self.expect_word("BY")?;
            group_by.push(self.expr()?);
            while self.eat_symbol(",") {
                group_by.push(self.expr()?);
            }
        }

        let mut order_by = Vec::new();
        if self.eat_word("ORDER") {
            self.expect_word("BY")?;
            loop {
                let expr = self.expr()?;
                let descending = if self.eat_word("DESC") {
                    true
                } else {
                    self.eat_word("ASC");
                    false
                };
                order_by.push(OrderKey { expr, descending });
                if !self.eat_symbol(",") {
                    break;
                }
            }
        }

        let limit = if self.eat_word("LIMIT") {
            match self.next() {
                Some(Token::Int(n)) if n >= 0 => Some(n as u64),
                _ => {
                    self.pos -= 1;
                    return Err(self.expected("non-negative integer"));
                }
            }
        } else {
            None
        };

        Ok(Select {
            distinct,
            items,
            from,
            filter,
            group_by,
            order_by,
            limit,
        })
    }

    fn select_item(&mut self) -> Result<SelectItem, SqlError> {
        if self.eat_symbol("*") {
            return Ok(SelectItem::Wildcard);
        }
        let expr = self.expr()?;
        let alias = if self.eat_word("AS") {
            Some(self.identifier()?)
        } else if matches!(self.peek(), Some(Token::Word(w)) if !is_reserved(w)) || matches!(self.peek(), Some(Token::Quoted(_))) {
            Some(self.identifier()?)
        } else {
            None
        };
        Ok(SelectItem::Expr { expr, alias })
    }

    fn expr(&mut self) -> Result<Expr, SqlError> {
        self.nested(Self::or)
    }

    fn or(&mut self) -> Result<Expr, SqlError> {
        let mut left = self.and()?;
        while self.eat_word("OR") {
            let right = self.and()?;
            left = self.binary(BinaryOp::Or, left, right)?;
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, SqlError> {
        let mut left = self.not()?;
        while self.eat_word("AND") {
            let right = self.not()?;
            left = self.binary(BinaryOp::And, left, right)?;
        }
        Ok(left)
    }

    fn not(&mut self) -> Result<Expr, SqlError> {
        if self.eat_word("NOT") {
            return Ok(Expr::Not(Box::new(self.nested(Self::not)?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, SqlError> {
        let left = self.sum()?;

        let op = match self.peek() {
            Some(Token::Symbol("=")) => Some(BinaryOp::Eq),
            Some(Token::Symbol("!=")) | Some(Token::Symbol("<>")) => Some(BinaryOp::NotEq),
            Some(Token::Symbol("<")) => Some(BinaryOp::Lt),
            Some(Token::Symbol("<=")) => Some(BinaryOp::LtEq),
            Some(Token::Symbol(">")) => Some(BinaryOp::Gt),
            Some(Token::Symbol(">=")) => Some(BinaryOp::GtEq),
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            let right = self.sum()?;
            return self.binary(op, left, right);
        }

        if self.eat_word("IS") {
            let negated = self.eat_word("NOT");
            self.expect_word("NULL")?;
            return Ok(Expr::IsNull { expr: Box::new(left), negated });
        }

        let negated = if self.at_word("NOT") && self.tokens.get(self.pos + 1).is_some_and(|t| t.is_word("LIKE")) {
            self.pos += 1;
            true
        } else {
            false
        };
        if self.eat_word("LIKE") {
            let pattern = self.sum()?;
            return Ok(Expr::Like {
                expr: Box::new(left),
                pattern: Box::new(pattern),
                negated,
            });
        }
        if self.at_word("IN") || self.at_word("BETWEEN") {
            return Err(SqlError::Unsupported(self.found()));
        }
        Ok(left)
    }

    fn sum(&mut self) -> Result<Expr, SqlError> {
        let mut left = self.term()?;
        loop {
            let op = if self.eat_symbol("+") {
                BinaryOp::Add
            } else if self.eat_symbol("-") {
                BinaryOp::Sub
            } else {
                return Ok(left);
            };
            let right = self.term()?;
            left = self.binary(op, left, right)?;
        }
    }

    fn term(&mut self) -> Result<Expr, SqlError> {
        let mut left = self.unary()?;
        loop {
            let op = if self.eat_symbol("*") {
                BinaryOp::Mul
            } else if self.eat_symbol("/") {
                BinaryOp::Div
            } else if self.eat_symbol("%") {
                BinaryOp::Mod
            } else {
                return Ok(left);
            };
            let right = self.unary()?;
            left = self.binary(op, left, right)?;
        }
    }

    fn unary(&mut self) -> Result<Expr, SqlError> {
        if self.eat_symbol("-") {
            return Ok(Expr::Neg(Box::new(self.nested(Self::unary)?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, SqlError> {
        let Some(token) = self.next() else {
            return Err(self.expected("expression"));
        };
        match token {
            Token::Int(i) => Ok(Expr::Literal(Value::Int(i))),
            Token::Float(x) => Ok(Expr::Literal(Value::Float(x))),
            Token::Str(s) => Ok(Expr::Literal(Value::Text(s))),
            Token::Quoted(name) => Ok(Expr::Column(name)),
            Token::Symbol("(") => {
                if self.at_word("SELECT") {
                    return Err(SqlError::Unsupported("subquery".into()));
                }
                let inner = self.expr()?;
                self.expect_symbol(")")?;
                Ok(inner)
            }
            Token::Word(w) if w.eq_ignore_ascii_case("NULL") => Ok(Expr::Literal(Value::Null)),
            Token::Word(w) if w.eq_ignore_ascii_case("TRUE") => Ok(Expr::Literal(Value::Bool(true))),
            Token::Word(w) if w.eq_ignore_ascii_case("FALSE") => Ok(Expr::Literal(Value::Bool(false))),
            Token::Word(w) if self.peek() == Some(&Token::Symbol("(")) => {
                let func = AggFunc::from_word(&w)
                    .ok_or_else(|| SqlError::Unsupported(format!("function {}", w.to_ascii_uppercase())))?;
                self.pos += 1;
                let arg = if func == AggFunc::Count && self.eat_symbol("*") {
                    None
                } else {
                    if self.at_word("DISTINCT") {
                        return Err(SqlError::Unsupported("DISTINCT inside aggregate".into()));
                    }
                    let arg = self.expr()?;
                    if arg.has_aggregate() {
                        return Err(SqlError::Unsupported("nested aggregate".into()));
                    }
                    Some(Box::new(arg))
                };
                self.expect_symbol(")")?;
                Ok(Expr::Aggregate { func, arg })
            }
            Token::Word(w) if !is_reserved(&w) => {
                // Qualified names keep only the column part.
                if self.eat_symbol(".") {
                    return Ok(Expr::Column(self.identifier()?));
                }
                Ok(Expr::Column(w))
            }
            other => {
                self.pos -= 1;
                Err(SqlError::Expected {
                    expected: "expression".into(),
                    found: other.to_string(),
                })
            }
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

fn is_reserved(word: &str) -> bool {
    RESERVED.iter().any(|k| word.eq_ignore_ascii_case(k))
}
