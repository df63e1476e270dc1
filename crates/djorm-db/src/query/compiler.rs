//! SQL query AST and compiler.
//!
//! [`Query`] describes one SELECT; [`SqlCompiler`] turns it, and the
//! INSERT/UPDATE/DELETE/CREATE TABLE statements the ORM issues, into
//! parameterized SQL. `PostgreSQL` uses `$1, $2, ...` placeholders and
//! `SQLite` uses `?`.

use djorm_core::{DjormError, DjormResult};

use super::lookups::{DatePart, Lookup};
use crate::schema::TableSchema;
use crate::value::Value;

/// The type of database backend, used to pick placeholder style and
/// backend-specific SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseBackendType {
    /// `PostgreSQL` (uses `$1, $2, ...` placeholders).
    PostgreSQL,
    /// `SQLite` (uses `?` placeholders).
    SQLite,
}

/// A column ordering direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    /// The column or output alias to order by.
    pub column: String,
    /// Whether to sort in descending order.
    pub descending: bool,
}

impl OrderBy {
    /// Creates an ascending order.
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
        }
    }

    /// Creates a descending order.
    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
        }
    }
}

/// A column to select in a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectColumn {
    /// A plain column.
    Column(String),
    /// Raw SQL with an output alias, as added by `extra(select=...)`.
    Raw(String, String),
    /// A calendar component of a date column, with an output alias.
    DatePart(DatePart, String, String),
    /// All columns (`*`).
    Star,
}

/// A WHERE clause node.
#[derive(Debug, Clone, PartialEq)]
pub enum WhereNode {
    /// A single column comparison.
    Condition {
        /// The column name.
        column: String,
        /// The comparison.
        lookup: Lookup,
    },
    /// Logical AND of conditions.
    And(Vec<WhereNode>),
    /// `column IN (SELECT ...)`.
    InSubquery {
        /// The column name.
        column: String,
        /// The subquery; it must select exactly one column.
        query: Box<Query>,
    },
}

impl WhereNode {
    /// Creates a condition node.
    pub fn condition(column: impl Into<String>, lookup: Lookup) -> Self {
        Self::Condition {
            column: column.into(),
            lookup,
        }
    }

    /// Returns `true` for an empty conjunction, which matches every row.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::And(children) if children.is_empty())
    }
}

/// An `INNER JOIN` from the main table to a parent table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    /// The joined table.
    pub table: String,
    /// Column of the joined table matched by the join.
    pub column: String,
    /// Table holding the link column.
    pub from_table: String,
    /// The link column.
    pub from_column: String,
}

/// The complete AST of a SELECT statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// The main table name.
    pub table: String,
    /// Parent tables joined to the main table.
    pub joins: Vec<Join>,
    /// Columns to select.
    pub select: Vec<SelectColumn>,
    /// WHERE clause.
    pub where_clause: Option<WhereNode>,
    /// ORDER BY clauses.
    pub order_by: Vec<OrderBy>,
    /// LIMIT.
    pub limit: Option<usize>,
    /// OFFSET.
    pub offset: Option<usize>,
    /// DISTINCT flag.
    pub distinct: bool,
}

impl Query {
    /// Creates a `SELECT *` query for the given table.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            joins: Vec::new(),
            select: vec![SelectColumn::Star],
            where_clause: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
            distinct: false,
        }
    }
}

/// A result row: column names and their values.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// Creates a row from column names and values of equal length.
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(
            columns.len(),
            values.len(),
            "Row column count must match value count"
        );
        Self { columns, values }
    }

    /// Returns the column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Returns the values in column order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Consumes the row, returning its values.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Returns the number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns `true` if the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Gets a typed value by column name.
    pub fn get<T: FromValue>(&self, column: &str) -> DjormResult<T> {
        let value = self.get_value(column).ok_or_else(|| {
            DjormError::DatabaseError(format!("Column '{column}' not found in row"))
        })?;
        T::from_value(value)
    }

    /// Gets a typed value by column index.
    pub fn get_by_index<T: FromValue>(&self, idx: usize) -> DjormResult<T> {
        let value = self.values.get(idx).ok_or_else(|| {
            DjormError::DatabaseError(format!(
                "Column index {idx} out of bounds (row has {} columns)",
                self.values.len()
            ))
        })?;
        T::from_value(value)
    }

    /// Returns the raw value of a column.
    pub fn get_value(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|idx| self.values.get(idx))
    }
}

/// Conversion from a [`Value`] to a concrete Rust type.
pub trait FromValue: Sized {
    /// Attempts the conversion.
    fn from_value(value: &Value) -> DjormResult<Self>;
}

fn type_mismatch(expected: &str, value: &Value) -> DjormError {
    DjormError::DatabaseError(format!("Expected {expected}, got {value:?}"))
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> DjormResult<Self> {
        value.as_int().ok_or_else(|| type_mismatch("Int", value))
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> DjormResult<Self> {
        let i = i64::from_value(value)?;
        Self::try_from(i)
            .map_err(|e| DjormError::DatabaseError(format!("Int value out of i32 range: {e}")))
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> DjormResult<Self> {
        value.as_float().ok_or_else(|| type_mismatch("Float", value))
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> DjormResult<Self> {
        value.as_bool().ok_or_else(|| type_mismatch("Bool", value))
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> DjormResult<Self> {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| type_mismatch("String", value))
    }
}

impl FromValue for chrono::NaiveDate {
    fn from_value(value: &Value) -> DjormResult<Self> {
        match value {
            Value::String(s) => Self::parse_from_str(s.get(..10).unwrap_or(s), "%Y-%m-%d")
                .map_err(|e| DjormError::DatabaseError(format!("Invalid date '{s}': {e}"))),
            other => other.as_date().ok_or_else(|| type_mismatch("Date", other)),
        }
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> DjormResult<Self> {
        Ok(value.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> DjormResult<Self> {
        match value {
            Value::Null => Ok(None),
            _ => T::from_value(value).map(Some),
        }
    }
}

/// Quotes an identifier.
pub fn quote_name(name: &str) -> String {
    if name.starts_with('"') && name.ends_with('"') {
        name.to_string()
    } else {
        format!("\"{name}\"")
    }
}

/// Quotes a column reference, which may be qualified as `table.column`.
pub fn quote_column(name: &str) -> String {
    match name.split_once('.') {
        Some((table, column)) => format!("{}.{}", quote_name(table), quote_name(column)),
        None => quote_name(name),
    }
}

fn from_clause(query: &Query) -> String {
    let mut sql = quote_name(&query.table);
    for join in &query.joins {
        sql.push_str(&format!(
            " INNER JOIN {} ON ({}.{} = {}.{})",
            quote_name(&join.table),
            quote_name(&join.table),
            quote_name(&join.column),
            quote_name(&join.from_table),
            quote_name(&join.from_column)
        ));
    }
    sql
}

/// Translates ASTs into parameterized SQL for one backend.
pub struct SqlCompiler {
    backend: DatabaseBackendType,
}

impl SqlCompiler {
    /// Creates a compiler for the given backend type.
    pub const fn new(backend: DatabaseBackendType) -> Self {
        Self { backend }
    }

    /// Returns a parameter placeholder for the given 1-based index.
    fn placeholder(&self, index: usize) -> String {
        match self.backend {
            DatabaseBackendType::PostgreSQL => format!("${index}"),
            DatabaseBackendType::SQLite => "?".to_string(),
        }
    }

    fn push_param(&self, value: Value, params: &mut Vec<Value>) -> String {
        params.push(value);
        self.placeholder(params.len())
    }

    /// Returns the SQL extracting a calendar component from a column.
    pub fn date_part_sql(&self, part: DatePart, column: &str) -> String {
        match self.backend {
            DatabaseBackendType::SQLite => format!(
                "CAST(strftime('{}', {}) AS INTEGER)",
                part.strftime_format(),
                quote_column(column)
            ),
            DatabaseBackendType::PostgreSQL => format!(
                "EXTRACT('{}' FROM {})",
                part.extract_name(),
                quote_column(column)
            ),
        }
    }

    fn select_list(&self, query: &Query) -> String {
        if query.select.is_empty() {
            return "*".to_string();
        }
        query
            .select
            .iter()
            .map(|col| match col {
                SelectColumn::Column(name) => quote_column(name),
                SelectColumn::Raw(sql, alias) => format!("({sql}) AS {}", quote_name(alias)),
                SelectColumn::DatePart(part, column, alias) => {
                    format!("{} AS {}", self.date_part_sql(*part, column), quote_name(alias))
                }
                SelectColumn::Star => "*".to_string(),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn push_where(&self, query: &Query, sql: &mut String, params: &mut Vec<Value>) {
        if let Some(ref where_clause) = query.where_clause {
            if !where_clause.is_empty() {
                sql.push_str(" WHERE ");
                self.compile_where_node(where_clause, sql, params);
            }
        }
    }

    fn push_limits(&self, limit: Option<usize>, offset: Option<usize>, sql: &mut String) {
        match (limit, offset) {
            (Some(limit), _) => sql.push_str(&format!(" LIMIT {limit}")),
            // SQLite needs a LIMIT before OFFSET.
            (None, Some(_)) if self.backend == DatabaseBackendType::SQLite => {
                sql.push_str(" LIMIT -1");
            }
            (None, _) => {}
        }
        if let Some(offset) = offset.filter(|o| *o > 0) {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
    }

    /// Compiles a SELECT query into SQL and parameters.
    pub fn compile_select(&self, query: &Query) -> (String, Vec<Value>) {
        let mut params: Vec<Value> = Vec::new();
        let sql = self.select_sql(query, &mut params);
        (sql, params)
    }

    fn select_sql(&self, query: &Query, params: &mut Vec<Value>) -> String {
        let mut sql = String::from("SELECT ");

        if query.distinct {
            sql.push_str("DISTINCT ");
        }
        sql.push_str(&self.select_list(query));
        sql.push_str(" FROM ");
        sql.push_str(&from_clause(query));

        self.push_where(query, &mut sql, params);

        if !query.order_by.is_empty() {
            let orders: Vec<String> = query
                .order_by
                .iter()
                .map(|o| {
                    let dir = if o.descending { "DESC" } else { "ASC" };
                    format!("{} {dir}", quote_column(&o.column))
                })
                .collect();
            sql.push_str(&format!(" ORDER BY {}", orders.join(", ")));
        }

        self.push_limits(query.limit, query.offset, &mut sql);
        sql
    }

    /// Compiles a row-existence probe honoring the query's filters and
    /// offset. The result has at most one row.
    pub fn compile_exists(&self, query: &Query) -> (String, Vec<Value>) {
        let mut params: Vec<Value> = Vec::new();
        let mut sql = format!("SELECT 1 AS \"a\" FROM {}", from_clause(query));
        self.push_where(query, &mut sql, &mut params);
        let limit = query.limit.map_or(1, |l| l.min(1));
        self.push_limits(Some(limit), query.offset, &mut sql);
        (sql, params)
    }

    /// Compiles a `COUNT(*)` over the query.
    ///
    /// Sliced or distinct queries are counted through a subquery so the
    /// limits apply to the rows being counted.
    pub fn compile_count(&self, query: &Query) -> (String, Vec<Value>) {
        if query.limit.is_none() && query.offset.is_none() && !query.distinct {
            let mut params = Vec::new();
            let mut sql = format!("SELECT COUNT(*) FROM {}", from_clause(query));
            self.push_where(query, &mut sql, &mut params);
            return (sql, params);
        }
        let mut inner = query.clone();
        inner.order_by.clear();
        let (inner_sql, params) = self.compile_select(&inner);
        (
            format!("SELECT COUNT(*) FROM ({inner_sql}) AS \"subquery\""),
            params,
        )
    }

    /// Compiles an INSERT statement.
    pub fn compile_insert(&self, table: &str, fields: &[(&str, Value)]) -> (String, Vec<Value>) {
        if fields.is_empty() {
            return (
                format!("INSERT INTO {} DEFAULT VALUES", quote_name(table)),
                Vec::new(),
            );
        }
        let mut params = Vec::new();
        let columns: Vec<String> = fields.iter().map(|(name, _)| quote_name(name)).collect();
        let placeholders: Vec<String> = fields
            .iter()
            .map(|(_, val)| self.push_param(val.clone(), &mut params))
            .collect();

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_name(table),
            columns.join(", "),
            placeholders.join(", ")
        );
        (sql, params)
    }

    /// Compiles an UPDATE statement. Without a WHERE clause every row is
    /// updated.
    pub fn compile_update(
        &self,
        table: &str,
        fields: &[(&str, Value)],
        where_clause: Option<&WhereNode>,
    ) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let set_parts: Vec<String> = fields
            .iter()
            .map(|(name, val)| {
                let ph = self.push_param(val.clone(), &mut params);
                format!("{} = {ph}", quote_name(name))
            })
            .collect();

        let mut sql = format!("UPDATE {} SET {}", quote_name(table), set_parts.join(", "));
        if let Some(node) = where_clause.filter(|n| !n.is_empty()) {
            sql.push_str(" WHERE ");
            self.compile_where_node(node, &mut sql, &mut params);
        }
        (sql, params)
    }

    /// Compiles a DELETE statement. Without a WHERE clause every row is
    /// deleted.
    pub fn compile_delete(&self, table: &str, where_clause: Option<&WhereNode>) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let mut sql = format!("DELETE FROM {}", quote_name(table));
        if let Some(node) = where_clause.filter(|n| !n.is_empty()) {
            sql.push_str(" WHERE ");
            self.compile_where_node(node, &mut sql, &mut params);
        }
        (sql, params)
    }

    /// Compiles the statements creating a table and its indexes.
    pub fn compile_create_table(&self, schema: &TableSchema) -> Vec<String> {
        let mut lines: Vec<String> = Vec::new();
        for col in &schema.columns {
            let mut line = format!(
                "    {} {}",
                quote_name(&col.name),
                col.field_type.column_type(self.backend, col.max_length)
            );
            line.push_str(if col.null { " NULL" } else { " NOT NULL" });
            if col.primary_key {
                line.push_str(" PRIMARY KEY");
                if col.field_type.is_auto() && self.backend == DatabaseBackendType::SQLite {
                    line.push_str(" AUTOINCREMENT");
                }
            } else if col.unique {
                line.push_str(" UNIQUE");
            }
            if let Some((table, column)) = &col.references {
                line.push_str(&format!(
                    " REFERENCES {} ({})",
                    quote_name(table),
                    quote_name(column)
                ));
                if self.backend == DatabaseBackendType::PostgreSQL {
                    line.push_str(" DEFERRABLE INITIALLY DEFERRED");
                }
            }
            lines.push(line);
        }
        for group in &schema.unique_together {
            let cols: Vec<String> = group.iter().map(|c| quote_name(c)).collect();
            lines.push(format!("    UNIQUE ({})", cols.join(", ")));
        }

        let mut statements = vec![format!(
            "CREATE TABLE {} (\n{}\n)",
            quote_name(&schema.table),
            lines.join(",\n")
        )];
        for col in schema.columns.iter().filter(|c| c.needs_index()) {
            statements.push(format!(
                "CREATE INDEX {} ON {} ({})",
                quote_name(&format!("{}_{}", schema.table, col.name)),
                quote_name(&schema.table),
                quote_name(&col.name)
            ));
        }
        statements
    }

    /// Compiles a `WhereNode`, appending to `sql`.
    fn compile_where_node(&self, node: &WhereNode, sql: &mut String, params: &mut Vec<Value>) {
        match node {
            WhereNode::Condition { column, lookup } => {
                self.compile_lookup(column, lookup, sql, params);
            }
            WhereNode::And(children) => {
                if children.is_empty() {
                    sql.push_str("1=1");
                    return;
                }
                sql.push('(');
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        sql.push_str(" AND ");
                    }
                    self.compile_where_node(child, sql, params);
                }
                sql.push(')');
            }
            WhereNode::InSubquery { column, query } => {
                let inner = self.select_sql(query, params);
                sql.push_str(&format!("{} IN ({inner})", quote_column(column)));
            }
        }
    }

    /// Compiles a single lookup.
    fn compile_lookup(&self, column: &str, lookup: &Lookup, sql: &mut String, params: &mut Vec<Value>) {
        let col = quote_column(column);
        match lookup {
            Lookup::Exact(val) => {
                if val.is_null() {
                    sql.push_str(&format!("{col} IS NULL"));
                } else {
                    let ph = self.push_param(val.clone(), params);
                    sql.push_str(&format!("{col} = {ph}"));
                }
            }
            Lookup::In(vals) => {
                if vals.is_empty() {
                    sql.push_str("1=0");
                    return;
                }
                let placeholders: Vec<String> = vals
                    .iter()
                    .map(|v| self.push_param(v.clone(), params))
                    .collect();
                sql.push_str(&format!("{col} IN ({})", placeholders.join(", ")));
            }
            Lookup::Lte(val) => {
                let ph = self.push_param(val.clone(), params);
                sql.push_str(&format!("{col} <= {ph}"));
            }
            Lookup::StartsWith(prefix) => match self.backend {
                DatabaseBackendType::SQLite => {
                    // LIKE is case-insensitive on SQLite; compare the prefix instead.
                    let len = prefix.chars().count();
                    let ph = self.push_param(Value::String(prefix.clone()), params);
                    sql.push_str(&format!("substr({col}, 1, {len}) = {ph}"));
                }
                DatabaseBackendType::PostgreSQL => {
                    let escaped = prefix
                        .replace('\\', "\\\\")
                        .replace('%', "\\%")
                        .replace('_', "\\_");
                    let ph = self.push_param(Value::String(format!("{escaped}%")), params);
                    sql.push_str(&format!("{col}::text LIKE {ph}"));
                }
            },
            Lookup::DatePart(part, val) => {
                let expr = self.date_part_sql(*part, column);
                let ph = self.push_param(val.clone(), params);
                sql.push_str(&format!("{expr} = {ph}"));
            }
            Lookup::IsNull(is_null) => {
                let op = if *is_null { "IS NULL" } else { "IS NOT NULL" };
                sql.push_str(&format!("{col} {op}"));
            }
        }
    }
}
