//! Lazy, chainable querysets.
//!
//! A [`QuerySet`] describes a query over one model. Chaining methods
//! (`filter`, `order_by`, `using`, `extra`, `values`, `dates`, `slice`)
//! borrow the queryset and return a fresh one; the original is left as it
//! was. Nothing touches the database until a consuming method runs
//! (`iter`, `len`, `get_item`, `fetch_all`, `has_results`, `get`, `count`,
//! `exists`).
//!
//! On first consumption the query runs once and its rows are turned into
//! items on demand, [`CHUNK_SIZE`] at a time, into a cache. The backend
//! hands back every row of the statement at once, so only the conversion
//! to items is incremental; the raw rows are held until the cache has
//! drained them. Indexing inside
//! the cached prefix is served from the cache; iterating a fully cached
//! queryset replays the cache without another query.
//!
//! What an item is depends on the [`Projection`]: model [`Instance`]s for
//! [`Objects`], field mappings for [`Values`], calendar dates for [`Dates`].
//!
//! # Examples
//!
//! ```
//! use djorm_db::fields::{Field, FieldType};
//! use djorm_db::model::ModelBuilder;
//! use djorm_db::query::compiler::DatabaseBackendType;
//! use djorm_db::registry::ModelRegistry;
//!
//! let registry = ModelRegistry::new();
//! let person = ModelBuilder::new("Person", "site.people.models")
//!     .field(Field::new("name", FieldType::CharField))
//!     .build(&registry)
//!     .unwrap();
//!
//! let qs = person
//!     .objects()
//!     .filter(&[("name__startswith", "A".into())])
//!     .unwrap()
//!     .order_by(&["name"])
//!     .unwrap()
//!     .slice(0..2);
//! let (sql, _) = qs.to_sql(DatabaseBackendType::SQLite).unwrap();
//! assert_eq!(
//!     sql,
//!     "SELECT \"id\", \"name\" FROM \"people_person\" WHERE substr(\"name\", 1, 1) = ? \
//!      ORDER BY \"name\" ASC LIMIT 2"
//! );
//! ```

use std::fmt;
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;
use std::vec;

use djorm_core::{DjormError, DjormResult};

use super::compiler::{
    DatabaseBackendType, Join, OrderBy, Query, Row, SelectColumn, SqlCompiler, WhereNode,
};
use super::lookups::{split_lookup, DatePart, Lookup, LookupType};
use crate::connection::ConnectionHandler;
use crate::fields::Field;
use crate::instance::{Instance, SaveOptions};
use crate::model::ModelClass;
use crate::value::Value;

/// Number of rows turned into items per cache extension.
pub const CHUNK_SIZE: usize = 100;

const SLICED_FILTER: &str = "Cannot filter a query once a slice has been taken.";
const SLICED_ORDER: &str = "Cannot reorder a query once a slice has been taken.";
const SLICED_CHANGE: &str = "Cannot change a query once a slice has been taken.";

/// Decides what a queryset selects and what each row becomes.
pub trait Projection: Clone + fmt::Debug {
    /// What iteration yields.
    type Item: Clone + fmt::Debug;

    /// The SELECT list.
    fn select(&self, source: &RowSource<'_>) -> Vec<SelectColumn>;

    /// Turns one row into an item.
    fn build(&self, source: &RowSource<'_>, row: Row) -> DjormResult<Self::Item>;

    /// Ordering replacing the queryset's own, if any.
    fn ordering(&self) -> Option<Vec<OrderBy>> {
        None
    }

    /// Whether duplicate rows are collapsed.
    fn distinct(&self) -> bool {
        false
    }
}

/// What a projection needs to know about the queryset it shapes.
#[derive(Debug)]
pub struct RowSource<'a> {
    /// The queried model.
    pub model: &'a Arc<ModelClass>,
    /// Extra select columns as `(alias, sql)`.
    pub extra: &'a [(String, String)],
    /// Whether column references must name their table.
    pub qualified: bool,
    /// Alias the rows come from.
    pub db: &'a str,
}

impl RowSource<'_> {
    fn column_ref(&self, table: &str, column: &str) -> String {
        if self.qualified {
            format!("{table}.{column}")
        } else {
            column.to_string()
        }
    }

    fn extra_names(&self) -> Vec<String> {
        self.extra.iter().map(|(alias, _)| alias.clone()).collect()
    }
}

/// Yields model instances.
#[derive(Debug, Clone, Copy, Default)]
pub struct Objects;

impl Projection for Objects {
    type Item = Instance;

    fn select(&self, source: &RowSource<'_>) -> Vec<SelectColumn> {
        let meta = source.model.meta();
        let mut columns: Vec<SelectColumn> = meta
            .get_fields_with_model()
            .iter()
            .map(|(field, owner)| {
                let table = owner
                    .as_ref()
                    .map_or(meta.db_table.as_str(), |m| m.meta().db_table.as_str());
                SelectColumn::Column(source.column_ref(table, &field.column))
            })
            .collect();
        columns.extend(
            source
                .extra
                .iter()
                .map(|(alias, sql)| SelectColumn::Raw(sql.clone(), alias.clone())),
        );
        columns
    }

    fn build(&self, source: &RowSource<'_>, row: Row) -> DjormResult<Instance> {
        Instance::from_db(
            Arc::clone(source.model),
            row.into_values(),
            &source.extra_names(),
            source.db,
        )
    }
}

#[derive(Debug, Clone)]
enum ValuesColumn {
    Field {
        key: String,
        field: Arc<Field>,
        table: String,
    },
    Extra {
        key: String,
    },
}

impl ValuesColumn {
    fn key(&self) -> &str {
        match self {
            Self::Field { key, .. } | Self::Extra { key } => key,
        }
    }
}

/// Yields one [`ValuesRow`] per row.
#[derive(Debug, Clone)]
pub struct Values {
    columns: Vec<ValuesColumn>,
}

/// Field values of one row, in the requested order.
#[derive(Debug, Clone, PartialEq)]
pub struct ValuesRow(Vec<(String, Value)>);

impl ValuesRow {
    /// Returns the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Returns the keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    /// Returns the `(key, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if nothing was selected.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Unwraps the pairs.
    pub fn into_inner(self) -> Vec<(String, Value)> {
        self.0
    }
}

impl Projection for Values {
    type Item = ValuesRow;

    fn select(&self, source: &RowSource<'_>) -> Vec<SelectColumn> {
        self.columns
            .iter()
            .map(|col| match col {
                ValuesColumn::Field { field, table, .. } => {
                    SelectColumn::Column(source.column_ref(table, &field.column))
                }
                ValuesColumn::Extra { key } => {
                    let sql = source
                        .extra
                        .iter()
                        .find(|(alias, _)| alias == key)
                        .map_or_else(|| "NULL".to_string(), |(_, sql)| sql.clone());
                    SelectColumn::Raw(sql, key.clone())
                }
            })
            .collect()
    }

    fn build(&self, _source: &RowSource<'_>, row: Row) -> DjormResult<ValuesRow> {
        self.columns
            .iter()
            .zip(row.into_values())
            .map(|(col, value)| {
                let value = match col {
                    ValuesColumn::Field { field, .. } => field.to_python(value)?,
                    ValuesColumn::Extra { .. } => value,
                };
                Ok((col.key().to_string(), value))
            })
            .collect::<DjormResult<Vec<_>>>()
            .map(ValuesRow)
    }
}

/// Granularity of [`QuerySet::dates`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateKind {
    /// First day of each year.
    Year,
    /// First day of each month.
    Month,
    /// Each day.
    Day,
}

impl DateKind {
    /// Parses `year`, `month` or `day`.
    pub fn parse(kind: &str) -> DjormResult<Self> {
        match kind {
            "year" => Ok(Self::Year),
            "month" => Ok(Self::Month),
            "day" => Ok(Self::Day),
            _ => Err(DjormError::InvalidArgument(
                "'kind' must be one of 'year', 'month' or 'day'.".into(),
            )),
        }
    }

    const fn parts(self) -> &'static [(DatePart, &'static str)] {
        match self {
            Self::Year => &[(DatePart::Year, "year")],
            Self::Month => &[(DatePart::Year, "year"), (DatePart::Month, "month")],
            Self::Day => &[
                (DatePart::Year, "year"),
                (DatePart::Month, "month"),
                (DatePart::Day, "day"),
            ],
        }
    }
}

/// Yields the distinct dates of a date field, truncated to a [`DateKind`].
#[derive(Debug, Clone)]
pub struct Dates {
    column: String,
    kind: DateKind,
    descending: bool,
}

fn date_component(value: &Value) -> DjormResult<i64> {
    #[allow(clippy::cast_possible_truncation)]
    let n = match value {
        Value::Int(i) => Some(*i),
        Value::Float(f) => Some(*f as i64),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    n.ok_or_else(|| {
        DjormError::DatabaseError(format!("{} is not a date component", value.repr()))
    })
}

impl Projection for Dates {
    type Item = chrono::NaiveDate;

    fn select(&self, _source: &RowSource<'_>) -> Vec<SelectColumn> {
        self.kind
            .parts()
            .iter()
            .map(|(part, alias)| SelectColumn::DatePart(*part, self.column.clone(), (*alias).into()))
            .collect()
    }

    fn build(&self, _source: &RowSource<'_>, row: Row) -> DjormResult<chrono::NaiveDate> {
        let values = row.values();
        let part = |idx: usize| -> DjormResult<u32> {
            match values.get(idx) {
                Some(v) => u32::try_from(date_component(v)?)
                    .map_err(|_| DjormError::DatabaseError("negative date component".into())),
                None => Ok(1),
            }
        };
        let year = values.first().map_or(Ok(1), date_component)?;
        let year = i32::try_from(year)
            .map_err(|_| DjormError::DatabaseError(format!("year {year} is out of range")))?;
        chrono::NaiveDate::from_ymd_opt(year, part(1)?, part(2)?).ok_or_else(|| {
            DjormError::DatabaseError(format!("invalid date components in {:?}", row.values()))
        })
    }

    fn ordering(&self) -> Option<Vec<OrderBy>> {
        Some(
            self.kind
                .parts()
                .iter()
                .map(|(_, alias)| {
                    if self.descending {
                        OrderBy::desc(*alias)
                    } else {
                        OrderBy::asc(*alias)
                    }
                })
                .collect(),
        )
    }

    fn distinct(&self) -> bool {
        true
    }
}

/// One filter condition, remembering the table of its column.
#[derive(Debug, Clone)]
struct Predicate {
    table: String,
    column: String,
    lookup: Lookup,
}

impl Predicate {
    fn node(&self, qualified: bool) -> WhereNode {
        let column = if qualified {
            format!("{}.{}", self.table, self.column)
        } else {
            self.column.clone()
        };
        WhereNode::condition(column, self.lookup.clone())
    }
}

fn where_node(predicates: &[Predicate], qualified: bool) -> Option<WhereNode> {
    let mut nodes: Vec<WhereNode> = predicates.iter().map(|p| p.node(qualified)).collect();
    match nodes.len() {
        0 => None,
        1 => nodes.pop(),
        _ => Some(WhereNode::And(nodes)),
    }
}

/// The parent tables a multi-table child must join to read all its fields.
fn inheritance_joins(model: &Arc<ModelClass>) -> Vec<Join> {
    let concrete = model.concrete_model();
    let meta = concrete.meta();
    let mut joins = Vec::new();
    for (parent, link) in meta.parents() {
        let Some(link) = link else { continue };
        let (Ok(link_field), Ok(parent_pk)) = (meta.get_field(link), parent.meta().pk_field())
        else {
            continue;
        };
        let join = Join {
            table: parent.meta().db_table.clone(),
            column: parent_pk.column.clone(),
            from_table: meta.db_table.clone(),
            from_column: link_field.column.clone(),
        };
        if !joins.iter().any(|j: &Join| j.table == join.table) {
            joins.push(join);
        }
        for inherited in inheritance_joins(parent) {
            if !joins.iter().any(|j| j.table == inherited.table) {
                joins.push(inherited);
            }
        }
    }
    joins
}

/// A lazy query over one model.
#[derive(Debug)]
pub struct QuerySet<P: Projection = Objects> {
    model: Arc<ModelClass>,
    joins: Vec<Join>,
    conditions: Vec<Predicate>,
    order_by: Vec<OrderBy>,
    default_ordering: bool,
    low_mark: usize,
    high_mark: Option<usize>,
    extra: Vec<(String, String)>,
    db: Option<String>,
    for_write: bool,
    projection: P,
    result_cache: Option<Vec<P::Item>>,
    pending: Option<vec::IntoIter<Row>>,
    loaded_from: String,
}

/// Cloning copies the query description, never the results.
impl<P: Projection> Clone for QuerySet<P> {
    fn clone(&self) -> Self {
        self.chain(self.projection.clone())
    }
}

impl QuerySet<Objects> {
    /// A queryset over every row of `model`.
    pub fn new(model: Arc<ModelClass>) -> Self {
        let joins = inheritance_joins(&model);
        Self {
            model,
            joins,
            conditions: Vec::new(),
            order_by: Vec::new(),
            default_ordering: true,
            low_mark: 0,
            high_mark: None,
            extra: Vec::new(),
            db: None,
            for_write: false,
            projection: Objects,
            result_cache: None,
            pending: None,
            loaded_from: String::new(),
        }
    }

    /// Creates an instance from keyword values and INSERTs it on the write
    /// alias.
    pub fn create(
        &self,
        conns: &mut ConnectionHandler,
        kwargs: Vec<(&str, Value)>,
    ) -> DjormResult<Instance> {
        let mut obj = self.model.build(Vec::new(), kwargs)?;
        let db = self.write_db(conns);
        obj.save(conns, SaveOptions::new().force_insert().using(db))?;
        Ok(obj)
    }
}

impl<P: Projection> QuerySet<P> {
    fn chain<Q: Projection>(&self, projection: Q) -> QuerySet<Q> {
        QuerySet {
            model: Arc::clone(&self.model),
            joins: self.joins.clone(),
            conditions: self.conditions.clone(),
            order_by: self.order_by.clone(),
            default_ordering: self.default_ordering,
            low_mark: self.low_mark,
            high_mark: self.high_mark,
            extra: self.extra.clone(),
            db: self.db.clone(),
            for_write: self.for_write,
            projection,
            result_cache: None,
            pending: None,
            loaded_from: String::new(),
        }
    }

    /// Returns the queried model.
    pub const fn model(&self) -> &Arc<ModelClass> {
        &self.model
    }

    /// Returns `true` once an offset or limit has been applied.
    pub const fn is_sliced(&self) -> bool {
        self.low_mark > 0 || self.high_mark.is_some()
    }

    /// Returns `true` if results are cached.
    pub const fn is_evaluated(&self) -> bool {
        self.result_cache.is_some()
    }

    fn main_table(&self) -> &str {
        &self.model.meta().db_table
    }

    fn qualified(&self) -> bool {
        !self.joins.is_empty()
    }

    fn resolve_field(&self, name: &str) -> Option<(Arc<Field>, String)> {
        let meta = self.model.meta();
        let name = if name == "pk" {
            meta.pk()?.name.as_str()
        } else {
            name
        };
        meta.get_fields_with_model()
            .iter()
            .find(|(f, _)| f.name == name || f.attname == name)
            .map(|(field, owner)| {
                let table = owner
                    .as_ref()
                    .map_or_else(|| meta.db_table.clone(), |m| m.meta().db_table.clone());
                (Arc::clone(field), table)
            })
    }

    fn field_choices(&self) -> String {
        let mut names: Vec<&str> = self
            .model
            .meta()
            .get_fields_with_model()
            .iter()
            .map(|(f, _)| f.name.as_str())
            .chain(self.extra.iter().map(|(alias, _)| alias.as_str()))
            .collect();
        names.sort_unstable();
        names.join(", ")
    }

    fn unknown_field(&self, name: &str) -> DjormError {
        DjormError::FieldDoesNotExist(format!(
            "Cannot resolve keyword '{name}' into field. Choices are: {}",
            self.field_choices()
        ))
    }

    fn column_ref(&self, table: &str, column: &str) -> String {
        if self.qualified() {
            format!("{table}.{column}")
        } else {
            column.to_string()
        }
    }

    fn resolve_ordering(&self, name: &str) -> DjormResult<OrderBy> {
        let (descending, name) = match name.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, name),
        };
        let column = if self.extra.iter().any(|(alias, _)| alias == name) {
            name.to_string()
        } else {
            let (field, table) = self
                .resolve_field(name)
                .ok_or_else(|| self.unknown_field(name))?;
            self.column_ref(&table, &field.column)
        };
        Ok(if descending {
            OrderBy::desc(column)
        } else {
            OrderBy::asc(column)
        })
    }

    // ── Chaining ─────────────────────────────────────────────────────

    /// Returns a copy of this queryset.
    #[must_use]
    pub fn all(&self) -> Self {
        self.clone()
    }

    /// Narrows the queryset by keyword lookups, ANDed together and with any
    /// earlier filters.
    ///
    /// Keywords are `field` or `field__<lookup>`; `pk` names the primary
    /// key. Unknown fields and lookups fail here, not at execution.
    pub fn filter(&self, lookups: &[(&str, Value)]) -> DjormResult<Self> {
        if !lookups.is_empty() && self.is_sliced() {
            return Err(DjormError::QueryState(SLICED_FILTER.into()));
        }
        let mut clone = self.clone();
        for (keyword, value) in lookups {
            let (name, kind) = split_lookup(keyword)?;
            let (field, table) = self
                .resolve_field(name)
                .ok_or_else(|| self.unknown_field(name))?;
            let value = match kind {
                LookupType::Exact | LookupType::Lte => field.to_python(value.clone())?,
                LookupType::In => match value {
                    Value::List(items) => Value::List(
                        items
                            .iter()
                            .map(|v| field.to_python(v.clone()))
                            .collect::<DjormResult<_>>()?,
                    ),
                    other => field.to_python(other.clone())?,
                },
                _ => value.clone(),
            };
            clone.conditions.push(Predicate {
                table,
                column: field.column.clone(),
                lookup: Lookup::build(kind, value)?,
            });
        }
        Ok(clone)
    }

    /// Replaces the ordering. A leading `-` sorts descending; `pk` names
    /// the primary key. With no names the model's default ordering applies.
    pub fn order_by(&self, names: &[&str]) -> DjormResult<Self> {
        if self.is_sliced() {
            return Err(DjormError::QueryState(SLICED_ORDER.into()));
        }
        let mut clone = self.clone();
        clone.order_by = names
            .iter()
            .map(|name| self.resolve_ordering(name))
            .collect::<DjormResult<_>>()?;
        Ok(clone)
    }

    /// Reads from (and writes to) `alias` instead of the router's choice.
    #[must_use]
    pub fn using(&self, alias: impl Into<String>) -> Self {
        let mut clone = self.clone();
        clone.db = Some(alias.into());
        clone
    }

    /// Adds computed columns, selected as `(sql) AS alias`.
    pub fn extra(&self, select: &[(&str, &str)]) -> DjormResult<Self> {
        if self.is_sliced() {
            return Err(DjormError::QueryState(SLICED_CHANGE.into()));
        }
        let mut clone = self.clone();
        for (alias, sql) in select {
            match clone.extra.iter_mut().find(|(a, _)| a == alias) {
                Some(slot) => slot.1 = (*sql).to_string(),
                None => clone.extra.push(((*alias).to_string(), (*sql).to_string())),
            }
        }
        Ok(clone)
    }

    /// Narrows the window to `range`, relative to any window already set.
    ///
    /// Bounds saturate at `usize::MAX`, which reads as "to the end".
    #[must_use]
    pub fn slice(&self, range: impl RangeBounds<usize>) -> Self {
        let low = match range.start_bound() {
            Bound::Included(&n) => Some(n),
            Bound::Excluded(&n) => Some(n.saturating_add(1)),
            Bound::Unbounded => None,
        };
        let high = match range.end_bound() {
            Bound::Included(&n) => Some(n.saturating_add(1)),
            Bound::Excluded(&n) => Some(n),
            Bound::Unbounded => None,
        };
        let mut clone = self.clone();
        clone.set_limits(low, high);
        clone
    }

    fn set_limits(&mut self, low: Option<usize>, high: Option<usize>) {
        if let Some(high) = high {
            let bound = self.low_mark.saturating_add(high);
            self.high_mark = Some(self.high_mark.map_or(bound, |h| h.min(bound)));
        }
        if let Some(low) = low {
            let bound = self.low_mark.saturating_add(low);
            self.low_mark = self.high_mark.map_or(bound, |h| h.min(bound));
        }
    }

    /// A field-mapping projection of this queryset.
    ///
    /// Names may be fields, `pk` or extra columns. With no names every
    /// field (keyed by attribute name) and extra column is selected.
    pub fn values(&self, fields: &[&str]) -> DjormResult<QuerySet<Values>> {
        let columns = if fields.is_empty() {
            self.model
                .meta()
                .get_fields_with_model()
                .iter()
                .map(|(f, _)| f.attname.as_str())
                .chain(self.extra.iter().map(|(alias, _)| alias.as_str()))
                .map(|name| self.values_column(name))
                .collect::<DjormResult<Vec<_>>>()?
        } else {
            fields
                .iter()
                .map(|name| self.values_column(name))
                .collect::<DjormResult<Vec<_>>>()?
        };
        Ok(self.chain(Values { columns }))
    }

    fn values_column(&self, name: &str) -> DjormResult<ValuesColumn> {
        if self.extra.iter().any(|(alias, _)| alias == name) {
            return Ok(ValuesColumn::Extra { key: name.into() });
        }
        self.resolve_field(name)
            .map(|(field, table)| ValuesColumn::Field {
                key: name.into(),
                field,
                table,
            })
            .ok_or_else(|| {
                DjormError::UnknownProjectionField(format!(
                    "Cannot resolve keyword '{name}' into field. Choices are: {}",
                    self.field_choices()
                ))
            })
    }

    /// The distinct dates of a date field matching this queryset.
    ///
    /// `kind` is `year`, `month` or `day` and `order` is `ASC` or `DESC`;
    /// both are checked before anything runs.
    pub fn dates(&self, field_name: &str, kind: &str, order: &str) -> DjormResult<QuerySet<Dates>> {
        let kind = DateKind::parse(kind)?;
        let descending = match order {
            "ASC" => false,
            "DESC" => true,
            _ => {
                return Err(DjormError::InvalidArgument(
                    "'order' must be either 'ASC' or 'DESC'.".into(),
                ))
            }
        };
        let (field, table) = self
            .resolve_field(field_name)
            .ok_or_else(|| self.unknown_field(field_name))?;
        if !field.field_type.is_temporal() {
            return Err(DjormError::InvalidArgument(format!(
                "'{}' isn't a DateField.",
                field.name
            )));
        }
        let mut clone = self.chain(Dates {
            column: self.column_ref(&table, &field.column),
            kind,
            descending,
        });
        clone.conditions.push(Predicate {
            table,
            column: field.column.clone(),
            lookup: Lookup::IsNull(false),
        });
        Ok(clone)
    }

    // ── SQL ──────────────────────────────────────────────────────────

    fn base_query(&self) -> DjormResult<Query> {
        let mut query = Query::new(self.main_table());
        query.joins.clone_from(&self.joins);
        query.where_clause = where_node(&self.conditions, self.qualified());
        query.order_by = match self.projection.ordering() {
            Some(ordering) => ordering,
            None if !self.order_by.is_empty() => self.order_by.clone(),
            None if self.default_ordering => self
                .model
                .meta()
                .ordering
                .iter()
                .map(|name| self.resolve_ordering(name))
                .collect::<DjormResult<_>>()?,
            None => Vec::new(),
        };
        query.offset = (self.low_mark > 0).then_some(self.low_mark);
        query.limit = self.high_mark.map(|high| high.saturating_sub(self.low_mark));
        Ok(query)
    }

    fn build_query(&self, db: &str) -> DjormResult<Query> {
        let mut query = self.base_query()?;
        let source = RowSource {
            model: &self.model,
            extra: &self.extra,
            qualified: self.qualified(),
            db,
        };
        query.select = self.projection.select(&source);
        query.distinct = self.projection.distinct();
        Ok(query)
    }

    /// The SELECT this queryset runs.
    pub fn to_sql(&self, backend: DatabaseBackendType) -> DjormResult<(String, Vec<Value>)> {
        let query = self.build_query("")?;
        Ok(SqlCompiler::new(backend).compile_select(&query))
    }

    /// The alias reads go to.
    pub fn db(&self, conns: &ConnectionHandler) -> String {
        if self.for_write {
            return self.write_db(conns);
        }
        self.db.clone().unwrap_or_else(|| {
            let meta = self.model.meta();
            conns.router().db_for_read(&meta.app_label, &meta.object_name)
        })
    }

    fn write_db(&self, conns: &ConnectionHandler) -> String {
        self.db.clone().unwrap_or_else(|| {
            let meta = self.model.meta();
            conns.router().db_for_write(&meta.app_label, &meta.object_name)
        })
    }

    // ── Evaluation ───────────────────────────────────────────────────

    fn execute(&mut self, conns: &mut ConnectionHandler) -> DjormResult<()> {
        let db = self.db(conns);
        let rows = if self.high_mark == Some(self.low_mark) {
            Vec::new()
        } else {
            let query = self.build_query(&db)?;
            let conn = conns.get(&db)?;
            let (sql, params) = conn.compiler().compile_select(&query);
            conn.query(&sql, &params)?
        };
        self.pending = (!rows.is_empty()).then(|| rows.into_iter());
        self.result_cache = Some(Vec::new());
        self.loaded_from = db;
        Ok(())
    }

    fn ensure_executed(&mut self, conns: &mut ConnectionHandler) -> DjormResult<()> {
        if self.result_cache.is_none() {
            self.execute(conns)?;
        }
        Ok(())
    }

    /// Turns up to `num` more pending rows into cached items.
    fn fill_cache(&mut self, num: usize) -> DjormResult<()> {
        let Some(pending) = self.pending.as_mut() else {
            return Ok(());
        };
        let cache = self.result_cache.get_or_insert_with(Vec::new);
        let source = RowSource {
            model: &self.model,
            extra: &self.extra,
            qualified: !self.joins.is_empty(),
            db: &self.loaded_from,
        };
        let mut failure = None;
        for row in pending.by_ref().take(num) {
            match self.projection.build(&source, row) {
                Ok(item) => cache.push(item),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        if failure.is_some() || pending.as_slice().is_empty() {
            self.pending = None;
        }
        failure.map_or(Ok(()), Err)
    }

    fn fill_to(&mut self, bound: usize) -> DjormResult<()> {
        let cached = self.result_cache.as_ref().map_or(0, Vec::len);
        if cached < bound {
            self.fill_cache(bound - cached)?;
        }
        Ok(())
    }

    fn fill_all(&mut self) -> DjormResult<()> {
        while self.pending.is_some() {
            self.fill_cache(CHUNK_SIZE)?;
        }
        Ok(())
    }

    /// Iterates the results, running the query on first use.
    pub fn iter(&mut self, conns: &mut ConnectionHandler) -> DjormResult<QuerySetIter<'_, P>> {
        self.ensure_executed(conns)?;
        Ok(QuerySetIter { qs: self, pos: 0 })
    }

    /// Number of results; loads them all.
    pub fn len(&mut self, conns: &mut ConnectionHandler) -> DjormResult<usize> {
        self.ensure_executed(conns)?;
        self.fill_all()?;
        Ok(self.result_cache.as_ref().map_or(0, Vec::len))
    }

    /// All results.
    pub fn fetch_all(&mut self, conns: &mut ConnectionHandler) -> DjormResult<Vec<P::Item>> {
        self.len(conns)?;
        Ok(self.result_cache.clone().unwrap_or_default())
    }

    /// Returns `true` if there is at least one result, loading the first
    /// chunk.
    pub fn has_results(&mut self, conns: &mut ConnectionHandler) -> DjormResult<bool> {
        self.ensure_executed(conns)?;
        self.fill_to(1)?;
        Ok(self.result_cache.as_ref().is_some_and(|c| !c.is_empty()))
    }

    /// The result at `index`.
    ///
    /// Served from the cache when results are loaded (extending it as far as
    /// needed); otherwise only that one row is queried.
    pub fn get_item(&mut self, conns: &mut ConnectionHandler, index: usize) -> DjormResult<P::Item> {
        let out_of_range = || DjormError::IndexOutOfRange("list index out of range".into());
        let end = index.checked_add(1).ok_or_else(out_of_range)?;
        if self.result_cache.is_some() {
            self.fill_to(end)?;
            return self
                .result_cache
                .as_ref()
                .and_then(|c| c.get(index))
                .cloned()
                .ok_or_else(out_of_range);
        }
        let mut qs = self.clone();
        qs.set_limits(Some(index), Some(end));
        qs.fetch_all(conns)?.into_iter().next().ok_or_else(out_of_range)
    }

    /// Loads the window `range` and keeps every `step`-th result.
    pub fn slice_step(
        &self,
        conns: &mut ConnectionHandler,
        range: impl RangeBounds<usize>,
        step: usize,
    ) -> DjormResult<Vec<P::Item>> {
        if step == 0 {
            return Err(DjormError::InvalidArgument("slice step cannot be zero".into()));
        }
        let mut qs = self.slice(range);
        Ok(qs.fetch_all(conns)?.into_iter().step_by(step).collect())
    }

    /// Number of matching rows: the cache length when everything is loaded,
    /// a `COUNT(*)` otherwise.
    pub fn count(&self, conns: &mut ConnectionHandler) -> DjormResult<usize> {
        if let (Some(cache), None) = (&self.result_cache, &self.pending) {
            return Ok(cache.len());
        }
        let db = self.db(conns);
        let mut query = self.build_query(&db)?;
        query.order_by.clear();
        let conn = conns.get(&db)?;
        let (sql, params) = conn.compiler().compile_count(&query);
        let rows = conn.query(&sql, &params)?;
        let count: i64 = rows.first().map_or(Ok(0), |row| row.get_by_index(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Returns `true` if any row matches, without loading rows unless they
    /// are being loaded already.
    pub fn exists(&mut self, conns: &mut ConnectionHandler) -> DjormResult<bool> {
        if self.result_cache.is_some() {
            self.fill_to(1)?;
            return Ok(self.result_cache.as_ref().is_some_and(|c| !c.is_empty()));
        }
        let db = self.db(conns);
        let mut query = self.base_query()?;
        query.order_by.clear();
        let conn = conns.get(&db)?;
        let (sql, params) = conn.compiler().compile_exists(&query);
        Ok(!conn.query(&sql, &params)?.is_empty())
    }

    /// The single result matching `lookups`.
    ///
    /// No match is a `DoesNotExist` error and several matches a
    /// `MultipleObjectsReturned` error, both scoped to the model.
    pub fn get(&self, conns: &mut ConnectionHandler, lookups: &[(&str, Value)]) -> DjormResult<P::Item> {
        let mut clone = self.filter(lookups)?;
        let num = clone.len(conns)?;
        let object_name = &self.model.meta().object_name;
        match num {
            1 => clone
                .result_cache
                .and_then(|mut c| c.pop())
                .ok_or_else(|| DjormError::DatabaseError("result vanished".into())),
            0 => Err(self
                .model
                .does_not_exist(format!("{object_name} matching query does not exist."))),
            n => {
                let params: Vec<String> = lookups
                    .iter()
                    .map(|(k, v)| format!("'{k}': {}", v.repr()))
                    .collect();
                Err(self.model.multiple_objects_returned(format!(
                    "get() returned more than one {object_name} -- it returned {n}! Lookup parameters were {{{}}}",
                    params.join(", ")
                )))
            }
        }
    }

    /// The latest result by `field_name`, or by the model's `get_latest_by`.
    pub fn latest(&self, conns: &mut ConnectionHandler, field_name: Option<&str>) -> DjormResult<P::Item> {
        let latest_by = field_name
            .map(str::to_string)
            .or_else(|| self.model.meta().get_latest_by.clone())
            .ok_or_else(|| {
                DjormError::InvalidArgument(
                    "latest() requires either a field_name parameter or 'get_latest_by' in the model"
                        .into(),
                )
            })?;
        if self.is_sliced() {
            return Err(DjormError::QueryState(SLICED_CHANGE.into()));
        }
        let descending = format!("-{latest_by}");
        let mut qs = self.order_by(&[descending.as_str()])?;
        qs.set_limits(None, Some(1));
        qs.get(conns, &[])
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// A WHERE clause on the main table selecting the matched rows.
    fn write_filter(&self, table: &str, pk_column: &str) -> DjormResult<Option<WhereNode>> {
        let main = self.main_table();
        if table == main && self.conditions.iter().all(|p| p.table == main) {
            return Ok(where_node(&self.conditions, false));
        }
        let mut inner = self.base_query()?;
        inner.order_by.clear();
        inner.select = vec![SelectColumn::Column(format!("{table}.{pk_column}"))];
        Ok(Some(WhereNode::InSubquery {
            column: pk_column.to_string(),
            query: Box::new(inner),
        }))
    }

    fn run_updates(
        &self,
        conns: &mut ConnectionHandler,
        db: &str,
        groups: &[(String, String, Vec<(String, Value)>)],
    ) -> DjormResult<u64> {
        let mut first = None;
        for (table, pk_column, values) in groups {
            let filter = self.write_filter(table, pk_column)?;
            let conn = conns.get(db)?;
            let fields: Vec<(&str, Value)> =
                values.iter().map(|(c, v)| (c.as_str(), v.clone())).collect();
            let (sql, params) = conn.compiler().compile_update(table, &fields, filter.as_ref());
            let rows = conn.execute(&sql, &params)?;
            first.get_or_insert(rows);
        }
        Ok(first.unwrap_or(0))
    }

    /// Updates every matched row; returns the number of main-table rows
    /// touched.
    ///
    /// Inherited fields are written to their parent tables. Runs in its own
    /// transaction unless the connection is already managed.
    pub fn update(&mut self, conns: &mut ConnectionHandler, values: &[(&str, Value)]) -> DjormResult<u64> {
        if self.is_sliced() {
            return Err(DjormError::QueryState(
                "Cannot update a query once a slice has been taken.".into(),
            ));
        }
        let mut groups: Vec<(String, String, Vec<(String, Value)>)> = Vec::new();
        for (name, value) in values {
            let (field, table) = self
                .resolve_field(name)
                .ok_or_else(|| self.unknown_field(name))?;
            let pk_column = if table == self.main_table() {
                self.model.meta().pk_field()?.column.clone()
            } else {
                self.joins
                    .iter()
                    .find(|j| j.table == table)
                    .map(|j| j.column.clone())
                    .ok_or_else(|| self.unknown_field(name))?
            };
            let entry = (field.column.clone(), value.clone());
            match groups.iter_mut().find(|(t, _, _)| *t == table) {
                Some(group) => group.2.push(entry),
                None => groups.push((table, pk_column, vec![entry])),
            }
        }
        // Main table first.
        groups.sort_by_key(|(t, _, _)| t != self.main_table());

        self.for_write = true;
        let db = self.write_db(conns);
        let forced_managed = {
            let conn = conns.get(&db)?;
            let forced = !conn.is_managed();
            if forced {
                conn.enter_transaction_management(true);
                conn.managed(true)?;
            }
            forced
        };
        let result = self.run_updates(conns, &db, &groups).and_then(|rows| {
            let conn = conns.get(&db)?;
            if forced_managed {
                conn.commit()?;
            } else {
                conn.commit_unless_managed()?;
            }
            Ok(rows)
        });
        if forced_managed {
            let left = conns.get(&db).and_then(|conn| {
                if result.is_err() {
                    conn.rollback()?;
                }
                conn.leave_transaction_management()
            });
            if result.is_ok() {
                left?;
            }
        }
        self.result_cache = None;
        self.pending = None;
        result
    }

    /// Updates columns of the main table for the matched rows, without any
    /// transaction handling. Used by instance saves.
    pub(crate) fn update_columns(
        &mut self,
        conns: &mut ConnectionHandler,
        values: &[(String, Value)],
    ) -> DjormResult<u64> {
        let db = self.write_db(conns);
        let table = self.main_table().to_string();
        let pk_column = self.model.meta().pk_field()?.column.clone();
        self.result_cache = None;
        self.pending = None;
        self.run_updates(conns, &db, &[(table, pk_column, values.to_vec())])
    }

    /// Deletes every matched row of the main table in one statement.
    ///
    /// Without filters the whole table is emptied.
    pub fn delete(&mut self, conns: &mut ConnectionHandler) -> DjormResult<u64> {
        if self.is_sliced() {
            return Err(DjormError::QueryState(
                "Cannot use 'limit' or 'offset' with delete.".into(),
            ));
        }
        self.for_write = true;
        let db = self.write_db(conns);
        let table = self.main_table().to_string();
        let pk_column = self.model.meta().pk_field()?.column.clone();
        let filter = self.write_filter(&table, &pk_column)?;
        let conn = conns.get(&db)?;
        let (sql, params) = conn.compiler().compile_delete(&table, filter.as_ref());
        let rows = conn.execute(&sql, &params)?;
        conn.commit_unless_managed()?;
        self.result_cache = None;
        self.pending = None;
        Ok(rows)
    }
}

/// Iterator over a queryset's results, extending the cache as it goes.
#[derive(Debug)]
pub struct QuerySetIter<'a, P: Projection> {
    qs: &'a mut QuerySet<P>,
    pos: usize,
}

impl<P: Projection> Iterator for QuerySetIter<'_, P> {
    type Item = DjormResult<P::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let cached = self.qs.result_cache.as_ref().map_or(0, Vec::len);
        if self.pos >= cached {
            self.qs.pending.as_ref()?;
            if let Err(err) = self.qs.fill_cache(CHUNK_SIZE) {
                return Some(Err(err));
            }
        }
        let item = self.qs.result_cache.as_ref()?.get(self.pos)?.clone();
        self.pos += 1;
        Some(Ok(item))
    }
}

/// INSERTs `objs` into `model`'s own table, one statement each.
///
/// With `raw` the instance values are written as they are; otherwise fields
/// may stamp values first (`auto_now`). With `return_id` the generated keys
/// are returned in order.
pub fn insert_query(
    conns: &mut ConnectionHandler,
    model: &Arc<ModelClass>,
    objs: &mut [Instance],
    fields: &[Arc<Field>],
    return_id: bool,
    raw: bool,
    using: &str,
) -> DjormResult<Vec<Value>> {
    let table = model.meta().db_table.clone();
    let conn = conns.get(using)?;
    let compiler = conn.compiler();
    let mut ids = Vec::new();
    for obj in objs.iter_mut() {
        let values: Vec<(&str, Value)> = fields
            .iter()
            .map(|f| {
                let value = if raw {
                    obj.raw_value(f)
                } else {
                    obj.pre_save_value(f, true)
                };
                (f.column.as_str(), value)
            })
            .collect();
        let (sql, params) = compiler.compile_insert(&table, &values);
        if return_id {
            ids.push(conn.insert_returning_id(&sql, &params)?);
        } else {
            conn.execute(&sql, &params)?;
        }
    }
    Ok(ids)
}
