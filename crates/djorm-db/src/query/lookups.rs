//! Filter lookups.
//!
//! A filter keyword such as `pub_date__year` names a field and, after the
//! double underscore, a lookup type. [`split_lookup`] takes the keyword
//! apart and [`Lookup::build`] turns the lookup type and the right-hand
//! value into a [`Lookup`] the compiler understands. Both fail immediately
//! on anything unsupported so a bad filter never reaches the database.
//!
//! # Examples
//!
//! ```
//! use djorm_db::query::lookups::{split_lookup, DatePart, Lookup};
//! use djorm_db::value::Value;
//!
//! let (field, kind) = split_lookup("pub_date__week_day").unwrap();
//! assert_eq!(field, "pub_date");
//!
//! // Week days are 1-based (Sunday = 1) on input and 0-based in SQL.
//! let lookup = Lookup::build(kind, Value::from(1)).unwrap();
//! assert_eq!(lookup, Lookup::DatePart(DatePart::WeekDay, Value::Int(0)));
//! ```

use djorm_core::{DjormError, DjormResult};

use crate::value::Value;

/// Separator between a field name and its lookup type.
pub const LOOKUP_SEP: &str = "__";

/// A calendar component extracted from a date column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatePart {
    /// Four-digit year.
    Year,
    /// Month, 1-12.
    Month,
    /// Day of month, 1-31.
    Day,
    /// Day of week, 0 = Sunday.
    WeekDay,
}

impl DatePart {
    /// The name used by `EXTRACT` on `PostgreSQL`.
    pub const fn extract_name(self) -> &'static str {
        match self {
            Self::Year => "year",
            Self::Month => "month",
            Self::Day => "day",
            Self::WeekDay => "dow",
        }
    }

    /// The `strftime` format used on `SQLite`.
    pub const fn strftime_format(self) -> &'static str {
        match self {
            Self::Year => "%Y",
            Self::Month => "%m",
            Self::Day => "%d",
            Self::WeekDay => "%w",
        }
    }
}

/// The lookup types a filter keyword may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupType {
    /// `field` or `field__exact`.
    Exact,
    /// `field__in`.
    In,
    /// `field__lte`.
    Lte,
    /// `field__startswith`.
    StartsWith,
    /// `field__year`, `field__month`, `field__day`, `field__week_day`.
    DatePart(DatePart),
}

impl LookupType {
    /// Parses a lookup suffix.
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "exact" => Self::Exact,
            "in" => Self::In,
            "lte" => Self::Lte,
            "startswith" => Self::StartsWith,
            "year" => Self::DatePart(DatePart::Year),
            "month" => Self::DatePart(DatePart::Month),
            "day" => Self::DatePart(DatePart::Day),
            "week_day" => Self::DatePart(DatePart::WeekDay),
            _ => return None,
        })
    }
}

/// A compiled column comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// `column = value`, or `IS NULL` for a null value.
    Exact(Value),
    /// `column IN (values...)`.
    In(Vec<Value>),
    /// `column <= value`.
    Lte(Value),
    /// The column starts with the given text (case-sensitive).
    StartsWith(String),
    /// A calendar component of the column equals the value.
    DatePart(DatePart, Value),
    /// `column IS NULL` / `IS NOT NULL`.
    IsNull(bool),
}

impl Lookup {
    /// Builds a lookup from its type and right-hand value.
    ///
    /// `week_day` values are converted from 1-based to 0-based here.
    pub fn build(kind: LookupType, value: Value) -> DjormResult<Self> {
        Ok(match kind {
            LookupType::Exact => Self::Exact(value),
            LookupType::Lte => Self::Lte(value),
            LookupType::In => match value {
                Value::List(values) => Self::In(values),
                other => Self::In(vec![other]),
            },
            LookupType::StartsWith => match value {
                Value::String(s) => Self::StartsWith(s),
                Value::Null => {
                    return Err(DjormError::InvalidLookup(
                        "startswith does not accept a null value".into(),
                    ))
                }
                other => Self::StartsWith(other.to_string()),
            },
            LookupType::DatePart(part) => {
                let n = date_part_value(&value)?;
                let n = if part == DatePart::WeekDay { n - 1 } else { n };
                Self::DatePart(part, Value::Int(n))
            }
        })
    }
}

fn date_part_value(value: &Value) -> DjormResult<i64> {
    match value {
        Value::Int(i) => Ok(*i),
        Value::String(s) => s.trim().parse::<i64>().map_err(|_| {
            DjormError::InvalidLookup(format!("'{s}' is not a valid date component"))
        }),
        other => Err(DjormError::InvalidLookup(format!(
            "{} is not a valid date component",
            other.repr()
        ))),
    }
}

/// Splits a filter keyword into its field name and lookup type.
///
/// A bare field name means `exact`. More than one separator, or an unknown
/// suffix, is rejected.
pub fn split_lookup(keyword: &str) -> DjormResult<(&str, LookupType)> {
    let parts: Vec<&str> = keyword.split(LOOKUP_SEP).collect();
    match parts.as_slice() {
        [field] if !field.is_empty() => Ok((field, LookupType::Exact)),
        [field, lookup] if !field.is_empty() => LookupType::parse(lookup)
            .map(|kind| (*field, kind))
            .ok_or_else(|| {
                DjormError::InvalidLookup(format!(
                    "Join on field '{field}' not permitted. Did you misspell '{lookup}' for the lookup type?"
                ))
            }),
        [_, _, ..] => Err(DjormError::InvalidLookup(format!(
            "Cannot resolve keyword '{keyword}': lookups across relations are not supported"
        ))),
        _ => Err(DjormError::InvalidLookup(format!(
            "Cannot resolve keyword '{keyword}' into field"
        ))),
    }
}
