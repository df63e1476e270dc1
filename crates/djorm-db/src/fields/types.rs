//! Field type definitions for the ORM.
//!
//! Each [`FieldType`] variant corresponds to a Django model field class, and
//! [`Field`] captures everything about one declared field: its names, its
//! column, its constraints and its default policy.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};

use djorm_core::i18n::LazyString;
use djorm_core::{DjormError, DjormResult};

use crate::query::compiler::DatabaseBackendType;
use crate::value::Value;

/// Issued to user-declared fields, counting up from 0.
static CREATION_COUNTER: AtomicI64 = AtomicI64::new(0);
/// Issued to auto-created fields, counting down from -1.
static AUTO_CREATION_COUNTER: AtomicI64 = AtomicI64::new(-1);

/// The type of a model field, determining its column type and conversions.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum FieldType {
    /// Auto-incrementing integer primary key.
    AutoField,
    /// Auto-incrementing 64-bit integer primary key.
    BigAutoField,
    /// Boolean (true/false).
    BooleanField,
    /// Variable-length string with a max length.
    CharField,
    /// Unlimited-length text.
    TextField,
    /// 32-bit signed integer.
    IntegerField,
    /// 64-bit signed integer.
    BigIntegerField,
    /// 64-bit floating-point number.
    FloatField,
    /// Date without time.
    DateField,
    /// Date and time.
    DateTimeField,
    /// Many-to-one relationship. The value stored is the target's primary key.
    ForeignKey {
        /// The target model label (e.g. "auth.User").
        to: String,
    },
    /// One-to-one relationship (unique foreign key).
    OneToOneField {
        /// The target model label.
        to: String,
        /// `true` for the link a multi-table child keeps to its parent.
        parent_link: bool,
    },
}

impl FieldType {
    /// Returns `true` for the auto-incrementing primary-key types.
    pub const fn is_auto(&self) -> bool {
        matches!(self, Self::AutoField | Self::BigAutoField)
    }

    /// Returns `true` if this field points at another model.
    pub const fn is_relation(&self) -> bool {
        matches!(self, Self::ForeignKey { .. } | Self::OneToOneField { .. })
    }

    /// Returns the target model label of a relation.
    pub fn related_model(&self) -> Option<&str> {
        match self {
            Self::ForeignKey { to } | Self::OneToOneField { to, .. } => Some(to),
            _ => None,
        }
    }

    /// Returns `true` for date and date-time fields.
    pub const fn is_temporal(&self) -> bool {
        matches!(self, Self::DateField | Self::DateTimeField)
    }

    /// Returns the Django class name of this field type.
    pub const fn internal_type(&self) -> &'static str {
        match self {
            Self::AutoField => "AutoField",
            Self::BigAutoField => "BigAutoField",
            Self::BooleanField => "BooleanField",
            Self::CharField => "CharField",
            Self::TextField => "TextField",
            Self::IntegerField => "IntegerField",
            Self::BigIntegerField => "BigIntegerField",
            Self::FloatField => "FloatField",
            Self::DateField => "DateField",
            Self::DateTimeField => "DateTimeField",
            Self::ForeignKey { .. } => "ForeignKey",
            Self::OneToOneField { .. } => "OneToOneField",
        }
    }

    /// Returns the column type for `backend`.
    ///
    /// Relations use the integer type of the auto primary key they point at.
    pub fn column_type(&self, backend: DatabaseBackendType, max_length: Option<usize>) -> String {
        match backend {
            DatabaseBackendType::SQLite => self.sqlite_column_type(max_length),
            DatabaseBackendType::PostgreSQL => self.pg_column_type(max_length),
        }
    }

    fn sqlite_column_type(&self, max_length: Option<usize>) -> String {
        match self {
            Self::AutoField
            | Self::IntegerField
            | Self::ForeignKey { .. }
            | Self::OneToOneField { .. } => "integer".to_string(),
            Self::BigAutoField | Self::BigIntegerField => "bigint".to_string(),
            Self::BooleanField => "bool".to_string(),
            Self::CharField => format!("varchar({})", max_length.unwrap_or(255)),
            Self::TextField => "text".to_string(),
            Self::FloatField => "real".to_string(),
            Self::DateField => "date".to_string(),
            Self::DateTimeField => "datetime".to_string(),
        }
    }

    fn pg_column_type(&self, max_length: Option<usize>) -> String {
        match self {
            Self::AutoField => "serial".to_string(),
            Self::BigAutoField => "bigserial".to_string(),
            Self::IntegerField | Self::ForeignKey { .. } | Self::OneToOneField { .. } => {
                "integer".to_string()
            }
            Self::BigIntegerField => "bigint".to_string(),
            Self::BooleanField => "boolean".to_string(),
            Self::CharField => format!("varchar({})", max_length.unwrap_or(255)),
            Self::TextField => "text".to_string(),
            Self::FloatField => "double precision".to_string(),
            Self::DateField => "date".to_string(),
            Self::DateTimeField => "timestamp".to_string(),
        }
    }
}

/// How a field produces its value when none is given.
///
/// A static value is cloned; a resolver is called every time a default is
/// needed and never cached; lazy text is translated at that moment.
#[derive(Debug, Clone, Default)]
pub enum FieldDefault {
    /// No default: the field starts as NULL.
    #[default]
    NotProvided,
    /// A fixed value.
    Static(Value),
    /// A zero-argument producer, invoked on each use.
    Resolver(fn() -> Value),
    /// Translatable text realized on each use.
    Lazy(LazyString),
}

/// Complete definition of a model field.
///
/// # Examples
///
/// ```
/// use djorm_db::fields::{Field, FieldType};
///
/// let title = Field::new("title", FieldType::CharField).max_length(100).db_index();
/// assert_eq!(title.column, "title");
/// assert_eq!(title.verbose_name, "title");
///
/// let author = Field::new("author", FieldType::ForeignKey { to: "auth.User".into() });
/// assert_eq!(author.attname, "author_id");
/// ```
#[derive(Debug, Clone)]
pub struct Field {
    /// The declared name of this field.
    pub name: String,
    /// The attribute holding the value on instances (`author_id` for `author`).
    pub attname: String,
    /// The database column name.
    pub column: String,
    db_column: Option<String>,
    /// The type of this field.
    pub field_type: FieldType,
    /// Human-readable name for the field.
    pub verbose_name: String,
    explicit_verbose_name: bool,
    /// Whether this field is the primary key.
    pub primary_key: bool,
    /// Maximum character length (for `CharField`).
    pub max_length: Option<usize>,
    unique: bool,
    /// Whether the field may be left blank.
    pub blank: bool,
    /// Whether NULL is allowed in the database.
    pub null: bool,
    /// Whether a database index should be created.
    pub db_index: bool,
    /// Whether the field is user-editable.
    pub editable: bool,
    /// Whether the field is included in serialized output.
    pub serialize: bool,
    /// Set on every save (date fields only).
    pub auto_now: bool,
    /// Set on the first save (date fields only).
    pub auto_now_add: bool,
    /// Human-readable help text.
    pub help_text: String,
    /// `true` for fields the ORM synthesized (implicit `id`, parent links, `_order`).
    pub auto_created: bool,
    /// Declaration order; see [`Field::creation_counter`].
    pub creation_counter: i64,
    default: FieldDefault,
}

impl Field {
    /// Creates a user-declared field with the next creation counter.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        let counter = CREATION_COUNTER.fetch_add(1, AtomicOrdering::SeqCst);
        Self::with_counter(name.into(), field_type, counter, false)
    }

    /// Creates a field synthesized by the ORM.
    ///
    /// Auto-created fields draw from a separate, decreasing counter so they
    /// sort before every user field. This only reflects construction order:
    /// mixing both kinds compares the raw counters.
    pub fn auto_created(name: impl Into<String>, field_type: FieldType) -> Self {
        let counter = AUTO_CREATION_COUNTER.fetch_sub(1, AtomicOrdering::SeqCst);
        Self::with_counter(name.into(), field_type, counter, true)
    }

    /// Creates an auto-incrementing field.
    ///
    /// Fails unless `primary_key` is set: an auto field must be the key.
    pub fn auto(name: impl Into<String>, primary_key: bool) -> DjormResult<Self> {
        if !primary_key {
            return Err(DjormError::ModelDeclaration(
                "AutoFields must have primary_key=True.".into(),
            ));
        }
        Ok(Self::new(name, FieldType::AutoField).primary_key())
    }

    fn with_counter(name: String, field_type: FieldType, counter: i64, auto_created: bool) -> Self {
        let mut field = Self {
            attname: String::new(),
            column: String::new(),
            db_column: None,
            verbose_name: String::new(),
            explicit_verbose_name: false,
            name: String::new(),
            field_type,
            primary_key: false,
            max_length: None,
            unique: false,
            blank: false,
            null: false,
            db_index: false,
            editable: true,
            serialize: true,
            auto_now: false,
            auto_now_add: false,
            help_text: String::new(),
            auto_created,
            creation_counter: counter,
            default: FieldDefault::NotProvided,
        };
        field.set_attributes_from_name(&name);
        field
    }

    /// Derives `attname`, `column` and the default verbose name from `name`.
    pub fn set_attributes_from_name(&mut self, name: &str) {
        self.name = name.to_string();
        self.attname = if self.field_type.is_relation() {
            format!("{name}_id")
        } else {
            name.to_string()
        };
        self.column = self
            .db_column
            .clone()
            .unwrap_or_else(|| self.attname.clone());
        if !self.explicit_verbose_name {
            self.verbose_name = name.replace('_', " ");
        }
    }

    // ── Builder ──────────────────────────────────────────────────────

    /// Marks this field as the primary key. Primary keys may be blank.
    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.blank = true;
        self
    }

    /// Sets the database column name.
    #[must_use]
    pub fn db_column(mut self, column: impl Into<String>) -> Self {
        let column = column.into();
        self.column.clone_from(&column);
        self.db_column = Some(column);
        self
    }

    /// Sets the maximum character length.
    #[must_use]
    pub const fn max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    /// Adds a UNIQUE constraint.
    #[must_use]
    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Allows NULL values in the database.
    #[must_use]
    pub const fn nullable(mut self) -> Self {
        self.null = true;
        self
    }

    /// Allows blank values.
    #[must_use]
    pub const fn blank(mut self) -> Self {
        self.blank = true;
        self
    }

    /// Requests a database index.
    #[must_use]
    pub const fn db_index(mut self) -> Self {
        self.db_index = true;
        self
    }

    /// Sets whether the field is editable.
    #[must_use]
    pub const fn editable(mut self, editable: bool) -> Self {
        self.editable = editable;
        self
    }

    /// Sets whether the field is serialized.
    #[must_use]
    pub const fn serialize(mut self, serialize: bool) -> Self {
        self.serialize = serialize;
        self
    }

    /// Sets a fixed default value.
    #[must_use]
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = FieldDefault::Static(value.into());
        self
    }

    /// Sets a producer called each time a default is needed.
    #[must_use]
    pub fn default_with(mut self, resolver: fn() -> Value) -> Self {
        self.default = FieldDefault::Resolver(resolver);
        self
    }

    /// Sets translatable text as the default.
    #[must_use]
    pub fn default_lazy(mut self, text: LazyString) -> Self {
        self.default = FieldDefault::Lazy(text);
        self
    }

    /// Sets the verbose (human-readable) name.
    #[must_use]
    pub fn verbose_name(mut self, name: impl Into<String>) -> Self {
        self.verbose_name = name.into();
        self.explicit_verbose_name = true;
        self
    }

    /// Sets the help text.
    #[must_use]
    pub fn help_text(mut self, text: impl Into<String>) -> Self {
        self.help_text = text.into();
        self
    }

    /// Stamps the current time on every save. Implies non-editable and blank.
    #[must_use]
    pub const fn auto_now(mut self) -> Self {
        self.auto_now = true;
        self.editable = false;
        self.blank = true;
        self
    }

    /// Stamps the current time on the first save. Implies non-editable and blank.
    #[must_use]
    pub const fn auto_now_add(mut self) -> Self {
        self.auto_now_add = true;
        self.editable = false;
        self.blank = true;
        self
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// Checks the declaration for errors that make the field unusable.
    pub fn check(&self) -> DjormResult<()> {
        if self.field_type.is_auto() && !self.primary_key {
            return Err(DjormError::ModelDeclaration(format!(
                "AutoFields must have primary_key=True (field '{}').",
                self.name
            )));
        }
        if (self.auto_now || self.auto_now_add) && !self.field_type.is_temporal() {
            return Err(DjormError::ModelDeclaration(format!(
                "auto_now and auto_now_add only apply to date fields (field '{}').",
                self.name
            )));
        }
        Ok(())
    }

    /// Returns `true` if the column is unique (primary keys always are).
    pub const fn is_unique(&self) -> bool {
        self.unique || self.primary_key
    }

    /// Returns `true` if a default was supplied.
    pub const fn has_default(&self) -> bool {
        !matches!(self.default, FieldDefault::NotProvided)
    }

    /// Returns the default policy.
    pub const fn default_policy(&self) -> &FieldDefault {
        &self.default
    }

    /// Returns the value a new instance gets for this field.
    ///
    /// [`Value::Null`] unless a default was supplied. Resolvers run on every
    /// call.
    pub fn get_default(&self) -> Value {
        match &self.default {
            FieldDefault::NotProvided => Value::Null,
            FieldDefault::Static(value) => value.clone(),
            FieldDefault::Resolver(resolver) => resolver(),
            FieldDefault::Lazy(text) => Value::String(text.evaluate()),
        }
    }

    /// Returns the value to write at save time when the field overrides
    /// whatever the instance holds.
    pub fn pre_save(&self, add: bool) -> Option<Value> {
        if self.auto_now || (self.auto_now_add && add) {
            let now = chrono::Local::now().naive_local();
            return Some(match self.field_type {
                FieldType::DateField => Value::Date(now.date()),
                _ => Value::DateTime(now),
            });
        }
        None
    }

    /// Converts a value read from the database into the field's Rust form.
    #[allow(clippy::cast_precision_loss)]
    pub fn to_python(&self, value: Value) -> DjormResult<Value> {
        if value.is_null() {
            return Ok(value);
        }
        match (&self.field_type, value) {
            (FieldType::BooleanField, Value::Int(i)) => Ok(Value::Bool(i != 0)),
            (FieldType::FloatField, Value::Int(i)) => Ok(Value::Float(i as f64)),
            (FieldType::DateField, Value::String(s)) => parse_date(&s).map(Value::Date),
            (FieldType::DateField, Value::DateTime(dt)) => Ok(Value::Date(dt.date())),
            (FieldType::DateTimeField, Value::String(s)) => {
                parse_datetime(&s).map(Value::DateTime)
            }
            (FieldType::DateTimeField, Value::Date(d)) => Ok(Value::DateTime(
                d.and_hms_opt(0, 0, 0).unwrap_or_default(),
            )),
            (_, other) => Ok(other),
        }
    }
}

fn parse_date(s: &str) -> DjormResult<chrono::NaiveDate> {
    let head = s.get(..10).unwrap_or(s);
    chrono::NaiveDate::parse_from_str(head, "%Y-%m-%d").map_err(|_| {
        DjormError::InvalidArgument(format!(
            "'{s}' value has an invalid date format. It must be in YYYY-MM-DD format."
        ))
    })
}

fn parse_datetime(s: &str) -> DjormResult<chrono::NaiveDateTime> {
    const FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ];
    FORMATS
        .iter()
        .find_map(|fmt| chrono::NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(|| {
            DjormError::InvalidArgument(format!(
                "'{s}' value has an invalid format. It must be in YYYY-MM-DD HH:MM[:ss[.uuuuuu]] format."
            ))
        })
}

impl PartialEq for Field {
    fn eq(&self, other: &Self) -> bool {
        self.creation_counter == other.creation_counter
    }
}

impl Eq for Field {}

impl PartialOrd for Field {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Fields order by creation counter.
impl Ord for Field {
    fn cmp(&self, other: &Self) -> Ordering {
        self.creation_counter.cmp(&other.creation_counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_new_defaults() {
        let f = Field::new("first_name", FieldType::CharField);
        assert_eq!(f.name, "first_name");
        assert_eq!(f.attname, "first_name");
        assert_eq!(f.column, "first_name");
        assert!(!f.primary_key);
        assert!(!f.null);
        assert!(!f.blank);
        assert!(!f.has_default());
        assert!(!f.is_unique());
        assert!(f.editable);
        assert!(f.serialize);
        assert!(!f.auto_created);
        assert_eq!(f.verbose_name, "first name");
    }

    #[test]
    fn test_field_builder() {
        let f = Field::new("email", FieldType::CharField)
            .db_column("email_address")
            .unique()
            .db_index()
            .max_length(254)
            .verbose_name("Email Address")
            .help_text("Enter a valid email");
        assert_eq!(f.column, "email_address");
        assert_eq!(f.attname, "email");
        assert!(f.is_unique());
        assert!(f.db_index);
        assert_eq!(f.max_length, Some(254));
        assert_eq!(f.verbose_name, "Email Address");
        assert_eq!(f.help_text, "Enter a valid email");
    }

    #[test]
    fn test_primary_key_implies_blank_and_unique() {
        let f = Field::new("code", FieldType::CharField).primary_key();
        assert!(f.primary_key);
        assert!(f.blank);
        assert!(f.is_unique());
    }

    #[test]
    fn test_auto_field_requires_primary_key() {
        let err = Field::auto("id", false).unwrap_err();
        assert!(err.to_string().contains("AutoFields must have primary_key=True"));
        let ok = Field::auto("id", true).unwrap();
        assert!(ok.primary_key);
        assert!(ok.check().is_ok());

        let sneaky = Field::new("id", FieldType::AutoField);
        assert!(matches!(sneaky.check(), Err(DjormError::ModelDeclaration(_))));
    }

    #[test]
    fn test_auto_now_only_on_dates() {
        let bad = Field::new("n", FieldType::IntegerField).auto_now();
        assert!(bad.check().is_err());
        let good = Field::new("stamp", FieldType::DateTimeField).auto_now();
        assert!(good.check().is_ok());
        assert!(!good.editable);
        assert!(matches!(good.pre_save(false), Some(Value::DateTime(_))));
    }

    #[test]
    fn test_auto_now_add_only_on_insert() {
        let f = Field::new("created", FieldType::DateField).auto_now_add();
        assert!(matches!(f.pre_save(true), Some(Value::Date(_))));
        assert!(f.pre_save(false).is_none());
    }

    #[test]
    fn test_relation_attname() {
        let fk = Field::new("author", FieldType::ForeignKey { to: "auth.User".into() });
        assert_eq!(fk.attname, "author_id");
        assert_eq!(fk.column, "author_id");
        assert_eq!(fk.field_type.related_model(), Some("auth.User"));
        assert!(fk.field_type.is_relation());
    }

    #[test]
    fn test_get_default_variants() {
        let none = Field::new("a", FieldType::IntegerField);
        assert_eq!(none.get_default(), Value::Null);

        let fixed = Field::new("b", FieldType::IntegerField).default(5);
        assert!(fixed.has_default());
        assert_eq!(fixed.get_default(), Value::Int(5));

        let produced = Field::new("c", FieldType::IntegerField).default_with(|| Value::Int(9));
        assert_eq!(produced.get_default(), Value::Int(9));

        let lazy = Field::new("d", FieldType::CharField)
            .default_lazy(djorm_core::i18n::gettext_lazy("nobody"));
        assert_eq!(lazy.get_default(), Value::from("nobody"));
    }

    #[test]
    fn test_resolver_invoked_each_time() {
        use std::sync::atomic::AtomicUsize;
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        fn counted() -> Value {
            Value::Int(CALLS.fetch_add(1, AtomicOrdering::SeqCst) as i64)
        }
        let f = Field::new("seq", FieldType::IntegerField).default_with(counted);
        let first = f.get_default();
        let second = f.get_default();
        assert_ne!(first, second);
    }

    #[test]
    fn test_creation_counter_ordering() {
        let a = Field::new("a", FieldType::IntegerField);
        let b = Field::new("b", FieldType::IntegerField);
        let auto = Field::auto_created("id", FieldType::AutoField);
        assert!(a < b);
        assert!(auto < a);
        assert!(auto.creation_counter < 0);
        assert!(auto.auto_created);
        let auto2 = Field::auto_created("x_ptr", FieldType::IntegerField);
        assert!(auto2 < auto);
    }

    #[test]
    fn test_column_types() {
        let sqlite = DatabaseBackendType::SQLite;
        let pg = DatabaseBackendType::PostgreSQL;
        assert_eq!(FieldType::CharField.column_type(sqlite, Some(30)), "varchar(30)");
        assert_eq!(FieldType::AutoField.column_type(sqlite, None), "integer");
        assert_eq!(FieldType::AutoField.column_type(pg, None), "serial");
        assert_eq!(FieldType::FloatField.column_type(pg, None), "double precision");
        assert_eq!(FieldType::DateTimeField.column_type(sqlite, None), "datetime");
    }

    #[test]
    fn test_to_python_conversions() {
        let b = Field::new("flag", FieldType::BooleanField);
        assert_eq!(b.to_python(Value::Int(1)).unwrap(), Value::Bool(true));

        let d = Field::new("day", FieldType::DateField);
        let parsed = d.to_python(Value::from("2024-03-05")).unwrap();
        assert_eq!(
            parsed,
            Value::Date(chrono::NaiveDate::from_ymd_opt(2024, 3, 5).unwrap())
        );
        assert!(d.to_python(Value::from("yesterday")).is_err());

        let dt = Field::new("at", FieldType::DateTimeField);
        let parsed = dt.to_python(Value::from("2024-03-05 10:20:30")).unwrap();
        assert!(matches!(parsed, Value::DateTime(_)));
        assert_eq!(dt.to_python(Value::Null).unwrap(), Value::Null);
    }

    #[test]
    fn test_internal_type() {
        assert_eq!(FieldType::AutoField.internal_type(), "AutoField");
        assert_eq!(
            FieldType::OneToOneField {
                to: "a.B".into(),
                parent_link: true
            }
            .internal_type(),
            "OneToOneField"
        );
    }
}
