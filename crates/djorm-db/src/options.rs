//! Model metadata.
//!
//! [`Meta`] is what a model declares about itself; [`Options`] is the
//! resolved metadata the builder produces from it. `Options` is mutated only
//! while the model class is being built and is read-only afterwards.

use std::sync::{Arc, OnceLock};

use djorm_core::{DjormError, DjormResult};
use serde::Deserialize;

use crate::fields::{Field, FieldType};
use crate::model::ModelClass;
use crate::schema::{ColumnDef, TableSchema};

/// The option names a `Meta` declaration may use.
pub const DEFAULT_NAMES: [&str; 14] = [
    "verbose_name",
    "verbose_name_plural",
    "db_table",
    "ordering",
    "unique_together",
    "permissions",
    "get_latest_by",
    "order_with_respect_to",
    "app_label",
    "db_tablespace",
    "abstract",
    "managed",
    "proxy",
    "auto_created",
];

/// Declared model options, the equivalent of an inner `class Meta`.
///
/// Unset options take their defaults when [`Options`] are built.
///
/// # Examples
///
/// ```
/// use djorm_db::options::Meta;
///
/// let meta = Meta::from_json(r#"{"ordering": ["-pub_date"], "get_latest_by": "pub_date"}"#).unwrap();
/// assert_eq!(meta.ordering.as_deref(), Some(&["-pub_date".to_string()][..]));
///
/// let err = Meta::from_json(r#"{"ordering": [], "colour": "red"}"#).unwrap_err();
/// assert_eq!(err.to_string(), "Model declaration error: 'class Meta' got invalid attribute(s): colour");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Meta {
    /// Human-readable singular name.
    pub verbose_name: Option<String>,
    /// Human-readable plural name.
    pub verbose_name_plural: Option<String>,
    /// Table name.
    pub db_table: Option<String>,
    /// Default ordering; a `-` prefix means descending.
    pub ordering: Option<Vec<String>>,
    /// Field-name groups that must be unique together.
    pub unique_together: Option<Vec<Vec<String>>>,
    /// Extra `(codename, name)` permissions.
    pub permissions: Vec<(String, String)>,
    /// Field used by `latest()`.
    pub get_latest_by: Option<String>,
    /// Field whose value groups rows into an ordered sequence.
    pub order_with_respect_to: Option<String>,
    /// App label; derived from the module path when unset.
    pub app_label: Option<String>,
    /// Tablespace name (informational).
    pub db_tablespace: Option<String>,
    /// Abstract models only contribute fields to subclasses.
    #[serde(rename = "abstract")]
    pub is_abstract: bool,
    /// Whether schema sync manages the table.
    pub managed: Option<bool>,
    /// Proxy models share their parent's table.
    pub proxy: bool,
    /// Set for models the ORM created itself.
    pub auto_created: bool,
}

impl Meta {
    /// Creates empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses options from a JSON object, rejecting unknown names.
    pub fn from_json(json: &str) -> DjormResult<Self> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| DjormError::SerializationError(e.to_string()))?;
        let serde_json::Value::Object(map) = &value else {
            return Err(DjormError::ModelDeclaration(
                "'class Meta' must be an object".into(),
            ));
        };
        let mut invalid: Vec<&str> = map
            .keys()
            .map(String::as_str)
            .filter(|k| !DEFAULT_NAMES.contains(k))
            .collect();
        if !invalid.is_empty() {
            invalid.sort_unstable();
            return Err(DjormError::ModelDeclaration(format!(
                "'class Meta' got invalid attribute(s): {}",
                invalid.join(",")
            )));
        }
        serde_json::from_value(value).map_err(|e| DjormError::SerializationError(e.to_string()))
    }

    /// Sets the table name.
    #[must_use]
    pub fn db_table(mut self, table: impl Into<String>) -> Self {
        self.db_table = Some(table.into());
        self
    }

    /// Sets the default ordering.
    #[must_use]
    pub fn ordering(mut self, ordering: &[&str]) -> Self {
        self.ordering = Some(ordering.iter().map(|s| (*s).to_string()).collect());
        self
    }

    /// Adds a unique-together group.
    #[must_use]
    pub fn unique_together(mut self, fields: &[&str]) -> Self {
        self.unique_together
            .get_or_insert_with(Vec::new)
            .push(fields.iter().map(|s| (*s).to_string()).collect());
        self
    }

    /// Sets the field `latest()` orders by.
    #[must_use]
    pub fn get_latest_by(mut self, field: impl Into<String>) -> Self {
        self.get_latest_by = Some(field.into());
        self
    }

    /// Orders rows within groups sharing a value of `field`.
    #[must_use]
    pub fn order_with_respect_to(mut self, field: impl Into<String>) -> Self {
        self.order_with_respect_to = Some(field.into());
        self
    }

    /// Sets the app label.
    #[must_use]
    pub fn app_label(mut self, label: impl Into<String>) -> Self {
        self.app_label = Some(label.into());
        self
    }

    /// Sets the singular verbose name.
    #[must_use]
    pub fn verbose_name(mut self, name: impl Into<String>) -> Self {
        self.verbose_name = Some(name.into());
        self
    }

    /// Marks the model abstract.
    #[must_use]
    pub const fn abstract_model(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    /// Marks the model as a proxy.
    #[must_use]
    pub const fn proxy(mut self) -> Self {
        self.proxy = true;
        self
    }

    /// Sets whether schema sync manages the table.
    #[must_use]
    pub const fn managed(mut self, managed: bool) -> Self {
        self.managed = Some(managed);
        self
    }
}

/// A field paired with the model that defines it (`None` for local fields).
pub type FieldWithModel = (Arc<Field>, Option<Arc<ModelClass>>);

/// Resolved metadata of a model class.
#[derive(Debug)]
pub struct Options {
    /// Class name, e.g. `Entry`.
    pub object_name: String,
    /// Lowercased class name.
    pub module_name: String,
    /// App label.
    pub app_label: String,
    /// Table name.
    pub db_table: String,
    /// Human-readable singular name.
    pub verbose_name: String,
    /// Human-readable plural name.
    pub verbose_name_plural: String,
    /// Default ordering.
    pub ordering: Vec<String>,
    /// Field-name groups that must be unique together.
    pub unique_together: Vec<Vec<String>>,
    /// Extra permissions.
    pub permissions: Vec<(String, String)>,
    /// Field used by `latest()`.
    pub get_latest_by: Option<String>,
    /// Name of the field rows are ordered within.
    pub order_with_respect_to: Option<String>,
    /// Tablespace name.
    pub db_tablespace: Option<String>,
    /// Abstract model.
    pub is_abstract: bool,
    /// Managed by schema sync.
    pub managed: bool,
    /// Proxy model.
    pub proxy: bool,
    /// Created by the ORM.
    pub auto_created: bool,
    /// The concrete model a proxy stands in for.
    pub proxy_for_model: Option<Arc<ModelClass>>,
    pub(crate) parents: Vec<(Arc<ModelClass>, Option<String>)>,
    pub(crate) properties: Vec<String>,
    local_fields: Vec<Arc<Field>>,
    pk: Option<Arc<Field>>,
    has_auto_field: bool,
    field_cache: OnceLock<Vec<FieldWithModel>>,
    schema: Option<Arc<TableSchema>>,
}

impl Options {
    /// Starts metadata for the class `object_name` from its declared `meta`.
    pub fn new(object_name: &str, app_label: &str, meta: &Meta) -> Self {
        let verbose_name = meta
            .verbose_name
            .clone()
            .unwrap_or_else(|| camel_case_to_spaces(object_name));
        let verbose_name_plural = meta
            .verbose_name_plural
            .clone()
            .unwrap_or_else(|| format!("{verbose_name}s"));
        Self {
            object_name: object_name.to_string(),
            module_name: object_name.to_lowercase(),
            app_label: app_label.to_string(),
            db_table: meta.db_table.clone().unwrap_or_default(),
            verbose_name,
            verbose_name_plural,
            ordering: meta.ordering.clone().unwrap_or_default(),
            unique_together: meta.unique_together.clone().unwrap_or_default(),
            permissions: meta.permissions.clone(),
            get_latest_by: meta.get_latest_by.clone(),
            order_with_respect_to: meta.order_with_respect_to.clone(),
            db_tablespace: meta.db_tablespace.clone(),
            is_abstract: meta.is_abstract,
            managed: meta.managed.unwrap_or(true),
            proxy: meta.proxy,
            auto_created: meta.auto_created,
            proxy_for_model: None,
            parents: Vec::new(),
            properties: Vec::new(),
            local_fields: Vec::new(),
            pk: None,
            has_auto_field: false,
            field_cache: OnceLock::new(),
            schema: None,
        }
    }

    /// Returns `app_label.ObjectName`.
    pub fn label(&self) -> String {
        format!("{}.{}", self.app_label, self.object_name)
    }

    /// Adds a field, keeping local fields in creation order.
    ///
    /// The first primary-key field becomes the model's primary key; later
    /// ones are ignored.
    pub fn add_field(&mut self, mut field: Field) -> DjormResult<Arc<Field>> {
        field.check()?;
        if self.local_fields.iter().any(|f| f.name == field.name) {
            return Err(DjormError::ModelDeclaration(format!(
                "Field '{}' is declared more than once on {}.",
                field.name, self.object_name
            )));
        }
        if field.field_type.is_auto() {
            if self.has_auto_field {
                return Err(DjormError::ModelDeclaration(format!(
                    "A model can't have more than one AutoField ({}).",
                    self.object_name
                )));
            }
            self.has_auto_field = true;
        }
        let becomes_pk = field.primary_key && self.pk.is_none();
        if becomes_pk {
            field.serialize = false;
        }
        let field = Arc::new(field);
        let pos = self
            .local_fields
            .partition_point(|f| f.creation_counter <= field.creation_counter);
        self.local_fields.insert(pos, Arc::clone(&field));
        if becomes_pk {
            self.pk = Some(Arc::clone(&field));
        }
        self.field_cache = OnceLock::new();
        Ok(field)
    }

    /// Records a parent class and the local field linking to it.
    pub(crate) fn add_parent(&mut self, parent: Arc<ModelClass>, link: Option<String>) {
        self.parents.push((parent, link));
        self.field_cache = OnceLock::new();
    }

    /// Fills in what the declaration left implicit: the `_order` field, the
    /// primary key and the table name.
    pub(crate) fn prepare(&mut self) -> DjormResult<()> {
        if let Some(ref name) = self.order_with_respect_to {
            // Resolve eagerly so a typo fails at declaration time.
            let field = self.get_field(name)?;
            self.order_with_respect_to = Some(field.name.clone());
            // Takes a regular counter so it lands after every declared field.
            let mut order = Field::new("_order", FieldType::IntegerField)
                .editable(false)
                .default(0);
            order.auto_created = true;
            self.add_field(order)?;
            self.ordering = vec!["_order".to_string()];
        }

        if let Some(ref proxied) = self.proxy_for_model {
            let target = proxied.meta();
            self.pk.clone_from(&target.pk);
            self.db_table.clone_from(&target.db_table);
            self.schema.clone_from(&target.schema);
            return Ok(());
        }

        if self.pk.is_none() && !self.is_abstract {
            match self.parents.iter().find_map(|(_, link)| link.clone()) {
                Some(link) => self.promote_parent_link(&link)?,
                None => {
                    let id = Field::auto_created("id", FieldType::AutoField)
                        .primary_key()
                        .verbose_name("ID");
                    self.add_field(id)?;
                }
            }
        }

        if self.db_table.is_empty() {
            self.db_table = format!("{}_{}", self.app_label, self.module_name);
        }
        Ok(())
    }

    fn promote_parent_link(&mut self, link: &str) -> DjormResult<()> {
        let pos = self
            .local_fields
            .iter()
            .position(|f| f.name == link)
            .ok_or_else(|| {
                DjormError::ModelDeclaration(format!(
                    "Parent link '{link}' is missing on {}.",
                    self.object_name
                ))
            })?;
        let mut field = (*self.local_fields[pos]).clone();
        field = field.primary_key();
        field.serialize = false;
        let field = Arc::new(field);
        self.local_fields[pos] = Arc::clone(&field);
        self.pk = Some(field);
        self.field_cache = OnceLock::new();
        Ok(())
    }

    /// Freezes the table shape built from the local fields.
    pub(crate) fn set_schema(&mut self, schema: Arc<TableSchema>) {
        self.schema = Some(schema);
    }

    /// Returns the local fields in creation order.
    pub fn local_fields(&self) -> &[Arc<Field>] {
        &self.local_fields
    }

    /// Returns the primary-key field.
    ///
    /// Only abstract models have none.
    pub fn pk(&self) -> Option<&Arc<Field>> {
        self.pk.as_ref()
    }

    /// Returns the primary-key field or a declaration error.
    pub fn pk_field(&self) -> DjormResult<&Arc<Field>> {
        self.pk.as_ref().ok_or_else(|| {
            DjormError::ModelDeclaration(format!("{} has no primary key.", self.object_name))
        })
    }

    /// Returns `true` if an auto-incrementing field is declared.
    pub const fn has_auto_field(&self) -> bool {
        self.has_auto_field
    }

    /// Returns the parents and the names of the fields linking to them.
    pub fn parents(&self) -> &[(Arc<ModelClass>, Option<String>)] {
        &self.parents
    }

    /// Returns the declared non-field attributes.
    pub fn properties(&self) -> &[String] {
        &self.properties
    }

    /// Returns the frozen table shape (absent for abstract models).
    pub fn schema(&self) -> Option<&Arc<TableSchema>> {
        self.schema.as_ref()
    }

    /// Returns every field: inherited ones first, local ones last.
    pub fn fields(&self) -> Vec<Arc<Field>> {
        self.get_fields_with_model()
            .iter()
            .map(|(field, _)| Arc::clone(field))
            .collect()
    }

    /// Returns every field paired with the model that defines it.
    pub fn get_fields_with_model(&self) -> &[FieldWithModel] {
        self.field_cache.get_or_init(|| {
            let mut cache: Vec<FieldWithModel> = Vec::new();
            for (parent, _) in &self.parents {
                for (field, model) in parent.meta().get_fields_with_model() {
                    let owner = model.clone().unwrap_or_else(|| Arc::clone(parent));
                    cache.push((Arc::clone(field), Some(owner)));
                }
            }
            cache.extend(self.local_fields.iter().map(|f| (Arc::clone(f), None)));
            cache
        })
    }

    /// Returns the position of a field in [`fields`](Self::fields).
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.get_fields_with_model()
            .iter()
            .position(|(f, _)| f.name == name || f.attname == name)
    }

    /// Looks a field up by name (or attribute name).
    pub fn get_field(&self, name: &str) -> DjormResult<Arc<Field>> {
        if let Some(field) = self
            .local_fields
            .iter()
            .find(|f| f.name == name || f.attname == name)
        {
            return Ok(Arc::clone(field));
        }
        self.get_fields_with_model()
            .iter()
            .find(|(f, _)| f.name == name || f.attname == name)
            .map(|(f, _)| Arc::clone(f))
            .ok_or_else(|| {
                DjormError::FieldDoesNotExist(format!(
                    "{} has no field named '{name}'",
                    self.object_name
                ))
            })
    }

    /// Builds the table shape from the local fields.
    ///
    /// Only the resolved primary key is marked as such; unique-together
    /// groups are translated from field names to columns.
    pub fn table_schema(&self) -> DjormResult<TableSchema> {
        let columns = self
            .local_fields
            .iter()
            .map(|f| {
                let mut col = ColumnDef::from_field(f);
                col.primary_key = self.pk.as_ref().is_some_and(|pk| Arc::ptr_eq(pk, f));
                col
            })
            .collect();
        let unique_together = self
            .unique_together
            .iter()
            .map(|group| {
                group
                    .iter()
                    .map(|name| self.get_field(name).map(|f| f.column.clone()))
                    .collect::<DjormResult<Vec<_>>>()
            })
            .collect::<DjormResult<Vec<_>>>()?;
        Ok(TableSchema {
            table: self.db_table.clone(),
            columns,
            unique_together,
        })
    }
}

/// `CamelCase` to `camel case`, the default verbose name.
fn camel_case_to_spaces(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let chars: Vec<char> = name.chars().collect();
    for (i, c) in chars.iter().enumerate() {
        if c.is_uppercase() && i > 0 && chars[i - 1].is_lowercase() {
            out.push(' ');
        }
        out.extend(c.to_lowercase());
    }
    out
}
