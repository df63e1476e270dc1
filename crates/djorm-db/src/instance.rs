//! Model instances and their persistence.
//!
//! An [`Instance`] holds one value per field of its model (in the order of
//! [`Options::fields`](crate::options::Options::fields)), the extra values a
//! query attached, and a [`ModelState`]. Saving decides between INSERT and
//! UPDATE the way Django does: parents first, then an existence probe on the
//! primary key, then the write.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use djorm_core::{DjormError, DjormResult};
use djorm_signals::{PostDelete, PostSave, PreDelete, PreSave, SIGNALS};

use crate::connection::ConnectionHandler;
use crate::fields::Field;
use crate::model::ModelClass;
use crate::query::compiler::{quote_name, FromValue, WhereNode};
use crate::query::lookups::Lookup;
use crate::query::insert_query;
use crate::value::Value;

/// Transient bookkeeping of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelState {
    /// Alias the instance was loaded from or last saved to.
    pub db: Option<String>,
    /// `true` until the first successful save.
    pub adding: bool,
}

impl Default for ModelState {
    fn default() -> Self {
        Self {
            db: None,
            adding: true,
        }
    }
}

/// Flags for [`Instance::save`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveOptions {
    /// Always INSERT.
    pub force_insert: bool,
    /// Always UPDATE; fails if no row was touched.
    pub force_update: bool,
    /// Alias to write to instead of the router's choice.
    pub using: Option<String>,
}

impl SaveOptions {
    /// Default flags.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forces an INSERT.
    #[must_use]
    pub const fn force_insert(mut self) -> Self {
        self.force_insert = true;
        self
    }

    /// Forces an UPDATE.
    #[must_use]
    pub const fn force_update(mut self) -> Self {
        self.force_update = true;
        self
    }

    /// Writes to `alias`.
    #[must_use]
    pub fn using(mut self, alias: impl Into<String>) -> Self {
        self.using = Some(alias.into());
        self
    }
}

/// One row of a model, loaded or about to be saved.
#[derive(Debug, Clone)]
pub struct Instance {
    model: Arc<ModelClass>,
    values: Vec<Value>,
    extras: Vec<(String, Value)>,
    /// Load/save bookkeeping.
    pub state: ModelState,
}

impl Instance {
    /// Creates an unsaved instance with every field at its default.
    pub fn with_defaults(model: Arc<ModelClass>) -> Self {
        let values = model
            .meta()
            .get_fields_with_model()
            .iter()
            .map(|(f, _)| f.get_default())
            .collect();
        Self {
            model,
            values,
            extras: Vec::new(),
            state: ModelState::default(),
        }
    }

    /// Creates an unsaved instance.
    ///
    /// Positional values fill fields in declaration order; keyword values
    /// are matched by field name or attribute name against the remaining
    /// fields. Fields given neither way get their default. Keywords that
    /// name a declared property are kept as extra attributes.
    pub fn new(
        model: Arc<ModelClass>,
        args: Vec<Value>,
        kwargs: Vec<(&str, Value)>,
    ) -> DjormResult<Self> {
        let fields = model.meta().fields();
        if args.len() > fields.len() {
            return Err(DjormError::InvalidArgument(format!(
                "Number of args exceeds number of fields ({} > {})",
                args.len(),
                fields.len()
            )));
        }
        let positional = args.len();
        let mut values: Vec<Value> = args;
        let mut kwargs = kwargs;
        for field in &fields[positional..] {
            let given = kwargs
                .iter()
                .position(|(k, _)| *k == field.name || *k == field.attname)
                .map(|idx| kwargs.remove(idx).1);
            values.push(given.unwrap_or_else(|| field.get_default()));
        }

        let mut extras = Vec::new();
        for (name, value) in kwargs {
            if model.meta().properties().iter().any(|p| p == name) {
                extras.push((name.to_string(), value));
            } else {
                return Err(DjormError::InvalidArgument(format!(
                    "'{name}' is an invalid keyword argument for this function"
                )));
            }
        }
        Ok(Self {
            model,
            values,
            extras,
            state: ModelState::default(),
        })
    }

    /// Builds an instance from a database row: one value per field, then
    /// the extra columns.
    pub(crate) fn from_db(
        model: Arc<ModelClass>,
        mut row: Vec<Value>,
        extra_names: &[String],
        db: &str,
    ) -> DjormResult<Self> {
        let field_count = model.meta().get_fields_with_model().len();
        if row.len() < field_count {
            return Err(DjormError::DatabaseError(format!(
                "Expected at least {field_count} columns for {}, got {}",
                model.label(),
                row.len()
            )));
        }
        let extra_values = row.split_off(field_count);
        let values = model
            .meta()
            .get_fields_with_model()
            .iter()
            .zip(row)
            .map(|((field, _), value)| field.to_python(value))
            .collect::<DjormResult<Vec<_>>>()?;
        let extras = extra_names.iter().cloned().zip(extra_values).collect();
        Ok(Self {
            model,
            values,
            extras,
            state: ModelState {
                db: Some(db.to_string()),
                adding: false,
            },
        })
    }

    /// Returns the model class.
    pub const fn model(&self) -> &Arc<ModelClass> {
        &self.model
    }

    /// Returns a field value (by name or attribute name) or an extra value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.model
            .meta()
            .field_index(name)
            .and_then(|idx| self.values.get(idx))
            .or_else(|| self.extras.iter().find(|(k, _)| k == name).map(|(_, v)| v))
    }

    /// Returns a value converted to `T`.
    pub fn get_as<T: FromValue>(&self, name: &str) -> DjormResult<T> {
        let value = self.get(name).ok_or_else(|| {
            DjormError::FieldDoesNotExist(format!(
                "{} has no field named '{name}'",
                self.model.name()
            ))
        })?;
        T::from_value(value)
    }

    /// Sets a field value, or a declared property.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> DjormResult<()> {
        let value = value.into();
        if let Some(idx) = self.model.meta().field_index(name) {
            self.values[idx] = value;
            return Ok(());
        }
        if let Some(slot) = self.extras.iter_mut().find(|(k, _)| k == name) {
            slot.1 = value;
            return Ok(());
        }
        if self.model.meta().properties().iter().any(|p| p == name) {
            self.extras.push((name.to_string(), value));
            return Ok(());
        }
        Err(DjormError::FieldDoesNotExist(format!(
            "{} has no field named '{name}'",
            self.model.name()
        )))
    }

    /// Field values keyed by attribute name, in field order.
    pub fn values(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.model
            .meta()
            .get_fields_with_model()
            .iter()
            .map(|(f, _)| f.attname.as_str())
            .zip(self.values.iter())
    }

    /// Extra values attached by the query that loaded the instance.
    pub fn extras(&self) -> &[(String, Value)] {
        &self.extras
    }

    /// Returns the primary-key value ([`Value::Null`] while unsaved).
    pub fn pk(&self) -> Value {
        self.model
            .meta()
            .pk()
            .map_or(Value::Null, |pk| self.attr(&pk.attname))
    }

    /// Sets the primary-key value.
    pub fn set_pk(&mut self, value: impl Into<Value>) -> DjormResult<()> {
        let attname = self.model.meta().pk_field()?.attname.clone();
        self.set(&attname, value)
    }

    /// Returns the value serialized for `field_name`: the attribute value of
    /// the field, or the plain attribute for non-fields.
    pub fn serializable_value(&self, field_name: &str) -> Value {
        match self.model.meta().get_field(field_name) {
            Ok(field) => self.attr(&field.attname),
            Err(_) => self.get(field_name).cloned().unwrap_or(Value::Null),
        }
    }

    fn attr(&self, attname: &str) -> Value {
        self.get(attname).cloned().unwrap_or(Value::Null)
    }

    fn set_attr(&mut self, attname: &str, value: Value) {
        if let Some(idx) = self.model.meta().field_index(attname) {
            self.values[idx] = value;
        }
    }

    /// The value written for `field`; auto-now stamps are stored back on the
    /// instance.
    pub(crate) fn pre_save_value(&mut self, field: &Field, add: bool) -> Value {
        match field.pre_save(add) {
            Some(value) => {
                self.set_attr(&field.attname, value.clone());
                value
            }
            None => self.attr(&field.attname),
        }
    }

    pub(crate) fn raw_value(&self, field: &Field) -> Value {
        self.attr(&field.attname)
    }

    // ── Persistence ──────────────────────────────────────────────────

    /// Saves the instance, inserting or updating as needed.
    pub fn save(&mut self, conns: &mut ConnectionHandler, options: SaveOptions) -> DjormResult<()> {
        if options.force_insert && options.force_update {
            return Err(DjormError::InvalidArgument(
                "Cannot force both insert and updating in model saving.".into(),
            ));
        }
        self.save_base(
            conns,
            false,
            options.using.as_deref(),
            options.force_insert,
            options.force_update,
        )
    }

    /// Saves the instance. With `raw`, values are written as they are
    /// (no auto-now stamps) and parent rows are not touched.
    pub fn save_base(
        &mut self,
        conns: &mut ConnectionHandler,
        raw: bool,
        using: Option<&str>,
        force_insert: bool,
        force_update: bool,
    ) -> DjormResult<()> {
        if force_insert && force_update {
            return Err(DjormError::InvalidArgument(
                "Cannot force both insert and updating in model saving.".into(),
            ));
        }
        let using = self.write_alias(conns, using);
        let cls = Arc::clone(&self.model);
        let origin = (!cls.meta().proxy).then(|| Arc::clone(&cls));
        self.save_for_class(
            conns,
            &cls,
            origin.as_ref(),
            raw,
            force_insert,
            force_update,
            &using,
        )
    }

    fn write_alias(&self, conns: &ConnectionHandler, using: Option<&str>) -> String {
        using.map_or_else(
            || {
                conns
                    .router()
                    .db_for_write(&self.model.meta().app_label, &self.model.meta().object_name)
            },
            str::to_string,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn save_for_class(
        &mut self,
        conns: &mut ConnectionHandler,
        cls: &Arc<ModelClass>,
        origin: Option<&Arc<ModelClass>>,
        raw: bool,
        force_insert: bool,
        force_update: bool,
        using: &str,
    ) -> DjormResult<()> {
        let meta = cls.meta();
        let announce = origin.filter(|_| !meta.auto_created);
        if let Some(sender) = announce {
            SIGNALS.pre_save.send(&PreSave {
                model: sender.label(),
                raw,
                using: using.to_string(),
            });
        }

        if !raw || meta.proxy {
            let proxy_origin = meta.proxy.then(|| Arc::clone(cls));
            for (parent, link) in meta.parents().to_vec() {
                let parent_pk = parent.meta().pk_field()?.attname.clone();
                let link_attname = match link {
                    Some(ref name) => Some(meta.get_field(name)?.attname.clone()),
                    None => None,
                };
                if let Some(ref link_attname) = link_attname {
                    let link_value = self.attr(link_attname);
                    if self.attr(&parent_pk).is_null() && !link_value.is_null() {
                        self.set_attr(&parent_pk, link_value);
                    }
                }
                self.save_for_class(
                    conns,
                    &parent,
                    proxy_origin.as_ref(),
                    false,
                    false,
                    false,
                    using,
                )?;
                if let Some(ref link_attname) = link_attname {
                    let parent_value = self.attr(&parent_pk);
                    self.set_attr(link_attname, parent_value);
                }
            }
            if meta.proxy {
                return Ok(());
            }
        }

        let pk = Arc::clone(meta.pk_field()?);
        let pk_val = self.attr(&pk.attname);
        let pk_set = !pk_val.is_null();
        let mut record_exists = true;

        if pk_set {
            let exists = force_update
                || (!force_insert
                    && cls
                        .objects()
                        .using(using)
                        .filter(&[("pk", pk_val.clone())])?
                        .exists(conns)?);
            if exists {
                let non_pks: Vec<Arc<Field>> = meta
                    .local_fields()
                    .iter()
                    .filter(|f| !Arc::ptr_eq(f, &pk))
                    .cloned()
                    .collect();
                if force_update || !non_pks.is_empty() {
                    let values: Vec<(String, Value)> = non_pks
                        .iter()
                        .map(|f| {
                            let v = if raw {
                                self.raw_value(f)
                            } else {
                                self.pre_save_value(f, false)
                            };
                            (f.column.clone(), v)
                        })
                        .collect();
                    if !values.is_empty() {
                        let rows = cls
                            .objects()
                            .using(using)
                            .filter(&[("pk", pk_val.clone())])?
                            .update_columns(conns, &values)?;
                        if force_update && rows == 0 {
                            return Err(DjormError::DatabaseError(
                                "Forced update did not affect any rows.".into(),
                            ));
                        }
                    }
                }
            } else {
                record_exists = false;
            }
        }

        if !pk_set || !record_exists {
            if let Some(ref wrt) = meta.order_with_respect_to {
                let field = meta.get_field(wrt)?;
                let group = self.attr(&field.attname);
                let count = cls
                    .objects()
                    .using(using)
                    .filter(&[(field.name.as_str(), group)])?
                    .count(conns)?;
                self.set_attr("_order", Value::Int(i64::try_from(count).unwrap_or(i64::MAX)));
            }
            let mut fields: Vec<Arc<Field>> = meta.local_fields().to_vec();
            if !pk_set {
                if force_update {
                    return Err(DjormError::InvalidArgument(
                        "Cannot force an update in save() with no primary key.".into(),
                    ));
                }
                fields.retain(|f| !f.field_type.is_auto());
            }
            record_exists = false;
            let update_pk = meta.has_auto_field() && !pk_set;
            let ids = insert_query(
                conns,
                cls,
                std::slice::from_mut(self),
                &fields,
                update_pk,
                raw,
                using,
            )?;
            if let Some(id) = ids.into_iter().next().filter(|_| update_pk) {
                self.set_attr(&pk.attname, id);
            }
        }
        conns.get(using)?.commit_unless_managed()?;

        self.state.db = Some(using.to_string());
        self.state.adding = false;
        if let Some(sender) = announce {
            SIGNALS.post_save.send(&PostSave {
                model: sender.label(),
                created: !record_exists,
                raw,
                using: using.to_string(),
            });
        }
        Ok(())
    }

    /// Deletes the row (and the rows of concrete parents) and clears the
    /// primary key.
    pub fn delete(&mut self, conns: &mut ConnectionHandler, using: Option<&str>) -> DjormResult<()> {
        let meta = self.model.meta();
        let pk = meta.pk_field()?;
        if self.attr(&pk.attname).is_null() {
            return Err(DjormError::InvalidArgument(format!(
                "{} object can't be deleted because its {} attribute is set to None.",
                meta.object_name, pk.attname
            )));
        }
        let using = self.write_alias(conns, using);
        let label = self.model.label();
        SIGNALS.pre_delete.send(&PreDelete {
            model: label.clone(),
            using: using.clone(),
        });
        let concrete = self.model.concrete_model();
        self.delete_rows(conns, &concrete, &using)?;
        conns.get(&using)?.commit_unless_managed()?;
        SIGNALS.post_delete.send(&PostDelete {
            model: label,
            using,
        });
        self.set_pk(Value::Null)
    }

    fn delete_rows(
        &self,
        conns: &mut ConnectionHandler,
        cls: &Arc<ModelClass>,
        using: &str,
    ) -> DjormResult<()> {
        let meta = cls.meta();
        let pk = meta.pk_field()?;
        let node = WhereNode::condition(pk.column.clone(), Lookup::Exact(self.attr(&pk.attname)));
        let conn = conns.get(using)?;
        let (sql, params) = conn.compiler().compile_delete(&meta.db_table, Some(&node));
        conn.execute(&sql, &params)?;
        tracing::trace!(table = %quote_name(&meta.db_table), "deleted instance row");
        for (parent, link) in meta.parents() {
            if link.is_some() {
                self.delete_rows(conns, parent, using)?;
            }
        }
        Ok(())
    }
}

/// Instances are equal when they belong to the same concrete model and
/// carry the same, non-null primary key.
impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        let pk = self.pk();
        !pk.is_null()
            && self.model.concrete_model() == other.model.concrete_model()
            && pk == other.pk()
    }
}

impl Hash for Instance {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.model.concrete_model().label().hash(state);
        self.pk().repr().hash(state);
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.model.name();
        write!(f, "<{name}: {name} object>")
    }
}
