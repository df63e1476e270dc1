//! Model classes and the builder that declares them.
//!
//! A model is declared by handing a [`ModelBuilder`] its fields, options and
//! base classes. [`ModelBuilder::build`] resolves inheritance, fills in the
//! implicit primary key, freezes the table shape into the registry's schema
//! catalog, announces the class on the `class_prepared` signal and returns
//! the canonical [`ModelClass`] from the registry. Declaring the same
//! `(app_label, name)` again returns the class registered first.
//!
//! # Examples
//!
//! ```
//! use djorm_db::fields::{Field, FieldType};
//! use djorm_db::model::ModelBuilder;
//! use djorm_db::options::Meta;
//! use djorm_db::registry::ModelRegistry;
//!
//! let registry = ModelRegistry::new();
//! let entry = ModelBuilder::new("Entry", "mysite.blog.models")
//!     .field(Field::new("headline", FieldType::CharField).max_length(100))
//!     .meta(Meta::new().ordering(&["-headline"]))
//!     .build(&registry)
//!     .unwrap();
//!
//! assert_eq!(entry.label(), "blog.Entry");
//! assert_eq!(entry.meta().db_table, "blog_entry");
//! assert_eq!(entry.meta().pk().unwrap().name, "id");
//! ```

use std::fmt;
use std::sync::Arc;

use djorm_core::{DjormError, DjormResult};
use djorm_signals::{ClassPrepared, SIGNALS};

use crate::fields::{Field, FieldType};
use crate::instance::Instance;
use crate::options::{Meta, Options};
use crate::query::QuerySet;
use crate::registry::{ModelRegistry, MODELS};
use crate::value::Value;

/// Something a model declaration is made of.
///
/// The builder attaches each contributor to the model's [`Options`] in
/// declaration order.
pub trait SchemaContributor: Send + Sync {
    /// Adds this contributor to the model being built.
    fn attach(&self, options: &mut Options) -> DjormResult<()>;
}

impl SchemaContributor for Field {
    fn attach(&self, options: &mut Options) -> DjormResult<()> {
        options.add_field(self.clone()).map(drop)
    }
}

/// A non-field attribute that instances accept as a keyword argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    /// Attribute name.
    pub name: String,
}

impl Property {
    /// Creates a property.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl SchemaContributor for Property {
    fn attach(&self, options: &mut Options) -> DjormResult<()> {
        if !options.properties.contains(&self.name) {
            options.properties.push(self.name.clone());
        }
        Ok(())
    }
}

/// A finalized model class.
pub struct ModelClass {
    name: String,
    module: String,
    meta: Options,
    scope: Vec<String>,
}

impl fmt::Debug for ModelClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelClass")
            .field("label", &self.label())
            .field("db_table", &self.meta.db_table)
            .finish_non_exhaustive()
    }
}

impl PartialEq for ModelClass {
    fn eq(&self, other: &Self) -> bool {
        self.meta.app_label == other.meta.app_label && self.name == other.name
    }
}

impl Eq for ModelClass {}

impl ModelClass {
    /// Returns the class name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the module the class was declared in.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Returns the resolved metadata.
    pub const fn meta(&self) -> &Options {
        &self.meta
    }

    /// Returns `app_label.Name`.
    pub fn label(&self) -> String {
        self.meta.label()
    }

    /// Returns the labels of this class and its concrete ancestors.
    pub fn scope(&self) -> &[String] {
        &self.scope
    }

    /// Returns `true` if `err` is a "does not exist" error raised for this
    /// class or one of its subclasses.
    pub fn is_does_not_exist(&self, err: &DjormError) -> bool {
        matches!(err, DjormError::DoesNotExist { .. }) && self.in_scope(err)
    }

    /// Returns `true` if `err` is a "multiple objects returned" error raised
    /// for this class or one of its subclasses.
    pub fn is_multiple_objects_returned(&self, err: &DjormError) -> bool {
        matches!(err, DjormError::MultipleObjectsReturned { .. }) && self.in_scope(err)
    }

    fn in_scope(&self, err: &DjormError) -> bool {
        let label = self.label();
        err.scope().iter().any(|l| *l == label)
    }

    pub(crate) fn does_not_exist(&self, message: String) -> DjormError {
        DjormError::DoesNotExist {
            model: self.label(),
            scope: self.scope.clone(),
            message,
        }
    }

    pub(crate) fn multiple_objects_returned(&self, message: String) -> DjormError {
        DjormError::MultipleObjectsReturned {
            model: self.label(),
            scope: self.scope.clone(),
            message,
        }
    }

    /// Returns the class whose table holds the rows: the proxied model for
    /// proxies, the class itself otherwise.
    pub fn concrete_model(self: &Arc<Self>) -> Arc<Self> {
        self.meta
            .proxy_for_model
            .clone()
            .unwrap_or_else(|| Arc::clone(self))
    }

    /// Returns a queryset over all rows of this model.
    pub fn objects(self: &Arc<Self>) -> QuerySet {
        QuerySet::new(Arc::clone(self))
    }

    /// Creates an unsaved instance with every field at its default.
    pub fn instance(self: &Arc<Self>) -> Instance {
        Instance::with_defaults(Arc::clone(self))
    }

    /// Creates an unsaved instance from positional and keyword values.
    pub fn build(
        self: &Arc<Self>,
        args: Vec<Value>,
        kwargs: Vec<(&str, Value)>,
    ) -> DjormResult<Instance> {
        Instance::new(Arc::clone(self), args, kwargs)
    }
}

/// Declares a model class.
pub struct ModelBuilder {
    name: String,
    module: String,
    meta: Meta,
    bases: Vec<Arc<ModelClass>>,
    contributors: Vec<Box<dyn SchemaContributor>>,
}

impl fmt::Debug for ModelBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelBuilder")
            .field("name", &self.name)
            .field("module", &self.module)
            .field("meta", &self.meta)
            .field("bases", &self.bases.len())
            .field("contributors", &self.contributors.len())
            .finish()
    }
}

impl ModelBuilder {
    /// Starts declaring the class `name` in `module`.
    ///
    /// Without an explicit `Meta::app_label`, the app label is the
    /// second-to-last segment of `module` (`mysite.blog.models` → `blog`).
    pub fn new(name: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module: module.into(),
            meta: Meta::default(),
            bases: Vec::new(),
            contributors: Vec::new(),
        }
    }

    /// Sets the declared options.
    #[must_use]
    pub fn meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    /// Adds a base class. Bases are processed in the order they are added.
    #[must_use]
    pub fn base(mut self, parent: &Arc<ModelClass>) -> Self {
        self.bases.push(Arc::clone(parent));
        self
    }

    /// Declares a field.
    #[must_use]
    pub fn field(self, field: Field) -> Self {
        self.contributor(Box::new(field))
    }

    /// Declares a property accepted by instance construction.
    #[must_use]
    pub fn property(self, name: impl Into<String>) -> Self {
        self.contributor(Box::new(Property::new(name)))
    }

    /// Adds any other contributor.
    #[must_use]
    pub fn contributor(mut self, contributor: Box<dyn SchemaContributor>) -> Self {
        self.contributors.push(contributor);
        self
    }

    /// Builds and registers the class in the process-wide registry.
    pub fn register(self) -> DjormResult<Arc<ModelClass>> {
        self.build(&MODELS)
    }

    /// Builds the class and registers it in `registry`.
    ///
    /// Abstract classes are returned without being registered.
    pub fn build(self, registry: &ModelRegistry) -> DjormResult<Arc<ModelClass>> {
        let app_label = match self.meta.app_label {
            Some(ref label) => label.clone(),
            None => app_label_from_module(&self.name, &self.module)?,
        };
        if !self.meta.is_abstract {
            if let Some(existing) = registry.get_registered(&app_label, &self.name) {
                return Ok(existing);
            }
        }

        let mut opts = Options::new(&self.name, &app_label, &self.meta);
        for contributor in &self.contributors {
            contributor.attach(&mut opts)?;
        }
        let label = opts.label();
        let local_names: Vec<String> = opts.local_fields().iter().map(|f| f.name.clone()).collect();
        let mut scope = vec![label.clone()];
        let mut inherited_meta = false;
        let mut proxy_base: Option<Arc<ModelClass>> = None;

        for base in &self.bases {
            let base_meta = base.meta();
            if base_meta.is_abstract {
                if opts.proxy && !base_meta.local_fields().is_empty() {
                    return Err(DjormError::ModelDeclaration(format!(
                        "Abstract base class containing model fields not permitted for proxy model '{}'.",
                        self.name
                    )));
                }
                for field in base_meta.local_fields() {
                    if local_names.contains(&field.name) {
                        return Err(DjormError::ModelDeclaration(format!(
                            "Local field '{}' in class '{}' clashes with field of similar name from abstract base class '{}'",
                            field.name,
                            self.name,
                            base.name()
                        )));
                    }
                    opts.add_field((**field).clone())?;
                }
                for prop in base_meta.properties() {
                    Property::new(prop.clone()).attach(&mut opts)?;
                }
                self.inherit_options(&mut opts, base_meta, true);
                continue;
            }

            for ancestor in base.scope() {
                if !scope.contains(ancestor) {
                    scope.push(ancestor.clone());
                }
            }
            if !inherited_meta {
                self.inherit_options(&mut opts, base_meta, false);
                inherited_meta = true;
            }

            if opts.proxy {
                if proxy_base.is_some() {
                    return Err(DjormError::ModelDeclaration(format!(
                        "Proxy model '{}' has more than one non-abstract model base class.",
                        self.name
                    )));
                }
                proxy_base = Some(Arc::clone(base));
                opts.add_parent(Arc::clone(base), None);
                continue;
            }

            for field in base_meta.fields() {
                if local_names.contains(&field.name) {
                    return Err(DjormError::ModelDeclaration(format!(
                        "Local field '{}' in class '{}' clashes with field of similar name from base class '{}'",
                        field.name,
                        self.name,
                        base.name()
                    )));
                }
            }
            let link = Self::parent_link(&mut opts, base)?;
            opts.add_parent(Arc::clone(base), Some(link));
        }

        if opts.proxy {
            let base = proxy_base.ok_or_else(|| {
                DjormError::ModelDeclaration(format!(
                    "No base class for proxy model '{}'.",
                    self.name
                ))
            })?;
            if !opts.local_fields().is_empty() {
                return Err(DjormError::ModelDeclaration(format!(
                    "Proxy model '{}' contains model fields.",
                    self.name
                )));
            }
            opts.proxy_for_model = Some(base.concrete_model());
        }

        opts.prepare()?;
        if !opts.is_abstract && !opts.proxy {
            let schema = registry.catalog().freeze(&label, opts.table_schema()?)?;
            opts.set_schema(schema);
        }

        let model = Arc::new(ModelClass {
            name: self.name,
            module: self.module,
            meta: opts,
            scope,
        });
        if model.meta.is_abstract {
            return Ok(model);
        }

        SIGNALS.class_prepared.send(&ClassPrepared {
            app_label: model.meta.app_label.clone(),
            object_name: model.name.clone(),
        });
        tracing::debug!(model = %label, table = %model.meta.db_table, "model class prepared");
        Ok(registry.register_or_get(model))
    }

    /// Carries ordering and `get_latest_by` over from a base unless the
    /// declaration sets them. Abstract bases also pass on unique-together.
    fn inherit_options(&self, opts: &mut Options, base: &Options, is_abstract: bool) {
        if self.meta.ordering.is_none() && opts.ordering.is_empty() {
            opts.ordering.clone_from(&base.ordering);
        }
        if self.meta.get_latest_by.is_none() && opts.get_latest_by.is_none() {
            opts.get_latest_by.clone_from(&base.get_latest_by);
        }
        if is_abstract && self.meta.unique_together.is_none() && opts.unique_together.is_empty() {
            opts.unique_together.clone_from(&base.unique_together);
        }
    }

    /// Returns the field linking to a concrete parent, adding `<parent>_ptr`
    /// unless one was declared.
    fn parent_link(opts: &mut Options, base: &Arc<ModelClass>) -> DjormResult<String> {
        let target = base.label();
        let declared = opts.local_fields().iter().find(|f| {
            matches!(
                &f.field_type,
                FieldType::OneToOneField { to, parent_link: true } if *to == target
            )
        });
        if let Some(field) = declared {
            return Ok(field.name.clone());
        }
        let name = format!("{}_ptr", base.meta().module_name);
        let link = Field::auto_created(
            name.clone(),
            FieldType::OneToOneField {
                to: target,
                parent_link: true,
            },
        )
        .unique()
        .editable(false);
        opts.add_field(link)?;
        Ok(name)
    }
}

fn app_label_from_module(name: &str, module: &str) -> DjormResult<String> {
    let parts: Vec<&str> = module.split('.').collect();
    if parts.len() < 2 {
        return Err(DjormError::ModelDeclaration(format!(
            "Cannot derive an app label for model {name} from module '{module}'; set Meta.app_label."
        )));
    }
    Ok(parts[parts.len() - 2].to_string())
}
