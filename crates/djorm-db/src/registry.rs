//! The process-wide model registry.
//!
//! Models are keyed by `(app_label, name)`; names compare case-insensitively.
//! Registration is idempotent: declaring a model twice hands back the class
//! registered first. The registry also owns the installed application
//! configs and the [`SchemaCatalog`] every concrete model freezes its table
//! into.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use djorm_core::apps::{AppConfig, AppRegistry};
use djorm_core::{DjormError, DjormResult};
use once_cell::sync::Lazy;

use crate::model::ModelClass;
use crate::schema::SchemaCatalog;

/// The registry [`ModelBuilder::register`](crate::model::ModelBuilder::register)
/// writes to.
pub static MODELS: Lazy<ModelRegistry> = Lazy::new(ModelRegistry::new);

/// Registered models grouped by app, plus installed app configs.
#[derive(Default)]
pub struct ModelRegistry {
    models: RwLock<Vec<(String, Vec<Arc<ModelClass>>)>>,
    apps: Mutex<AppRegistry>,
    catalog: SchemaCatalog,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let labels: Vec<String> = self.get_models(None, true).iter().map(|m| m.label()).collect();
        f.debug_struct("ModelRegistry")
            .field("models", &labels)
            .finish_non_exhaustive()
    }
}

impl ModelRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The catalog of materialized tables.
    pub const fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    /// Registers `model` unless a model with the same app label and name
    /// exists; returns the canonical class either way.
    pub fn register_or_get(&self, model: Arc<ModelClass>) -> Arc<ModelClass> {
        let mut models = self.models.write().unwrap_or_else(PoisonError::into_inner);
        let app_label = model.meta().app_label.clone();
        let idx = match models.iter().position(|(app, _)| *app == app_label) {
            Some(idx) => idx,
            None => {
                models.push((app_label, Vec::new()));
                models.len() - 1
            }
        };
        let app_models = &mut models[idx].1;
        if let Some(existing) = app_models
            .iter()
            .find(|m| m.name().eq_ignore_ascii_case(model.name()))
        {
            return Arc::clone(existing);
        }
        tracing::debug!(model = %model.label(), "registered model");
        app_models.push(Arc::clone(&model));
        model
    }

    /// Looks up a model among those registered so far.
    pub fn get_registered(&self, app_label: &str, name: &str) -> Option<Arc<ModelClass>> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(app, _)| app == app_label)
            .and_then(|(_, models)| {
                models
                    .iter()
                    .find(|m| m.name().eq_ignore_ascii_case(name))
                    .cloned()
            })
    }

    /// Looks up a model.
    ///
    /// With `seed_cache` the installed apps are populated first. With
    /// `only_installed` a model whose app is not installed is not found.
    pub fn get_model(
        &self,
        app_label: &str,
        name: &str,
        seed_cache: bool,
        only_installed: bool,
    ) -> DjormResult<Option<Arc<ModelClass>>> {
        if seed_cache {
            self.populate()?;
        }
        if only_installed && !self.is_installed(app_label) {
            return Ok(None);
        }
        Ok(self.get_registered(app_label, name))
    }

    /// Looks up a model by its `app_label.Name` label among all registered
    /// models.
    pub fn get_model_by_label(&self, label: &str) -> DjormResult<Option<Arc<ModelClass>>> {
        let (app_label, name) = label.split_once('.').ok_or_else(|| {
            DjormError::InvalidArgument(format!(
                "Model label '{label}' must have the form 'app_label.ModelName'"
            ))
        })?;
        self.get_model(app_label, name, false, false)
    }

    /// Registered models, in registration order, optionally limited to one
    /// app. Auto-created models are skipped unless asked for.
    pub fn get_models(&self, app_label: Option<&str>, include_auto_created: bool) -> Vec<Arc<ModelClass>> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(app, _)| app_label.map_or(true, |wanted| wanted == app))
            .flat_map(|(_, models)| models.iter())
            .filter(|m| include_auto_created || !m.meta().auto_created)
            .cloned()
            .collect()
    }

    /// Labels of the apps that have models.
    ///
    /// Once any app config is installed, apps without one are left out.
    pub fn get_apps(&self) -> Vec<String> {
        let any_installed = !self.lock_apps().get_app_configs().is_empty();
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(app, _)| app.clone())
            .filter(|app| !any_installed || self.is_installed(app))
            .collect()
    }

    /// Installs an application config.
    pub fn register_app(&self, app: Arc<dyn AppConfig>) -> DjormResult<()> {
        self.lock_apps().register(app)
    }

    /// Returns `true` if an app with this label is installed.
    pub fn is_installed(&self, app_label: &str) -> bool {
        self.lock_apps().get_app_config(app_label).is_some()
    }

    /// Runs the `ready` hook of every installed app once.
    ///
    /// The hooks run without the registry lock held, so they may declare
    /// models or look them up. Calls made while loading is under way, or
    /// after it finished, return immediately.
    pub fn populate(&self) -> DjormResult<()> {
        let Some(apps) = self.lock_apps().begin_population() else {
            return Ok(());
        };
        for app in &apps {
            tracing::debug!(app = app.label(), "running app ready hook");
            app.ready()?;
        }
        self.lock_apps().finish_population();
        Ok(())
    }

    /// Returns `true` once [`populate`](Self::populate) finished.
    pub fn is_ready(&self) -> bool {
        self.lock_apps().is_ready()
    }

    fn lock_apps(&self) -> std::sync::MutexGuard<'_, AppRegistry> {
        self.apps.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
