//! Installed application configs.
//!
//! An [`AppConfig`] is the unit that declares models: its
//! [`ready`](AppConfig::ready) hook runs when the model registry is seeded
//! and is where an application builds its model classes. [`AppRegistry`]
//! keeps the configs in registration order and tracks whether they have been
//! loaded.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{DjormError, DjormResult};

/// Configuration for an installed application.
///
/// # Examples
///
/// ```
/// use djorm_core::apps::AppConfig;
///
/// struct Blog;
///
/// impl AppConfig for Blog {
///     fn name(&self) -> &str { "project.blog" }
/// }
///
/// assert_eq!(Blog.label(), "blog");
/// ```
pub trait AppConfig: Send + Sync {
    /// Returns the full dotted path of the application.
    fn name(&self) -> &str;

    /// Returns a short label derived from the name (the last component).
    fn label(&self) -> &str {
        self.name().rsplit('.').next().unwrap_or_else(|| self.name())
    }

    /// Returns a human-readable name for the application.
    fn verbose_name(&self) -> &str {
        self.name()
    }

    /// Declares the application's models.
    fn ready(&self) -> DjormResult<()> {
        Ok(())
    }
}

/// Loading state of an [`AppRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadState {
    Pending,
    Loading,
    Ready,
}

/// The registry of installed application configs.
pub struct AppRegistry {
    apps: Vec<Arc<dyn AppConfig>>,
    app_labels: HashMap<String, usize>,
    state: LoadState,
}

impl Default for AppRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AppRegistry {
    /// Creates a new, empty `AppRegistry`.
    pub fn new() -> Self {
        Self {
            apps: Vec::new(),
            app_labels: HashMap::new(),
            state: LoadState::Pending,
        }
    }

    /// Registers an application.
    ///
    /// Fails if an app with the same label exists or loading has already started.
    pub fn register(&mut self, app: Arc<dyn AppConfig>) -> DjormResult<()> {
        if self.state != LoadState::Pending {
            return Err(DjormError::ImproperlyConfigured(
                "Cannot register apps after the registry has been populated".into(),
            ));
        }

        let label = app.label().to_string();
        if self.app_labels.contains_key(&label) {
            return Err(DjormError::ImproperlyConfigured(format!(
                "Application labels aren't unique, duplicates: {label}"
            )));
        }

        let index = self.apps.len();
        self.app_labels.insert(label, index);
        self.apps.push(app);
        Ok(())
    }

    /// Returns the configuration for the app with the given label, if registered.
    pub fn get_app_config(&self, label: &str) -> Option<&Arc<dyn AppConfig>> {
        self.app_labels.get(label).map(|&idx| &self.apps[idx])
    }

    /// Returns all registered app configurations, in registration order.
    pub fn get_app_configs(&self) -> &[Arc<dyn AppConfig>] {
        &self.apps
    }

    /// Marks loading as started and hands out the configs to run.
    ///
    /// Returns `None` if loading already started or finished, so a `ready`
    /// hook that re-enters the registry does not run the hooks twice. The
    /// caller runs the hooks without holding any lock and then calls
    /// [`finish_population`](Self::finish_population).
    pub fn begin_population(&mut self) -> Option<Vec<Arc<dyn AppConfig>>> {
        if self.state != LoadState::Pending {
            return None;
        }
        self.state = LoadState::Loading;
        Some(self.apps.clone())
    }

    /// Marks loading as finished.
    pub fn finish_population(&mut self) {
        self.state = LoadState::Ready;
    }

    /// Runs every `ready` hook in registration order.
    pub fn populate(&mut self) -> DjormResult<()> {
        let Some(apps) = self.begin_population() else {
            return Err(DjormError::ImproperlyConfigured(
                "App registry has already been populated".into(),
            ));
        };
        for app in apps {
            app.ready()?;
        }
        self.finish_population();
        Ok(())
    }

    /// Returns `true` if the registry has been populated.
    pub fn is_ready(&self) -> bool {
        self.state == LoadState::Ready
    }
}
