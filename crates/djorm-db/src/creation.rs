//! Table creation and test databases.
//!
//! [`sync_db`] creates the table of every routable concrete model that is
//! not in the database yet. [`create_test_db`] and [`destroy_test_db`]
//! point an alias at a throwaway database for the length of a test run.

use std::sync::Arc;

use djorm_core::settings::DatabaseSettings;
use djorm_core::{DjormError, DjormResult};

use crate::connection::ConnectionHandler;
use crate::model::ModelClass;
use crate::query::compiler::{DatabaseBackendType, SqlCompiler};
use crate::registry::ModelRegistry;

/// Returns the CREATE TABLE (and CREATE INDEX) statements for `model`.
///
/// Relation columns reference the primary key of their target when the
/// target is registered; otherwise the column is created without a
/// constraint.
pub fn sql_create_model(
    model: &Arc<ModelClass>,
    registry: &ModelRegistry,
    backend: DatabaseBackendType,
) -> DjormResult<Vec<String>> {
    let meta = model.meta();
    let mut schema = match meta.schema() {
        Some(schema) => (**schema).clone(),
        None => meta.table_schema()?,
    };
    for (column, field) in schema.columns.iter_mut().zip(meta.local_fields()) {
        let Some(target) = field.field_type.related_model() else {
            continue;
        };
        let label = if target.contains('.') {
            target.to_string()
        } else {
            format!("{}.{target}", meta.app_label)
        };
        match registry.get_model_by_label(&label)? {
            Some(related) => {
                let related = related.concrete_model();
                let related_meta = related.meta();
                column.references = Some((
                    related_meta.db_table.clone(),
                    related_meta.pk_field()?.column.clone(),
                ));
            }
            None => {
                tracing::debug!(model = %meta.label(), target = %label, "relation target not registered");
            }
        }
    }
    Ok(SqlCompiler::new(backend).compile_create_table(&schema))
}

/// Creates the missing tables on `alias`; returns the tables created.
///
/// Installed apps are populated first. A model gets a table when it is
/// managed, concrete, not a proxy and the routers allow it on `alias`.
pub fn sync_db(
    conns: &mut ConnectionHandler,
    registry: &ModelRegistry,
    alias: &str,
) -> DjormResult<Vec<String>> {
    registry.populate()?;
    let mut existing = conns.get(alias)?.table_names()?;
    let mut created = Vec::new();

    for app in registry.get_apps() {
        for model in registry.get_models(Some(&app), true) {
            let meta = model.meta();
            if !meta.managed || meta.is_abstract || meta.proxy {
                continue;
            }
            if !conns
                .router()
                .allow_syncdb(alias, &meta.app_label, &meta.object_name)
            {
                continue;
            }
            if existing.iter().any(|t| t.eq_ignore_ascii_case(&meta.db_table)) {
                continue;
            }
            let conn = conns.get(alias)?;
            tracing::info!(alias, table = %meta.db_table, "creating table");
            for sql in sql_create_model(&model, registry, conn.backend_type())? {
                conn.execute(&sql, &[])?;
            }
            existing.push(meta.db_table.clone());
            created.push(meta.db_table.clone());
        }
    }

    conns.get(alias)?.commit_unless_managed()?;
    Ok(created)
}

/// The database name tests run against.
///
/// An explicit `test_name` wins. `SQLite` otherwise tests in memory; other
/// backends prefix the name with `test_`.
pub fn test_db_name(settings: &DatabaseSettings, backend: DatabaseBackendType) -> String {
    if let Some(name) = settings.test_name.as_deref().filter(|n| !n.is_empty()) {
        return name.to_string();
    }
    match backend {
        DatabaseBackendType::SQLite => ":memory:".to_string(),
        DatabaseBackendType::PostgreSQL => format!("test_{}", settings.name),
    }
}

/// Points `alias` at a fresh test database and creates its tables.
///
/// A leftover test database of the same name is destroyed first. Returns
/// the previous database name, to be handed to [`destroy_test_db`].
pub fn create_test_db(
    conns: &mut ConnectionHandler,
    registry: &ModelRegistry,
    alias: &str,
) -> DjormResult<String> {
    let engine = conns.engine_for(alias)?;
    let settings = conns.settings_for(alias)?.clone();
    let old_name = settings.name.clone();

    let mut test_settings = settings;
    test_settings.name = test_db_name(&test_settings, engine.backend_type());
    if test_settings.name == old_name {
        return Err(DjormError::ImproperlyConfigured(format!(
            "The test database for '{alias}' would overwrite the database '{old_name}'."
        )));
    }
    tracing::info!(alias, name = %test_settings.name, "creating test database");
    if !engine.is_in_memory(&test_settings) {
        engine.destroy_database(&test_settings)?;
    }

    conns.get(alias)?.close();
    conns.set_settings(alias, test_settings);
    sync_db(conns, registry, alias)?;
    Ok(old_name)
}

/// Destroys the test database of `alias` and points it back at `old_name`.
pub fn destroy_test_db(conns: &mut ConnectionHandler, alias: &str, old_name: &str) -> DjormResult<()> {
    let engine = conns.engine_for(alias)?;
    let test_settings = conns.settings_for(alias)?.clone();
    tracing::info!(alias, name = %test_settings.name, "destroying test database");

    let mut restored = test_settings.clone();
    restored.name = old_name.to_string();
    // Dropping the wrapper releases the connection, in-memory ones included.
    conns.set_settings(alias, restored);
    if !engine.is_in_memory(&test_settings) {
        engine.destroy_database(&test_settings)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{Field, FieldType};
    use crate::model::ModelBuilder;
    use crate::options::Meta;
    use crate::router::{DatabaseRouter, RouterChain};
    use crate::testing::{lock, mock_handler, statements};

    fn blog_models(registry: &ModelRegistry) -> (Arc<ModelClass>, Arc<ModelClass>) {
        let blog = ModelBuilder::new("Blog", "site.blog.models")
            .field(Field::new("name", FieldType::CharField).max_length(100))
            .build(registry)
            .unwrap();
        let entry = ModelBuilder::new("Entry", "site.blog.models")
            .field(Field::new("blog", FieldType::ForeignKey { to: "blog.Blog".into() }))
            .field(Field::new("headline", FieldType::CharField).max_length(255))
            .build(registry)
            .unwrap();
        (blog, entry)
    }

    #[test]
    fn test_sql_create_model_resolves_references() {
        let registry = ModelRegistry::new();
        let (_, entry) = blog_models(&registry);
        let sql = sql_create_model(&entry, &registry, DatabaseBackendType::SQLite).unwrap();
        assert_eq!(sql.len(), 2);
        assert!(sql[0].starts_with("CREATE TABLE \"blog_entry\" ("));
        assert!(sql[0].contains("\"blog_id\" integer NOT NULL REFERENCES \"blog_blog\" (\"id\")"));
        assert_eq!(
            sql[1],
            "CREATE INDEX \"blog_entry_blog_id\" ON \"blog_entry\" (\"blog_id\")"
        );
    }

    #[test]
    fn test_sql_create_model_unknown_target_has_no_constraint() {
        let registry = ModelRegistry::new();
        let note = ModelBuilder::new("Note", "site.notes.models")
            .field(Field::new("author", FieldType::ForeignKey { to: "auth.User".into() }))
            .build(&registry)
            .unwrap();
        let sql = sql_create_model(&note, &registry, DatabaseBackendType::SQLite).unwrap();
        assert!(!sql[0].contains("REFERENCES"));
    }

    #[test]
    fn test_sync_db_skips_existing_proxy_and_unmanaged() {
        let registry = ModelRegistry::new();
        let (blog, _) = blog_models(&registry);
        ModelBuilder::new("BlogProxy", "site.blog.models")
            .base(&blog)
            .meta(Meta::new().proxy())
            .build(&registry)
            .unwrap();
        ModelBuilder::new("Legacy", "site.blog.models")
            .field(Field::new("code", FieldType::IntegerField))
            .meta(Meta::new().managed(false))
            .build(&registry)
            .unwrap();

        let (mut conns, state) = mock_handler();
        lock(&state).tables.push("blog_blog".into());
        let created = sync_db(&mut conns, &registry, "default").unwrap();
        assert_eq!(created, vec!["blog_entry".to_string()]);
        let stmts = statements(&state);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].starts_with("CREATE TABLE \"blog_entry\""));
    }

    struct NoBlogs;

    impl DatabaseRouter for NoBlogs {
        fn allow_syncdb(&self, _db: &str, app_label: &str, _model_name: &str) -> Option<bool> {
            (app_label == "blog").then_some(false)
        }
    }

    #[test]
    fn test_sync_db_consults_routers() {
        let registry = ModelRegistry::new();
        blog_models(&registry);
        let (mut conns, state) = mock_handler();
        let mut router = RouterChain::new();
        router.add_router(Box::new(NoBlogs));
        conns.set_router(router);
        assert!(sync_db(&mut conns, &registry, "default").unwrap().is_empty());
        assert!(statements(&state).is_empty());
    }

    #[test]
    fn test_test_db_name() {
        let mut settings = DatabaseSettings::sqlite_file("app.db");
        assert_eq!(test_db_name(&settings, DatabaseBackendType::SQLite), ":memory:");
        assert_eq!(
            test_db_name(&settings, DatabaseBackendType::PostgreSQL),
            "test_app.db"
        );
        settings.test_name = Some("custom.db".into());
        assert_eq!(test_db_name(&settings, DatabaseBackendType::SQLite), "custom.db");
    }

    #[test]
    fn test_create_and_destroy_test_db() {
        let registry = ModelRegistry::new();
        blog_models(&registry);
        let (mut conns, state) = mock_handler();
        let old = create_test_db(&mut conns, &registry, "default").unwrap();
        assert_eq!(old, "test.db");
        assert_eq!(conns.settings_for("default").unwrap().name, ":memory:");
        assert_eq!(
            statements(&state)
                .iter()
                .filter(|s| s.starts_with("CREATE TABLE"))
                .count(),
            2
        );
        destroy_test_db(&mut conns, "default", &old).unwrap();
        assert_eq!(conns.settings_for("default").unwrap().name, "test.db");
    }
}
