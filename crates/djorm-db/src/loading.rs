//! Bulk loading of prepared objects.
//!
//! [`load_objects`] saves many instances as one unit: either every object
//! of every fixture is written, or the database is left as it was. The
//! loader opens its own managed transaction level, turns referential checks
//! off while rows go in, and validates the touched tables once at the end.
//! Objects are saved raw, so field hooks such as `auto_now` do not run.

use std::fmt;
use std::sync::Arc;

use djorm_core::DjormResult;

use crate::connection::ConnectionHandler;
use crate::instance::Instance;
use crate::model::ModelClass;

/// A named group of objects to load.
#[derive(Debug, Clone)]
pub struct Fixture {
    /// Name reported in diagnostics.
    pub name: String,
    /// The objects, saved in order.
    pub objects: Vec<Instance>,
}

impl Fixture {
    /// Creates a fixture.
    pub fn new(name: impl Into<String>, objects: Vec<Instance>) -> Self {
        Self {
            name: name.into(),
            objects,
        }
    }
}

/// Where and how to load.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Alias written to.
    pub using: String,
    /// Commit, leave the transaction level and close the connection when
    /// done. Without it the caller owns the still-open level.
    pub commit: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            using: "default".to_string(),
            commit: true,
        }
    }
}

impl LoadOptions {
    /// Options writing to `alias`.
    pub fn using(alias: impl Into<String>) -> Self {
        Self {
            using: alias.into(),
            ..Self::default()
        }
    }

    /// Leaves committing to the caller.
    #[must_use]
    pub const fn without_commit(mut self) -> Self {
        self.commit = false;
        self
    }
}

/// What a load wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSummary {
    /// Objects saved.
    pub object_count: usize,
    /// Fixtures processed.
    pub fixture_count: usize,
    /// Labels of the models written, in first-seen order.
    pub models: Vec<String>,
}

impl fmt::Display for LoadSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Installed {} object(s) from {} fixture(s)",
            self.object_count, self.fixture_count
        )
    }
}

/// Saves every object of `fixtures` in one transaction.
///
/// Objects whose model the routers do not sync to the target alias are
/// skipped. A failure names the object that caused it and keeps its error
/// kind; everything written so far is rolled back.
pub fn load_objects(
    conns: &mut ConnectionHandler,
    fixtures: Vec<Fixture>,
    options: &LoadOptions,
) -> DjormResult<LoadSummary> {
    let using = options.using.as_str();
    {
        let conn = conns.get(using)?;
        conn.commit_unless_managed()?;
        conn.enter_transaction_management(true);
        conn.managed(true)?;
    }

    let mut touched: Vec<Arc<ModelClass>> = Vec::new();
    let result = conns
        .with_constraint_checks_disabled(using, |conns| {
            save_fixtures(conns, fixtures, using, &mut touched)
        })
        .and_then(|summary| {
            let tables: Vec<String> = touched.iter().map(|m| m.meta().db_table.clone()).collect();
            conns.get(using)?.check_constraints(&tables)?;
            Ok(summary)
        });

    let conn = conns.get(using)?;
    match result {
        Err(err) => {
            tracing::error!(alias = using, error = %err, "problem installing fixtures");
            conn.rollback()?;
            conn.leave_transaction_management()?;
            Err(err)
        }
        Ok(summary) => {
            if options.commit {
                conn.commit()?;
                conn.leave_transaction_management()?;
                conn.close();
            }
            tracing::info!(alias = using, "{summary}");
            Ok(summary)
        }
    }
}

fn save_fixtures(
    conns: &mut ConnectionHandler,
    fixtures: Vec<Fixture>,
    using: &str,
    touched: &mut Vec<Arc<ModelClass>>,
) -> DjormResult<LoadSummary> {
    let mut summary = LoadSummary::default();
    for fixture in fixtures {
        tracing::debug!(fixture = %fixture.name, objects = fixture.objects.len(), "installing fixture");
        summary.fixture_count += 1;
        for mut obj in fixture.objects {
            let model = Arc::clone(obj.model());
            let meta = model.meta();
            if !conns
                .router()
                .allow_syncdb(using, &meta.app_label, &meta.object_name)
            {
                continue;
            }
            obj.save_base(conns, true, Some(using), false, false)
                .map_err(|err| {
                    err.with_context(&format!(
                        "Could not load {}(pk={}): ",
                        meta.label(),
                        obj.pk()
                    ))
                })?;
            summary.object_count += 1;
            if !touched.iter().any(|m| Arc::ptr_eq(m, &model)) {
                summary.models.push(meta.label());
                touched.push(Arc::clone(&model));
            }
        }
    }
    Ok(summary)
}
