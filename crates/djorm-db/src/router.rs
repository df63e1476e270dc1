//! Database routing.
//!
//! Before every read or write the ORM asks the [`RouterChain`] which
//! connection alias serves the model. Routers are consulted in order; the
//! first `Some` answer wins and `"default"` (or `true`) is the fallback.
//!
//! ## Example
//!
//! ```
//! use djorm_db::router::{DatabaseRouter, RouterChain};
//!
//! struct ReadReplicaRouter;
//!
//! impl DatabaseRouter for ReadReplicaRouter {
//!     fn db_for_read(&self, _app_label: &str, _model_name: &str) -> Option<String> {
//!         Some("replica".to_string())
//!     }
//! }
//!
//! let mut chain = RouterChain::new();
//! chain.add_router(Box::new(ReadReplicaRouter));
//! assert_eq!(chain.db_for_read("blog", "Entry"), "replica");
//! assert_eq!(chain.db_for_write("blog", "Entry"), "default");
//! ```

/// The alias used when no router answers.
pub const DEFAULT_DB_ALIAS: &str = "default";

/// A database router. Each method returns `None` to defer to the next
/// router in the chain.
pub trait DatabaseRouter: Send + Sync {
    /// Suggests the alias for reads of the given model.
    fn db_for_read(&self, app_label: &str, model_name: &str) -> Option<String> {
        let _ = (app_label, model_name);
        None
    }

    /// Suggests the alias for writes of the given model.
    fn db_for_write(&self, app_label: &str, model_name: &str) -> Option<String> {
        let _ = (app_label, model_name);
        None
    }

    /// Decides whether a relation between two models is allowed.
    fn allow_relation(
        &self,
        obj1_app: &str,
        obj1_model: &str,
        obj2_app: &str,
        obj2_model: &str,
    ) -> Option<bool> {
        let _ = (obj1_app, obj1_model, obj2_app, obj2_model);
        None
    }

    /// Decides whether the model's table should be created on `db`.
    fn allow_syncdb(&self, db: &str, app_label: &str, model_name: &str) -> Option<bool> {
        let _ = (db, app_label, model_name);
        None
    }
}

/// Routers evaluated in insertion order.
#[derive(Default)]
pub struct RouterChain {
    routers: Vec<Box<dyn DatabaseRouter>>,
}

impl std::fmt::Debug for RouterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterChain")
            .field("routers", &self.routers.len())
            .finish()
    }
}

impl RouterChain {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a router.
    pub fn add_router(&mut self, router: Box<dyn DatabaseRouter>) {
        self.routers.push(router);
    }

    /// Returns the number of routers.
    pub fn len(&self) -> usize {
        self.routers.len()
    }

    /// Returns `true` if no routers are installed.
    pub fn is_empty(&self) -> bool {
        self.routers.is_empty()
    }

    /// Returns the alias for reads.
    pub fn db_for_read(&self, app_label: &str, model_name: &str) -> String {
        self.routers
            .iter()
            .find_map(|r| r.db_for_read(app_label, model_name))
            .unwrap_or_else(|| DEFAULT_DB_ALIAS.to_string())
    }

    /// Returns the alias for writes.
    pub fn db_for_write(&self, app_label: &str, model_name: &str) -> String {
        self.routers
            .iter()
            .find_map(|r| r.db_for_write(app_label, model_name))
            .unwrap_or_else(|| DEFAULT_DB_ALIAS.to_string())
    }

    /// Returns whether a relation is allowed; `true` when no router decides.
    pub fn allow_relation(
        &self,
        obj1_app: &str,
        obj1_model: &str,
        obj2_app: &str,
        obj2_model: &str,
    ) -> bool {
        self.routers
            .iter()
            .find_map(|r| r.allow_relation(obj1_app, obj1_model, obj2_app, obj2_model))
            .unwrap_or(true)
    }

    /// Returns whether the model is synced to `db`; `true` when no router decides.
    pub fn allow_syncdb(&self, db: &str, app_label: &str, model_name: &str) -> bool {
        self.routers
            .iter()
            .find_map(|r| r.allow_syncdb(db, app_label, model_name))
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AuthRouter;

    impl DatabaseRouter for AuthRouter {
        fn db_for_read(&self, app_label: &str, _model_name: &str) -> Option<String> {
            (app_label == "auth").then(|| "auth_db".to_string())
        }

        fn db_for_write(&self, app_label: &str, _model_name: &str) -> Option<String> {
            (app_label == "auth").then(|| "auth_db".to_string())
        }

        fn allow_relation(
            &self,
            obj1_app: &str,
            _obj1_model: &str,
            obj2_app: &str,
            _obj2_model: &str,
        ) -> Option<bool> {
            if obj1_app == "auth" && obj2_app == "auth" {
                Some(true)
            } else if obj1_app == "auth" || obj2_app == "auth" {
                Some(false)
            } else {
                None
            }
        }

        fn allow_syncdb(&self, db: &str, app_label: &str, _model_name: &str) -> Option<bool> {
            (app_label == "auth").then(|| db == "auth_db")
        }
    }

    struct ReadReplicaRouter;

    impl DatabaseRouter for ReadReplicaRouter {
        fn db_for_read(&self, _app_label: &str, _model_name: &str) -> Option<String> {
            Some("replica".to_string())
        }
    }

    #[test]
    fn test_empty_chain_uses_default() {
        let chain = RouterChain::new();
        assert!(chain.is_empty());
        assert_eq!(chain.db_for_read("blog", "Entry"), "default");
        assert_eq!(chain.db_for_write("blog", "Entry"), "default");
        assert!(chain.allow_syncdb("default", "blog", "Entry"));
        assert!(chain.allow_relation("blog", "Entry", "blog", "Blog"));
    }

    #[test]
    fn test_router_chain_order_matters() {
        let mut chain = RouterChain::new();
        chain.add_router(Box::new(AuthRouter));
        chain.add_router(Box::new(ReadReplicaRouter));
        assert_eq!(chain.len(), 2);

        assert_eq!(chain.db_for_read("auth", "User"), "auth_db");
        assert_eq!(chain.db_for_write("auth", "User"), "auth_db");
        assert_eq!(chain.db_for_read("blog", "Entry"), "replica");
        assert_eq!(chain.db_for_write("blog", "Entry"), "default");
    }

    #[test]
    fn test_allow_relation() {
        let mut chain = RouterChain::new();
        chain.add_router(Box::new(AuthRouter));
        assert!(chain.allow_relation("auth", "User", "auth", "Group"));
        assert!(!chain.allow_relation("auth", "User", "blog", "Entry"));
        assert!(chain.allow_relation("blog", "Entry", "blog", "Blog"));
    }

    #[test]
    fn test_allow_syncdb() {
        let mut chain = RouterChain::new();
        chain.add_router(Box::new(AuthRouter));
        assert!(chain.allow_syncdb("auth_db", "auth", "User"));
        assert!(!chain.allow_syncdb("default", "auth", "User"));
        assert!(chain.allow_syncdb("default", "blog", "Entry"));
    }
}
