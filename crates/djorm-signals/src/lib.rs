//! # djorm-signals
//!
//! Signal dispatcher for djorm. Components subscribe to model lifecycle
//! events without the ORM knowing about them: a model class being
//! finalized, and instances being saved or deleted.
//!
//! ## Usage
//!
//! ```
//! use djorm_signals::{ClassPrepared, Signal};
//! use std::sync::Arc;
//!
//! let signal: Signal<ClassPrepared> = Signal::new();
//!
//! signal.connect("audit", Arc::new(|event: &ClassPrepared| {
//!     println!("prepared {}", event.label());
//!     None
//! }));
//!
//! let results = signal.send(&ClassPrepared {
//!     app_label: "blog".into(),
//!     object_name: "Entry".into(),
//! });
//! assert_eq!(results.len(), 1);
//! ```

use std::any::Any;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use once_cell::sync::Lazy;

/// A signal receiver callback.
///
/// Receives the event payload and may return a value to the sender.
pub type SignalReceiver<T> = Arc<dyn Fn(&T) -> Option<Box<dyn Any + Send>> + Send + Sync>;

/// A typed signal that receivers connect to by id.
pub struct Signal<T: 'static> {
    receivers: RwLock<Vec<(String, SignalReceiver<T>)>>,
}

impl<T: 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Signal<T> {
    /// Creates a new signal with no receivers.
    pub fn new() -> Self {
        Self {
            receivers: RwLock::new(Vec::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<(String, SignalReceiver<T>)>> {
        self.receivers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<(String, SignalReceiver<T>)>> {
        self.receivers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Connects a receiver. An existing receiver with the same id is replaced.
    pub fn connect(&self, receiver_id: impl Into<String>, callback: SignalReceiver<T>) {
        let id = receiver_id.into();
        let mut receivers = self.write();

        if let Some(entry) = receivers.iter_mut().find(|(rid, _)| *rid == id) {
            entry.1 = callback;
        } else {
            receivers.push((id, callback));
        }
    }

    /// Disconnects a receiver. Returns `true` if it was connected.
    pub fn disconnect(&self, receiver_id: &str) -> bool {
        let mut receivers = self.write();
        let len_before = receivers.len();
        receivers.retain(|(id, _)| id != receiver_id);
        receivers.len() < len_before
    }

    /// Sends the signal to all receivers in connection order.
    ///
    /// Receivers are called without the receiver list locked, so a receiver
    /// may connect or disconnect other receivers.
    pub fn send(&self, sender: &T) -> Vec<Option<Box<dyn Any + Send>>> {
        let receivers: Vec<SignalReceiver<T>> =
            self.read().iter().map(|(_, cb)| Arc::clone(cb)).collect();
        receivers.iter().map(|callback| callback(sender)).collect()
    }

    /// Returns the number of connected receivers.
    pub fn receiver_count(&self) -> usize {
        self.read().len()
    }
}

// ── Payloads ─────────────────────────────────────────────────────────

/// Sent once a model class has been finalized and registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassPrepared {
    /// App label of the model.
    pub app_label: String,
    /// Class name of the model.
    pub object_name: String,
}

impl ClassPrepared {
    /// Returns `app_label.ObjectName`.
    pub fn label(&self) -> String {
        format!("{}.{}", self.app_label, self.object_name)
    }
}

/// Sent before an instance row is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreSave {
    /// `app_label.ObjectName` of the model being saved.
    pub model: String,
    /// `true` when loading fixture data as-is.
    pub raw: bool,
    /// The database alias written to.
    pub using: String,
}

/// Sent after an instance row was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostSave {
    /// `app_label.ObjectName` of the model being saved.
    pub model: String,
    /// `true` if a new row was inserted.
    pub created: bool,
    /// `true` when loading fixture data as-is.
    pub raw: bool,
    /// The database alias written to.
    pub using: String,
}

/// Sent before an instance row is deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreDelete {
    /// `app_label.ObjectName` of the model.
    pub model: String,
    /// The database alias deleted from.
    pub using: String,
}

/// Sent after an instance row was deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostDelete {
    /// `app_label.ObjectName` of the model.
    pub model: String,
    /// The database alias deleted from.
    pub using: String,
}

// ── Global signal registry ───────────────────────────────────────────

/// The process-wide set of model lifecycle signals.
pub struct SignalRegistry {
    /// A model class was finalized.
    pub class_prepared: Signal<ClassPrepared>,
    /// An instance is about to be saved.
    pub pre_save: Signal<PreSave>,
    /// An instance was saved.
    pub post_save: Signal<PostSave>,
    /// An instance is about to be deleted.
    pub pre_delete: Signal<PreDelete>,
    /// An instance was deleted.
    pub post_delete: Signal<PostDelete>,
}

impl SignalRegistry {
    fn new() -> Self {
        Self {
            class_prepared: Signal::new(),
            pre_save: Signal::new(),
            post_save: Signal::new(),
            pre_delete: Signal::new(),
            post_delete: Signal::new(),
        }
    }
}

/// The global signal registry.
pub static SIGNALS: Lazy<SignalRegistry> = Lazy::new(SignalRegistry::new);
