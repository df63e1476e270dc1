//! Message translation and lazy translatable strings.
//!
//! Field defaults and verbose names are often written as translatable text
//! that must not be translated when the model is declared, only when the
//! value is used. [`gettext_lazy`] returns a [`LazyString`] for that case;
//! it is realized with [`LazyString::evaluate`] under whatever language is
//! active on the calling thread at that moment.
//!
//! ```
//! use djorm_core::i18n;
//!
//! i18n::register_translations("es", &[("Untitled", "Sin título")]);
//! let title = i18n::gettext_lazy("Untitled");
//!
//! i18n::activate("es");
//! assert_eq!(title.evaluate(), "Sin título");
//! i18n::deactivate();
//! assert_eq!(title.evaluate(), "Untitled");
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use once_cell::sync::Lazy;

type Catalogs = HashMap<String, HashMap<String, String>>;

static CATALOGS: Lazy<RwLock<Catalogs>> = Lazy::new(|| RwLock::new(HashMap::new()));

thread_local! {
    static CURRENT_LANGUAGE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Registers `(msgid, translation)` pairs for a language, merging with existing ones.
pub fn register_translations(language: &str, entries: &[(&str, &str)]) {
    let mut catalogs = match CATALOGS.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let catalog = catalogs.entry(language.to_string()).or_default();
    for (msgid, translated) in entries {
        catalog.insert((*msgid).to_string(), (*translated).to_string());
    }
}

/// Activates the given language code for the current thread.
pub fn activate(language_code: &str) {
    CURRENT_LANGUAGE.with(|cell| {
        *cell.borrow_mut() = Some(language_code.to_string());
    });
}

/// Reverts the current thread to the default language.
pub fn deactivate() {
    CURRENT_LANGUAGE.with(|cell| {
        *cell.borrow_mut() = None;
    });
}

/// Returns the language active on the current thread, `"en"` by default.
pub fn get_language() -> String {
    CURRENT_LANGUAGE.with(|cell| cell.borrow().clone().unwrap_or_else(|| "en".to_string()))
}

/// Translates `msgid` into the current thread's language.
///
/// Falls back to `msgid` itself when no translation is registered.
pub fn gettext(msgid: &str) -> String {
    let lang = get_language();
    let catalogs = match CATALOGS.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    catalogs
        .get(&lang)
        .and_then(|c| c.get(msgid))
        .cloned()
        .unwrap_or_else(|| msgid.to_string())
}

/// Returns a [`LazyString`] that translates `msgid` when evaluated.
pub fn gettext_lazy(msgid: &str) -> LazyString {
    LazyString::new(msgid.to_string())
}

/// A string whose translation is deferred until it is evaluated.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct LazyString {
    msgid: String,
}

impl LazyString {
    /// Creates a new `LazyString` with the given message ID.
    pub const fn new(msgid: String) -> Self {
        Self { msgid }
    }

    /// Returns the untranslated message ID.
    pub fn msgid(&self) -> &str {
        &self.msgid
    }

    /// Realizes the translation using the current thread's active language.
    pub fn evaluate(&self) -> String {
        gettext(&self.msgid)
    }
}

impl fmt::Display for LazyString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.evaluate())
    }
}

impl fmt::Debug for LazyString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyString")
            .field("msgid", &self.msgid)
            .finish()
    }
}

impl From<LazyString> for String {
    fn from(lazy: LazyString) -> Self {
        lazy.evaluate()
    }
}
