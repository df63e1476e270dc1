//! Field definitions and types for the ORM.
//!
//! Provides the [`Field`] struct and [`FieldType`] enum that describe model
//! fields and their column mappings, mirroring Django's
//! `django.db.models.fields`.

pub mod types;

pub use types::{Field, FieldDefault, FieldType};
