//! Query building, compilation, and execution.
//!
//! - [`lookups`] - filter keywords and the comparisons they compile to
//! - [`compiler`] - Query AST and SQL compilation
//! - [`queryset`] - lazy querysets, their projections and the insert path

pub mod compiler;
pub mod lookups;
pub mod queryset;

pub use compiler::{DatabaseBackendType, OrderBy, Query, Row, SelectColumn, SqlCompiler, WhereNode};
pub use lookups::{Lookup, LookupType};
pub use queryset::{
    insert_query, DateKind, Dates, Objects, Projection, QuerySet, QuerySetIter, Values, ValuesRow,
    CHUNK_SIZE,
};
