//! Metadata-driven conversion of self-describing tabular payloads.
//!
//! A provider response lists its columns, declares a type per column and
//! carries rows of loosely-typed JSON cells. A target record publishes a
//! [`RecordSchema`] once (memoised per type) and [`convert`] turns every row
//! into a strongly-typed record using only that table, never per-row
//! introspection.

pub mod convert;
pub mod error;
pub mod metadata;
pub mod schema;

pub use convert::{ColumnPlan, convert};
pub use error::ConvertError;
pub use metadata::{ColumnDescriptor, ColumnMetadata, DeclaredType, TabularResponse};
pub use schema::{FieldKind, FieldSetter, Record, RecordSchema};
