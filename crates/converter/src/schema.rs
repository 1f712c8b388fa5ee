//! Explicit column-to-field tables for target records.

use std::collections::HashMap;

use crate::metadata::DeclaredType;

/// Shape of a target field, as seen by the converter.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FieldKind {
    /// `String`; null cells become `""`.
    Text,
    /// `Option<i32>`; null cells leave the field unset.
    Int32,
    /// `Option<bool>` fed from an `int32` column as `value > 0`.
    Flag,
}

impl FieldKind {
    /// Whether a column declared as `declared` can populate this field.
    pub fn accepts(self, declared: &DeclaredType) -> bool {
        matches!(
            (self, declared),
            (FieldKind::Text, DeclaredType::String)
                | (FieldKind::Int32, DeclaredType::Int32)
                | (FieldKind::Flag, DeclaredType::Int32)
        )
    }
}

/// Typed setter for one field of `R`.
pub enum FieldSetter<R> {
    Text(fn(&mut R, String)),
    Int32(fn(&mut R, Option<i32>)),
    Flag(fn(&mut R, Option<bool>)),
}

impl<R> FieldSetter<R> {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldSetter::Text(_) => FieldKind::Text,
            FieldSetter::Int32(_) => FieldKind::Int32,
            FieldSetter::Flag(_) => FieldKind::Flag,
        }
    }
}

impl<R> Clone for FieldSetter<R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R> Copy for FieldSetter<R> {}

impl<R> core::fmt::Debug for FieldSetter<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "FieldSetter::{:?}", self.kind())
    }
}

/// Column-name → setter table for a record type.
///
/// Column names are matched case-insensitively.
#[derive(Debug)]
pub struct RecordSchema<R> {
    record: &'static str,
    fields: HashMap<String, FieldSetter<R>>,
}

impl<R> RecordSchema<R> {
    pub fn new(record: &'static str) -> Self {
        Self {
            record,
            fields: HashMap::new(),
        }
    }

    pub fn text(self, column: &str, set: fn(&mut R, String)) -> Self {
        self.with(column, FieldSetter::Text(set))
    }

    pub fn int32(self, column: &str, set: fn(&mut R, Option<i32>)) -> Self {
        self.with(column, FieldSetter::Int32(set))
    }

    pub fn flag(self, column: &str, set: fn(&mut R, Option<bool>)) -> Self {
        self.with(column, FieldSetter::Flag(set))
    }

    fn with(mut self, column: &str, setter: FieldSetter<R>) -> Self {
        self.fields.insert(column.to_ascii_lowercase(), setter);
        self
    }

    pub fn record_name(&self) -> &'static str {
        self.record
    }

    pub fn field(&self, column: &str) -> Option<FieldSetter<R>> {
        self.fields.get(&column.to_ascii_lowercase()).copied()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A record the converter can build.
///
/// Implementations keep their schema in a `static OnceLock` so the table is
/// built once per process:
///
/// ```ignore
/// impl Record for Security {
///     fn schema() -> &'static RecordSchema<Self> {
///         static SCHEMA: OnceLock<RecordSchema<Security>> = OnceLock::new();
///         SCHEMA.get_or_init(|| RecordSchema::<Security>::new("Security").text("secid", |r, v| r.sec_id = v))
///     }
/// }
/// ```
pub trait Record: Default + Sized + 'static {
    fn schema() -> &'static RecordSchema<Self>;
}
