use thiserror::Error;

use crate::metadata::DeclaredType;
use crate::schema::FieldKind;

/// Conversion failure.
///
/// Every variant is terminal for the payload being converted: retrying the
/// same response yields the same error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConvertError {
    /// The payload names a column the target record does not map.
    #[error("unknown column '{column}' for record {record}")]
    UnknownColumn { record: &'static str, column: String },

    /// A column declares a type the converter cannot coerce.
    #[error("column '{column}' declares unsupported type '{declared}'")]
    UnsupportedColumnType { column: String, declared: String },

    /// A column is listed but has no metadata entry.
    #[error("column '{column}' has no metadata")]
    MissingMetadata { column: String },

    /// The declared type cannot feed the mapped field.
    #[error("column '{column}' declared as {declared} cannot populate a {expected:?} field")]
    TypeMismatch {
        column: String,
        declared: DeclaredType,
        expected: FieldKind,
    },

    /// A cell disagrees with its column's declared type.
    #[error("row {row}, column '{column}': {reason}")]
    MalformedCell {
        row: usize,
        column: String,
        reason: String,
    },

    /// A row carries more cells than there are columns.
    #[error("row {row} has {found} cells, expected at most {expected}")]
    RowLength {
        row: usize,
        expected: usize,
        found: usize,
    },

    /// The payload is not shaped like a tabular response at all.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

impl ConvertError {
    /// The payload's declared schema no longer matches the record's.
    pub fn is_schema_drift(&self) -> bool {
        matches!(
            self,
            ConvertError::UnknownColumn { .. }
                | ConvertError::UnsupportedColumnType { .. }
                | ConvertError::MissingMetadata { .. }
                | ConvertError::TypeMismatch { .. }
        )
    }
}
