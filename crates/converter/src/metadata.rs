//! Wire shape of a self-describing tabular response.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::ConvertError;

/// A column's self-described data type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeclaredType {
    String,
    Int32,
    /// Anything the provider declares that the converter does not coerce
    /// (e.g. `double`, `date`, `float64`). Kept verbatim for error reporting.
    Other(String),
}

impl DeclaredType {
    pub fn as_str(&self) -> &str {
        match self {
            DeclaredType::String => "string",
            DeclaredType::Int32 => "int32",
            DeclaredType::Other(name) => name,
        }
    }
}

impl From<String> for DeclaredType {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "string" => DeclaredType::String,
            "int32" => DeclaredType::Int32,
            _ => DeclaredType::Other(value),
        }
    }
}

impl From<&str> for DeclaredType {
    fn from(value: &str) -> Self {
        DeclaredType::from(value.to_string())
    }
}

impl From<DeclaredType> for String {
    fn from(value: DeclaredType) -> Self {
        value.as_str().to_string()
    }
}

impl core::fmt::Display for DeclaredType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-column metadata entry as it appears on the wire.
///
/// Providers attach extra attributes (`bytes`, `max_size`); only the type
/// drives coercion and the rest is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    #[serde(rename = "type")]
    pub declared_type: DeclaredType,
}

/// A column name paired with its declared type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMetadata {
    pub name: String,
    pub declared_type: DeclaredType,
}

/// `{columns, column_metadata, rows}` payload.
///
/// Also accepts the ISS spelling (`metadata`, `data`) so provider blocks can
/// be deserialised directly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TabularResponse {
    pub columns: Vec<String>,
    #[serde(alias = "metadata", default)]
    pub column_metadata: HashMap<String, ColumnDescriptor>,
    #[serde(alias = "data", default)]
    pub rows: Vec<Vec<JsonValue>>,
}

impl TabularResponse {
    pub fn new(columns: Vec<String>, column_metadata: HashMap<String, ColumnDescriptor>) -> Self {
        Self {
            columns,
            column_metadata,
            rows: Vec::new(),
        }
    }

    /// Extract a named block (e.g. `"securities"`) from a provider document.
    pub fn from_json_block(document: &JsonValue, block: &str) -> Result<Self, ConvertError> {
        let section = document
            .get(block)
            .ok_or_else(|| ConvertError::MalformedPayload(format!("missing block '{block}'")))?;
        serde_json::from_value(section.clone())
            .map_err(|e| ConvertError::MalformedPayload(format!("block '{block}': {e}")))
    }

    /// Metadata for a listed column, if present.
    pub fn metadata(&self, column: &str) -> Option<ColumnMetadata> {
        self.column_metadata.get(column).map(|d| ColumnMetadata {
            name: column.to_string(),
            declared_type: d.declared_type.clone(),
        })
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn declared_type_parses_known_and_keeps_unknown_verbatim() {
        assert_eq!(DeclaredType::from("string"), DeclaredType::String);
        assert_eq!(DeclaredType::from("INT32"), DeclaredType::Int32);
        assert_eq!(
            DeclaredType::from("float64"),
            DeclaredType::Other("float64".to_string())
        );
    }

    #[test]
    fn iss_block_deserialises_with_aliases() {
        let doc = json!({
            "securities": {
                "metadata": {
                    "secid": {"type": "string", "bytes": 36, "max_size": 0},
                    "is_traded": {"type": "int32"}
                },
                "columns": ["secid", "is_traded"],
                "data": [["ABC", 1], ["XYZ", 0]]
            }
        });

        let response = TabularResponse::from_json_block(&doc, "securities").unwrap();
        assert_eq!(response.columns, vec!["secid", "is_traded"]);
        assert_eq!(response.row_count(), 2);
        assert_eq!(
            response.metadata("is_traded").unwrap().declared_type,
            DeclaredType::Int32
        );
    }

    #[test]
    fn missing_block_is_malformed_payload() {
        let err = TabularResponse::from_json_block(&json!({}), "securities").unwrap_err();
        assert!(matches!(err, ConvertError::MalformedPayload(_)));
    }
}
