use serde_json::Value as JsonValue;

use crate::error::ConvertError;
use crate::metadata::{DeclaredType, TabularResponse};
use crate::schema::{FieldSetter, Record, RecordSchema};

/// Convert every row of `response` into an `R`.
///
/// Fails on the first schema or data error; partial output is never returned.
pub fn convert<R: Record>(response: &TabularResponse) -> Result<Vec<R>, ConvertError> {
    let plan = ColumnPlan::resolve(R::schema(), response)?;
    response
        .rows
        .iter()
        .enumerate()
        .map(|(index, row)| plan.apply(index, row))
        .collect()
}

/// Column index → setter resolution for one response.
///
/// Resolved once per response so the per-row loop only indexes.
#[derive(Debug)]
pub struct ColumnPlan<R: 'static> {
    columns: Vec<PlannedColumn<R>>,
}

#[derive(Debug)]
struct PlannedColumn<R> {
    name: String,
    setter: FieldSetter<R>,
}

impl<R: Record> ColumnPlan<R> {
    pub fn resolve(
        schema: &'static RecordSchema<R>,
        response: &TabularResponse,
    ) -> Result<Self, ConvertError> {
        let mut columns = Vec::with_capacity(response.columns.len());

        for name in &response.columns {
            let setter = schema.field(name).ok_or_else(|| ConvertError::UnknownColumn {
                record: schema.record_name(),
                column: name.clone(),
            })?;

            let metadata = response
                .metadata(name)
                .ok_or_else(|| ConvertError::MissingMetadata {
                    column: name.clone(),
                })?;

            if let DeclaredType::Other(declared) = &metadata.declared_type {
                return Err(ConvertError::UnsupportedColumnType {
                    column: name.clone(),
                    declared: declared.clone(),
                });
            }

            if !setter.kind().accepts(&metadata.declared_type) {
                return Err(ConvertError::TypeMismatch {
                    column: name.clone(),
                    declared: metadata.declared_type,
                    expected: setter.kind(),
                });
            }

            columns.push(PlannedColumn {
                name: name.clone(),
                setter,
            });
        }

        Ok(Self { columns })
    }

    /// Build one record. Cells past the end of a short row count as null.
    pub fn apply(&self, row_index: usize, row: &[JsonValue]) -> Result<R, ConvertError> {
        if row.len() > self.columns.len() {
            return Err(ConvertError::RowLength {
                row: row_index,
                expected: self.columns.len(),
                found: row.len(),
            });
        }

        let mut record = R::default();
        for (index, column) in self.columns.iter().enumerate() {
            let cell = row.get(index).unwrap_or(&JsonValue::Null);
            match column.setter {
                FieldSetter::Text(set) => set(&mut record, text_cell(row_index, &column.name, cell)?),
                FieldSetter::Int32(set) => set(&mut record, int32_cell(row_index, &column.name, cell)?),
                FieldSetter::Flag(set) => {
                    let value = int32_cell(row_index, &column.name, cell)?;
                    set(&mut record, value.map(|v| v > 0));
                }
            }
        }
        Ok(record)
    }
}

fn text_cell(row: usize, column: &str, cell: &JsonValue) -> Result<String, ConvertError> {
    match cell {
        JsonValue::Null => Ok(String::new()),
        JsonValue::String(s) => Ok(s.clone()),
        other => Err(ConvertError::MalformedCell {
            row,
            column: column.to_string(),
            reason: format!("expected string, found {other}"),
        }),
    }
}

fn int32_cell(row: usize, column: &str, cell: &JsonValue) -> Result<Option<i32>, ConvertError> {
    match cell {
        JsonValue::Null => Ok(None),
        JsonValue::Number(n) => {
            let value = n.as_i64().ok_or_else(|| ConvertError::MalformedCell {
                row,
                column: column.to_string(),
                reason: format!("expected int32, found {n}"),
            })?;
            i32::try_from(value)
                .map(Some)
                .map_err(|_| ConvertError::MalformedCell {
                    row,
                    column: column.to_string(),
                    reason: format!("{value} does not fit in int32"),
                })
        }
        other => Err(ConvertError::MalformedCell {
            row,
            column: column.to_string(),
            reason: format!("expected int32, found {other}"),
        }),
    }
}
