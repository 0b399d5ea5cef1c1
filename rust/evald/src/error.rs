use thiserror::Error;

/// Failures raised by the pure allocation and scoring code.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    #[error("no participants to allocate")]
    EmptyInput,

    #[error("group count must be in 1..={max}, got {count}")]
    InvalidGroupCount { count: i64, max: usize },

    #[error("{field} must be in 1..=5, got {value}")]
    Validation { field: String, value: f64 },
}

impl CoreError {
    /// Stable error code carried in IPC error responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyInput => "empty_input",
            Self::InvalidGroupCount { .. } => "invalid_group_count",
            Self::Validation { .. } => "validation_failed",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::EmptyInput => None,
            Self::InvalidGroupCount { count, max } => {
                Some(serde_json::json!({ "groupCount": count, "max": max }))
            }
            Self::Validation { field, value } => {
                Some(serde_json::json!({ "field": field, "value": value }))
            }
        }
    }
}
