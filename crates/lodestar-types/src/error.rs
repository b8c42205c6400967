//! Type model errors

use thiserror::Error;

/// Errors raised while building or editing type-model values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("entry class {class} has {expected} fields, got {actual}")]
    FieldCount {
        class: String,
        expected: usize,
        actual: usize,
    },

    #[error("entry class {class} has no field named {field}")]
    UnknownField { class: String, field: String },

    #[error("invalid transition mask: {0:#x}")]
    InvalidTransitionMask(u8),
}

/// Result type for type-model operations
pub type Result<T> = std::result::Result<T, TypeError>;
