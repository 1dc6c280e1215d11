//! # Error Types
//!
//! Domain-specific error types for funnel-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  funnel-core errors (this file)                                        │
//! │  ├── CoreError        - General domain errors                          │
//! │  └── ValidationError  - Lead / query validation failures               │
//! │                                                                         │
//! │  funnel-db errors                                                      │
//! │  └── DbError          - Lead store failures                            │
//! │                                                                         │
//! │  funnel-sync errors                                                    │
//! │  └── SyncError        - CRM client + orchestration failures            │
//! │                                                                         │
//! │  funnel-api errors                                                     │
//! │  └── ApiError         - What HTTP callers see (serialized)             │
//! │                                                                         │
//! │  Flow: ValidationError → DbError → SyncError → ApiError → Caller       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A classifier keyword rule cannot be used.
    ///
    /// ## When This Occurs
    /// - Empty phrase or token in a configured rule table
    /// - A token rule whose `unless` equals its own token
    #[error("Invalid keyword rule: {reason}")]
    InvalidKeywordRule { reason: String },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Raised for malformed leads coming from the CRM and for malformed
/// listing requests coming from callers.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Invalid format (e.g., bad characters in a tenant id).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Range start is after range end.
    #[error("{field} range is inverted: {from} > {to}")]
    InvertedRange { field: String, from: i64, to: i64 },
}

impl ValidationError {
    /// Shorthand for a `Required` error.
    pub fn required(field: impl Into<String>) -> Self {
        ValidationError::Required {
            field: field.into(),
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================
