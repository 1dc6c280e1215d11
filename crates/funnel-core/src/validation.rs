//! # Validation Module
//!
//! Validation for leads arriving from the CRM and for listing requests
//! arriving from callers.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: HTTP extractors (funnel-api)                                 │
//! │  └── Type validation (deserialization)                                 │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: THIS MODULE                                                  │
//! │  ├── Lead id must be a positive integer                                │
//! │  ├── Tenant id shape                                                   │
//! │  └── Paging and date range sanity                                      │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: SQLite                                                       │
//! │  └── Partial UNIQUE index on (tenant_id, lead_id)                      │
//! │                                                                         │
//! │  Invalid leads are rejected here, never by an index failure.           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::ValidationError;
use crate::types::{Lead, LeadQuery};
use crate::{MAX_PAGE_LIMIT, MAX_TENANT_ID_LEN};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// Lead Validators
// =============================================================================

/// Validates a lead for storage and returns its id.
///
/// ## Rules
/// - `id` must be present
/// - `id` must be a positive integer
///
/// ## Example
/// ```rust
/// use funnel_core::validation::validate_lead;
/// use funnel_core::Lead;
///
/// assert_eq!(validate_lead(&Lead::new(12, 1, 1)).unwrap(), 12);
/// assert!(validate_lead(&Lead::new(0, 1, 1)).is_err());
/// ```
pub fn validate_lead(lead: &Lead) -> ValidationResult<i64> {
    match lead.id {
        None => Err(ValidationError::required("id")),
        Some(id) if id <= 0 => Err(ValidationError::MustBePositive {
            field: "id".to_string(),
        }),
        Some(id) => Ok(id),
    }
}

// =============================================================================
// Request Validators
// =============================================================================

/// Validates a tenant identifier.
///
/// ## Rules
/// - Must not be empty
/// - At most 64 characters
/// - Letters, digits, hyphens, underscores and dots only
pub fn validate_tenant_id(tenant_id: &str) -> ValidationResult<()> {
    if tenant_id.trim().is_empty() {
        return Err(ValidationError::required("tenant_id"));
    }

    if tenant_id.len() > MAX_TENANT_ID_LEN {
        return Err(ValidationError::TooLong {
            field: "tenant_id".to_string(),
            max: MAX_TENANT_ID_LEN,
        });
    }

    if !tenant_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(ValidationError::InvalidFormat {
            field: "tenant_id".to_string(),
            reason: "must contain only letters, numbers, hyphens, underscores, and dots"
                .to_string(),
        });
    }

    Ok(())
}

/// Validates paging parameters.
pub fn validate_paging(page: u32, limit: u32) -> ValidationResult<()> {
    if page == 0 {
        return Err(ValidationError::MustBePositive {
            field: "page".to_string(),
        });
    }

    if limit == 0 || limit > MAX_PAGE_LIMIT {
        return Err(ValidationError::OutOfRange {
            field: "limit".to_string(),
            min: 1,
            max: i64::from(MAX_PAGE_LIMIT),
        });
    }

    Ok(())
}

/// Validates an optional inclusive date range.
pub fn validate_date_range(
    field: &str,
    from: Option<i64>,
    to: Option<i64>,
) -> ValidationResult<()> {
    match (from, to) {
        (Some(from), Some(to)) if from > to => Err(ValidationError::InvertedRange {
            field: field.to_string(),
            from,
            to,
        }),
        _ => Ok(()),
    }
}

/// Validates a whole lead listing request.
pub fn validate_lead_query(query: &LeadQuery) -> ValidationResult<()> {
    validate_paging(query.page, query.limit)?;
    validate_date_range(query.date_field.column(), query.from, query.to)?;

    if query.tags.iter().any(|t| t.trim().is_empty()) {
        return Err(ValidationError::InvalidFormat {
            field: "tags".to_string(),
            reason: "tag names must not be empty".to_string(),
        });
    }

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
