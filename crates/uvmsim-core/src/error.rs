//! Error types for the paging engine
//!
//! Only irrecoverable conditions surface as errors: a configuration that
//! cannot describe a working system, or the operating system refusing a
//! backing region. Expected resource exhaustion and client misuse are
//! reported through sentinel return values and WARN/ERROR logs so the
//! simulator never tears down a run over a bad pointer.

use thiserror::Error;

/// Result type alias for paging-engine operations.
pub type Result<T> = std::result::Result<T, UvmError>;

/// Errors surfaced by the paging engine.
#[derive(Error, Debug)]
pub enum UvmError {
    /// Configuration validation failure
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The OS refused a pool backing region
    #[error("backing region allocation failed: {0}")]
    PoolAllocation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        let err = UvmError::InvalidConfig("page size must be a power of two".into());
        assert!(err.to_string().contains("invalid configuration"));

        let err = UvmError::PoolAllocation("out of address space".into());
        assert!(err.to_string().contains("backing region"));
    }
}
