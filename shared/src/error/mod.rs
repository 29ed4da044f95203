//! Unified error system for the ledger pipeline
//!
//! - [`ErrorCode`]: Standardized error codes
//! - [`ErrorCategory`]: Classification of errors by range
//! - [`AppError`]: Rich error type with codes, messages, and details
//!
//! # Example
//!
//! ```
//! use shared::error::{AppError, ErrorCode};
//!
//! let err = AppError::new(ErrorCode::RangeTooLarge)
//!     .with_detail("days", 400);
//! assert_eq!(err.code.code(), 4003);
//! ```

mod category;
mod codes;
mod types;

pub use category::ErrorCategory;
pub use codes::{ErrorCode, InvalidErrorCode};
pub use types::{AppError, AppResult};
