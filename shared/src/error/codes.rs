//! Unified error codes for the ledger pipeline
//!
//! Error codes are organized by category:
//! - 0xxx: General errors
//! - 4xxx: Ledger errors (entries, projection, rebuild)
//! - 9xxx: System errors (storage, broker)

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified error code enum
///
/// Represented as u16 on the wire so collaborators in other runtimes can
/// map them to their own status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum ErrorCode {
    // ==================== 0xxx: General ====================
    /// Validation failed
    ValidationFailed = 2,
    /// Resource not found
    NotFound = 3,
    /// Resource already exists
    AlreadyExists = 4,
    /// Invalid request
    InvalidRequest = 5,
    /// Invalid format
    InvalidFormat = 6,
    /// Required field missing
    RequiredField = 7,
    /// Value out of range
    ValueOutOfRange = 8,

    // ==================== 4xxx: Ledger ====================
    /// Amount must be a positive number of cents
    InvalidAmount = 4001,
    /// `from` is after `to`
    InvalidDateRange = 4002,
    /// Date range spans more days than allowed
    RangeTooLarge = 4003,
    /// Broker payload could not be parsed
    MalformedMessage = 4004,
    /// Projection rebuild failed
    RebuildFailed = 4005,
    /// Idempotency key missing or too long
    InvalidIdempotencyKey = 4006,
    /// Description too long
    DescriptionTooLong = 4007,

    // ==================== 9xxx: System ====================
    /// Internal server error
    InternalError = 9001,
    /// Database error
    DatabaseError = 9002,
    /// Configuration error
    ConfigError = 9003,
    /// Message broker unavailable
    BrokerUnavailable = 9101,
}

impl ErrorCode {
    /// Get the numeric code value
    #[inline]
    pub const fn code(&self) -> u16 {
        *self as u16
    }

    /// Get the developer-facing English message for this error code
    pub const fn message(&self) -> &'static str {
        match self {
            // General
            ErrorCode::ValidationFailed => "Validation failed",
            ErrorCode::NotFound => "Resource not found",
            ErrorCode::AlreadyExists => "Resource already exists",
            ErrorCode::InvalidRequest => "Invalid request",
            ErrorCode::InvalidFormat => "Invalid format",
            ErrorCode::RequiredField => "Required field is missing",
            ErrorCode::ValueOutOfRange => "Value is out of range",

            // Ledger
            ErrorCode::InvalidAmount => "Amount must be greater than zero",
            ErrorCode::InvalidDateRange => "Start date must not be after end date",
            ErrorCode::RangeTooLarge => "Date range is too large",
            ErrorCode::MalformedMessage => "Message payload is malformed",
            ErrorCode::RebuildFailed => "Projection rebuild failed",
            ErrorCode::InvalidIdempotencyKey => "Idempotency key is invalid",
            ErrorCode::DescriptionTooLong => "Description is too long",

            // System
            ErrorCode::InternalError => "Internal server error",
            ErrorCode::DatabaseError => "Database error",
            ErrorCode::ConfigError => "Configuration error",
            ErrorCode::BrokerUnavailable => "Message broker is unavailable",
        }
    }
}

impl From<ErrorCode> for u16 {
    #[inline]
    fn from(code: ErrorCode) -> Self {
        code.code()
    }
}

/// Error when converting from an invalid u16 to ErrorCode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidErrorCode(pub u16);

impl fmt::Display for InvalidErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid error code: {}", self.0)
    }
}

impl std::error::Error for InvalidErrorCode {}

impl TryFrom<u16> for ErrorCode {
    type Error = InvalidErrorCode;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            // General
            2 => Ok(ErrorCode::ValidationFailed),
            3 => Ok(ErrorCode::NotFound),
            4 => Ok(ErrorCode::AlreadyExists),
            5 => Ok(ErrorCode::InvalidRequest),
            6 => Ok(ErrorCode::InvalidFormat),
            7 => Ok(ErrorCode::RequiredField),
            8 => Ok(ErrorCode::ValueOutOfRange),

            // Ledger
            4001 => Ok(ErrorCode::InvalidAmount),
            4002 => Ok(ErrorCode::InvalidDateRange),
            4003 => Ok(ErrorCode::RangeTooLarge),
            4004 => Ok(ErrorCode::MalformedMessage),
            4005 => Ok(ErrorCode::RebuildFailed),
            4006 => Ok(ErrorCode::InvalidIdempotencyKey),
            4007 => Ok(ErrorCode::DescriptionTooLong),

            // System
            9001 => Ok(ErrorCode::InternalError),
            9002 => Ok(ErrorCode::DatabaseError),
            9003 => Ok(ErrorCode::ConfigError),
            9101 => Ok(ErrorCode::BrokerUnavailable),

            _ => Err(InvalidErrorCode(value)),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{:04}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_values() {
        assert_eq!(ErrorCode::ValidationFailed.code(), 2);
        assert_eq!(ErrorCode::InvalidAmount.code(), 4001);
        assert_eq!(ErrorCode::MalformedMessage.code(), 4004);
        assert_eq!(ErrorCode::DatabaseError.code(), 9002);
    }

    #[test]
    fn test_try_from_invalid() {
        assert_eq!(ErrorCode::try_from(4999), Err(InvalidErrorCode(4999)));
    }

    #[test]
    fn test_serialize_as_number() {
        let json = serde_json::to_string(&ErrorCode::RangeTooLarge).unwrap();
        assert_eq!(json, "4003");
        let code: ErrorCode = serde_json::from_str("4005").unwrap();
        assert_eq!(code, ErrorCode::RebuildFailed);
        assert!(serde_json::from_str::<ErrorCode>("12345").is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(ErrorCode::InvalidAmount.to_string(), "E4001");
        assert_eq!(ErrorCode::NotFound.to_string(), "E0003");
        assert_eq!(ErrorCode::ConfigError.to_string(), "E9003");
    }
}
