//! Error types and the server error-code table.
//!
//! Two surfaces, per the protocol's error handling design: errors that are
//! fatal to the in-flight request but not to the connection
//! ([`TransportError`]), and well-formed replies carrying a non-zero server
//! code ([`ServerError`]). [`ClientError`] is what every public operation on
//! [`crate::Client`] actually returns, and additionally carries schema/codec
//! errors that never reach the wire.

use std::borrow::Cow;
use std::io;

use thiserror::Error;

/// Bit 31 of a response code marks an error; bits 0..15 select the error
/// class from [`error_name`].
pub const ERROR_FLAG: u32 = 0x8000_0000;

/// Transport-level failures: fatal to the in-flight request, but the
/// connection may recover (except [`TransportError::AuthFailed`], which is
/// terminal).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("failed to connect to {0}: {1}")]
    ConnectFailed(String, io::Error),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("request timed out")]
    RequestTimeout,
    #[error("malformed frame received from server: {0}")]
    Protocol(String),
    #[error("too many pending requests (limit {0})")]
    TooManyPendingRequests(usize),
    #[error("connection is closed")]
    Closed,
}

/// A well-formed reply carrying a non-zero server response code.
#[derive(Debug, Clone, Error)]
#[error("server responded with error {name} ({code:#06x}): {message}")]
pub struct ServerError {
    pub code: u32,
    pub name: Cow<'static, str>,
    pub message: String,
}

impl ServerError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        ServerError {
            code,
            name: error_name(code),
            message: message.into(),
        }
    }

    /// The single server error that the client layer retries on: a stale
    /// cached schema id.
    pub fn is_wrong_schema_version(&self) -> bool {
        self.name == "ER_WRONG_SCHEMA_VERSION"
    }
}

/// The error returned by every public [`crate::Client`] operation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error("schema error: {0}")]
    Schema(String),
}

/// The numeric class for `ER_WRONG_SCHEMA_VERSION`. The client's retry logic
/// keys on the symbolic name, not this number, but it is kept as a named
/// constant so the two never drift apart.
pub const WRONG_SCHEMA_VERSION_CLASS: u32 = 109;

/// The fixed numeric-class to symbolic-name table. Unrecognized classes are
/// synthesized as `ER_UNKNOWN_<code>`, never silently dropped.
///
/// This table MUST be preserved exactly as the server defines it, since
/// retry logic keys on `ER_WRONG_SCHEMA_VERSION` by name, not by number.
pub fn error_name(code: u32) -> Cow<'static, str> {
    let class = code & !ERROR_FLAG;
    let name: &'static str = match class {
        0 => "ER_UNKNOWN",
        1 => "ER_ILLEGAL_PARAMS",
        3 => "ER_MEMORY_ISSUE",
        4 => "ER_TUPLE_FOUND",
        5 => "ER_TUPLE_NOT_FOUND",
        9 => "ER_UNSUPPORTED",
        10 => "ER_NONMASTER",
        19 => "ER_WAL_IO",
        20 => "ER_FIELD_TYPE",
        23 => "ER_SPACE_EXISTS",
        26 => "ER_FUNCTION_EXISTS",
        29 => "ER_INDEX_TYPE",
        32 => "ER_NO_SUCH_FIELD",
        36 => "ER_SPLICE",
        37 => "ER_UPDATE_ARG_TYPE",
        39 => "ER_TUPLE_FORMAT_LIMIT",
        51 => "ER_CREATE_SPACE",
        55 => "ER_KEY_PART_COUNT",
        56 => "ER_PROC_LUA",
        59 => "ER_NO_SUCH_PROC",
        63 => "ER_INDEX_ARITY",
        68 => "ER_DROP_PRIMARY_KEY",
        71 => "ER_EXACT_MATCH",
        77 => "ER_INVALID_MSGPACK",
        78 => "ER_PROC_RET",
        80 => "ER_NO_SUCH_SPACE",
        82 => "ER_NO_SUCH_FIELD_NO",
        83 => "ER_EXACT_FIELD_COUNT",
        84 => "ER_FIELD_MISSING",
        88 => "ER_NO_SUCH_INDEX_ID",
        105 => "ER_UNKNOWN_REQUEST_TYPE",
        109 => "ER_WRONG_SCHEMA_VERSION",
        112 => "ER_PASSWORD_MISMATCH",
        122 => "ER_NO_SUCH_INDEX_NAME",
        136 => "ER_TRANSACTION_CONFLICT",
        145 => "ER_LOADING",
        147 => "ER_ACCESS_DENIED",
        148 => "ER_CREATE_USER",
        150 => "ER_NO_SUCH_SEQUENCE",
        156 => "ER_UNSUPPORTED_PRIV",
        162 => "ER_WRONG_INDEX_RECORD",
        167 => "ER_ITERATOR_TYPE",
        175 => "ER_KEY_PART_IS_TOO_LONG",
        178 => "ER_INVALID_XLOG",
        198 => "ER_NO_SUCH_ROLE",
        _ => "",
    };

    if name.is_empty() {
        Cow::Owned(format!("ER_UNKNOWN_{:04X}", class))
    } else {
        Cow::Borrowed(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_code_resolves_by_name() {
        assert_eq!(error_name(4), "ER_TUPLE_FOUND");
        assert_eq!(error_name(ERROR_FLAG | 4), "ER_TUPLE_FOUND");
    }

    #[test]
    fn wrong_schema_version_resolves() {
        let err = ServerError::new(ERROR_FLAG | WRONG_SCHEMA_VERSION_CLASS, "schema changed");
        assert!(err.is_wrong_schema_version());
    }

    #[test]
    fn unknown_code_is_synthesized_not_dropped() {
        let name = error_name(ERROR_FLAG | 0xfff);
        assert_eq!(name, "ER_UNKNOWN_0FFF");
    }
}
