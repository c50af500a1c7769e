//! Error types for tdhead-client.

use std::io;

// ─── RemoteError ──────────────────────────────────────────────────────────────

/// An error object returned by the native library in reply to a request.
///
/// TDLib forwards Telegram's error names verbatim in `message`, e.g.
/// `RemoteError { code: 400, message: "PHONE_CODE_INVALID" }`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteError {
    /// HTTP-like status code.
    pub code:    i32,
    /// Error text as reported by the library.
    pub message: String,
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

impl RemoteError {
    /// Match on the error message, with optional wildcard prefix/suffix `'*'`.
    ///
    /// # Examples
    /// - `err.is("PASSWORD_HASH_INVALID")`: exact match
    /// - `err.is("PHONE_CODE_*")`: starts-with match
    /// - `err.is("*_INVALID")`: ends-with match
    pub fn is(&self, pattern: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.message.starts_with(prefix)
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            self.message.ends_with(suffix)
        } else {
            self.message == pattern
        }
    }

    /// Seconds to wait before retrying, for `429 Too Many Requests: retry after N`.
    pub fn retry_after(&self) -> Option<u64> {
        if self.code != 429 {
            return None;
        }
        let idx = self.message.rfind("retry after ")?;
        self.message[idx + "retry after ".len()..]
            .split(|c: char| !c.is_ascii_digit())
            .next()
            .and_then(|n| n.parse().ok())
    }
}

// ─── Error ────────────────────────────────────────────────────────────────────

/// The error type returned by every tdhead operation.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The native library rejected the request.
    #[error("remote error {0}")]
    Remote(RemoteError),
    /// No reply arrived within the request's timeout.
    #[error("request timed out")]
    Timeout,
    /// The client handle was shut down or authorization closed.
    #[error("client closed")]
    Closed,
    /// An event or reply could not be decoded.
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    /// The native library could not be loaded or instantiated.
    #[error("native library: {0}")]
    Native(String),
    /// A chat identifier could not be resolved.
    #[error("invalid chat identifier: {0}")]
    InvalidTarget(String),
}

impl Error {
    /// Returns `true` if this is the named remote error (supports `'*'` wildcards).
    pub fn is(&self, pattern: &str) -> bool {
        match self {
            Self::Remote(e) => e.is(pattern),
            _               => false,
        }
    }

    /// The remote error, if this is one.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(e) => Some(e),
            _               => None,
        }
    }
}

impl From<tdhead_native::NativeError> for Error {
    fn from(e: tdhead_native::NativeError) -> Self {
        match e {
            tdhead_native::NativeError::Closed => Self::Closed,
            other                              => Self::Native(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self { Self::MalformedEvent(e.to_string()) }
}

/// Shorthand for `Result<T, tdhead_client::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

// ─── DeliveryError ────────────────────────────────────────────────────────────

/// Why a subscriber could not take a message.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Writing to the subscriber's transport failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The consumer on the other end went away.
    #[error("subscriber disconnected")]
    Disconnected,
    /// The message could not be encoded for the transport.
    #[error("encode error: {0}")]
    Encode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(code: i32, message: &str) -> RemoteError {
        RemoteError { code, message: message.into() }
    }

    #[test]
    fn wildcard_matching() {
        let e = remote(400, "PHONE_CODE_INVALID");
        assert!(e.is("PHONE_CODE_INVALID"));
        assert!(e.is("PHONE_CODE_*"));
        assert!(e.is("*_INVALID"));
        assert!(!e.is("PASSWORD_*"));
        assert!(Error::Remote(e).is("PHONE_CODE_*"));
        assert!(!Error::Timeout.is("PHONE_CODE_*"));
    }

    #[test]
    fn retry_after_parses_flood_messages() {
        assert_eq!(remote(429, "Too Many Requests: retry after 17").retry_after(), Some(17));
        assert_eq!(remote(400, "Too Many Requests: retry after 17").retry_after(), None);
        assert_eq!(remote(429, "Too Many Requests").retry_after(), None);
    }

    #[test]
    fn native_closed_maps_to_closed() {
        assert_eq!(Error::from(tdhead_native::NativeError::Closed), Error::Closed);
        assert!(matches!(
            Error::from(tdhead_native::NativeError::CreateFailed),
            Error::Native(_)
        ));
    }
}
