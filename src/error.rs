//! Error taxonomy.
//!
//! Errors fall into two bands. Framework errors arise from the protocol or
//! the transport: unknown object type or request, no service installed, a
//! body that does not decode, a dying connection. Method errors are values
//! returned by user code (finders and handlers) and flow through the error
//! transformer installed with `serve` before they go on the wire.
//! Framework errors never tear down the connection unless they are
//! transport-level.

use std::fmt;
use std::io;

/// Machine-readable tags carried in the `error_code` header field for
/// framework-originated failures.
pub mod codes {
    /// The request named an object type the root does not expose.
    pub const UNKNOWN_OBJECT_TYPE: &str = "unknown-object-type";
    /// The object type exists but has no such method.
    pub const UNKNOWN_REQUEST: &str = "unknown-request";
    /// A request arrived while no root was installed.
    pub const NO_SERVICE: &str = "no-service";
    /// The request body did not decode into the method's argument type.
    pub const BAD_REQUEST: &str = "bad-request";
    /// The connection was closing or dead when the request arrived.
    pub const SHUTDOWN: &str = "shutdown";
}

/// An error produced on the serving side: by a finder, by a handler, or
/// synthesized by the dispatcher for framework failures.
///
/// The message always reaches the caller; the code, when present, becomes
/// the wire's `error_code` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    message: String,
    code: Option<String>,
}

impl ServerError {
    /// An error with a message and no code.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// An error with a message and a machine-readable code.
    pub fn with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.into()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ServerError {}

impl From<String> for ServerError {
    fn from(message: String) -> Self {
        ServerError::new(message)
    }
}

impl From<&str> for ServerError {
    fn from(message: &str) -> Self {
        ServerError::new(message)
    }
}

/// A server method that fails because its own nested call failed re-surfaces
/// the nested error, keeping the wire code when there is one.
impl From<CallError> for ServerError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Request(req) => ServerError {
                message: format!("request error: {}", req.message),
                code: req.code,
            },
            other => ServerError::new(other.to_string()),
        }
    }
}

/// The error half of a response envelope, as seen by the calling side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestError {
    message: String,
    code: Option<String>,
}

impl RequestError {
    pub(crate) fn new(message: String, code: Option<String>) -> Self {
        Self { message, code }
    }

    /// The peer's error message, without the `request error:` prefix.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The peer's machine-readable error code, if it sent one.
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request error: {}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " ({code})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RequestError {}

/// Everything an outbound call can fail with.
#[derive(Debug)]
pub enum CallError {
    /// The peer answered with an error response.
    Request(RequestError),
    /// The call arguments did not encode.
    Encode(serde_json::Error),
    /// The response body did not decode into the expected result type.
    Decode(serde_json::Error),
    /// Writing the request failed at the transport.
    Transport(io::Error),
    /// The connection was not running, or died before the response arrived.
    Shutdown,
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Request(e) => write!(f, "{e}"),
            CallError::Encode(e) => write!(f, "cannot encode call arguments: {e}"),
            CallError::Decode(e) => write!(f, "cannot decode call result: {e}"),
            CallError::Transport(e) => write!(f, "transport error: {e}"),
            CallError::Shutdown => write!(f, "connection is shut down"),
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CallError::Request(e) => Some(e),
            CallError::Encode(e) | CallError::Decode(e) => Some(e),
            CallError::Transport(e) => Some(e),
            CallError::Shutdown => None,
        }
    }
}

impl From<RequestError> for CallError {
    fn from(e: RequestError) -> Self {
        CallError::Request(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_error_display_includes_code_when_present() {
        let plain = RequestError::new("message".into(), None);
        assert_eq!(plain.to_string(), "request error: message");

        let coded = RequestError::new("message".into(), Some("code".into()));
        assert_eq!(coded.to_string(), "request error: message (code)");
    }

    #[test]
    fn shutdown_display() {
        assert_eq!(CallError::Shutdown.to_string(), "connection is shut down");
    }

    #[test]
    fn nested_request_error_keeps_code() {
        let inner = CallError::Request(RequestError::new(
            "no service".into(),
            Some(codes::NO_SERVICE.into()),
        ));
        let server: ServerError = inner.into();
        assert_eq!(server.message(), "request error: no service");
        assert_eq!(server.code(), Some(codes::NO_SERVICE));
    }

    #[test]
    fn nested_shutdown_becomes_message_only() {
        let server: ServerError = ServerError::from(CallError::Shutdown);
        assert_eq!(server.message(), "connection is shut down");
        assert_eq!(server.code(), None);
    }
}
