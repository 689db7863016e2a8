//! Message headers and request/response classification.
//!
//! Every frame on the wire is a header plus an optional body. The header has
//! a fixed shape for both directions; a frame is a request iff its `request`
//! field is non-empty. Empty strings mean "absent"; the codec is expected to
//! omit empty fields when it serializes a header.

/// The fixed-shape header carried by every message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    /// Assigned by the issuer of a request; monotonically increasing and
    /// never reused within a connection and direction. Responses echo the id
    /// of the request they answer.
    pub request_id: u64,
    /// Object type the request is addressed to. Requests only.
    pub object_type: String,
    /// Instance id resolved by the object type's finder. May be empty.
    pub object_id: String,
    /// Name of the method being invoked. Non-empty iff this is a request.
    pub request: String,
    /// Error message on a failed response; empty on success and on requests.
    pub error: String,
    /// Optional machine-readable tag accompanying `error`.
    pub error_code: String,
}

impl Header {
    /// A header is a request iff it names a method to invoke.
    pub fn is_request(&self) -> bool {
        !self.request.is_empty()
    }
}
