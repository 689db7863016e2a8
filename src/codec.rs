//! The pluggable wire interface the connection engine consumes.
//!
//! A codec owns the transport and knows how to frame and (de)serialize
//! messages on it. The engine drives it from a single task, so
//! implementations need no internal locking. Bodies cross the boundary as
//! [`serde_json::Value`]: the codec parses eagerly, and decoding into the
//! handler's concrete argument type is deferred to the dispatcher. This makes
//! body consumption unconditional: by the time the engine knows a header is
//! unusable, the body has already been taken off the wire.

use std::future::Future;
use std::io;

use serde_json::Value;

use crate::wire::Header;

/// A framed, typed message transport.
///
/// The engine guarantees strict alternation on the read side: after every
/// `read_header` that yields a header, `read_body` is called exactly once
/// before the next `read_header`. All writes are issued one at a time.
pub trait Codec: Send + 'static {
    /// Read the next header. Returns `Ok(None)` on clean end of stream.
    ///
    /// Must be cancel-safe: the engine races this future against its internal
    /// message queue and may drop it between messages. A partially received
    /// frame must survive in the codec's buffer.
    fn read_header(&mut self) -> impl Future<Output = io::Result<Option<Header>>> + Send;

    /// Read the body belonging to the most recently returned header.
    ///
    /// `is_request` reflects the header's classification. Returns `Ok(None)`
    /// when the message carried no body.
    fn read_body(&mut self, is_request: bool) -> impl Future<Output = io::Result<Option<Value>>> + Send;

    /// Emit one framed message. `body` is `None` for bodiless messages
    /// (error responses, results of methods that return nothing).
    fn write_message(
        &mut self,
        header: &Header,
        body: Option<&Value>,
    ) -> impl Future<Output = io::Result<()>> + Send;

    /// Close the underlying transport. Idempotent.
    fn close(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}
