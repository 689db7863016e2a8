//! Bidirectional, symmetric RPC over a single full-duplex transport.
//!
//! Both ends of a connection are peers: each may issue calls and each may
//! serve a root object, at the same time, over the same transport. The root
//! can be replaced (or revoked) while requests are in flight, and teardown is
//! orderly: in-flight handlers drain, every waiter is released, and the
//! root's destructor hook runs exactly once.
//!
//! The wire format is pluggable through the [`Codec`] trait; [`JsonCodec`]
//! implements it as newline-delimited JSON over any async byte stream.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use parley::{Connection, JsonCodec, MethodTable, ServerError};
//!
//! let mut table = MethodTable::new();
//! table
//!     .object_type("Clock", |root: Arc<Wall>, _id: String| async move {
//!         Ok(root.clock.clone())
//!     })
//!     .method0("Now", |clock: Arc<Clock>| async move { Ok(clock.now()) });
//!
//! let conn = Connection::new(JsonCodec::new(stream));
//! conn.serve(Arc::new(wall), &table, None);
//! conn.start();
//!
//! let now: Timestamp = conn.call("Clock", "", "Now", &()).await?;
//! conn.close().await?;
//! ```

pub mod codec;
pub mod dispatch;
pub mod error;
pub mod json;
pub mod wire;

mod binder;
mod connection;
mod driver;

pub use binder::ErrorTransform;
pub use codec::Codec;
pub use connection::{Connection, State};
pub use dispatch::{MethodTable, ObjectTypeBuilder};
pub use error::{codes, CallError, RequestError, ServerError};
pub use json::JsonCodec;
pub use wire::Header;
