//! Core types for the braid RPC runtime.
//!
//! This crate holds the leaf building blocks that the managed runtime in the
//! `braid` crate is assembled from: the [`Status`] error taxonomy, ordered
//! [`Metadata`], deadlines and the `grpc-timeout` wire codec, the [`Context`]
//! cancellation tree, immutable [`CallOptions`], length-prefixed message
//! framing, and the typed [`http2`] codec boundary with its flow-control
//! accounting.
//!
//! Nothing in here talks to a network. The HTTP/2 framing codec itself is an
//! external collaborator behind the [`http2::Http2Codec`] trait; the only
//! in-tree implementation is the in-memory pair in [`http2::mem`] used for
//! in-process wiring and tests.

mod context;
mod deadline;
mod framing;
mod metadata;
mod options;
mod status;

pub mod http2;

pub use context::{CancellableContext, Context, ContextGuard, Key};
pub use deadline::{decode_timeout, encode_timeout, Deadline, TimeoutParseError};
pub use framing::{frame_message, Deframed, MessageDeframer, DEFAULT_MAX_MESSAGE_SIZE};
pub use metadata::{Metadata, MetadataValue, BINARY_HEADER_SUFFIX};
pub use options::{AttributeKey, Attributes, CallOptionKey, CallOptions};
pub use status::{
    http_status_to_grpc, Code, PanicError, Status, GRPC_MESSAGE_HEADER, GRPC_STATUS_HEADER,
};
