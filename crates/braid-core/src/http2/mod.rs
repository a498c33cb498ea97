//! The typed HTTP/2 codec boundary.
//!
//! The framing codec itself (HPACK, frame parsing, the wire) is an external
//! collaborator. Transport handlers in the `braid` crate own all per-stream
//! gRPC state and talk to the codec exclusively through [`Http2Frame`] values
//! via the [`Http2Codec`] trait, so a handler is a composition over typed
//! events rather than a subclass of a connection implementation.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;

use crate::{Code, Status};

pub mod flow;
pub mod mem;

/// The default initial flow-control window.
pub const DEFAULT_WINDOW_SIZE: u32 = 65_535;

/// Largest DATA payload written in one frame.
pub const MAX_FRAME_SIZE: usize = 16_384;

/// Largest stream id; allocation past this point exhausts the connection.
pub const MAX_STREAM_ID: u32 = (1 << 31) - 1;

/// One decoded header field. Values are bytes; gRPC metadata keeps binary
/// values base64-coded at this layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: String,
    pub value: Bytes,
}

impl HeaderField {
    pub fn new(name: impl Into<String>, value: impl Into<Bytes>) -> HeaderField {
        HeaderField {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

/// An ordered header block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderBlock {
    pub fields: Vec<HeaderField>,
}

impl HeaderBlock {
    pub fn new() -> HeaderBlock {
        HeaderBlock::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<Bytes>) {
        self.fields.push(HeaderField::new(name, value));
    }

    /// First value for a name.
    pub fn get(&self, name: &str) -> Option<&HeaderField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|f| f.value_str())
    }
}

/// An HTTP/2 frame at the codec boundary, in either direction.
#[derive(Debug)]
pub enum Http2Frame {
    Headers {
        stream_id: u32,
        headers: HeaderBlock,
        end_stream: bool,
    },
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
    },
    RstStream {
        stream_id: u32,
        error_code: u32,
    },
    GoAway {
        last_stream_id: u32,
        error_code: u32,
        debug_data: Bytes,
    },
    Ping {
        ack: bool,
        payload: u64,
    },
    Settings {
        ack: bool,
        initial_window_size: Option<u32>,
        max_concurrent_streams: Option<u32>,
    },
    WindowUpdate {
        /// 0 addresses the connection window.
        stream_id: u32,
        increment: u32,
    },
}

/// Codec-level failures.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("connection closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// An HTTP/2 framing codec for one connection.
///
/// `next_frame` must be cancel-safe: the transport handlers poll it inside
/// `select!` against their command queues.
pub trait Http2Codec: Send + 'static {
    /// The next frame from the peer; `Ok(None)` once the peer has closed.
    fn next_frame(
        &mut self,
    ) -> impl Future<Output = Result<Option<Http2Frame>, CodecError>> + Send + '_;

    /// Writes one frame towards the peer.
    fn write_frame(
        &mut self,
        frame: Http2Frame,
    ) -> impl Future<Output = Result<(), CodecError>> + Send + '_;
}

/// Object-safe form of [`Http2Codec`] for dynamic dispatch.
pub trait DynHttp2Codec: Send + 'static {
    fn next_frame_dyn(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Http2Frame>, CodecError>> + Send + '_>>;

    fn write_frame_dyn(
        &mut self,
        frame: Http2Frame,
    ) -> Pin<Box<dyn Future<Output = Result<(), CodecError>> + Send + '_>>;
}

impl<C: Http2Codec> DynHttp2Codec for C {
    fn next_frame_dyn(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Http2Frame>, CodecError>> + Send + '_>> {
        Box::pin(self.next_frame())
    }

    fn write_frame_dyn(
        &mut self,
        frame: Http2Frame,
    ) -> Pin<Box<dyn Future<Output = Result<(), CodecError>> + Send + '_>> {
        Box::pin(self.write_frame(frame))
    }
}

/// A type-erased codec, for transports that receive their codec at runtime.
pub struct AnyHttp2Codec {
    inner: Box<dyn DynHttp2Codec>,
}

impl AnyHttp2Codec {
    pub fn new(codec: impl Http2Codec) -> AnyHttp2Codec {
        AnyHttp2Codec {
            inner: Box::new(codec),
        }
    }
}

impl Http2Codec for AnyHttp2Codec {
    fn next_frame(
        &mut self,
    ) -> impl Future<Output = Result<Option<Http2Frame>, CodecError>> + Send + '_ {
        self.inner.next_frame_dyn()
    }

    fn write_frame(
        &mut self,
        frame: Http2Frame,
    ) -> impl Future<Output = Result<(), CodecError>> + Send + '_ {
        self.inner.write_frame_dyn(frame)
    }
}

/// The HTTP/2 error codes used in GOAWAY and RST_STREAM frames, with their
/// status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Http2ErrorCode {
    /// Graceful shutdown; the request is safe to retry elsewhere.
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl Http2ErrorCode {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Http2ErrorCode> {
        use Http2ErrorCode::*;
        Some(match code {
            0x0 => NoError,
            0x1 => ProtocolError,
            0x2 => InternalError,
            0x3 => FlowControlError,
            0x4 => SettingsTimeout,
            0x5 => StreamClosed,
            0x6 => FrameSizeError,
            0x7 => RefusedStream,
            0x8 => Cancel,
            0x9 => CompressionError,
            0xa => ConnectError,
            0xb => EnhanceYourCalm,
            0xc => InadequateSecurity,
            0xd => Http11Required,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        use Http2ErrorCode::*;
        match self {
            NoError => "NO_ERROR",
            ProtocolError => "PROTOCOL_ERROR",
            InternalError => "INTERNAL_ERROR",
            FlowControlError => "FLOW_CONTROL_ERROR",
            SettingsTimeout => "SETTINGS_TIMEOUT",
            StreamClosed => "STREAM_CLOSED",
            FrameSizeError => "FRAME_SIZE_ERROR",
            RefusedStream => "REFUSED_STREAM",
            Cancel => "CANCEL",
            CompressionError => "COMPRESSION_ERROR",
            ConnectError => "CONNECT_ERROR",
            EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            InadequateSecurity => "INADEQUATE_SECURITY",
            Http11Required => "HTTP_1_1_REQUIRED",
        }
    }

    /// The status this error code maps to.
    pub fn status(self) -> Status {
        use Http2ErrorCode::*;
        let base = match self {
            NoError | RefusedStream => Status::new(Code::Unavailable),
            ProtocolError | InternalError | FlowControlError | SettingsTimeout | StreamClosed
            | FrameSizeError | CompressionError | ConnectError => Status::new(Code::Internal),
            Cancel => Status::new(Code::Cancelled),
            EnhanceYourCalm => {
                Status::new(Code::ResourceExhausted).with_description("Bandwidth exhausted")
            }
            InadequateSecurity => Status::new(Code::PermissionDenied)
                .with_description("Permission denied as protocol is not secure enough to call"),
            Http11Required => Status::new(Code::Unknown),
        };
        base.augment_description(format!("HTTP/2 error code: {}", self.name()))
    }

    /// Status for a raw wire code. Unrecognized codes are treated as
    /// INTERNAL_ERROR, per the HTTP/2 rule that unknown codes carry no
    /// special behavior.
    pub fn status_for_code(code: u32) -> Status {
        match Http2ErrorCode::from_code(code) {
            Some(known) => known.status(),
            None => Status::new(Code::Internal)
                .with_description(format!("Unrecognized HTTP/2 error code: {}", code)),
        }
    }
}
