//! Status codes and the `Status` error type.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::Metadata;

/// Trailer key carrying the numeric status code.
pub const GRPC_STATUS_HEADER: &str = "grpc-status";

/// Trailer key carrying the percent-encoded status message.
pub const GRPC_MESSAGE_HEADER: &str = "grpc-message";

/// The canonical status codes.
///
/// The integer values are the wire values of `grpc-status` and must never be
/// reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Code {
    /// Success (not an error).
    Ok = 0,
    /// The operation was cancelled, typically by the caller.
    Cancelled = 1,
    /// Unknown error, e.g. an unrecognized status from another runtime.
    Unknown = 2,
    /// The client specified an invalid argument.
    InvalidArgument = 3,
    /// The deadline expired before the operation could complete.
    DeadlineExceeded = 4,
    /// A requested entity was not found.
    NotFound = 5,
    /// The entity the client attempted to create already exists.
    AlreadyExists = 6,
    /// The caller does not have permission.
    PermissionDenied = 7,
    /// Some resource has been exhausted.
    ResourceExhausted = 8,
    /// The system is not in a state required for the operation.
    FailedPrecondition = 9,
    /// The operation was aborted, e.g. a concurrency conflict.
    Aborted = 10,
    /// The operation was attempted past the valid range.
    OutOfRange = 11,
    /// The method is not implemented by the server.
    Unimplemented = 12,
    /// An internal invariant was broken.
    Internal = 13,
    /// The service is currently unavailable; safe to retry.
    Unavailable = 14,
    /// Unrecoverable data loss or corruption.
    DataLoss = 15,
    /// The request lacks valid authentication credentials.
    Unauthenticated = 16,
}

impl Code {
    /// The wire value of this code.
    pub fn value(self) -> i32 {
        self as i32
    }

    /// Maps a wire value back to a code. Unrecognized values become
    /// [`Code::Unknown`].
    pub fn from_value(value: i32) -> Code {
        match value {
            0 => Code::Ok,
            1 => Code::Cancelled,
            2 => Code::Unknown,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }

    /// A `Status` with this code and no description.
    pub fn to_status(self) -> Status {
        Status::new(self)
    }

    fn name(self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An immutable status: a [`Code`] plus an optional description and cause.
///
/// `with_description` and `with_cause` return new values; a `Status` handed
/// out is never mutated behind the caller's back.
#[derive(Clone)]
pub struct Status {
    code: Code,
    description: Option<String>,
    cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Status {
    pub fn new(code: Code) -> Status {
        Status {
            code,
            description: None,
            cause: None,
        }
    }

    pub fn ok() -> Status {
        Status::new(Code::Ok)
    }

    pub fn cancelled(description: impl Into<String>) -> Status {
        Status::new(Code::Cancelled).with_description(description)
    }

    pub fn unknown(description: impl Into<String>) -> Status {
        Status::new(Code::Unknown).with_description(description)
    }

    pub fn deadline_exceeded(description: impl Into<String>) -> Status {
        Status::new(Code::DeadlineExceeded).with_description(description)
    }

    pub fn unimplemented(description: impl Into<String>) -> Status {
        Status::new(Code::Unimplemented).with_description(description)
    }

    pub fn internal(description: impl Into<String>) -> Status {
        Status::new(Code::Internal).with_description(description)
    }

    pub fn unavailable(description: impl Into<String>) -> Status {
        Status::new(Code::Unavailable).with_description(description)
    }

    pub fn resource_exhausted(description: impl Into<String>) -> Status {
        Status::new(Code::ResourceExhausted).with_description(description)
    }

    pub fn invalid_argument(description: impl Into<String>) -> Status {
        Status::new(Code::InvalidArgument).with_description(description)
    }

    /// Recovers a status from a panic payload, keeping the panic message when
    /// it is a string.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Status {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic in application callback".to_string()
        };
        Status::new(Code::Unknown)
            .with_description(message.clone())
            .with_cause(Arc::new(PanicError(message)))
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync)> {
        self.cause.as_deref()
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }

    /// Returns a status with the same code and cause, replacing the
    /// description.
    pub fn with_description(&self, description: impl Into<String>) -> Status {
        Status {
            code: self.code,
            description: Some(description.into()),
            cause: self.cause.clone(),
        }
    }

    /// Returns a status with additional detail appended to the description.
    pub fn augment_description(&self, extra: impl AsRef<str>) -> Status {
        let description = match &self.description {
            Some(d) => format!("{}\n{}", d, extra.as_ref()),
            None => extra.as_ref().to_string(),
        };
        Status {
            code: self.code,
            description: Some(description),
            cause: self.cause.clone(),
        }
    }

    /// Returns a status with the same code and description, replacing the
    /// cause.
    pub fn with_cause(&self, cause: Arc<dyn std::error::Error + Send + Sync>) -> Status {
        Status {
            code: self.code,
            description: self.description.clone(),
            cause: Some(cause),
        }
    }

    /// Writes `grpc-status` and `grpc-message` into trailers.
    pub fn to_trailers(&self, trailers: &mut Metadata) {
        trailers.put(GRPC_STATUS_HEADER, self.code.value().to_string());
        if let Some(description) = &self.description {
            trailers.put(GRPC_MESSAGE_HEADER, percent_encode(description));
        }
    }

    /// Reads a status back out of trailers, if `grpc-status` is present.
    pub fn from_trailers(trailers: &Metadata) -> Option<Status> {
        let code = trailers.get(GRPC_STATUS_HEADER)?.parse::<i32>().ok()?;
        let mut status = Status::new(Code::from_value(code));
        if let Some(message) = trailers.get(GRPC_MESSAGE_HEADER) {
            status = status.with_description(percent_decode(message));
        }
        Some(status)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(d) => write!(f, "{}: {}", self.code, d),
            None => write!(f, "{}", self.code),
        }
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Status")
            .field("code", &self.code)
            .field("description", &self.description)
            .field("cause", &self.cause.as_ref().map(|c| c.to_string()))
            .finish()
    }
}

impl std::error::Error for Status {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|c| c.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// A panic message captured as an error cause.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct PanicError(pub String);

/// Maps an HTTP `:status` code to a status, for responses that never carried
/// `grpc-status`.
pub fn http_status_to_grpc(http_status: u16) -> Status {
    let status = match http_status {
        401 => Status::new(Code::Unauthenticated),
        403 => Status::new(Code::PermissionDenied),
        code if code < 100 => Status::new(Code::Unknown),
        code if code < 200 => Status::new(Code::Internal),
        _ => Status::new(Code::Unknown),
    };
    status.augment_description(format!("HTTP status code {}", http_status))
}

/// Percent-encodes a status message: visible ASCII except `%` passes through,
/// everything else becomes `%XX` on the UTF-8 bytes.
fn percent_encode(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for &b in message.as_bytes() {
        if (b' '..=b'~').contains(&b) && b != b'%' {
            out.push(b as char);
        } else {
            out.push('%');
            out.push_str(&format!("{:02X}", b));
        }
    }
    out
}

/// Decodes a percent-encoded status message. Malformed escapes are passed
/// through literally rather than rejected.
fn percent_decode(message: &str) -> String {
    let bytes = message.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok());
            if let Some(b) = hex {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
