use crate::StatusCode;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    Cancelled,
    InvalidArgument,
    SerializeFailed,
    DeserializeFailed,
    SerdeJsonError,
    /// A frame was malformed or of a type not expected at this point.
    ProtocolError,
    /// The peer closed the connection or it failed underneath us.
    TransportUnavailable,
    ConnectFailed,
    BindFailed,
    AddrInUse,
    SendMsgFailed,
    RecvMsgFailed,
    Io,
    /// Enqueue on a queue that was already terminated.
    QueueTerminated,
    /// One or more event handlers failed during a broadcast.
    Aggregate,
    /// An engine invariant was broken. Never caused by user input.
    InternalBug,
    /// An explicit status raised by a handler, or received by a client.
    Status(StatusCode),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    pub msg: String,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, msg: String) -> Self {
        Self { kind, msg }
    }

    #[must_use]
    pub fn kind(kind: ErrorKind) -> Self {
        Self {
            kind,
            msg: String::default(),
        }
    }

    /// Builds an error that is reported to the caller verbatim as `code` and `detail`.
    #[must_use]
    pub fn status(code: StatusCode, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Status(code), detail.into())
    }

    #[must_use]
    pub fn cancelled() -> Self {
        Self::kind(ErrorKind::Cancelled)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        self.kind == ErrorKind::TransportUnavailable
    }

    /// The status code carried by this error, if it is an explicit status.
    #[must_use]
    pub fn status_code(&self) -> Option<StatusCode> {
        match self.kind {
            ErrorKind::Status(code) => Some(code),
            _ => None,
        }
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::kind(kind)
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(value: std::num::TryFromIntError) -> Self {
        Self {
            kind: ErrorKind::InvalidArgument,
            msg: value.to_string(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        let kind = match value.kind() {
            Io::UnexpectedEof
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::BrokenPipe
            | Io::NotConnected => ErrorKind::TransportUnavailable,
            Io::AddrInUse => ErrorKind::AddrInUse,
            Io::TimedOut => ErrorKind::Timeout,
            _ => ErrorKind::Io,
        };
        Self::new(kind, value.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self {
            kind: ErrorKind::SerdeJsonError,
            msg: value.to_string(),
        }
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(value: rmp_serde::encode::Error) -> Self {
        Self {
            kind: ErrorKind::SerializeFailed,
            msg: value.to_string(),
        }
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(value: rmp_serde::decode::Error) -> Self {
        Self {
            kind: ErrorKind::DeserializeFailed,
            msg: value.to_string(),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.msg.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            write!(f, "{:?}: {}", self.kind, self.msg)
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
