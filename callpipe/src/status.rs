use crate::{Error, ErrorKind};

/// Status codes with the same numbering as gRPC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl StatusCode {
    /// Decodes a wire value. Values outside the known range map to `Unknown`.
    #[must_use]
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => Self::Ok,
            1 => Self::Cancelled,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Unauthenticated,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Terminal status of a call: a code plus a human readable detail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    pub detail: String,
}

impl Status {
    pub const INTERNAL_ERROR_DETAIL: &'static str = "The server encountered an internal error.";

    #[must_use]
    pub fn new(code: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "")
    }

    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(StatusCode::Cancelled, "")
    }

    #[must_use]
    pub fn internal_error() -> Self {
        Self::new(StatusCode::Unknown, Self::INTERNAL_ERROR_DETAIL)
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    /// Classifies a failed handler outcome.
    ///
    /// Explicit status errors are reported verbatim, cancellation becomes
    /// `Cancelled` with an empty detail and everything else is `Unknown` with
    /// the error description as detail.
    #[must_use]
    pub fn from_error(error: &Error) -> Self {
        match error.kind {
            ErrorKind::Status(code) => Self::new(code, error.msg.clone()),
            ErrorKind::Cancelled => Self::cancelled(),
            _ => Self::new(StatusCode::Unknown, error.to_string()),
        }
    }

    /// Converts a status received by a client into a result.
    ///
    /// # Errors
    ///
    /// Returns an `ErrorKind::Status` error for every non-`Ok` code.
    pub fn into_result(self) -> crate::Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(Error::status(self.code, self.detail))
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{:?}", self.code)
        } else {
            write!(f, "{:?}: {}", self.code, self.detail)
        }
    }
}
