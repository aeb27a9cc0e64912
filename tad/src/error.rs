//! Errors reported by the traffic application domain.
//!
//! Every failure carries an [`ErrorKind`] with a small, stable numeric code. The code is what
//! travels in answers, the message is for logs.
//!
//! [`ErrorKind`]: enum.ErrorKind.html
use core::fmt;
use std::io;

use thiserror::Error;

use crate::csap::CsapId;

/// The result type of fallible operations in this crate.
pub type Result<T> = core::result::Result<T, Error>;

/// A failure of some operation, with enough context for a log line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("CSAP {0} does not exist")]
    NoSuchCsap(CsapId),

    #[error("CSAP {0} is busy with another operation")]
    CsapBusy(CsapId),

    #[error("CSAP {0} is in the wrong state for this command")]
    CsapBadState(CsapId),

    #[error("protocol '{0}' is not supported")]
    ProtoNotSupported(String),

    #[error("stack '{0}' is not supported")]
    StackNotSupported(String),

    #[error("command requires an NDS attachment")]
    MissingNds,

    #[error("malformed NDS: {0}")]
    BadNds(String),

    #[error("NDS of wrong type, expected {expected}")]
    WrongNdsType {
        /// The NDS type the command needed.
        expected: &'static str,
    },

    #[error("layer '{layer}' rejected the unit: {reason}")]
    ConfirmFailed {
        /// Tag of the rejecting layer.
        layer: String,
        /// What it did not like.
        reason: String,
    },

    #[error("generation failed: {0}")]
    GenerateFailed(String),

    #[error("no match")]
    MatchNotFound,

    #[error("not enough data to match")]
    MatchLessData,

    #[error("timed out")]
    Timeout,

    #[error("i/o error: {0}")]
    Io(String),

    #[error("expression syntax: {0}")]
    ExprParse(String),

    #[error("expression evaluation: {0}")]
    ExprEval(String),

    #[error("no function named '{0}'")]
    NoSuchName(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// The abstract kind of an error, as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NoSuchCsap,
    CsapBusy,
    CsapBadState,
    ProtoNotSupported,
    StackNotSupported,
    MissingNds,
    BadNds,
    WrongNdsType,
    ConfirmFailed,
    GenerateFailed,
    MatchNotFound,
    MatchLessData,
    Timeout,
    IoError,
    ExprParse,
    ExprEval,
    NoSuchName,
    OutOfMemory,
    NotImplemented,
    InvalidArgument,
}

impl Error {
    /// The abstract kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NoSuchCsap(_) => ErrorKind::NoSuchCsap,
            Error::CsapBusy(_) => ErrorKind::CsapBusy,
            Error::CsapBadState(_) => ErrorKind::CsapBadState,
            Error::ProtoNotSupported(_) => ErrorKind::ProtoNotSupported,
            Error::StackNotSupported(_) => ErrorKind::StackNotSupported,
            Error::MissingNds => ErrorKind::MissingNds,
            Error::BadNds(_) => ErrorKind::BadNds,
            Error::WrongNdsType { .. } => ErrorKind::WrongNdsType,
            Error::ConfirmFailed { .. } => ErrorKind::ConfirmFailed,
            Error::GenerateFailed(_) => ErrorKind::GenerateFailed,
            Error::MatchNotFound => ErrorKind::MatchNotFound,
            Error::MatchLessData => ErrorKind::MatchLessData,
            Error::Timeout => ErrorKind::Timeout,
            Error::Io(_) => ErrorKind::IoError,
            Error::ExprParse(_) => ErrorKind::ExprParse,
            Error::ExprEval(_) => ErrorKind::ExprEval,
            Error::NoSuchName(_) => ErrorKind::NoSuchName,
            Error::OutOfMemory => ErrorKind::OutOfMemory,
            Error::NotImplemented(_) => ErrorKind::NotImplemented,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
        }
    }

    /// Shorthand for the wire code of the kind.
    pub fn code(&self) -> u32 {
        self.kind().code()
    }

    /// Whether the error only means that a frame should be skipped.
    ///
    /// These never reach the user, they advance the matching loop.
    pub fn is_mismatch(&self) -> bool {
        match self {
            Error::MatchNotFound | Error::MatchLessData => true,
            _ => false,
        }
    }

    pub(crate) fn confirm(layer: &str, reason: impl Into<String>) -> Self {
        Error::ConfirmFailed {
            layer: layer.to_owned(),
            reason: reason.into(),
        }
    }
}

impl ErrorKind {
    /// All kinds, in code order.
    pub const ALL: [ErrorKind; 20] = [
        ErrorKind::NoSuchCsap,
        ErrorKind::CsapBusy,
        ErrorKind::CsapBadState,
        ErrorKind::ProtoNotSupported,
        ErrorKind::StackNotSupported,
        ErrorKind::MissingNds,
        ErrorKind::BadNds,
        ErrorKind::WrongNdsType,
        ErrorKind::ConfirmFailed,
        ErrorKind::GenerateFailed,
        ErrorKind::MatchNotFound,
        ErrorKind::MatchLessData,
        ErrorKind::Timeout,
        ErrorKind::IoError,
        ErrorKind::ExprParse,
        ErrorKind::ExprEval,
        ErrorKind::NoSuchName,
        ErrorKind::OutOfMemory,
        ErrorKind::NotImplemented,
        ErrorKind::InvalidArgument,
    ];

    /// The stable wire code. Zero is reserved for success.
    pub fn code(self) -> u32 {
        match self {
            ErrorKind::NoSuchCsap => 1,
            ErrorKind::CsapBusy => 2,
            ErrorKind::CsapBadState => 3,
            ErrorKind::ProtoNotSupported => 4,
            ErrorKind::StackNotSupported => 5,
            ErrorKind::MissingNds => 6,
            ErrorKind::BadNds => 7,
            ErrorKind::WrongNdsType => 8,
            ErrorKind::ConfirmFailed => 9,
            ErrorKind::GenerateFailed => 10,
            ErrorKind::MatchNotFound => 11,
            ErrorKind::MatchLessData => 12,
            ErrorKind::Timeout => 13,
            ErrorKind::IoError => 14,
            ErrorKind::ExprParse => 15,
            ErrorKind::ExprEval => 16,
            ErrorKind::NoSuchName => 17,
            ErrorKind::OutOfMemory => 18,
            ErrorKind::NotImplemented => 19,
            ErrorKind::InvalidArgument => 20,
        }
    }

    /// Look up a kind by its wire code.
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.code() == code)
    }

    /// The symbolic name, as used in logs.
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::NoSuchCsap => "NO_SUCH_CSAP",
            ErrorKind::CsapBusy => "CSAP_BUSY",
            ErrorKind::CsapBadState => "CSAP_BAD_STATE",
            ErrorKind::ProtoNotSupported => "PROTO_NOT_SUPPORTED",
            ErrorKind::StackNotSupported => "STACK_NOT_SUPPORTED",
            ErrorKind::MissingNds => "MISSING_NDS",
            ErrorKind::BadNds => "BAD_NDS",
            ErrorKind::WrongNdsType => "WRONG_NDS_TYPE",
            ErrorKind::ConfirmFailed => "CONFIRM_FAILED",
            ErrorKind::GenerateFailed => "GENERATE_FAILED",
            ErrorKind::MatchNotFound => "MATCH_NOT_FOUND",
            ErrorKind::MatchLessData => "MATCH_LESS_DATA",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::IoError => "IO_ERROR",
            ErrorKind::ExprParse => "EXPR_PARSE",
            ErrorKind::ExprEval => "EXPR_EVAL",
            ErrorKind::NoSuchName => "NO_SUCH_NAME",
            ErrorKind::OutOfMemory => "OUT_OF_MEMORY",
            ErrorKind::NotImplemented => "NOT_IMPLEMENTED",
            ErrorKind::InvalidArgument => "INVALID_ARGUMENT",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout,
            io::ErrorKind::OutOfMemory => Error::OutOfMemory,
            _ => Error::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::BadNds(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_unique_and_stable() {
        for (idx, kind) in ErrorKind::ALL.iter().enumerate() {
            assert_eq!(kind.code() as usize, idx + 1);
            assert_eq!(ErrorKind::from_code(kind.code()), Some(*kind));
        }
        assert_eq!(ErrorKind::from_code(0), None);
        assert_eq!(ErrorKind::Timeout.code(), 13);
    }

    #[test]
    fn io_errors() {
        let timeout = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert_eq!(Error::from(timeout), Error::Timeout);
        let broken = io::Error::new(io::ErrorKind::BrokenPipe, "gone");
        assert_eq!(Error::from(broken).kind(), ErrorKind::IoError);
    }

    #[test]
    fn mismatch_kinds() {
        assert!(Error::MatchNotFound.is_mismatch());
        assert!(Error::MatchLessData.is_mismatch());
        assert!(!Error::Timeout.is_mismatch());
    }
}
