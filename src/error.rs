// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Error and exit-code types for the engine.

use std::{fmt, io};

use hickory_proto::error::ProtoError;
use thiserror::Error;

/// An alias for results returned by functions of this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Process exit codes of the diagnostic tools driven by this engine.
///
/// The variants are ordered by severity; the engine ratchets its exit code
/// monotonically upward and never lowers it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExitCode {
    /// Everything went well, including things like NXDOMAIN
    #[default]
    Success,
    /// Usage error
    Usage,
    /// Got too many RRs or names during a transfer
    TooManyRecords,
    /// Couldn't open the batch file
    BatchFile,
    /// No reply from any server
    NoServers,
    /// Internal error
    Internal,
}

impl ExitCode {
    /// The numeric code handed to the operating system.
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Usage => 1,
            Self::TooManyRecords => 7,
            Self::BatchFile => 8,
            Self::NoServers => 9,
            Self::Internal => 10,
        }
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// The error kind for fatal errors surfaced by the engine.
///
/// Recoverable conditions (a server timing out, a SERVFAIL, a truncated
/// response) are handled inside the lookup loop and never show up here.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The query or origin name was rejected by the codec
    #[error("'{name}' is not a legal name syntax ({source})")]
    BadName {
        /// the offending name as typed
        name: String,
        /// the codec's complaint
        source: ProtoError,
    },

    /// A server hostname could not be resolved to an address
    #[error("couldn't find server '{host}': {reason}")]
    ServerNotFound {
        /// server name from the configuration
        host: String,
        /// resolver failure text
        reason: String,
    },

    /// The follow-up chain exceeded the loop-protection limit
    #[error("too many lookups")]
    TooManyLookups,

    /// A TCP length prefix announced a message larger than the receive buffer
    #[error("length of {length:#06X} was longer than the receive buffer ({limit} bytes)")]
    LengthPrefix {
        /// the announced length
        length: u16,
        /// the configured buffer ceiling
        limit: usize,
    },

    /// An error from the wire codec while building or rendering a message
    #[error("{0}")]
    Proto(#[from] ProtoError),

    /// An I/O error during transport setup
    #[error("{0}")]
    Io(#[from] io::Error),

    /// An error with an arbitrary message
    #[error("{0}")]
    Msg(String),
}

/// A fatal engine error; carries the exit code the driver should use.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    /// Returns the kind of the error
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// The exit code this error maps to.
    pub fn exit_code(&self) -> ExitCode {
        match self.kind {
            ErrorKind::BadName { .. } => ExitCode::Usage,
            _ => ExitCode::Internal,
        }
    }

    pub(crate) fn bad_name(name: impl Into<String>, source: ProtoError) -> Self {
        ErrorKind::BadName {
            name: name.into(),
            source,
        }
        .into()
    }

    pub(crate) fn server_not_found(host: impl Into<String>, reason: impl Into<String>) -> Self {
        ErrorKind::ServerNotFound {
            host: host.into(),
            reason: reason.into(),
        }
        .into()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self { kind }
    }
}

impl From<ProtoError> for Error {
    fn from(error: ProtoError) -> Self {
        ErrorKind::from(error).into()
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        ErrorKind::from(error).into()
    }
}

impl From<&'static str> for Error {
    fn from(msg: &'static str) -> Self {
        ErrorKind::Msg(msg.to_string()).into()
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        ErrorKind::Msg(msg).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_the_documented_numbers() {
        assert_eq!(ExitCode::Success.code(), 0);
        assert_eq!(ExitCode::Usage.code(), 1);
        assert_eq!(ExitCode::TooManyRecords.code(), 7);
        assert_eq!(ExitCode::BatchFile.code(), 8);
        assert_eq!(ExitCode::NoServers.code(), 9);
        assert_eq!(ExitCode::Internal.code(), 10);
    }

    #[test]
    fn severity_ordering_supports_the_ratchet() {
        assert!(ExitCode::Success < ExitCode::TooManyRecords);
        assert!(ExitCode::TooManyRecords < ExitCode::NoServers);
        assert!(ExitCode::NoServers < ExitCode::Internal);
    }

    #[test]
    fn bad_name_is_a_usage_error() {
        let err = Error::bad_name("not a name", ProtoError::from("bad label"));
        assert_eq!(err.exit_code(), ExitCode::Usage);
    }
}
