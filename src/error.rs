//! Error variants returned by the public API of this crate.
//!
//! Mirrors spec.md §7's distinction between programmer-facing failures
//! (this type, propagated with `?`) and the protocol-level error taxonomy
//! that is *observed* through [`crate::component::RemoteComponent::on_error`]
//! rather than returned (see [`crate::error::ErrorKind`]).

use std::fmt;

/// Result type returned by fallible functions of this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error variant returned by functions of this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no pin named '{0}' is declared on this component")]
    UnknownPin(String),

    #[error("pin '{0}' already declared on this component")]
    DuplicatePin(String),

    #[error("received an incremental update for unknown handle {0}")]
    UnknownHandle(u32),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("component is not ready; call ready() first")]
    NotReady,

    #[error(transparent)]
    Zmq(#[from] zmq::Error),

    #[error(transparent)]
    DBus(#[from] dbus::Error),

    #[error("send would block: {0}")]
    SendWouldBlock(zmq::Error),

    #[error(transparent)]
    ProstDecode(#[from] prost::DecodeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The recoverable, protocol-level error taxonomy from spec.md §7.
///
/// These are surfaced through observer callbacks, never returned from a
/// `Result`: the engine keeps running and keeps transitioning states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// mDNS daemon unavailable, or a browser-level failure.
    Discovery,
    /// `HALRCOMP_BIND_REJECT` was received.
    Bind,
    /// `HALRCOMP_SET_REJECT` was received.
    Pinchange,
    /// `HALRCOMMAND_ERROR` was received on the subscription channel.
    Halrcomp,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Discovery => "Discovery",
            ErrorKind::Bind => "Bind",
            ErrorKind::Pinchange => "Pinchange",
            ErrorKind::Halrcomp => "halrcomp",
        };
        f.write_str(s)
    }
}

/// A single observed protocol error: what kind, and the broker's `note`
/// (or a locally-generated description for discovery errors).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentError {
    pub kind: ErrorKind,
    pub message: String,
}

impl fmt::Display for ComponentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
