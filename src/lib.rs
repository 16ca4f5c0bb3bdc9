//! A native D-Bus client: wire marshalling, message framing, an async
//! connection with reply correlation and signal fan-out, and a convenience
//! client layer with introspection-driven call inference and desktop-portal
//! request support.
//!
//! DBus Specification:
//! https://dbus.freedesktop.org/doc/dbus-specification.html

pub mod address;
pub mod client;
pub mod connection;
pub mod message_protocol;
pub mod type_system;

pub use address::Address;
pub use client::{get_client, BusKind, Client, SignalStream};
pub use connection::{Connection, SignalFilter, SignalMessage};
pub use message_protocol::{Message, MethodCall};
pub use type_system::types::Type;

use type_system::types;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    TryFromIntError(#[from] std::num::TryFromIntError),

    #[error(transparent)]
    TryFromSliceError(#[from] std::array::TryFromSliceError),

    /// Malformed wire bytes, bad signature, invalid path, size-limit breach.
    /// Fatal to the connection.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// The bus address string could not be parsed, or named no usable
    /// transport.
    #[error("bad bus address: {0}")]
    Address(String),

    /// The SASL handshake was rejected by the server. Fatal to the
    /// connection.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// An `ERROR` message from the peer. The connection survives.
    #[error("{name}: {message}")]
    Remote { name: String, message: String },

    /// Introspection-driven resolution failed: member not found, or the
    /// introspection data could not be interpreted. The connection survives.
    #[error("resolution failed: {0}")]
    Resolution(String),

    /// The awaited operation was cancelled by its caller scope.
    #[error("operation cancelled")]
    Cancelled,

    /// The socket closed or failed. All outstanding calls fail with this
    /// kind; subsequent operations fail the same way.
    #[error("connection closed")]
    Disconnected,

    /// A portal request completed with a non-zero response code. Carries the
    /// code (1 = cancelled by the user, 2 = other) and whatever partial
    /// results the portal supplied.
    #[error("portal request failed with response code {code}")]
    Portal {
        code: u32,
        results: Vec<(String, types::Type)>,
    },
}

/// The distinct wire-level failure conditions.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("malformed signature: {0:?}")]
    BadSignature(String),

    #[error("unexpected end of input")]
    Truncated,

    #[error("array exceeds {} bytes", crate::MAX_ARRAY_LENGTH)]
    ArrayTooLarge,

    #[error("message exceeds {} bytes", crate::MAX_MESSAGE_SIZE)]
    MessageTooLarge,

    #[error("boolean encoded as {0}")]
    NonCanonicalBoolean(u32),

    #[error("string is not valid UTF-8")]
    BadUtf8,

    #[error("invalid object path: {0:?}")]
    BadObjectPath(String),

    #[error("unix fd index {0} outside the fd table")]
    BadFdIndex(u32),

    #[error("{0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, Error>;

pub const MAJOR_PROTOCOL_VERSION: u8 = 1;

/// Marshalled arrays may not exceed 64 MiB.
pub const MAX_ARRAY_LENGTH: usize = 64 * 1024 * 1024;

/// A complete message frame may not exceed 128 MiB.
pub const MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024;
