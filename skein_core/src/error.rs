//! Unified error handling for skein.
//!
//! One error type for the whole runtime. There are no recoverable errors at
//! the aggregation layer by design: callers that receive an error hold a
//! broken runtime and are expected to tear down. The variants exist so the
//! diagnostic names the failing contract rather than a generic message.

use thiserror::Error;

/// Main error type for skein operations
#[derive(Debug, Error)]
pub enum SkeinError {
    /// I/O related errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration parsing or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Destination core outside the job's core range
    #[error("Destination core {destination} out of range (total cores: {total_cores})")]
    BadDestination { destination: u32, total_cores: u32 },

    /// A single message too large for its send path
    #[error("Message of {size} bytes exceeds the {limit}-byte limit of {path}")]
    Oversized {
        size: usize,
        limit: usize,
        path: &'static str,
    },

    /// Transport layer errors
    #[error("Transport error: {0}")]
    Transport(String),

    /// Receive-side buffer walk did not line up with the sender's layout
    #[error("Wire format mismatch: {0}")]
    WireFormat(String),

    /// No deserializer registered for an id found on the wire
    #[error("Unknown deserializer id {0:#06x}")]
    UnknownDeserializer(u16),

    /// Operation raced with aggregator teardown
    #[error("Aggregator is shut down")]
    ShutdownRace,

    /// Serialization/Deserialization errors in control frames
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl SkeinError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(msg: S) -> Self {
        SkeinError::Config(msg.into())
    }

    /// Create a transport error
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        SkeinError::Transport(msg.into())
    }

    /// Create a wire format error
    pub fn wire<S: Into<String>>(msg: S) -> Self {
        SkeinError::WireFormat(msg.into())
    }
}

impl From<bincode::Error> for SkeinError {
    fn from(err: bincode::Error) -> Self {
        SkeinError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for SkeinError {
    fn from(err: toml::de::Error) -> Self {
        SkeinError::Config(format!("TOML parse error: {}", err))
    }
}

/// Convenience type alias for Results using SkeinError
pub type SkeinResult<T> = std::result::Result<T, SkeinError>;

/// Log a diagnostic and abort the process.
///
/// Wire corruption, rendezvous-protocol faults, and transport failures
/// have no recovery path at this layer: the whole job must stop, not one
/// thread. Unwinding a dispatcher would leave the other cores running
/// against a broken peer, so these sites abort instead of panicking.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        std::process::abort()
    }};
}
pub(crate) use fatal;
