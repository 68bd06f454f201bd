//! Error types

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::Arc;

/// A specialized `Result` type for cloudsql-connector.
pub type Result<T> = std::result::Result<T, Error>;

// Errors are shared between every caller waiting on the same refresh, so causes
// are reference counted rather than boxed.
pub(crate) type SharedError = Arc<dyn StdError + Send + Sync + 'static>;

/// The step of a dial that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialFailure {
    /// Opening the raw transport connection failed
    Connect,
    /// The TLS handshake was rejected or interrupted
    Handshake,
    /// The dial timeout elapsed
    Timeout,
}

impl fmt::Display for DialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Handshake => write!(f, "handshake"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Represents all the ways an operation can fail.
///
/// Each variant names the phase that failed so callers can branch on it:
/// configuration problems are never worth retrying, refresh errors come from
/// the control-plane, dial errors from the network or the TLS handshake.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The request can never succeed as configured.
    #[error("config error: {message} (connection name = {instance:?})")]
    Config {
        /// Instance the error relates to (may be the raw, unparsed input)
        instance: String,
        /// What is wrong
        message: String,
    },

    /// Fetching metadata or a certificate from the control-plane failed.
    #[error("refresh error: {message} (connection name = {instance:?}): {source}")]
    Refresh {
        /// Instance being refreshed
        instance: String,
        /// Which part of the refresh failed
        message: String,
        /// Underlying cause
        #[source]
        source: SharedError,
    },

    /// Connecting to the instance failed.
    #[error("dial error: {message} (connection name = {instance:?}): {source}")]
    Dial {
        /// Instance being dialed
        instance: String,
        /// What failed
        message: String,
        /// Step that failed
        failure: DialFailure,
        /// Underlying cause
        #[source]
        source: SharedError,
    },

    /// The caller gave up waiting.
    #[error("operation cancelled")]
    Cancelled,

    /// The dialer (or the instance cache) was closed.
    #[error("dialer is closed")]
    Closed,
}

impl Error {
    pub(crate) fn config(instance: impl fmt::Display, message: impl Into<String>) -> Self {
        Error::Config {
            instance: instance.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn refresh<E>(instance: impl fmt::Display, message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Error::Refresh {
            instance: instance.to_string(),
            message: message.into(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn dial<E>(
        instance: impl fmt::Display,
        failure: DialFailure,
        message: impl Into<String>,
        source: E,
    ) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Error::Dial {
            instance: instance.to_string(),
            message: message.into(),
            failure,
            source: Arc::new(source),
        }
    }

    pub(crate) fn timed_out(what: &str) -> io::Error {
        io::Error::new(io::ErrorKind::TimedOut, format!("{} timed out", what))
    }

    /// Configuration error: never retried
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config { .. })
    }

    /// Control-plane refresh error
    pub fn is_refresh(&self) -> bool {
        matches!(self, Error::Refresh { .. })
    }

    /// Transport or TLS error while dialing
    pub fn is_dial(&self) -> bool {
        matches!(self, Error::Dial { .. })
    }

    /// The TLS handshake was rejected, the signal that cached credentials went bad
    pub fn is_handshake_failure(&self) -> bool {
        matches!(
            self,
            Error::Dial {
                failure: DialFailure::Handshake,
                ..
            }
        )
    }

    /// Short label used for metrics
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config",
            Error::Refresh { .. } => "refresh",
            Error::Dial { .. } => "dial",
            Error::Cancelled => "cancelled",
            Error::Closed => "closed",
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::Config { .. } => io::ErrorKind::InvalidInput,
            Error::Dial {
                failure: DialFailure::Timeout,
                ..
            } => io::ErrorKind::TimedOut,
            Error::Dial { .. } => io::ErrorKind::ConnectionRefused,
            Error::Cancelled => io::ErrorKind::Interrupted,
            Error::Closed => io::ErrorKind::NotConnected,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Dial {
            instance: String::new(),
            message: "I/O error".into(),
            failure: DialFailure::Connect,
            source: Arc::new(err),
        }
    }
}
