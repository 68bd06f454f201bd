//! Connection management
//!
//! This module handles:
//! * Transport abstraction (TCP or a caller-supplied dial function)
//! * Dialing: transport connect, TLS handshake, timeouts and cancellation
//! * State machine enforcement
//! * TLS configuration bound to the instance identity

mod conn;
mod state;
pub mod tls;
mod transport;

pub use conn::{connect, DEFAULT_DIAL_TIMEOUT, SERVER_PROXY_PORT};
pub use state::{DialState, DialStateError};
pub use tls::InstanceIdentityVerifier;
pub use transport::{BoxedStream, FnDialer, InstanceStream, Stream, TcpDialer, TransportDialer};
