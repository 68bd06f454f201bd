//! cloudsql-connector: authenticated, encrypted connections to managed database instances
//!
//! The caller names an instance (`project:region:instance`) and picks a few
//! policy options; the crate resolves the instance's address, keeps a short-lived
//! client certificate fresh in the background, performs a mutual-TLS handshake
//! and hands back a plain byte stream.
//!
//! # Layout
//!
//! * [`client`] - the [`Dialer`] facade, instance names and dial options
//! * [`cache`] - per-instance connection info cache and refresh engine
//! * [`connection`] - TLS dialing over a pluggable transport
//! * [`admin`] - contract of the remote control-plane
//! * [`auth`] - access token suppliers
//!
//! # Example
//!
//! ```no_run
//! # async fn example(
//! #     control_plane: impl cloudsql_connector::admin::ControlPlane,
//! # ) -> cloudsql_connector::Result<()> {
//! use cloudsql_connector::{DialOption, Dialer, StaticTokenSource};
//! use tokio::io::AsyncWriteExt;
//!
//! let dialer = Dialer::builder(control_plane)
//!     .token_source(StaticTokenSource::new("ya29.token"))
//!     .build()?;
//!
//! let mut stream = dialer
//!     .dial("my-project:us-central1:my-instance", [DialOption::PrivateIp])
//!     .await?;
//! stream.write_all(b"hello").await?;
//! dialer.close();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod admin;
pub mod auth;
pub mod cache;
pub mod client;
pub mod connection;
pub mod error;
pub mod metrics;

pub use admin::{ControlPlane, ControlPlaneError, IpType};
pub use auth::{AccessToken, ServiceAccountTokenSource, StaticTokenSource, TokenSource};
pub use cache::{ConnectionInfo, DatabaseEngine};
pub use client::{DialConfig, DialOption, Dialer, DialerBuilder, InstanceName};
pub use connection::InstanceStream;
pub use error::{DialFailure, Error, Result};

/// User agent sent with every control-plane request
pub const USER_AGENT: &str = concat!("cloudsql-connector-rs/", env!("CARGO_PKG_VERSION"));
