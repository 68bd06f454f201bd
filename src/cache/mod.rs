//! Connection info cache and refresh engine
//!
//! This module handles:
//! * Connection info bundles (addresses, trust material, client certificate)
//! * One refresh against the control-plane, bounded by a timeout
//! * Per-instance caching with single-flight refreshes
//! * Background refresh scheduling ahead of certificate expiry
//! * Refresh rate limiting

mod info;
mod instance;
mod rate_limiter;
mod refresh;

pub use info::{ConnectionInfo, DatabaseEngine};
pub use instance::{InstanceCache, RefreshState};
pub use rate_limiter::RateLimit;
pub use refresh::{refresh_delay, Refresher, DEFAULT_REFRESH_TIMEOUT};
