//! Client-facing API
//!
//! This module handles:
//! * Instance connection names (`project:region:instance`)
//! * Dial options and their precedence
//! * The [`Dialer`] facade and its builder

mod dialer;
mod instance_name;
mod options;

pub use dialer::{Dialer, DialerBuilder, CREDENTIALS_ENV};
pub use instance_name::InstanceName;
pub use options::{DialConfig, DialOption};
