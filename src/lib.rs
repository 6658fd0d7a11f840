//! Voice Ferry Core - a SIP back-to-back user agent
//!
//! Bridges an inbound dialog to a routed, outbound dialog, negotiating
//! media through RTPEngine and enforcing per-user session limits.

pub mod config;
pub mod core;
pub mod error;
pub mod protocols;
pub mod services;
pub mod utils;

pub use error::{Error, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");