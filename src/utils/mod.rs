//! Small cross-cutting helpers shared by the binary and library crates.

pub mod logger;

pub use logger::setup_logging;
