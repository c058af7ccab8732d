//! Common utilities for docrelay
//!
//! This crate provides the error type and the console logger shared by the
//! store layer and the binary.

pub mod error;
pub mod logging;

pub use error::{DocRelayError, Result};
pub use logging::{ConsoleFormat, LogLevel};
