//! The `utils` module provides the error type and logging setup shared across
//! the `mqbridge` library and binary.

pub mod error;
pub mod logging;
