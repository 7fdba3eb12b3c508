//! The `transport` module is responsible for the HTTP surface of the service.
//!
//! It maps HTTP requests onto [`crate::bridge::Bridge::send`] and bridge
//! outcomes onto status codes and JSON response bodies.

pub mod http;
