//! Shared test utilities.

pub mod server;
