//! Upload client: resume resolution and the chunk scheduler.

pub mod api;
pub mod error;
pub mod fingerprint;
pub mod progress;
pub mod resume;
pub mod scheduler;
pub mod source;
pub mod state;

#[cfg(test)]
pub(crate) mod test_support;
