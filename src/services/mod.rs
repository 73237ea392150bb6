//! Server-side upload engine.

pub mod archive;
pub mod chunk_store;
pub mod error;
pub mod finalizer;
pub mod layout;
pub mod registry;
pub mod sweeper;
pub mod upload_service;

#[cfg(test)]
pub(crate) mod test_support;
