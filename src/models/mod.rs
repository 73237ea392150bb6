//! Core data models for the chunked upload service.
//!
//! These entities describe uploads and the chunk facts recorded against them.
//! They map cleanly to database tables via `sqlx::FromRow` and serialize
//! naturally as JSON via `serde`.

pub mod chunk;
pub mod upload;
