//! Client-side identity of a logical file.

use crate::client::source::ChunkSource;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{fmt, io};

/// Bytes sampled from the head of the file.
pub const SAMPLE_LEN: u64 = 1024 * 1024;
const DIGEST_HEX_LEN: usize = 16;

/// `name:size:<16 hex of sha256(first MiB)>`, opaque to the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub async fn of(source: &dyn ChunkSource) -> io::Result<Self> {
        let sample = source.read_range(0..source.size().min(SAMPLE_LEN)).await?;
        let digest = hex::encode(Sha256::digest(&sample));
        Ok(Self(format!(
            "{}:{}:{}",
            source.name(),
            source.size(),
            &digest[..DIGEST_HEX_LEN]
        )))
    }

    /// Name and size only. Two different files with equal name and size
    /// collide under this form.
    pub fn weak(name: &str, size: u64) -> Self {
        Self(format!("{}:{}", name, size))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
