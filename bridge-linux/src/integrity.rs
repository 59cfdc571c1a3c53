//! Integrity: SHA-256 over whole resources, computed incrementally as chunks pass.

use sha2::{Digest, Sha256};

/// Running digest over a resource's chunks.
#[derive(Default)]
pub struct ResourceHasher {
    hasher: Sha256,
    len: u64,
}

impl ResourceHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.len += chunk.len() as u64;
    }

    /// Bytes hashed so far.
    pub fn bytes_hashed(&self) -> u64 {
        self.len
    }

    pub fn finalize(self) -> [u8; 32] {
        self.hasher.finalize().into()
    }

    /// Compare against the digest the sender announced.
    pub fn verify(self, expected: &[u8; 32]) -> bool {
        self.finalize() == *expected
    }
}

/// Hash a whole payload. Returns 32-byte digest.
#[cfg(test)]
pub fn hash_bytes(payload: &[u8]) -> [u8; 32] {
    let mut hasher = ResourceHasher::new();
    hasher.update(payload);
    hasher.finalize()
}
