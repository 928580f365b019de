//! Content digests used to detect which parts of a reloaded configuration
//! actually changed.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::{
    config::{PassageConfig, ServerConfig},
    error::PassageResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Digest of the fields that define how a server is reached.
    ///
    /// Passage entries are left out: editing a passage must not force the
    /// shared connection to be rebuilt.
    pub fn server(config: &ServerConfig) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(config.address.as_bytes());
        hasher.update([0]);
        hasher.update(config.retries().to_be_bytes());
        hasher.update(config.timeout().as_millis().to_be_bytes());
        hasher.update(config.user.as_bytes());
        hasher.update([0]);
        if let Some(key) = &config.key {
            hasher.update(key.as_bytes());
        }
        Self(hasher.finalize().into())
    }

    /// Digest of a passage entry combined with its server's fingerprint, so a
    /// server change cascades to every passage on it.
    pub fn passage(config: &PassageConfig, server: &Fingerprint) -> PassageResult<Self> {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(config)?);
        hasher.update(server.0);
        Ok(Self(hasher.finalize().into()))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
