//! A deterministic content-addressable key for a job's computation (C3
//! "Fingerprint"): a hash over function name, version, container image, and
//! a normalised argument serialisation where every upstream job reference
//! has already been replaced by *its* fingerprint.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::value::Value;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Computes the fingerprint. `resolved_args` must already have every
    /// [`Value::JobRef`](crate::value::Value::JobRef) replaced by a
    /// `Value::Str` of the upstream fingerprint's hex digest — the caller
    /// (job manager, C3's `resolve_inputs` sibling) is responsible for
    /// that substitution, since only it knows which upstream jobs have
    /// finished and what their fingerprints are.
    pub fn compute(
        function_name: &str,
        function_version: &str,
        container: Option<&str>,
        resolved_args: &Value,
    ) -> anyhow::Result<Self> {
        let mut hasher = Sha256::new();
        hasher.update(b"jobrelay-fingerprint-v1\0");
        hasher.update(function_name.as_bytes());
        hasher.update(b"\0");
        hasher.update(function_version.as_bytes());
        hasher.update(b"\0");
        hasher.update(container.unwrap_or("").as_bytes());
        hasher.update(b"\0");
        let canonical = serde_json::to_vec(resolved_args)?;
        hasher.update(&canonical);
        Ok(Self(hasher.finalize().into()))
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("fingerprint must be 32 bytes"))?;
        Ok(Self(arr))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..12])
    }
}
