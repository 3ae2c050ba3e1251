//! Identifier types used throughout the CConnect core.
//!
//! A device id is a stable opaque string. Devices with a certificate derive
//! it from the certificate fingerprint so it survives reinstalls; devices
//! without one fall back to a random UUID minted once and persisted by the
//! caller.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Stable identifier for a peer device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Creates a new random device id (UUID v4, no dashes).
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Derives a device id from DER-encoded certificate bytes.
    ///
    /// The id is the hex form of the first 16 bytes of the SHA-256
    /// fingerprint, which keeps it the same length as the UUID form.
    #[must_use]
    pub fn from_certificate(der: &[u8]) -> Self {
        let digest = Sha256::digest(der);
        Self(hex::encode(&digest[..16]))
    }

    /// Parses a device id from a string, rejecting empty input.
    pub fn parse(s: &str) -> crate::Result<Self> {
        if s.trim().is_empty() {
            return Err(crate::Error::InvalidDeviceId("empty".into()));
        }
        Ok(Self(s.to_string()))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_distinct() {
        assert_ne!(DeviceId::random(), DeviceId::random());
    }

    #[test]
    fn certificate_derivation_is_stable() {
        let der = b"dummy certificate bytes";
        assert_eq!(DeviceId::from_certificate(der), DeviceId::from_certificate(der));
        assert_ne!(
            DeviceId::from_certificate(der),
            DeviceId::from_certificate(b"other bytes")
        );
    }

    #[test]
    fn parse_rejects_empty() {
        assert!(DeviceId::parse("").is_err());
        assert!(DeviceId::parse("  ").is_err());
        assert!(DeviceId::parse("abc123").is_ok());
    }
}
