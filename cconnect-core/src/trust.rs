//! Certificate trust bookkeeping.
//!
//! Only the protocol role of certificates lives here: fingerprints are
//! recorded when a device pairs, checked on every handshake, and dropped on
//! unpair. Validation is trust-on-first-use; a recorded fingerprint must
//! match exactly on later handshakes.

use crate::error::HandshakeFailure;
use cconnect_types::DeviceId;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{info, warn};

/// Computes the hex SHA-256 fingerprint of DER-encoded certificate bytes.
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Maps device ids to trusted certificate fingerprints.
#[derive(Debug, Default)]
pub struct TrustStore {
    entries: RwLock<HashMap<DeviceId, String>>,
}

impl TrustStore {
    /// Creates an empty trust store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates a peer's certificate against the recorded fingerprint.
    ///
    /// Unknown devices are trusted on first use and their fingerprint
    /// recorded. A recorded fingerprint that does not match, or a recorded
    /// fingerprint with no certificate presented, rejects the handshake.
    pub fn validate(
        &self,
        device_id: &DeviceId,
        presented: Option<&str>,
    ) -> Result<(), HandshakeFailure> {
        let mut entries = self.entries.write().unwrap();
        match (entries.get(device_id), presented) {
            (Some(recorded), Some(presented)) if recorded == presented => Ok(()),
            (Some(_), Some(_)) => {
                warn!(device = %device_id, "certificate fingerprint mismatch");
                Err(HandshakeFailure::CertificateRejected(format!(
                    "fingerprint mismatch for device {device_id}"
                )))
            }
            (Some(_), None) => Err(HandshakeFailure::CertificateRejected(format!(
                "device {device_id} presented no certificate but one is recorded"
            ))),
            (None, Some(presented)) => {
                info!(device = %device_id, "trusting certificate on first use");
                entries.insert(device_id.clone(), presented.to_string());
                Ok(())
            }
            // No certificate on either side: nothing to check at this layer.
            (None, None) => Ok(()),
        }
    }

    /// Records a fingerprint, replacing any previous one. Called when
    /// pairing completes.
    pub fn record(&self, device_id: DeviceId, fingerprint: String) {
        self.entries.write().unwrap().insert(device_id, fingerprint);
    }

    /// Drops the recorded fingerprint for a device. Called on unpair and on
    /// certificate mismatch.
    pub fn forget(&self, device_id: &DeviceId) {
        self.entries.write().unwrap().remove(device_id);
    }

    /// The recorded fingerprint for a device, if any.
    pub fn fingerprint_of(&self, device_id: &DeviceId) -> Option<String> {
        self.entries.read().unwrap().get(device_id).cloned()
    }

    /// Whether a fingerprint is recorded for this device.
    pub fn is_trusted(&self, device_id: &DeviceId) -> bool {
        self.entries.read().unwrap().contains_key(device_id)
    }
}
