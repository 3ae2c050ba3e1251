//! The network packet — the typed message unit exchanged over a link.
//!
//! Wire form is one JSON object per line: `id`, `type`, `body`, and for
//! packets carrying a binary payload, `payloadSize` plus transport hints in
//! `payloadTransferInfo`. Field names are contract with peer implementations
//! and body values must round-trip byte-for-byte; the body is structurally
//! untyped at this layer and only the `type` string is ever matched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicI64, Ordering};

/// Packet type used for the identity exchange during the link handshake.
pub const PACKET_TYPE_IDENTITY: &str = "cconnect.identity";

/// Packet type used for pairing requests and responses.
pub const PACKET_TYPE_PAIR: &str = "cconnect.pair";

/// Untyped packet body: a JSON object owned by the producing plugin.
pub type PacketBody = Map<String, Value>;

/// Process-wide monotonic packet id counter.
static NEXT_PACKET_ID: AtomicI64 = AtomicI64::new(1);

/// Metadata for a binary payload transferred out-of-band with a packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PayloadInfo {
    /// Total payload size in bytes.
    pub size: u64,
    /// Transport hints for the receiver (e.g. the port a payload stream
    /// listens on). Opaque to this layer.
    pub transfer_info: Map<String, Value>,
}

impl PayloadInfo {
    /// Creates payload metadata with the given size and no transport hints.
    pub fn new(size: u64) -> Self {
        Self {
            size,
            transfer_info: Map::new(),
        }
    }
}

/// A typed message unit. Immutable after construction; the only sanctioned
/// mutation is [`Packet::attach_payload`], which registers payload metadata
/// before the packet is handed to a link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Sender-assigned monotonic id. Not globally unique.
    id: i64,

    /// Opaque namespaced type string, matched verbatim by the router.
    #[serde(rename = "type")]
    packet_type: String,

    /// Untyped body; plugins own interpretation.
    body: PacketBody,

    #[serde(
        rename = "payloadSize",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    payload_size: Option<u64>,

    #[serde(
        rename = "payloadTransferInfo",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    payload_transfer_info: Option<Map<String, Value>>,

    /// Received payload bytes, populated by the link layer on delivery.
    /// Never part of the JSON wire form; the payload travels out-of-band.
    #[serde(skip)]
    payload_data: Option<std::sync::Arc<Vec<u8>>>,
}

impl Packet {
    /// Creates a packet with the next process-wide monotonic id.
    pub fn new(packet_type: impl Into<String>, body: PacketBody) -> Self {
        Self {
            id: NEXT_PACKET_ID.fetch_add(1, Ordering::Relaxed),
            packet_type: packet_type.into(),
            body,
            payload_size: None,
            payload_transfer_info: None,
            payload_data: None,
        }
    }

    /// Creates a packet with an explicit id (used when re-materializing a
    /// packet received from a peer).
    pub fn with_id(id: i64, packet_type: impl Into<String>, body: PacketBody) -> Self {
        Self {
            id,
            packet_type: packet_type.into(),
            body,
            payload_size: None,
            payload_transfer_info: None,
            payload_data: None,
        }
    }

    /// Registers payload metadata on this packet.
    ///
    /// This is the explicit registration point for payload bookkeeping; the
    /// payload bytes themselves travel through the link's payload channel,
    /// not through the JSON wire form.
    pub fn attach_payload(&mut self, info: PayloadInfo) {
        self.payload_size = Some(info.size);
        self.payload_transfer_info = if info.transfer_info.is_empty() {
            None
        } else {
            Some(info.transfer_info)
        };
    }

    /// The sender-assigned packet id.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// The packet type string.
    pub fn packet_type(&self) -> &str {
        &self.packet_type
    }

    /// The untyped body.
    pub fn body(&self) -> &PacketBody {
        &self.body
    }

    /// Whether a binary payload accompanies this packet.
    pub fn has_payload(&self) -> bool {
        self.payload_size.is_some()
    }

    /// The payload size in bytes, if a payload is attached.
    pub fn payload_size(&self) -> Option<u64> {
        self.payload_size
    }

    /// The attached payload metadata, if any.
    pub fn payload(&self) -> Option<PayloadInfo> {
        self.payload_size.map(|size| PayloadInfo {
            size,
            transfer_info: self.payload_transfer_info.clone().unwrap_or_default(),
        })
    }

    /// Registers received payload bytes on a delivered packet. Called by
    /// the link layer; plugins read them back via [`Packet::payload_bytes`].
    pub fn attach_payload_bytes(&mut self, bytes: std::sync::Arc<Vec<u8>>) {
        if self.payload_size.is_none() {
            self.payload_size = Some(bytes.len() as u64);
        }
        self.payload_data = Some(bytes);
    }

    /// Received payload bytes, present on delivered packets whose sender
    /// attached a payload.
    pub fn payload_bytes(&self) -> Option<&[u8]> {
        self.payload_data.as_deref().map(Vec::as_slice)
    }

    /// Convenience accessor for a boolean body field.
    pub fn body_bool(&self, key: &str) -> Option<bool> {
        self.body.get(key).and_then(Value::as_bool)
    }

    /// Convenience accessor for a string body field.
    pub fn body_str(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    /// Whether this is a pairing-protocol packet (exempt from pairing-state
    /// gating).
    pub fn is_pair(&self) -> bool {
        self.packet_type == PACKET_TYPE_PAIR
    }

    /// Serializes to the newline-delimited wire form.
    pub fn to_wire(&self) -> crate::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parses a packet from one wire line.
    pub fn from_wire(line: &str) -> crate::Result<Self> {
        let packet: Self = serde_json::from_str(line)?;
        if packet.packet_type.is_empty() {
            return Err(crate::Error::MalformedPacket("empty type field".into()));
        }
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn body(v: Value) -> PacketBody {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn ids_are_monotonic() {
        let a = Packet::new("cconnect.ping", PacketBody::new());
        let b = Packet::new("cconnect.ping", PacketBody::new());
        assert!(b.id() > a.id());
    }

    #[test]
    fn attach_payload_is_explicit() {
        let mut packet = Packet::new("cconnect.share", body(json!({"filename": "a.txt"})));
        assert!(!packet.has_payload());

        packet.attach_payload(PayloadInfo::new(4096));
        assert!(packet.has_payload());
        assert_eq!(packet.payload_size(), Some(4096));
    }

    #[test]
    fn wire_round_trip_preserves_body() {
        let original = Packet::new(
            "cconnect.ping",
            body(json!({
                "message": "hello",
                "count": 3,
                "nested": {"flag": true, "values": [1, 2.5, "x"]}
            })),
        );

        let line = original.to_wire().unwrap();
        let parsed = Packet::from_wire(&line).unwrap();

        assert_eq!(parsed.packet_type(), "cconnect.ping");
        assert_eq!(parsed.body(), original.body());
        assert_eq!(parsed.id(), original.id());
    }

    #[test]
    fn wire_form_omits_payload_fields_when_absent() {
        let packet = Packet::new("cconnect.ping", PacketBody::new());
        let line = packet.to_wire().unwrap();
        assert!(!line.contains("payloadSize"));
        assert!(!line.contains("payloadTransferInfo"));
    }

    #[test]
    fn from_wire_rejects_empty_type() {
        let err = Packet::from_wire(r#"{"id":1,"type":"","body":{}}"#);
        assert!(err.is_err());
    }
}
