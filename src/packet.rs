//! Network packet
//!
//! This module implements the core packet structure for the peerlink
//! protocol. Packets are JSON-formatted messages with a newline terminator.
//!
//! ## Packet Structure
//!
//! Each packet contains:
//! - `id`: UNIX epoch timestamp in milliseconds
//! - `type`: Packet type in format `peerlink.<area>[.<action>]`
//! - `body`: JSON dictionary of type-specific parameters
//! - `payloadSize`: (optional) Size of payload data in bytes
//! - `payloadTransferInfo`: (optional) Transfer negotiation parameters

use crate::{ProtocolError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// Represents a peerlink network packet
///
/// # Examples
///
/// ```
/// use peerlink::Packet;
/// use serde_json::json;
///
/// let packet = Packet::new(
///     "peerlink.identity",
///     json!({
///         "deviceId": "my-device-id",
///         "deviceName": "My Computer",
///         "protocolVersion": 7,
///         "deviceType": "desktop"
///     })
/// );
///
/// let bytes = packet.to_bytes().unwrap();
/// let parsed = Packet::from_bytes(&bytes).unwrap();
/// assert_eq!(parsed.packet_type, "peerlink.identity");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Packet {
    /// UNIX timestamp in milliseconds
    /// Note: Some clients may send this as a string
    #[serde(deserialize_with = "deserialize_id", serialize_with = "serialize_id")]
    pub id: i64,

    /// Packet type in format: peerlink.<area>[.<action>]
    ///
    /// Examples: "peerlink.pair", "peerlink.ping"
    #[serde(rename = "type")]
    pub packet_type: String,

    /// Type-specific parameters
    #[serde(default)]
    pub body: Value,

    /// Optional payload size in bytes
    #[serde(rename = "payloadSize", skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<i64>,

    /// Optional payload transfer negotiation info
    #[serde(
        rename = "payloadTransferInfo",
        skip_serializing_if = "Option::is_none"
    )]
    pub payload_transfer_info: Option<HashMap<String, Value>>,
}

impl Packet {
    /// Creates a new packet with the specified type and body
    ///
    /// The packet ID is automatically set from a monotonic millisecond clock.
    ///
    /// # Examples
    ///
    /// ```
    /// use peerlink::Packet;
    /// use serde_json::json;
    ///
    /// let packet = Packet::new("peerlink.ping", json!({}));
    /// ```
    pub fn new(packet_type: impl Into<String>, body: Value) -> Self {
        Self {
            id: current_timestamp(),
            packet_type: packet_type.into(),
            body,
            payload_size: None,
            payload_transfer_info: None,
        }
    }

    /// Create a new packet with an explicit timestamp
    ///
    /// Useful for testing or when you need specific timestamp control
    pub fn with_id(id: i64, packet_type: impl Into<String>, body: Value) -> Self {
        Self {
            id,
            packet_type: packet_type.into(),
            body,
            payload_size: None,
            payload_transfer_info: None,
        }
    }

    /// Serialize packet to bytes with newline terminator
    ///
    /// Packets are JSON-formatted and terminated with a single newline
    /// character (`\n`) so they can be delimited on TCP streams.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Json` if serialization fails
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_string(self)?;
        let mut bytes = json.into_bytes();
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Deserialize a packet from bytes
    ///
    /// Accepts both newline-terminated and non-terminated JSON.
    /// Some implementations may send `\r\n` (CRLF) or `\n` (LF) terminators.
    /// Unknown fields are ignored for forward compatibility.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::MalformedPacket` if the data is not valid
    /// JSON or doesn't conform to the packet structure.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let trimmed = data
            .strip_suffix(b"\r\n")
            .or_else(|| data.strip_suffix(b"\n"))
            .unwrap_or(data);

        serde_json::from_slice(trimmed).map_err(|e| {
            ProtocolError::MalformedPacket(format!("Failed to deserialize packet: {}", e))
        })
    }

    /// Builder pattern: Set payload size
    pub fn with_payload_size(mut self, size: i64) -> Self {
        self.payload_size = Some(size);
        self
    }

    /// Builder pattern: Set payload transfer info
    pub fn with_payload_transfer_info(mut self, info: HashMap<String, Value>) -> Self {
        self.payload_transfer_info = Some(info);
        self
    }

    /// Builder pattern: Add a key-value pair to the body
    pub fn with_body_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if let Value::Object(ref mut map) = self.body {
            map.insert(key.into(), value.into());
        }
        self
    }

    /// Check if packet is of a specific type
    pub fn is_type(&self, packet_type: &str) -> bool {
        self.packet_type == packet_type
    }

    /// Check if this packet announces an out-of-band payload
    pub fn has_payload(&self) -> bool {
        matches!(self.payload_size, Some(size) if size != 0)
    }

    /// Get a field from the body as a specific type
    pub fn get_body_field<T>(&self, key: &str) -> Option<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.body
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Merge a newer packet into this one for send-queue replacement
    ///
    /// For each body field of `newer`: if both sides hold numbers the values
    /// are summed, otherwise the newer value overwrites the older one. The
    /// id and payload fields are taken from the newer packet. Summing keeps
    /// accumulated deltas (pointer movement, scroll distance) intact when a
    /// queued packet is superseded before it was flushed.
    pub fn merge_for_replace(&mut self, newer: Packet) {
        self.id = newer.id;
        self.payload_size = newer.payload_size;
        self.payload_transfer_info = newer.payload_transfer_info;

        let Value::Object(new_map) = newer.body else {
            self.body = newer.body;
            return;
        };

        if !self.body.is_object() {
            self.body = Value::Object(new_map);
            return;
        }

        if let Value::Object(ref mut map) = self.body {
            for (key, new_value) in new_map {
                let merged = match (map.get(&key), &new_value) {
                    (Some(Value::Number(old)), Value::Number(new)) => {
                        sum_numbers(old, new).unwrap_or_else(|| new_value.clone())
                    }
                    _ => new_value,
                };
                map.insert(key, merged);
            }
        }
    }
}

/// Add two JSON numbers, preferring integer arithmetic when both sides are
/// integral
fn sum_numbers(a: &serde_json::Number, b: &serde_json::Number) -> Option<Value> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return Some(Value::from(x.wrapping_add(y)));
    }
    let (x, y) = (a.as_f64()?, b.as_f64()?);
    serde_json::Number::from_f64(x + y).map(Value::Number)
}

/// Custom deserializer for the `id` field to handle both string and number formats
fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let value: Value = Deserialize::deserialize(deserializer)?;
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| Error::custom("Invalid number for id")),
        Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| Error::custom("Invalid string for id")),
        _ => Err(Error::custom("id must be a number or string")),
    }
}

/// Custom serializer for the `id` field - always serialize as a number
fn serialize_id<S>(id: &i64, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_i64(*id)
}

/// Generate the current packet id: UNIX milliseconds, never decreasing
///
/// Ids double as ordering hints, so the clock must not run backwards even if
/// the OS clock is stepped.
pub fn current_timestamp() -> i64 {
    static LAST: AtomicI64 = AtomicI64::new(0);

    let now = Utc::now().timestamp_millis();
    LAST.fetch_max(now, Ordering::Relaxed);
    LAST.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_packet() {
        let packet = Packet::new("peerlink.ping", json!({}));
        assert_eq!(packet.packet_type, "peerlink.ping");
        assert!(packet.body.is_object());
        assert!(packet.id > 0);
    }

    #[test]
    fn test_packet_serialization() {
        let packet = Packet::new(
            "peerlink.identity",
            json!({
                "deviceId": "test-device",
                "deviceName": "Test Device",
                "protocolVersion": 7
            }),
        );

        let bytes = packet.to_bytes().unwrap();
        let json_str = String::from_utf8_lossy(&bytes);

        assert!(json_str.ends_with('\n'));

        let json_part = json_str.trim_end();
        assert!(serde_json::from_str::<Value>(json_part).is_ok());
    }

    #[test]
    fn test_packet_deserialization() {
        let json_data = r#"{"id":1234567890,"type":"peerlink.ping","body":{}}"#;
        let packet = Packet::from_bytes(json_data.as_bytes()).unwrap();

        assert_eq!(packet.id, 1234567890);
        assert_eq!(packet.packet_type, "peerlink.ping");
        assert!(packet.body.is_object());
    }

    #[test]
    fn test_packet_deserialization_with_newline() {
        let json_data = r#"{"id":1234567890,"type":"peerlink.ping","body":{}}"#.to_string() + "\n";
        let packet = Packet::from_bytes(json_data.as_bytes()).unwrap();

        assert_eq!(packet.id, 1234567890);
        assert_eq!(packet.packet_type, "peerlink.ping");
    }

    #[test]
    fn test_packet_deserialization_with_crlf() {
        let json_data =
            r#"{"id":1234567890,"type":"peerlink.ping","body":{}}"#.to_string() + "\r\n";
        let packet = Packet::from_bytes(json_data.as_bytes()).unwrap();

        assert_eq!(packet.id, 1234567890);
        assert_eq!(packet.packet_type, "peerlink.ping");
    }

    #[test]
    fn test_roundtrip() {
        let original = Packet::new(
            "peerlink.battery",
            json!({
                "isCharging": true,
                "currentCharge": 85,
                "thresholdEvent": 0
            }),
        );

        let bytes = original.to_bytes().unwrap();
        let parsed = Packet::from_bytes(&bytes).unwrap();

        assert_eq!(original.packet_type, parsed.packet_type);
        assert_eq!(original.body, parsed.body);
    }

    #[test]
    fn test_id_as_string() {
        // Some clients send id as string
        let json_data = r#"{"id":"1234567890","type":"peerlink.ping","body":{}}"#;
        let packet = Packet::from_bytes(json_data.as_bytes()).unwrap();

        assert_eq!(packet.id, 1234567890);
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let json_data =
            r#"{"id":1,"type":"peerlink.ping","body":{"extra":1},"futureField":true}"#;
        let packet = Packet::from_bytes(json_data.as_bytes()).unwrap();

        assert_eq!(packet.packet_type, "peerlink.ping");
        assert_eq!(packet.get_body_field::<i64>("extra"), Some(1));
    }

    #[test]
    fn test_with_payload_size() {
        let packet = Packet::new("peerlink.share", json!({})).with_payload_size(1024);

        assert_eq!(packet.payload_size, Some(1024));
        assert!(packet.has_payload());
        assert!(!Packet::new("peerlink.ping", json!({})).has_payload());
    }

    #[test]
    fn test_with_payload_transfer_info() {
        let mut info = HashMap::new();
        info.insert("port".to_string(), json!(1739));

        let packet = Packet::new("peerlink.share", json!({})).with_payload_transfer_info(info);

        assert!(packet.payload_transfer_info.is_some());
        let port = packet
            .payload_transfer_info
            .as_ref()
            .and_then(|i| i.get("port"))
            .and_then(|v| v.as_i64());
        assert_eq!(port, Some(1739));
    }

    #[test]
    fn test_builder_pattern() {
        let packet = Packet::new("peerlink.identity", json!({}))
            .with_body_field("deviceId", "test-device")
            .with_body_field("deviceName", "Test Device")
            .with_body_field("protocolVersion", 7);

        assert_eq!(
            packet.get_body_field::<String>("deviceId"),
            Some("test-device".to_string())
        );
        assert_eq!(packet.get_body_field::<i64>("protocolVersion"), Some(7));
    }

    #[test]
    fn test_is_type() {
        let packet = Packet::new("peerlink.ping", json!({}));
        assert!(packet.is_type("peerlink.ping"));
        assert!(!packet.is_type("peerlink.battery"));
    }

    #[test]
    fn test_get_body_field() {
        let packet = Packet::new(
            "peerlink.battery",
            json!({
                "isCharging": true,
                "currentCharge": 85
            }),
        );

        assert_eq!(packet.get_body_field::<bool>("isCharging"), Some(true));
        assert_eq!(packet.get_body_field::<i64>("currentCharge"), Some(85));
        assert_eq!(packet.get_body_field::<String>("nonexistent"), None);
    }

    #[test]
    fn test_invalid_packet() {
        let invalid_json = b"not json data";
        let result = Packet::from_bytes(invalid_json);
        assert!(matches!(result, Err(ProtocolError::MalformedPacket(_))));
    }

    #[test]
    fn test_timestamp_monotonic() {
        let a = current_timestamp();
        let b = current_timestamp();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[test]
    fn test_merge_sums_numeric_fields() {
        let mut older = Packet::with_id(
            1,
            "peerlink.mousepad.request",
            json!({"dx": 3.0, "dy": -1.0, "source": "trackpad"}),
        );
        let newer = Packet::with_id(
            2,
            "peerlink.mousepad.request",
            json!({"dx": 2.0, "dy": 5.0, "source": "mouse"}),
        );

        older.merge_for_replace(newer);

        assert_eq!(older.id, 2);
        assert_eq!(older.get_body_field::<f64>("dx"), Some(5.0));
        assert_eq!(older.get_body_field::<f64>("dy"), Some(4.0));
        assert_eq!(
            older.get_body_field::<String>("source"),
            Some("mouse".to_string())
        );
    }

    #[test]
    fn test_merge_integer_fields() {
        let mut older = Packet::with_id(1, "peerlink.scroll", json!({"ticks": 4}));
        let newer = Packet::with_id(2, "peerlink.scroll", json!({"ticks": 3, "axis": "y"}));

        older.merge_for_replace(newer);

        assert_eq!(older.get_body_field::<i64>("ticks"), Some(7));
        assert_eq!(older.get_body_field::<String>("axis"), Some("y".to_string()));
    }

    #[test]
    fn test_merge_overwrites_non_numeric() {
        let mut older = Packet::with_id(1, "peerlink.clipboard", json!({"content": "old"}));
        let newer = Packet::with_id(2, "peerlink.clipboard", json!({"content": "new"}));

        older.merge_for_replace(newer);

        assert_eq!(
            older.get_body_field::<String>("content"),
            Some("new".to_string())
        );
    }
}
