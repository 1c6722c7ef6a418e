//! JSON shapes shared by the HTTP and WebSocket relay.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Deserializer, Serialize};

use super::command::Opcode;
use super::frame::{checksum, Frame, CHECKSUM_SIZE, MAX_PAYLOAD};
use super::CodecError;

/// Event reported by a device or by the relay on its behalf.
///
/// Serialized untagged so that acknowledgements read as
/// `{"ack":true,"seq":N}` and device reports pass through verbatim. Only an
/// object with exactly the ack or error keys takes the typed form; anything
/// else stays a [`DeviceEvent::Report`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DeviceEvent {
    Ack { ack: bool, seq: u32 },
    Error { error: String },
    Report(serde_json::Value),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AckShape {
    ack: bool,
    seq: u32,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ErrorShape {
    error: String,
}

impl<'de> Deserialize<'de> for DeviceEvent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        if let Ok(AckShape { ack, seq }) = AckShape::deserialize(&value) {
            return Ok(DeviceEvent::Ack { ack, seq });
        }
        if let Ok(ErrorShape { error }) = ErrorShape::deserialize(&value) {
            return Ok(DeviceEvent::Error { error });
        }
        Ok(DeviceEvent::Report(value))
    }
}

impl DeviceEvent {
    /// Acknowledgement for `seq`.
    pub fn ack(seq: u32) -> Self {
        DeviceEvent::Ack { ack: true, seq }
    }

    /// Error report with the given kind.
    pub fn error(kind: impl Into<String>) -> Self {
        DeviceEvent::Error { error: kind.into() }
    }

    /// Returns the acknowledged sequence number, if this is a positive ack.
    pub fn acked_seq(&self) -> Option<u32> {
        match self {
            DeviceEvent::Ack { ack: true, seq } => Some(*seq),
            _ => None,
        }
    }

    /// Interprets a device-originated frame.
    pub fn from_frame(frame: &Frame) -> Result<Self, CodecError> {
        match frame.opcode {
            Opcode::Ack => Ok(DeviceEvent::ack(frame.seq)),
            Opcode::Event => serde_json::from_slice(&frame.payload)
                .map_err(|e| CodecError::InvalidPayload(format!("event JSON: {}", e))),
            other => Err(CodecError::InvalidPayload(format!(
                "{:?} is not a device event",
                other
            ))),
        }
    }

    /// Encodes the event as a device `Event` frame.
    pub fn to_frame(&self, seq: u32) -> Frame {
        match self {
            DeviceEvent::Ack { ack: true, seq } => Frame::ack(*seq),
            other => Frame {
                seq,
                opcode: Opcode::Event,
                payload: serde_json::to_vec(other).unwrap_or_default(),
            },
        }
    }
}

/// Frame in relay JSON form: `{"seq":N,"opcode":N,"payload":"<base64>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMessage {
    pub seq: u32,
    pub opcode: u8,
    #[serde(default)]
    pub payload: String,
    /// Optional wire checksum; validated when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<u16>,
}

impl FrameMessage {
    /// Validates the message and rebuilds the frame it describes.
    pub fn into_frame(self) -> Result<Frame, CodecError> {
        let payload = STANDARD
            .decode(self.payload.as_bytes())
            .map_err(|e| CodecError::InvalidPayload(format!("base64: {}", e)))?;
        if payload.len() > MAX_PAYLOAD {
            return Err(CodecError::InvalidPayload(format!(
                "payload of {} bytes exceeds {}",
                payload.len(),
                MAX_PAYLOAD
            )));
        }

        if let Some(expected) = self.checksum {
            let mut bytes = Vec::with_capacity(payload.len() + 7);
            bytes.extend_from_slice(&self.seq.to_le_bytes());
            bytes.push(self.opcode);
            bytes.extend_from_slice(&(payload.len() as u16).to_le_bytes());
            bytes.extend_from_slice(&payload);
            if checksum(&bytes) != expected {
                return Err(CodecError::ChecksumMismatch);
            }
        }

        let opcode = Opcode::from_byte(self.opcode)?;
        Ok(Frame {
            seq: self.seq,
            opcode,
            payload,
        })
    }
}

impl From<&Frame> for FrameMessage {
    fn from(frame: &Frame) -> Self {
        let bytes = frame.to_bytes();
        let sum_at = bytes.len() - CHECKSUM_SIZE;
        Self {
            seq: frame.seq,
            opcode: frame.opcode as u8,
            payload: STANDARD.encode(&frame.payload),
            checksum: Some(u16::from_le_bytes([bytes[sum_at], bytes[sum_at + 1]])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Color, Command};
    use serde_json::json;

    #[test]
    fn test_ack_json_shape() {
        let event = DeviceEvent::ack(12);
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"ack": true, "seq": 12})
        );
        let parsed: DeviceEvent = serde_json::from_str(r#"{"ack":true,"seq":12}"#).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_report_passes_through() {
        let raw = json!({"state": "on", "brightness": 200});
        let parsed: DeviceEvent = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(parsed, DeviceEvent::Report(raw.clone()));
        assert_eq!(serde_json::to_value(&parsed).unwrap(), raw);
    }

    #[test]
    fn test_report_with_ack_keys_is_not_narrowed() {
        let raw = json!({"ack": true, "seq": 3, "state": "on"});
        let frame = Frame {
            seq: 3,
            opcode: Opcode::Event,
            payload: serde_json::to_vec(&raw).unwrap(),
        };
        let event = DeviceEvent::from_frame(&frame).unwrap();
        assert_eq!(event.acked_seq(), None);
        assert_eq!(serde_json::to_value(&event).unwrap(), raw);

        let raw = json!({"error": "overheat", "temp": 91});
        let parsed: DeviceEvent = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(parsed, DeviceEvent::Report(raw.clone()));
        assert_eq!(serde_json::to_value(&parsed).unwrap(), raw);

        let parsed: DeviceEvent = serde_json::from_str(r#"{"error":"out_of_order"}"#).unwrap();
        assert_eq!(parsed, DeviceEvent::error("out_of_order"));
    }

    #[test]
    fn test_event_from_frames() {
        assert_eq!(
            DeviceEvent::from_frame(&Frame::ack(4)).unwrap(),
            DeviceEvent::ack(4)
        );

        let report = DeviceEvent::Report(json!({"detected": 17}));
        let frame = report.to_frame(9);
        assert_eq!(frame.opcode, Opcode::Event);
        assert_eq!(DeviceEvent::from_frame(&frame).unwrap(), report);

        let bad = Frame {
            seq: 1,
            opcode: Opcode::Event,
            payload: b"{not json".to_vec(),
        };
        assert!(matches!(
            DeviceEvent::from_frame(&bad),
            Err(CodecError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_frame_message_roundtrip() {
        let frame = Frame::from_command(
            5,
            &Command::SetPixel {
                index: 5,
                color: Color::new(255, 0, 0),
            },
        );
        let message = FrameMessage::from(&frame);
        assert_eq!(message.opcode, 0x01);
        assert_eq!(message.payload, STANDARD.encode([5u8, 255, 0, 0]));
        assert_eq!(message.into_frame().unwrap(), frame);
    }

    #[test]
    fn test_frame_message_validation() {
        let message = FrameMessage {
            seq: 1,
            opcode: 0x03,
            payload: STANDARD.encode([1u8, 2, 3]),
            checksum: Some(0),
        };
        assert_eq!(message.into_frame().unwrap_err(), CodecError::ChecksumMismatch);

        let message = FrameMessage {
            seq: 1,
            opcode: 0x55,
            payload: String::new(),
            checksum: None,
        };
        assert_eq!(message.into_frame().unwrap_err(), CodecError::UnknownOpcode(0x55));

        let message = FrameMessage {
            seq: 1,
            opcode: 0x03,
            payload: "***".to_string(),
            checksum: None,
        };
        assert!(matches!(
            message.into_frame(),
            Err(CodecError::InvalidPayload(_))
        ));
    }
}
