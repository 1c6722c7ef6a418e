//! LED command set and RGB color type.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::CodecError;

/// 24-bit RGB color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "[u8; 3]", into = "[u8; 3]")]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const BLACK: Color = Color::new(0, 0, 0);
    pub const RED: Color = Color::new(255, 0, 0);
    pub const GREEN: Color = Color::new(0, 255, 0);
    pub const BLUE: Color = Color::new(0, 0, 255);
    pub const WHITE: Color = Color::new(255, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    fn bytes(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }
}

impl From<[u8; 3]> for Color {
    fn from([r, g, b]: [u8; 3]) -> Self {
        Self { r, g, b }
    }
}

impl From<Color> for [u8; 3] {
    fn from(color: Color) -> Self {
        color.bytes()
    }
}

impl FromStr for Color {
    type Err = String;

    /// Accepts `#RRGGBB`, `RRGGBB` or `r,g,b`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.contains(',') {
            let parts: Vec<&str> = s.split(',').map(str::trim).collect();
            if parts.len() != 3 {
                return Err(format!("expected r,g,b but got '{}'", s));
            }
            let mut channels = [0u8; 3];
            for (slot, part) in channels.iter_mut().zip(&parts) {
                *slot = part
                    .parse()
                    .map_err(|_| format!("invalid color channel '{}'", part))?;
            }
            return Ok(Color::from(channels));
        }

        let hex = s.trim_start_matches('#');
        if hex.len() != 6 {
            return Err(format!("invalid hex color '{}'", s));
        }
        let value = u32::from_str_radix(hex, 16).map_err(|_| format!("invalid hex color '{}'", s))?;
        Ok(Color::new(
            ((value >> 16) & 0xFF) as u8,
            ((value >> 8) & 0xFF) as u8,
            (value & 0xFF) as u8,
        ))
    }
}

impl std::fmt::Display for Color {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

/// Wire opcodes.
///
/// `0x01..=0x06` travel host to device, `0x80` and above device to host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    SetPixel = 0x01,
    SetRange = 0x02,
    Fill = 0x03,
    Clear = 0x04,
    SetBrightness = 0x05,
    Ping = 0x06,
    /// Device acknowledgement of the frame with the same sequence number.
    Ack = 0x80,
    /// Device report carrying a JSON document.
    Event = 0x81,
}

impl Opcode {
    /// Converts a byte value to an opcode.
    pub fn from_byte(value: u8) -> Result<Self, CodecError> {
        match value {
            0x01 => Ok(Opcode::SetPixel),
            0x02 => Ok(Opcode::SetRange),
            0x03 => Ok(Opcode::Fill),
            0x04 => Ok(Opcode::Clear),
            0x05 => Ok(Opcode::SetBrightness),
            0x06 => Ok(Opcode::Ping),
            0x80 => Ok(Opcode::Ack),
            0x81 => Ok(Opcode::Event),
            other => Err(CodecError::UnknownOpcode(other)),
        }
    }

    /// Returns true for opcodes that carry a host command.
    pub fn is_command(self) -> bool {
        (self as u8) < 0x80
    }
}

/// LED command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    SetPixel { index: u8, color: Color },
    /// Inclusive range `start..=end`.
    SetRange { start: u8, end: u8, color: Color },
    Fill { color: Color },
    Clear,
    SetBrightness { level: u8 },
    Ping,
}

impl Command {
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::SetPixel { .. } => Opcode::SetPixel,
            Command::SetRange { .. } => Opcode::SetRange,
            Command::Fill { .. } => Opcode::Fill,
            Command::Clear => Opcode::Clear,
            Command::SetBrightness { .. } => Opcode::SetBrightness,
            Command::Ping => Opcode::Ping,
        }
    }

    /// Encodes the command arguments into the frame payload layout.
    pub fn payload(&self) -> Vec<u8> {
        match *self {
            Command::SetPixel { index, color } => vec![index, color.r, color.g, color.b],
            Command::SetRange { start, end, color } => {
                vec![start, end, color.r, color.g, color.b]
            }
            Command::Fill { color } => color.bytes().to_vec(),
            Command::Clear | Command::Ping => Vec::new(),
            Command::SetBrightness { level } => vec![level],
        }
    }

    /// Rebuilds a command from its opcode and payload.
    pub fn from_parts(opcode: Opcode, payload: &[u8]) -> Result<Self, CodecError> {
        let expected = match opcode {
            Opcode::SetPixel => 4,
            Opcode::SetRange => 5,
            Opcode::Fill => 3,
            Opcode::Clear | Opcode::Ping => 0,
            Opcode::SetBrightness => 1,
            Opcode::Ack | Opcode::Event => {
                return Err(CodecError::InvalidPayload(format!(
                    "opcode {:#04X} is not a command",
                    opcode as u8
                )))
            }
        };
        if payload.len() != expected {
            return Err(CodecError::InvalidPayload(format!(
                "{:?} expects {} payload bytes, got {}",
                opcode,
                expected,
                payload.len()
            )));
        }

        let command = match opcode {
            Opcode::SetPixel => Command::SetPixel {
                index: payload[0],
                color: Color::new(payload[1], payload[2], payload[3]),
            },
            Opcode::SetRange => {
                let (start, end) = (payload[0], payload[1]);
                if start > end {
                    return Err(CodecError::InvalidPayload(format!(
                        "range start {} is past end {}",
                        start, end
                    )));
                }
                Command::SetRange {
                    start,
                    end,
                    color: Color::new(payload[2], payload[3], payload[4]),
                }
            }
            Opcode::Fill => Command::Fill {
                color: Color::new(payload[0], payload[1], payload[2]),
            },
            Opcode::Clear => Command::Clear,
            Opcode::SetBrightness => Command::SetBrightness { level: payload[0] },
            Opcode::Ping => Command::Ping,
            Opcode::Ack | Opcode::Event => unreachable!("rejected above"),
        };
        Ok(command)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::SetPixel { index, color } => write!(f, "pixel {} {}", index, color),
            Command::SetRange { start, end, color } => {
                write!(f, "range {}..={} {}", start, end, color)
            }
            Command::Fill { color } => write!(f, "fill {}", color),
            Command::Clear => write!(f, "clear"),
            Command::SetBrightness { level } => write!(f, "brightness {}", level),
            Command::Ping => write!(f, "ping"),
        }
    }
}
