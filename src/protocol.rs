//! GATT UUIDs, command frames, and control-channel helpers for Muse headbands.
//!
//! All vendor UUIDs belong to the Muse namespace
//! `273eXXXX-4c4d-454d-96be-f03bac821358`.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::error::EncodeError;

// ── Service ──────────────────────────────────────────────────────────────────

/// Primary GATT service advertised by Muse headbands.
///
/// Discovery is considered successful only when this service is present.
pub const MUSE_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fe8d_0000_1000_8000_00805f9b34fb);

// ── Characteristics ───────────────────────────────────────────────────────────

/// Bidirectional control channel.
///
/// The host writes the framed commands produced by [`encode_command`]; the
/// headband answers with length-prefixed JSON fragments (see [`decode_response`]).
pub const CONTROL_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x273e0001_4c4d_454d_96be_f03bac821358);

pub const TP9_CHARACTERISTIC: Uuid = Uuid::from_u128(0x273e0003_4c4d_454d_96be_f03bac821358);
pub const AF7_CHARACTERISTIC: Uuid = Uuid::from_u128(0x273e0004_4c4d_454d_96be_f03bac821358);
pub const AF8_CHARACTERISTIC: Uuid = Uuid::from_u128(0x273e0005_4c4d_454d_96be_f03bac821358);
pub const TP10_CHARACTERISTIC: Uuid = Uuid::from_u128(0x273e0006_4c4d_454d_96be_f03bac821358);

// ── Descriptors ───────────────────────────────────────────────────────────────

/// Client Characteristic Configuration Descriptor (standard 16-bit `0x2902`).
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// CCCD value that turns notifications on (little-endian `0x0001`).
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

// ── Sampling constants ────────────────────────────────────────────────────────

/// EEG sample rate in Hz.
pub const EEG_FREQUENCY: f64 = 256.0;

/// Samples carried by one EEG notification.
pub const EEG_SAMPLES_PER_READING: usize = 12;

/// Minimum data frame: 2-byte index followed by 12 big-endian `u16` samples.
pub const EEG_FRAME_LEN: usize = 2 + EEG_SAMPLES_PER_READING * 2;

/// Raw sample units per microvolt.
pub const EEG_SCALE_DIVISOR: f64 = 1000.0;

// ── Commands ──────────────────────────────────────────────────────────────────

/// Channel preset selected at the start of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Preset {
    /// EEG only.
    #[default]
    P21,
    /// EEG plus optical (PPG) sensors.
    P51,
}

impl Preset {
    pub fn name(self) -> &'static str {
        match self {
            Preset::P21 => "p21",
            Preset::P51 => "p51",
        }
    }
}

impl FromStr for Preset {
    type Err = EncodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "p21" => Ok(Preset::P21),
            "p51" => Ok(Preset::P51),
            other => Err(EncodeError::UnknownCommand(other.to_owned())),
        }
    }
}

/// The commands the handshake sends on [`CONTROL_CHARACTERISTIC`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SelectPreset(Preset),
    StartStream,
    RequestStatus,
}

// Frames are fixed by the firmware and not derived from a length formula:
// the preset frames carry a length byte of 3, the single-letter ones 2.
const FRAME_P21: &[u8] = &[0x03, b'p', b'2', b'1', b'\n'];
const FRAME_P51: &[u8] = &[0x03, b'p', b'5', b'1', b'\n'];
const FRAME_START_STREAM: &[u8] = &[0x02, b'd', b'\n'];
const FRAME_REQUEST_STATUS: &[u8] = &[0x02, b's', b'\n'];

impl Command {
    pub fn name(self) -> &'static str {
        match self {
            Command::SelectPreset(p) => p.name(),
            Command::StartStream => "d",
            Command::RequestStatus => "s",
        }
    }

    /// The exact bytes written to the control characteristic.
    pub fn frame(self) -> &'static [u8] {
        match self {
            Command::SelectPreset(Preset::P21) => FRAME_P21,
            Command::SelectPreset(Preset::P51) => FRAME_P51,
            Command::StartStream => FRAME_START_STREAM,
            Command::RequestStatus => FRAME_REQUEST_STATUS,
        }
    }
}

impl FromStr for Command {
    type Err = EncodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "d" => Ok(Command::StartStream),
            "s" => Ok(Command::RequestStatus),
            other => other.parse().map(Command::SelectPreset),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Encode a command name into its control-channel frame.
///
/// The frame layout is `[length, ascii…, 0x0a]`. Only `p21`, `p51`, `d`
/// and `s` are understood; anything else is an [`EncodeError::UnknownCommand`].
///
/// # Example
///
/// ```
/// # use muse_connect::protocol::encode_command;
/// assert_eq!(encode_command("d").unwrap(), [0x02, b'd', b'\n']);
/// assert!(encode_command("h").is_err());
/// ```
pub fn encode_command(name: &str) -> Result<Vec<u8>, EncodeError> {
    name.parse::<Command>().map(|c| c.frame().to_vec())
}

/// Decode a control-channel notification into its text fragment.
///
/// Responses use a length prefix:
/// ```text
/// byte 0     : payload length
/// bytes 1..N : UTF-8 (or lossy) response fragment
/// ```
///
/// A length byte larger than the payload is clamped. Returns an empty string
/// for an empty payload. Multi-packet JSON replies are reassembled with
/// [`crate::parse::ControlAccumulator`].
pub fn decode_response(bytes: &[u8]) -> String {
    let Some((&len, rest)) = bytes.split_first() else {
        return String::new();
    };
    let end = usize::from(len).min(rest.len());
    String::from_utf8_lossy(&rest[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_frames_are_bit_exact() {
        assert_eq!(encode_command("p21").unwrap(), [0x03, 0x70, 0x32, 0x31, 0x0a]);
        assert_eq!(encode_command("p51").unwrap(), [0x03, 0x70, 0x35, 0x31, 0x0a]);
        assert_eq!(encode_command("d").unwrap(), [0x02, 0x64, 0x0a]);
        assert_eq!(encode_command("s").unwrap(), [0x02, 0x73, 0x0a]);
    }

    #[test]
    fn test_unknown_commands_rejected() {
        for name in ["h", "v1", "p20", "", "D", "p21\n"] {
            assert_eq!(
                encode_command(name),
                Err(EncodeError::UnknownCommand(name.to_owned())),
                "{name:?}"
            );
        }
    }

    #[test]
    fn test_command_names_match_frames() {
        for cmd in [
            Command::SelectPreset(Preset::P21),
            Command::SelectPreset(Preset::P51),
            Command::StartStream,
            Command::RequestStatus,
        ] {
            assert_eq!(cmd.name().parse::<Command>(), Ok(cmd));
            let frame = cmd.frame();
            assert_eq!(&frame[1..frame.len() - 1], cmd.name().as_bytes());
            assert_eq!(frame.last(), Some(&b'\n'));
        }
    }

    #[test]
    fn test_decode_response() {
        assert_eq!(decode_response(&[]), "");
        assert_eq!(decode_response(b"\x06{\"rc\":"), "{\"rc\":");
        // Length byte claims more than was delivered.
        assert_eq!(decode_response(b"\x10ok"), "ok");
        // Trailing padding beyond the length byte is ignored.
        assert_eq!(decode_response(b"\x020}xxxx"), "0}");
    }

    #[test]
    fn test_preset_default_is_eeg_only() {
        assert_eq!(Preset::default(), Preset::P21);
        assert_eq!("p51".parse::<Preset>(), Ok(Preset::P51));
    }
}
