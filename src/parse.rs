//! Decoders for Muse BLE notification payloads.
//!
//! [`decode_notification`] is pure: no I/O, no retained state, safe to call
//! from any context and to test with literal byte arrays.
//!
//! | Channel | Payload | Result |
//! |---|---|---|
//! | TP9 / AF7 / AF8 / TP10 | `[idx_hi, idx_lo, 12 × (hi, lo)]` | [`Sample`], values = raw ÷ 1000 |
//! | Control | `[len, utf8…]` | [`StatusEvent`] with raw bytes kept |

use log::warn;

use crate::channels::ChannelId;
use crate::error::DecodeError;
use crate::protocol::{decode_response, EEG_FRAME_LEN, EEG_SAMPLES_PER_READING, EEG_SCALE_DIVISOR};
use crate::types::{ControlResponse, Decoded, Sample, StatusEvent};

// ── EEG ──────────────────────────────────────────────────────────────────────

/// Decode one EEG data frame.
///
/// Frames shorter than 26 bytes are rejected with
/// [`DecodeError::UndersizedFrame`]; they are never padded. Bytes past the
/// 26th are ignored, so the result always carries exactly 12 values.
pub fn decode_eeg_frame(channel: ChannelId, raw: &[u8]) -> Result<Sample, DecodeError> {
    if !channel.is_data() {
        return Err(DecodeError::NotADataChannel(channel));
    }
    if raw.len() < EEG_FRAME_LEN {
        return Err(DecodeError::UndersizedFrame(raw.len()));
    }
    let timestamp_ticks = u16::from_be_bytes([raw[0], raw[1]]);
    let values = raw[2..EEG_FRAME_LEN]
        .chunks_exact(2)
        .map(|c| f64::from(u16::from_be_bytes([c[0], c[1]])) / EEG_SCALE_DIVISOR)
        .collect::<Vec<_>>();
    debug_assert_eq!(values.len(), EEG_SAMPLES_PER_READING);

    Ok(Sample {
        channel,
        channel_label: channel.label(),
        timestamp_ticks,
        values,
    })
}

/// Decode a raw notification according to the channel it arrived on.
///
/// ```
/// # use muse_connect::channels::ChannelId;
/// # use muse_connect::parse::decode_notification;
/// # use muse_connect::types::Decoded;
/// let mut frame = vec![0x01, 0x02];
/// frame.extend([0x00, 0x64].repeat(12));
/// let Decoded::Sample(s) = decode_notification(ChannelId::Tp9, &frame).unwrap() else {
///     panic!("expected a sample");
/// };
/// assert_eq!(s.timestamp_ticks, 258);
/// assert!(s.values.iter().all(|&v| v == 0.1));
/// ```
pub fn decode_notification(channel: ChannelId, raw: &[u8]) -> Result<Decoded, DecodeError> {
    match channel {
        ChannelId::Control => Ok(Decoded::Status(StatusEvent {
            raw: raw.to_vec(),
            text: decode_response(raw),
        })),
        _ => decode_eeg_frame(channel, raw).map(Decoded::Sample),
    }
}

// ── Control response reassembly ───────────────────────────────────────────────

/// Reassembles JSON status replies split across control notifications.
///
/// The headband sends fragments such as `{"hn":`, `"Muse-AB12"`, `}`. Each
/// fragment is pushed in arrival order; when the top-level object closes the
/// accumulated text is parsed and returned.
///
/// ```
/// # use muse_connect::parse::ControlAccumulator;
/// let mut acc = ControlAccumulator::new();
/// assert!(acc.push(r#"{"rc":"#).is_none());
/// let resp = acc.push("0}").unwrap();
/// assert_eq!(resp.raw, r#"{"rc":0}"#);
/// assert_eq!(resp.fields["rc"], 0);
/// ```
///
/// Text outside an object is dropped, so a stray tail from one reply cannot
/// corrupt the next. Objects that close but don't parse are logged and
/// discarded.
#[derive(Debug, Default)]
pub struct ControlAccumulator {
    buffer: String,
    /// Brace depth; 0 means "between objects".
    depth: usize,
}

impl ControlAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one decoded fragment. Returns a response when an object completes.
    pub fn push(&mut self, fragment: &str) -> Option<ControlResponse> {
        let mut completed = None;
        for ch in fragment.chars() {
            match ch {
                '{' => {
                    if self.depth == 0 {
                        self.buffer.clear();
                    }
                    self.depth += 1;
                    self.buffer.push(ch);
                }
                '}' if self.depth > 0 => {
                    self.buffer.push(ch);
                    self.depth -= 1;
                    if self.depth == 0 {
                        let raw = std::mem::take(&mut self.buffer);
                        completed = parse_control_json(raw).or(completed);
                    }
                }
                _ if self.depth > 0 => self.buffer.push(ch),
                _ => {}
            }
        }
        completed
    }

    /// Drop any partial object.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.depth = 0;
    }
}

fn parse_control_json(raw: String) -> Option<ControlResponse> {
    match serde_json::from_str::<serde_json::Value>(&raw) {
        Ok(serde_json::Value::Object(fields)) => Some(ControlResponse { raw, fields }),
        Ok(_) => None,
        Err(e) => {
            warn!("Control JSON parse error: {e} | raw: {raw}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ts: [u8; 2], pair: [u8; 2], pairs: usize) -> Vec<u8> {
        let mut v = ts.to_vec();
        v.extend(pair.repeat(pairs));
        v
    }

    #[test]
    fn test_decode_reference_frame() {
        let raw = frame([0x01, 0x02], [0x00, 0x64], 12);
        assert_eq!(raw.len(), 26);
        let Ok(Decoded::Sample(s)) = decode_notification(ChannelId::Tp9, &raw) else {
            panic!("expected sample");
        };
        assert_eq!(s.channel_label, "TP9");
        assert_eq!(s.timestamp_ticks, 258);
        assert_eq!(s.values.len(), 12);
        assert!(s.values.iter().all(|&v| v == 0.1));
    }

    #[test]
    fn test_values_are_unsigned_big_endian() {
        let raw = frame([0xff, 0xff], [0xff, 0xff], 12);
        let s = decode_eeg_frame(ChannelId::Af8, &raw).unwrap();
        assert_eq!(s.timestamp_ticks, 0xffff);
        assert!(s.values.iter().all(|&v| v == 65.535));
    }

    #[test]
    fn test_undersized_frame_rejected_with_length() {
        let raw = [0u8; 10];
        assert_eq!(
            decode_notification(ChannelId::Af7, &raw),
            Err(DecodeError::UndersizedFrame(10))
        );
        assert_eq!(
            decode_notification(ChannelId::Af7, &[0u8; 25]),
            Err(DecodeError::UndersizedFrame(25))
        );
        assert_eq!(
            decode_notification(ChannelId::Tp10, &[]),
            Err(DecodeError::UndersizedFrame(0))
        );
    }

    #[test]
    fn test_oversized_frame_yields_exactly_twelve_values() {
        let raw = frame([0x00, 0x01], [0x03, 0xe8], 14);
        let s = decode_eeg_frame(ChannelId::Tp10, &raw).unwrap();
        assert_eq!(s.values, vec![1.0; 12]);
    }

    #[test]
    fn test_control_payload_is_a_status_event() {
        let raw = b"\x07{\"rc\":0".to_vec();
        let decoded = decode_notification(ChannelId::Control, &raw).unwrap();
        assert_eq!(
            decoded,
            Decoded::Status(StatusEvent {
                raw: raw.clone(),
                text: "{\"rc\":0".into(),
            })
        );
    }

    #[test]
    fn test_control_is_not_a_data_channel() {
        assert_eq!(
            decode_eeg_frame(ChannelId::Control, &[0u8; 26]),
            Err(DecodeError::NotADataChannel(ChannelId::Control))
        );
    }

    #[test]
    fn test_accumulator_reassembles_fragments() {
        let mut acc = ControlAccumulator::new();
        assert!(acc.push("{\"hn\":").is_none());
        assert!(acc.push("\"Muse-AB12\",\"sp\":").is_none());
        let resp = acc.push("{\"a\":1}}").unwrap();
        assert_eq!(resp.fields["hn"], "Muse-AB12");
        assert_eq!(resp.fields["sp"]["a"], 1);
    }

    #[test]
    fn test_accumulator_drops_garbage_between_objects() {
        let mut acc = ControlAccumulator::new();
        assert!(acc.push("xx}").is_none());
        let resp = acc.push("junk{\"rc\":0}tail").unwrap();
        assert_eq!(resp.raw, "{\"rc\":0}");
    }

    #[test]
    fn test_accumulator_skips_unparseable_object() {
        let mut acc = ControlAccumulator::new();
        assert!(acc.push("{not json}").is_none());
        assert!(acc.push("{\"ok\":true}").is_some());
    }

    #[test]
    fn test_accumulator_reset() {
        let mut acc = ControlAccumulator::new();
        assert!(acc.push("{\"partial\":").is_none());
        acc.reset();
        assert!(acc.push("1}").is_none());
    }
}
