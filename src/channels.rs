//! Channel registry: the closed set of GATT characteristics the session talks to.
//!
//! Every Muse characteristic lives in the vendor namespace
//! `273eXXXX-4c4d-454d-96be-f03bac821358`.
//!
//! | Channel | UUID suffix | Role |
//! |---------|-------------|------|
//! | Control | 0001        | command writes, status notifications |
//! | TP9     | 0003        | EEG, left rear |
//! | AF7     | 0004        | EEG, left front |
//! | AF8     | 0005        | EEG, right front |
//! | TP10    | 0006        | EEG, right rear |

use std::fmt;

use uuid::Uuid;

use crate::protocol::{
    AF7_CHARACTERISTIC, AF8_CHARACTERISTIC, CONTROL_CHARACTERISTIC, TP10_CHARACTERISTIC,
    TP9_CHARACTERISTIC,
};

/// Label reported for notifications from characteristics outside the registry.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Fixed subscription order for the EEG channels.
pub const DATA_CHANNELS: [ChannelId; 4] =
    [ChannelId::Tp9, ChannelId::Af7, ChannelId::Af8, ChannelId::Tp10];

/// A characteristic known to the session.
///
/// `Control` is the single command channel and is always armed first; the
/// others carry EEG samples and are only subscribed after the stream starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelId {
    Control,
    Tp9,
    Af7,
    Af8,
    Tp10,
}

impl ChannelId {
    pub const ALL: [ChannelId; 5] = [
        ChannelId::Control,
        ChannelId::Tp9,
        ChannelId::Af7,
        ChannelId::Af8,
        ChannelId::Tp10,
    ];

    pub fn uuid(self) -> Uuid {
        match self {
            ChannelId::Control => CONTROL_CHARACTERISTIC,
            ChannelId::Tp9 => TP9_CHARACTERISTIC,
            ChannelId::Af7 => AF7_CHARACTERISTIC,
            ChannelId::Af8 => AF8_CHARACTERISTIC,
            ChannelId::Tp10 => TP10_CHARACTERISTIC,
        }
    }

    /// Reverse lookup; `None` for anything outside the registry.
    pub fn from_uuid(uuid: &Uuid) -> Option<ChannelId> {
        Self::ALL.into_iter().find(|c| c.uuid() == *uuid)
    }

    pub fn label(self) -> &'static str {
        match self {
            ChannelId::Control => "Control",
            ChannelId::Tp9 => "TP9",
            ChannelId::Af7 => "AF7",
            ChannelId::Af8 => "AF8",
            ChannelId::Tp10 => "TP10",
        }
    }

    pub fn is_data(self) -> bool {
        !matches!(self, ChannelId::Control)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Human-readable label for a characteristic UUID.
///
/// Stray notifications from unrelated services are labelled
/// [`UNKNOWN_LABEL`] instead of failing.
///
/// ```
/// # use muse_connect::channels::label_for;
/// # use muse_connect::protocol::TP9_CHARACTERISTIC;
/// assert_eq!(label_for(&TP9_CHARACTERISTIC), "TP9");
/// assert_eq!(label_for(&uuid::Uuid::nil()), "Unknown");
/// ```
pub fn label_for(uuid: &Uuid) -> &'static str {
    ChannelId::from_uuid(uuid).map_or(UNKNOWN_LABEL, ChannelId::label)
}

/// The EEG channels in subscription order: TP9, AF7, AF8, TP10.
pub fn data_channels() -> &'static [ChannelId] {
    &DATA_CHANNELS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_round_trip_for_every_channel() {
        for ch in ChannelId::ALL {
            assert_eq!(ChannelId::from_uuid(&ch.uuid()), Some(ch));
        }
    }

    #[test]
    fn test_labels() {
        assert_eq!(label_for(&CONTROL_CHARACTERISTIC), "Control");
        assert_eq!(label_for(&AF7_CHARACTERISTIC), "AF7");
        assert_eq!(label_for(&AF8_CHARACTERISTIC), "AF8");
        assert_eq!(label_for(&TP10_CHARACTERISTIC), "TP10");
    }

    #[test]
    fn test_unknown_uuid_is_labelled_not_rejected() {
        // Telemetry characteristic: real Muse attribute, but not in the registry.
        let telemetry = Uuid::from_u128(0x273e000b_4c4d_454d_96be_f03bac821358);
        assert_eq!(ChannelId::from_uuid(&telemetry), None);
        assert_eq!(label_for(&telemetry), UNKNOWN_LABEL);
    }

    #[test]
    fn test_data_channel_order() {
        assert_eq!(
            data_channels(),
            &[ChannelId::Tp9, ChannelId::Af7, ChannelId::Af8, ChannelId::Tp10]
        );
        assert!(data_channels().iter().all(|c| c.is_data()));
        assert!(!ChannelId::Control.is_data());
    }
}
