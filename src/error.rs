//! Error taxonomy for the session engine.
//!
//! | Type | Raised by | Policy |
//! |---|---|---|
//! | [`EncodeError`] | [`crate::protocol::encode_command`] | caller error |
//! | [`DecodeError`] | [`crate::parse::decode_notification`] | logged and dropped per notification |
//! | [`TransportError`] | the [`crate::transport::Transport`] implementation | always surfaced, never retried |
//! | [`ProtocolError`] | [`crate::session::CommandSession`] | handshake rejection ends the session in `Failed` |
//! | [`ChannelRegistrationError`] | [`crate::sequencer::SubscriptionSequencer::begin`] | rejected before any transport call |

use thiserror::Error;
use uuid::Uuid;

use crate::channels::ChannelId;
use crate::types::HandshakeStep;

/// A command name outside the supported command set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("unknown command: {0:?}")]
    UnknownCommand(String),
}

/// A notification payload that could not be turned into a [`crate::types::Sample`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Data frames carry a 2-byte index plus 12 × 2-byte samples.
    #[error("undersized frame: {0} bytes (need at least 26)")]
    UndersizedFrame(usize),

    #[error("{0} does not carry sample data")]
    NotADataChannel(ChannelId),
}

/// Failures reported by the BLE link.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("link is closed")]
    LinkClosed,

    #[error("Bluetooth permission denied")]
    PermissionDenied,

    #[error("device {0} not found")]
    DeviceNotFound(String),

    #[error("characteristic {0} not found")]
    CharacteristicMissing(Uuid),

    #[error("write to {0} rejected")]
    WriteRejected(Uuid),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("BLE backend error: {0}")]
    Backend(String),
}

/// The headband did something the session did not expect.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("firmware rejected the {0} command")]
    HandshakeRejected(HandshakeStep),

    #[error("unexpected notification on {channel}: {reason}")]
    UnexpectedNotification { channel: Uuid, reason: String },
}

/// The channel list handed to the sequencer was unusable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelRegistrationError {
    #[error("no channels to subscribe")]
    Empty,

    #[error("{0} is not a data channel")]
    NotADataChannel(ChannelId),

    #[error("{0} listed more than once")]
    Duplicate(ChannelId),
}

/// Umbrella error for callers that don't care which layer failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    ChannelRegistration(#[from] ChannelRegistrationError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            DecodeError::UndersizedFrame(10).to_string(),
            "undersized frame: 10 bytes (need at least 26)"
        );
        assert_eq!(
            EncodeError::UnknownCommand("h".into()).to_string(),
            "unknown command: \"h\""
        );
        assert_eq!(
            ProtocolError::HandshakeRejected(HandshakeStep::StartStream).to_string(),
            "firmware rejected the StartStream command"
        );
        assert_eq!(
            ChannelRegistrationError::NotADataChannel(ChannelId::Control).to_string(),
            "Control is not a data channel"
        );
    }

    #[test]
    fn test_umbrella_conversion() {
        let err: Error = TransportError::PermissionDenied.into();
        assert_eq!(err, Error::Transport(TransportError::PermissionDenied));
        assert_eq!(err.to_string(), "Bluetooth permission denied");
    }
}
