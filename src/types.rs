use std::fmt;

use crate::channels::ChannelId;
use crate::error::TransportError;

/// A physical headband as reported by the scanner.
///
/// Immutable once discovered; the session keeps it for the life of the
/// connection for logging and reconnection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    /// Platform BLE identifier.
    /// • macOS / Windows — a UUID string
    /// • Linux — a Bluetooth MAC address (`AA:BB:CC:DD:EE:FF`)
    pub address: String,
    /// Advertised name (e.g. `"Muse-AB12"`), when the peer sent one.
    pub name: Option<String>,
}

impl DeviceHandle {
    pub fn new(address: impl Into<String>, name: Option<String>) -> Self {
        Self {
            address: address.into(),
            name,
        }
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name} [{}]", self.address),
            None => f.write_str(&self.address),
        }
    }
}

/// One EEG notification from a single electrode.
///
/// Produced by [`crate::parse::decode_notification`] and handed downstream;
/// the session does not retain it.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub channel: ChannelId,
    /// `"TP9"`, `"AF7"`, `"AF8"` or `"TP10"`.
    pub channel_label: &'static str,
    /// Big-endian 16-bit packet index from the first two bytes of the frame.
    pub timestamp_ticks: u16,
    /// Exactly 12 values, raw units divided by 1000.
    pub values: Vec<f64>,
}

/// A control-channel notification, kept as bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub raw: Vec<u8>,
    /// The length-prefixed text fragment carried by `raw`.
    pub text: String,
}

/// A complete JSON status reply reassembled from control fragments.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlResponse {
    /// The raw, un-parsed JSON string.
    pub raw: String,
    /// Key-value pairs from the parsed JSON object.
    pub fields: serde_json::Map<String, serde_json::Value>,
}

/// Output of decoding one notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Sample(Sample),
    Status(StatusEvent),
}

/// The three control commands, in the only order the firmware accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeStep {
    SelectPreset,
    StartStream,
    RequestStatus,
}

impl HandshakeStep {
    /// The step after this one, or `None` after `RequestStatus`.
    pub fn next(self) -> Option<HandshakeStep> {
        match self {
            HandshakeStep::SelectPreset => Some(HandshakeStep::StartStream),
            HandshakeStep::StartStream => Some(HandshakeStep::RequestStatus),
            HandshakeStep::RequestStatus => None,
        }
    }
}

impl fmt::Display for HandshakeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why a session ended up in [`SessionState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The Muse service was not among the discovered services.
    ServiceMissing,
    /// The service exists but lacks a required characteristic.
    CharacteristicMissing(ChannelId),
    /// The firmware answered a handshake write with an error status.
    HandshakeRejected(HandshakeStep),
    Transport(TransportError),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ServiceMissing => f.write_str("Muse service missing"),
            FailureReason::CharacteristicMissing(ch) => write!(f, "{ch} characteristic missing"),
            FailureReason::HandshakeRejected(step) => write!(f, "{step} rejected by firmware"),
            FailureReason::Transport(e) => write!(f, "transport: {e}"),
        }
    }
}

/// Lifecycle of one [`crate::session::CommandSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    ServicesDiscovering,
    /// The command for this step is in flight (or, for `SelectPreset`,
    /// about to be sent once control notifications are armed).
    Handshaking(HandshakeStep),
    /// Index of the next data channel awaiting confirmation.
    SubscribingChannels(usize),
    Streaming,
    Failed(FailureReason),
}

/// Everything the session reports to its owner.
///
/// Transitions and errors are structured values rather than log text so that
/// callers can both display and test them.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// The link dropped (or could not be opened) before discovery started.
    ConnectFailed {
        device: DeviceHandle,
        error: Option<TransportError>,
    },
    /// One data channel could not be subscribed; the others continue.
    SubscriptionFailed {
        channel: ChannelId,
        error: TransportError,
    },
    /// Every data channel has had its subscription step completed.
    AllSubscribed,
    Sample {
        sample: Sample,
        /// Wall-clock time of the first value, ms since the Unix epoch.
        timestamp_ms: f64,
    },
    Status(StatusEvent),
    Control(ControlResponse),
    Failed(FailureReason),
}
