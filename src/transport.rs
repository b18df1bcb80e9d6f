//! The BLE link as seen by the session.
//!
//! A [`Transport`] only *initiates* operations. Every method returns at once;
//! an `Err` means the request never left the host (permission revoked, link
//! already closed). Completions come back later as [`SessionInput`] values
//! posted to the session's inbox ([`crate::runner::SessionInbox`]). They
//! share one ordered queue with owner requests, which is what keeps request
//! N+1 from overtaking the confirmation of request N. Notifications travel
//! on a separate bounded queue.

use uuid::Uuid;

use crate::error::TransportError;
use crate::types::DeviceHandle;

/// Connection state reported by the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

/// The Muse service as found by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

impl ServiceHandle {
    pub fn has_characteristic(&self, uuid: &Uuid) -> bool {
        self.characteristics.contains(uuid)
    }
}

/// Everything that can happen to a session, from its owner or from the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInput {
    ConnectRequested(DeviceHandle),
    /// Accepted in any state; drops all in-flight work.
    DisconnectRequested,
    /// Ask a streaming headband for a fresh status report.
    StatusRequested,
    LinkStateChanged(LinkState),
    /// A connect attempt ended before the link came up.
    ConnectAttemptFailed(TransportError),
    /// `Ok(None)` means discovery ran but the Muse service was absent.
    ServicesDiscovered(Result<Option<ServiceHandle>, TransportError>),
    /// Completion of [`Transport::write_value`].
    ///
    /// `Err(TransportError::WriteRejected(_))` is the peer refusing the
    /// write; any other error is the link failing underneath it.
    WriteConfirmed {
        channel: Uuid,
        result: Result<(), TransportError>,
    },
    /// Completion of [`Transport::write_descriptor`]. Same error split as
    /// `WriteConfirmed`.
    DescriptorWritten {
        channel: Uuid,
        result: Result<(), TransportError>,
    },
    NotificationReceived { channel: Uuid, value: Vec<u8> },
}

impl SessionInput {
    /// A value-write completion; `false` means the peer rejected the write.
    pub fn write_confirmed(channel: Uuid, success: bool) -> Self {
        SessionInput::WriteConfirmed {
            channel,
            result: acknowledged(channel, success),
        }
    }

    /// A descriptor-write completion; `false` means the peer rejected it.
    pub fn descriptor_written(channel: Uuid, success: bool) -> Self {
        SessionInput::DescriptorWritten {
            channel,
            result: acknowledged(channel, success),
        }
    }
}

fn acknowledged(channel: Uuid, success: bool) -> Result<(), TransportError> {
    if success {
        Ok(())
    } else {
        Err(TransportError::WriteRejected(channel))
    }
}

/// Request side of a single BLE link.
///
/// One instance drives one peripheral; concurrent sessions against the same
/// device are not supported.
pub trait Transport {
    /// Open the link. Completes with `LinkStateChanged(Connected)` or
    /// `ConnectAttemptFailed`.
    fn connect(&mut self, device: &DeviceHandle) -> Result<(), TransportError>;

    /// Enumerate services. Completes with `ServicesDiscovered`.
    fn discover_services(&mut self) -> Result<(), TransportError>;

    /// Write a characteristic value. Completes with `WriteConfirmed`.
    fn write_value(&mut self, characteristic: Uuid, value: &[u8]) -> Result<(), TransportError>;

    /// Toggle local notification delivery for a characteristic.
    ///
    /// Takes effect immediately; there is no completion event.
    fn set_notification(&mut self, characteristic: Uuid, enabled: bool)
        -> Result<(), TransportError>;

    /// Write a descriptor under a characteristic. Completes with `DescriptorWritten`.
    fn write_descriptor(
        &mut self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError>;

    /// Tear the link down. Idempotent.
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CONTROL_CHARACTERISTIC;

    #[test]
    fn test_completion_constructors() {
        assert_eq!(
            SessionInput::write_confirmed(CONTROL_CHARACTERISTIC, true),
            SessionInput::WriteConfirmed {
                channel: CONTROL_CHARACTERISTIC,
                result: Ok(()),
            }
        );
        assert_eq!(
            SessionInput::descriptor_written(CONTROL_CHARACTERISTIC, false),
            SessionInput::DescriptorWritten {
                channel: CONTROL_CHARACTERISTIC,
                result: Err(TransportError::WriteRejected(CONTROL_CHARACTERISTIC)),
            }
        );
    }
}
