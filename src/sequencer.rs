//! One-at-a-time enable-notification across the EEG channels.
//!
//! Each step is two transport operations: set the local notification flag,
//! then write `[0x01, 0x00]` to the channel's `0x2902` descriptor. Only the
//! descriptor write has a completion, and only that completion advances the
//! cursor. The sequencer never retries and never skips on its own: a failed
//! step parks the cursor and the owner decides with [`skip_failed`].
//!
//! [`skip_failed`]: SubscriptionSequencer::skip_failed

use std::collections::HashSet;

use log::{debug, info, warn};

use crate::channels::ChannelId;
use crate::error::{ChannelRegistrationError, TransportError};
use crate::protocol::{CCCD_UUID, ENABLE_NOTIFICATION_VALUE};
use crate::transport::{ServiceHandle, Transport};

/// What the sequencer is doing after a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// A subscription for this channel is in flight.
    Requested(ChannelId),
    /// This channel's step failed; the cursor is parked on it.
    Failed {
        channel: ChannelId,
        error: TransportError,
    },
    /// The whole list has been processed.
    AllSubscribed,
    /// Nothing to do: not started, or the call did not match an in-flight step.
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    InFlight,
    Parked,
    Done,
}

/// Ordered subscription cursor over a list of data channels.
#[derive(Debug)]
pub struct SubscriptionSequencer {
    channels: Vec<ChannelId>,
    service: Option<ServiceHandle>,
    cursor: usize,
    phase: Phase,
}

impl Default for SubscriptionSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionSequencer {
    pub fn new() -> Self {
        Self {
            channels: Vec::new(),
            service: None,
            cursor: 0,
            phase: Phase::Idle,
        }
    }

    /// Reset to the start of `channels` and issue the first request.
    ///
    /// The list must be non-empty, data channels only, without duplicates;
    /// otherwise nothing is sent to the transport.
    pub fn begin<T: Transport>(
        &mut self,
        transport: &mut T,
        service: ServiceHandle,
        channels: &[ChannelId],
    ) -> Result<Progress, ChannelRegistrationError> {
        validate(channels)?;
        self.channels = channels.to_vec();
        self.service = Some(service);
        self.cursor = 0;
        info!(
            "Subscribing to {} channel(s): {:?}",
            channels.len(),
            self.channels
        );
        Ok(self.issue(transport))
    }

    /// Feed the completion of the in-flight descriptor write.
    pub fn on_step_confirmed<T: Transport>(
        &mut self,
        transport: &mut T,
        result: Result<(), TransportError>,
    ) -> Progress {
        let Some(channel) = self.in_flight() else {
            debug!("Subscription confirmation with nothing in flight – ignored");
            return Progress::Idle;
        };
        if let Err(error) = result {
            warn!("Subscription to {channel} failed: {error}");
            self.phase = Phase::Parked;
            return Progress::Failed { channel, error };
        }
        info!(
            "Subscribed to {channel} ({}/{})",
            self.cursor + 1,
            self.channels.len()
        );
        self.cursor += 1;
        self.issue(transport)
    }

    /// Move past a failed channel and continue with the next one.
    pub fn skip_failed<T: Transport>(&mut self, transport: &mut T) -> Progress {
        if self.phase != Phase::Parked {
            return Progress::Idle;
        }
        self.cursor += 1;
        self.issue(transport)
    }

    /// Drop all state. Late confirmations are ignored afterwards.
    pub fn abort(&mut self) {
        self.channels.clear();
        self.service = None;
        self.cursor = 0;
        self.phase = Phase::Idle;
    }

    /// Channel whose descriptor write is outstanding, if any.
    pub fn in_flight(&self) -> Option<ChannelId> {
        match self.phase {
            Phase::InFlight => self.channels.get(self.cursor).copied(),
            _ => None,
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    fn issue<T: Transport>(&mut self, transport: &mut T) -> Progress {
        let Some(&channel) = self.channels.get(self.cursor) else {
            info!("All {} channel subscription(s) processed", self.channels.len());
            self.phase = Phase::Done;
            return Progress::AllSubscribed;
        };

        let uuid = channel.uuid();
        let present = self
            .service
            .as_ref()
            .is_some_and(|s| s.has_characteristic(&uuid));
        if !present {
            warn!("EEG characteristic {channel} ({uuid}) not found");
            self.phase = Phase::Parked;
            return Progress::Failed {
                channel,
                error: TransportError::CharacteristicMissing(uuid),
            };
        }

        let sent = transport
            .set_notification(uuid, true)
            .and_then(|()| transport.write_descriptor(uuid, CCCD_UUID, &ENABLE_NOTIFICATION_VALUE));
        match sent {
            Ok(()) => {
                debug!("Initiated subscription for {channel} ({uuid})");
                self.phase = Phase::InFlight;
                Progress::Requested(channel)
            }
            Err(e) => {
                warn!("Failed to initiate subscription for {channel}: {e}");
                self.phase = Phase::Parked;
                Progress::Failed { channel, error: e }
            }
        }
    }
}

fn validate(channels: &[ChannelId]) -> Result<(), ChannelRegistrationError> {
    if channels.is_empty() {
        return Err(ChannelRegistrationError::Empty);
    }
    let mut seen = HashSet::new();
    for &ch in channels {
        if !ch.is_data() {
            return Err(ChannelRegistrationError::NotADataChannel(ch));
        }
        if !seen.insert(ch) {
            return Err(ChannelRegistrationError::Duplicate(ch));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::data_channels;
    use crate::transport_mock::{MockTransport, Request};

    fn subscribe_requests(ch: ChannelId) -> Vec<Request> {
        vec![
            Request::SetNotification {
                characteristic: ch.uuid(),
                enabled: true,
            },
            Request::WriteDescriptor {
                characteristic: ch.uuid(),
                descriptor: CCCD_UUID,
                value: vec![0x01, 0x00],
            },
        ]
    }

    fn rejected(ch: ChannelId) -> Result<(), TransportError> {
        Err(TransportError::WriteRejected(ch.uuid()))
    }

    #[test]
    fn test_one_request_at_a_time_in_order() {
        let mut t = MockTransport::new();
        let mut seq = SubscriptionSequencer::new();
        let chans = data_channels();

        let p = seq.begin(&mut t, MockTransport::muse_service(), chans).unwrap();
        assert_eq!(p, Progress::Requested(ChannelId::Tp9));
        assert_eq!(t.take_requests(), subscribe_requests(ChannelId::Tp9));

        for (i, &next) in chans.iter().enumerate().skip(1) {
            assert_eq!(seq.cursor(), i - 1);
            assert_eq!(seq.on_step_confirmed(&mut t, Ok(())), Progress::Requested(next));
            assert_eq!(t.take_requests(), subscribe_requests(next));
        }
        assert_eq!(seq.on_step_confirmed(&mut t, Ok(())), Progress::AllSubscribed);
        assert_eq!(seq.cursor(), chans.len());
        assert_eq!(seq.in_flight(), None);
        assert!(t.take_requests().is_empty());
    }

    #[test]
    fn test_failure_parks_until_owner_skips() {
        let mut t = MockTransport::new();
        let mut seq = SubscriptionSequencer::new();
        seq.begin(&mut t, MockTransport::muse_service(), data_channels())
            .unwrap();
        seq.on_step_confirmed(&mut t, Ok(()));
        t.take_requests();

        let p = seq.on_step_confirmed(&mut t, rejected(ChannelId::Af7));
        assert_eq!(
            p,
            Progress::Failed {
                channel: ChannelId::Af7,
                error: TransportError::WriteRejected(ChannelId::Af7.uuid()),
            }
        );
        // No auto-retry, no auto-advance.
        assert!(t.take_requests().is_empty());
        assert_eq!(seq.in_flight(), None);
        assert_eq!(seq.on_step_confirmed(&mut t, Ok(())), Progress::Idle);

        assert_eq!(seq.skip_failed(&mut t), Progress::Requested(ChannelId::Af8));
        assert_eq!(t.take_requests(), subscribe_requests(ChannelId::Af8));
        assert_eq!(
            seq.on_step_confirmed(&mut t, Ok(())),
            Progress::Requested(ChannelId::Tp10)
        );
        assert_eq!(seq.on_step_confirmed(&mut t, Ok(())), Progress::AllSubscribed);
    }

    #[test]
    fn test_link_error_on_completion_is_reported() {
        let mut t = MockTransport::new();
        let mut seq = SubscriptionSequencer::new();
        seq.begin(&mut t, MockTransport::muse_service(), data_channels())
            .unwrap();
        assert_eq!(
            seq.on_step_confirmed(&mut t, Err(TransportError::PermissionDenied)),
            Progress::Failed {
                channel: ChannelId::Tp9,
                error: TransportError::PermissionDenied,
            }
        );
    }

    #[test]
    fn test_missing_characteristic_fails_step_without_transport_call() {
        let mut t = MockTransport::new();
        let mut service = MockTransport::muse_service();
        service.characteristics.retain(|u| *u != ChannelId::Tp9.uuid());
        let mut seq = SubscriptionSequencer::new();

        let p = seq.begin(&mut t, service, data_channels()).unwrap();
        assert_eq!(
            p,
            Progress::Failed {
                channel: ChannelId::Tp9,
                error: TransportError::CharacteristicMissing(ChannelId::Tp9.uuid()),
            }
        );
        assert!(t.take_requests().is_empty());
        assert_eq!(seq.skip_failed(&mut t), Progress::Requested(ChannelId::Af7));
    }

    #[test]
    fn test_transport_rejection_fails_step() {
        let mut t = MockTransport::new();
        t.rejected_writes
            .insert(ChannelId::Af7.uuid(), TransportError::PermissionDenied);
        let mut seq = SubscriptionSequencer::new();
        seq.begin(&mut t, MockTransport::muse_service(), data_channels())
            .unwrap();
        assert_eq!(
            seq.on_step_confirmed(&mut t, Ok(())),
            Progress::Failed {
                channel: ChannelId::Af7,
                error: TransportError::PermissionDenied,
            }
        );
    }

    #[test]
    fn test_invalid_channel_lists_rejected_before_transport() {
        let mut t = MockTransport::new();
        let mut seq = SubscriptionSequencer::new();
        let svc = MockTransport::muse_service;

        assert_eq!(
            seq.begin(&mut t, svc(), &[]),
            Err(ChannelRegistrationError::Empty)
        );
        assert_eq!(
            seq.begin(&mut t, svc(), &[ChannelId::Tp9, ChannelId::Control]),
            Err(ChannelRegistrationError::NotADataChannel(ChannelId::Control))
        );
        assert_eq!(
            seq.begin(&mut t, svc(), &[ChannelId::Af8, ChannelId::Af8]),
            Err(ChannelRegistrationError::Duplicate(ChannelId::Af8))
        );
        assert!(t.requests().is_empty());
        assert_eq!(seq.in_flight(), None);
    }

    #[test]
    fn test_abort_ignores_late_confirmation() {
        let mut t = MockTransport::new();
        let mut seq = SubscriptionSequencer::new();
        seq.begin(&mut t, MockTransport::muse_service(), data_channels())
            .unwrap();
        seq.abort();
        t.take_requests();
        assert_eq!(seq.on_step_confirmed(&mut t, Ok(())), Progress::Idle);
        assert!(t.take_requests().is_empty());
        assert_eq!(seq.skip_failed(&mut t), Progress::Idle);
    }
}
