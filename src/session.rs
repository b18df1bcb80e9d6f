//! The command session: one state machine per physical link.
//!
//! ```text
//! Disconnected ─connect─▶ Connecting ─link up─▶ ServicesDiscovering
//!      ▲                                              │ Muse service found
//!      │ link down / disconnect (any state)           ▼
//!      │                          Handshaking(SelectPreset)   arm control CCCD, send p21/p51
//!      │                                              │ write ok
//!      │                          Handshaking(StartStream)    send d
//!      │                                              │ write ok
//!      │                          Handshaking(RequestStatus)  send s ┐ in parallel
//!      │                          SubscribingChannels(i)  TP9…TP10   ┘
//!      │                                              │ both complete
//!      └──────────────────────────────────────── Streaming
//! ```
//!
//! [`CommandSession::handle`] consumes one [`SessionInput`] and returns the
//! [`SessionEvent`]s it produced. It is synchronous and never blocks, so the
//! caller decides how inputs are serialized (see [`crate::runner`]).
//!
//! At most one control write is outstanding at any time and the next
//! handshake command is only sent after the previous write confirms.

use std::collections::HashMap;

use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::channels::{label_for, ChannelId, DATA_CHANNELS};
use crate::error::{ProtocolError, TransportError};
use crate::parse::{decode_notification, ControlAccumulator};
use crate::protocol::{
    Command, Preset, CCCD_UUID, CONTROL_CHARACTERISTIC, ENABLE_NOTIFICATION_VALUE,
};
use crate::sequencer::{Progress, SubscriptionSequencer};
use crate::timestamp::TimestampTracker;
use crate::transport::{LinkState, ServiceHandle, SessionInput, Transport};
use crate::types::{
    Decoded, DeviceHandle, FailureReason, HandshakeStep, SessionEvent, SessionState,
};

// ── SessionConfig ─────────────────────────────────────────────────────────────

/// Per-session settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Preset sent as the first handshake command. Default: `p21` (EEG only).
    pub preset: Preset,
    /// EEG channels to subscribe, in order. Default: TP9, AF7, AF8, TP10.
    pub data_channels: Vec<ChannelId>,
    /// Capacity of the outbound event channel used by [`crate::runner`].
    /// Default: `256`.
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            preset: Preset::default(),
            data_channels: DATA_CHANNELS.to_vec(),
            event_buffer: 256,
        }
    }
}

// ── CommandSession ────────────────────────────────────────────────────────────

pub struct CommandSession<T: Transport> {
    transport: T,
    config: SessionConfig,
    state: SessionState,
    device: Option<DeviceHandle>,
    /// Set once discovery found the Muse service; cleared on reset.
    service: Option<ServiceHandle>,
    /// Control CCCD write outstanding.
    arming_control: bool,
    /// Control value write outstanding, tagged with the step it belongs to.
    pending_control: Option<HandshakeStep>,
    /// `RequestStatus` confirmed during the handshake.
    handshake_complete: bool,
    subscriptions_done: bool,
    sequencer: SubscriptionSequencer,
    trackers: HashMap<ChannelId, TimestampTracker>,
    control_acc: ControlAccumulator,
    outbox: Vec<SessionEvent>,
}

impl<T: Transport> CommandSession<T> {
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self {
            transport,
            config,
            state: SessionState::Disconnected,
            device: None,
            service: None,
            arming_control: false,
            pending_control: None,
            handshake_complete: false,
            subscriptions_done: false,
            sequencer: SubscriptionSequencer::new(),
            trackers: HashMap::new(),
            control_acc: ControlAccumulator::new(),
            outbox: Vec::new(),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// The device of the current connection attempt, if any.
    pub fn device(&self) -> Option<&DeviceHandle> {
        self.device.as_ref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Process one input and return the events it produced, in order.
    pub fn handle(&mut self, input: SessionInput) -> Vec<SessionEvent> {
        match input {
            SessionInput::ConnectRequested(device) => self.on_connect_requested(device),
            SessionInput::DisconnectRequested => self.on_disconnect_requested(),
            SessionInput::StatusRequested => self.on_status_requested(),
            SessionInput::LinkStateChanged(link) => self.on_link_state(link),
            SessionInput::ServicesDiscovered(result) => self.on_services_discovered(result),
            SessionInput::ConnectAttemptFailed(error) => self.on_connect_attempt_failed(error),
            SessionInput::WriteConfirmed { channel, result } => {
                self.on_write_confirmed(channel, result);
            }
            SessionInput::DescriptorWritten { channel, result } => {
                self.on_descriptor_written(channel, result);
            }
            SessionInput::NotificationReceived { channel, value } => {
                self.on_notification(channel, &value);
            }
        }
        std::mem::take(&mut self.outbox)
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    fn on_connect_requested(&mut self, device: DeviceHandle) {
        match self.state {
            SessionState::Disconnected => {}
            SessionState::Failed(_) => {
                info!("Closing failed link before reconnecting");
                self.transport.close();
            }
            ref other => {
                warn!("Connect to {device} requested while {other:?} – ignored");
                return;
            }
        }

        self.reset();
        info!("Connecting to {device} …");
        self.device = Some(device.clone());
        self.set_state(SessionState::Connecting);

        if let Err(e) = self.transport.connect(&device) {
            warn!("Connect to {device} could not be started: {e}");
            self.reset();
            self.outbox.push(SessionEvent::ConnectFailed {
                device,
                error: Some(e),
            });
            self.set_state(SessionState::Disconnected);
        }
    }

    fn on_connect_attempt_failed(&mut self, error: TransportError) {
        if self.state != SessionState::Connecting {
            debug!("Connect failure ({error}) while {:?} – ignored", self.state);
            return;
        }
        warn!("Connection attempt failed: {error}");
        let device = self.device.clone();
        self.transport.close();
        self.reset();
        if let Some(device) = device {
            self.outbox.push(SessionEvent::ConnectFailed {
                device,
                error: Some(error),
            });
        }
        self.set_state(SessionState::Disconnected);
    }

    fn on_disconnect_requested(&mut self) {
        if self.state == SessionState::Disconnected {
            debug!("Disconnect requested while already disconnected");
            return;
        }
        info!("Disconnect requested");
        self.transport.close();
        self.reset();
        self.set_state(SessionState::Disconnected);
    }

    fn on_link_state(&mut self, link: LinkState) {
        match (link, &self.state) {
            (LinkState::Connected, SessionState::Connecting) => {
                self.set_state(SessionState::ServicesDiscovering);
                if let Err(e) = self.transport.discover_services() {
                    self.fail(FailureReason::Transport(e));
                }
            }
            (LinkState::Connected, state) => {
                debug!("Link up while {state:?} – ignored");
            }
            (LinkState::Disconnected, SessionState::Disconnected) => {
                debug!("Link down while already disconnected");
            }
            (LinkState::Disconnected, SessionState::Connecting) => {
                let device = self.device.clone();
                warn!("Connection attempt failed");
                self.transport.close();
                self.reset();
                if let Some(device) = device {
                    self.outbox.push(SessionEvent::ConnectFailed {
                        device,
                        error: None,
                    });
                }
                self.set_state(SessionState::Disconnected);
            }
            (LinkState::Disconnected, state) => {
                info!("Link lost while {state:?}");
                self.transport.close();
                self.reset();
                self.set_state(SessionState::Disconnected);
            }
        }
    }

    fn on_services_discovered(&mut self, result: Result<Option<ServiceHandle>, TransportError>) {
        if self.state != SessionState::ServicesDiscovering {
            debug!("Discovery result while {:?} – ignored", self.state);
            return;
        }
        let service = match result {
            Ok(Some(service)) => service,
            Ok(None) => return self.fail(FailureReason::ServiceMissing),
            Err(e) => return self.fail(FailureReason::Transport(e)),
        };
        if !service.has_characteristic(&CONTROL_CHARACTERISTIC) {
            return self.fail(FailureReason::CharacteristicMissing(ChannelId::Control));
        }
        info!(
            "Muse service {} found with {} characteristic(s)",
            service.uuid,
            service.characteristics.len()
        );
        self.service = Some(service);
        self.set_state(SessionState::Handshaking(HandshakeStep::SelectPreset));
        self.arm_control();
    }

    // ── Handshake ────────────────────────────────────────────────────────────

    /// Enable status notifications on the control channel; the preset is
    /// sent once the descriptor write completes.
    fn arm_control(&mut self) {
        let armed = self
            .transport
            .set_notification(CONTROL_CHARACTERISTIC, true)
            .and_then(|()| {
                self.transport.write_descriptor(
                    CONTROL_CHARACTERISTIC,
                    CCCD_UUID,
                    &ENABLE_NOTIFICATION_VALUE,
                )
            });
        match armed {
            Ok(()) => {
                debug!("Initiated subscription for control channel");
                self.arming_control = true;
            }
            Err(e) => {
                warn!("Control notifications unavailable ({e}); status text will be missing");
                self.send_step(HandshakeStep::SelectPreset);
            }
        }
    }

    fn command_for(&self, step: HandshakeStep) -> Command {
        match step {
            HandshakeStep::SelectPreset => Command::SelectPreset(self.config.preset),
            HandshakeStep::StartStream => Command::StartStream,
            HandshakeStep::RequestStatus => Command::RequestStatus,
        }
    }

    /// Write the command for `step`. A transport refusal is fatal.
    fn send_step(&mut self, step: HandshakeStep) -> bool {
        let command = self.command_for(step);
        match self.transport.write_value(CONTROL_CHARACTERISTIC, command.frame()) {
            Ok(()) => {
                info!("Sent '{command}' ({step})");
                self.pending_control = Some(step);
                true
            }
            Err(e) => {
                error!("Failed to write '{command}': {e}");
                self.fail(FailureReason::Transport(e));
                false
            }
        }
    }

    fn on_write_confirmed(&mut self, channel: Uuid, result: Result<(), TransportError>) {
        if channel != CONTROL_CHARACTERISTIC {
            debug!("Write confirmation for {} – ignored", label_for(&channel));
            return;
        }
        let Some(step) = self.pending_control.take() else {
            debug!("Control write confirmation with nothing outstanding – ignored");
            return;
        };

        if self.handshake_complete {
            // Post-handshake status refresh; never fatal.
            match result {
                Ok(()) => debug!("Status request confirmed"),
                Err(e) => warn!("Status request failed: {e}"),
            }
            return;
        }

        match result {
            Ok(()) => {}
            Err(TransportError::WriteRejected(_)) => {
                error!("{}", ProtocolError::HandshakeRejected(step));
                return self.fail(FailureReason::HandshakeRejected(step));
            }
            Err(e) => return self.fail(FailureReason::Transport(e)),
        }

        info!("'{}' confirmed", self.command_for(step));
        match step.next() {
            Some(next) => {
                self.set_state(SessionState::Handshaking(next));
                // The status write and the channel subscriptions target
                // different attributes, so they proceed side by side.
                if self.send_step(next) && next == HandshakeStep::RequestStatus {
                    self.start_subscriptions();
                }
            }
            None => {
                self.handshake_complete = true;
                self.update_fanout_state();
            }
        }
    }

    fn on_status_requested(&mut self) {
        if self.state != SessionState::Streaming {
            warn!("Status request while {:?} – ignored", self.state);
            return;
        }
        if self.pending_control.is_some() {
            warn!("Status request while a control write is outstanding – ignored");
            return;
        }
        self.send_step(HandshakeStep::RequestStatus);
    }

    // ── Subscriptions ────────────────────────────────────────────────────────

    fn start_subscriptions(&mut self) {
        let Some(service) = self.service.clone() else {
            return;
        };
        let channels = self.config.data_channels.clone();
        match self.sequencer.begin(&mut self.transport, service, &channels) {
            Ok(progress) => self.drive_subscriptions(progress),
            Err(e) => {
                warn!("Channel registration rejected: {e} – continuing without EEG channels");
                self.subscriptions_done = true;
                self.update_fanout_state();
            }
        }
    }

    /// Apply the log-and-continue policy until a request is in flight or the
    /// list is exhausted.
    fn drive_subscriptions(&mut self, mut progress: Progress) {
        loop {
            match progress {
                Progress::Failed { channel, error } => {
                    warn!("Continuing without {channel}");
                    self.outbox
                        .push(SessionEvent::SubscriptionFailed { channel, error });
                    progress = self.sequencer.skip_failed(&mut self.transport);
                }
                Progress::Requested(_) => {
                    self.update_fanout_state();
                    return;
                }
                Progress::AllSubscribed => {
                    self.subscriptions_done = true;
                    self.outbox.push(SessionEvent::AllSubscribed);
                    self.update_fanout_state();
                    return;
                }
                Progress::Idle => return,
            }
        }
    }

    fn on_descriptor_written(&mut self, channel: Uuid, result: Result<(), TransportError>) {
        match ChannelId::from_uuid(&channel) {
            Some(ChannelId::Control) if self.arming_control => {
                self.arming_control = false;
                match result {
                    Ok(()) => info!("Subscribed to control channel"),
                    Err(e) => {
                        warn!("Control subscription failed ({e}); status text will be missing")
                    }
                }
                self.send_step(HandshakeStep::SelectPreset);
            }
            Some(ch) if self.sequencer.in_flight() == Some(ch) => {
                let progress = self.sequencer.on_step_confirmed(&mut self.transport, result);
                self.drive_subscriptions(progress);
            }
            _ => debug!("Descriptor write for {} – ignored", label_for(&channel)),
        }
    }

    /// `Streaming` needs both the status confirmation and the last
    /// subscription; whichever lands first leaves the other to finish.
    fn update_fanout_state(&mut self) {
        let next = match (self.handshake_complete, self.subscriptions_done) {
            (true, true) => SessionState::Streaming,
            (false, false) => SessionState::Handshaking(HandshakeStep::RequestStatus),
            _ => SessionState::SubscribingChannels(self.sequencer.cursor()),
        };
        self.set_state(next);
    }

    // ── Notifications ────────────────────────────────────────────────────────

    fn on_notification(&mut self, uuid: Uuid, value: &[u8]) {
        let Some(channel) = ChannelId::from_uuid(&uuid) else {
            debug!("Notification from {} ({uuid}) dropped", label_for(&uuid));
            return;
        };

        let accepted = if channel.is_data() {
            self.state == SessionState::Streaming
        } else {
            self.service.is_some()
        };
        if !accepted {
            debug!("{channel} notification while {:?} – dropped", self.state);
            return;
        }

        match decode_notification(channel, value) {
            Ok(Decoded::Sample(sample)) => {
                let timestamp_ms = self
                    .trackers
                    .entry(channel)
                    .or_default()
                    .get(sample.timestamp_ticks);
                self.outbox.push(SessionEvent::Sample {
                    sample,
                    timestamp_ms,
                });
            }
            Ok(Decoded::Status(status)) => {
                if status.raw.is_empty() {
                    let err = ProtocolError::UnexpectedNotification {
                        channel: uuid,
                        reason: "empty payload".into(),
                    };
                    warn!("{err}");
                    self.outbox.push(SessionEvent::Status(status));
                    return;
                }
                debug!("Control fragment: {:?}", status.text);
                let response = self.control_acc.push(&status.text);
                self.outbox.push(SessionEvent::Status(status));
                if let Some(response) = response {
                    self.outbox.push(SessionEvent::Control(response));
                }
            }
            Err(e) => warn!("{channel}: {e} – dropped"),
        }
    }

    // ── State helpers ────────────────────────────────────────────────────────

    fn set_state(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        info!("Session: {:?} → {next:?}", self.state);
        self.state = next.clone();
        self.outbox.push(SessionEvent::StateChanged(next));
    }

    /// Enter `Failed`. No further writes are issued; the link stays up until
    /// the owner disconnects or reconnects.
    fn fail(&mut self, reason: FailureReason) {
        error!("Session failed: {reason}");
        self.sequencer.abort();
        self.arming_control = false;
        self.pending_control = None;
        self.set_state(SessionState::Failed(reason.clone()));
        self.outbox.push(SessionEvent::Failed(reason));
    }

    /// Forget everything tied to the current link.
    fn reset(&mut self) {
        self.device = None;
        self.service = None;
        self.arming_control = false;
        self.pending_control = None;
        self.handshake_complete = false;
        self.subscriptions_done = false;
        self.sequencer.abort();
        self.trackers.values_mut().for_each(TimestampTracker::reset);
        self.control_acc.reset();
    }
}
