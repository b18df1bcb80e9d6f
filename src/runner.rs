//! Async driver for a [`CommandSession`].
//!
//! A single tokio task handles inputs strictly one at a time. They arrive on
//! two queues:
//!
//! - owner requests and transport completions use an unbounded queue, so a
//!   disconnect or a write confirmation is never refused;
//! - notifications use a bounded queue of `event_buffer` entries.
//!
//! Events leave on a bounded channel of the same size. When the consumer
//! stops reading, the task blocks on the event channel, the notification
//! queue fills, and [`SessionInbox::notify`] makes the BLE pump wait.
//! Completions are preferred over queued notifications, so a subscription
//! confirmation is handled before data that followed it.

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::session::{CommandSession, SessionConfig};
use crate::transport::{SessionInput, Transport};
use crate::types::{DeviceHandle, SessionEvent};

/// Where a transport posts what it learns. Cloned into every task that
/// reports back to the session.
#[derive(Debug, Clone)]
pub struct SessionInbox {
    inputs: mpsc::UnboundedSender<SessionInput>,
    notifications: mpsc::Sender<SessionInput>,
}

impl SessionInbox {
    /// Queue a request or completion. `false` once the session task is gone.
    pub fn post(&self, input: SessionInput) -> bool {
        self.inputs.send(input).is_ok()
    }

    /// Queue a notification, waiting while the queue is full.
    /// `false` once the session task is gone.
    pub async fn notify(&self, channel: Uuid, value: Vec<u8>) -> bool {
        self.notifications
            .send(SessionInput::NotificationReceived { channel, value })
            .await
            .is_ok()
    }
}

/// Spawn a session task.
///
/// `make_transport` receives the session's inbox so the transport can post
/// completions and notifications back to it.
///
/// The task ends when the event receiver is dropped; it disconnects the link
/// on its way out.
pub fn spawn_session<T, F>(
    config: SessionConfig,
    make_transport: F,
) -> (SessionHandle, mpsc::Receiver<SessionEvent>)
where
    T: Transport + Send + 'static,
    F: FnOnce(SessionInbox) -> T,
{
    let buffer = config.event_buffer.max(1);
    let (inputs_tx, mut inputs_rx) = mpsc::unbounded_channel::<SessionInput>();
    let (notify_tx, mut notify_rx) = mpsc::channel::<SessionInput>(buffer);
    let (events_tx, events_rx) = mpsc::channel::<SessionEvent>(buffer);

    let inbox = SessionInbox {
        inputs: inputs_tx,
        notifications: notify_tx,
    };
    let transport = make_transport(inbox.clone());
    let mut session = CommandSession::new(transport, config);

    tokio::spawn(async move {
        loop {
            let input = tokio::select! {
                biased;
                Some(input) = inputs_rx.recv() => input,
                Some(input) = notify_rx.recv() => input,
                else => break,
            };
            for event in session.handle(input) {
                if events_tx.send(event).await.is_err() {
                    info!("Event receiver dropped – shutting session down");
                    session.handle(SessionInput::DisconnectRequested);
                    return;
                }
            }
        }
        debug!("Session input queues closed");
    });

    (SessionHandle { inbox }, events_rx)
}

/// Cheap, cloneable control surface for a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    inbox: SessionInbox,
}

impl SessionHandle {
    /// Start connecting to `device`. Ignored unless the session is
    /// `Disconnected` or `Failed`.
    pub fn connect(&self, device: DeviceHandle) -> Result<()> {
        self.send(SessionInput::ConnectRequested(device))
    }

    /// Drop the link and all in-flight work.
    pub fn disconnect(&self) -> Result<()> {
        self.send(SessionInput::DisconnectRequested)
    }

    /// Ask a streaming headband for a status report (`s`).
    pub fn request_status(&self) -> Result<()> {
        self.send(SessionInput::StatusRequested)
    }

    /// Queue an arbitrary input, e.g. a completion from a custom transport.
    ///
    /// Notifications go to the bounded queue without waiting and are
    /// refused while it is full.
    pub fn send(&self, input: SessionInput) -> Result<()> {
        if let SessionInput::NotificationReceived { channel, .. } = &input {
            let channel = *channel;
            return match self.inbox.notifications.try_send(input) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => {
                    warn!("Notification queue full – {channel} value dropped");
                    Err(anyhow!("notification queue full"))
                }
                Err(TrySendError::Closed(_)) => Err(anyhow!("session task has stopped")),
            };
        }
        if self.inbox.post(input) {
            Ok(())
        } else {
            Err(anyhow!("session task has stopped"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelId;
    use crate::transport::LinkState;
    use crate::transport_mock::{MockTransport, Request};
    use crate::types::SessionState;

    fn device() -> DeviceHandle {
        DeviceHandle::new("00:55:DA:B0:00:01", Some("Muse-0001".into()))
    }

    fn eeg_frame() -> Vec<u8> {
        let mut v = vec![0x00, 0x01];
        v.extend([0x08, 0x00].repeat(12));
        v
    }

    /// Answer outstanding requests the way the BLE worker would.
    fn answer(mock: &MockTransport, inbox: &SessionInbox) {
        for request in mock.take_requests() {
            let input = match request {
                Request::Connect(_) => SessionInput::LinkStateChanged(LinkState::Connected),
                Request::DiscoverServices => {
                    SessionInput::ServicesDiscovered(Ok(Some(MockTransport::muse_service())))
                }
                Request::WriteValue { characteristic, .. } => {
                    SessionInput::write_confirmed(characteristic, true)
                }
                Request::WriteDescriptor { characteristic, .. } => {
                    SessionInput::descriptor_written(characteristic, true)
                }
                Request::SetNotification { .. } | Request::Close => continue,
            };
            assert!(inbox.post(input));
        }
    }

    #[tokio::test]
    async fn test_inputs_are_processed_in_order() {
        let mock = MockTransport::new();
        let (handle, mut rx) = spawn_session(SessionConfig::default(), |_| mock.clone());

        handle.connect(device()).unwrap();
        handle
            .send(SessionInput::LinkStateChanged(LinkState::Connected))
            .unwrap();

        assert_eq!(
            rx.recv().await,
            Some(SessionEvent::StateChanged(SessionState::Connecting))
        );
        assert_eq!(
            rx.recv().await,
            Some(SessionEvent::StateChanged(SessionState::ServicesDiscovering))
        );
        assert_eq!(
            mock.requests(),
            [Request::Connect(device()), Request::DiscoverServices]
        );
    }

    #[tokio::test]
    async fn test_dropping_receiver_disconnects() {
        let mock = MockTransport::new();
        let (handle, mut rx) = spawn_session(SessionConfig::default(), |_| mock.clone());
        handle.connect(device()).unwrap();
        assert!(rx.recv().await.is_some());
        drop(rx);

        // The next event fails to send and the task tears the link down.
        handle
            .send(SessionInput::LinkStateChanged(LinkState::Connected))
            .unwrap();
        for _ in 0..100 {
            if mock.requests().last() == Some(&Request::Close) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(mock.requests().last(), Some(&Request::Close));
    }

    #[tokio::test]
    async fn test_transport_receives_inbox() {
        let (tx_slot, rx_slot) = std::sync::mpsc::channel();
        let (handle, mut rx) = spawn_session(SessionConfig::default(), |inbox| {
            tx_slot.send(inbox).unwrap();
            MockTransport::new()
        });
        let transport_inbox = rx_slot.recv().unwrap();

        handle.connect(device()).unwrap();
        assert!(transport_inbox.post(SessionInput::ConnectAttemptFailed(
            crate::error::TransportError::Timeout("connect")
        )));

        assert_eq!(
            rx.recv().await,
            Some(SessionEvent::StateChanged(SessionState::Connecting))
        );
        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::ConnectFailed { error: Some(_), .. })
        ));
    }

    #[tokio::test]
    async fn test_stalled_consumer_bounds_notification_queue() {
        let (tx_slot, rx_slot) = std::sync::mpsc::channel();
        let mock = MockTransport::new();
        let config = SessionConfig {
            event_buffer: 1,
            ..SessionConfig::default()
        };
        let (handle, mut rx) = spawn_session(config, |inbox| {
            tx_slot.send(inbox).unwrap();
            mock.clone()
        });
        let inbox = rx_slot.recv().unwrap();

        handle.connect(device()).unwrap();
        let mut streaming = false;
        while !streaming {
            tokio::task::yield_now().await;
            answer(&mock, &inbox);
            while let Ok(event) = rx.try_recv() {
                streaming |= event == SessionEvent::StateChanged(SessionState::Streaming);
            }
        }

        // Nobody reads `rx` from here on.
        let mut refused = None;
        for i in 0..50 {
            let sent = handle.send(SessionInput::NotificationReceived {
                channel: ChannelId::Tp9.uuid(),
                value: eeg_frame(),
            });
            if sent.is_err() {
                refused = Some(i);
                break;
            }
            tokio::task::yield_now().await;
        }
        let refused = refused.expect("notification queue never filled");
        assert!(refused <= 4, "accepted {refused} notifications");

        // The pump path waits instead of failing.
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            inbox.notify(ChannelId::Tp9.uuid(), eeg_frame()),
        )
        .await;
        assert!(pending.is_err());

        // Reading again drains the backlog and unblocks the pump.
        assert!(matches!(rx.recv().await, Some(SessionEvent::Sample { .. })));
        assert!(matches!(rx.recv().await, Some(SessionEvent::Sample { .. })));
        assert!(inbox.notify(ChannelId::Tp9.uuid(), eeg_frame()).await);
    }
}
