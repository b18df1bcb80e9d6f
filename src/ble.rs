//! [`Transport`] backed by `btleplug`.
//!
//! The trait methods are synchronous, so every call becomes a [`Op`] on an
//! unbounded queue consumed by one worker task. The worker runs operations
//! strictly in order against the peripheral and posts each completion, with
//! its error if any, into the session's inbox. Two helper tasks live for the
//! duration of a link:
//!
//! * the **notification pump** forwards `ValueNotification`s for
//!   characteristics whose notification flag is set, waiting whenever the
//!   session's notification queue is full;
//! * the **disconnect watcher** listens on the adapter's `CentralEvent`
//!   stream and reports `DeviceDisconnected` for this peripheral.
//!
//! Both are aborted before a new connect or on close, so a torn-down link
//! cannot post into the next attempt.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use btleplug::api::{Central, CentralEvent, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::TransportError;
use crate::protocol::{CCCD_UUID, MUSE_SERVICE_UUID};
use crate::runner::SessionInbox;
use crate::transport::{LinkState, ServiceHandle, SessionInput, Transport};
use crate::types::DeviceHandle;

/// Bounds for the two operations that can hang on a misbehaving stack.
#[derive(Debug, Clone, Copy)]
pub struct BleTimeouts {
    pub connect: Duration,
    pub discovery: Duration,
}

impl Default for BleTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            discovery: Duration::from_secs(15),
        }
    }
}

#[derive(Debug)]
enum Op {
    Connect(DeviceHandle),
    Discover,
    Write { characteristic: Uuid, value: Vec<u8> },
    WriteDescriptor { characteristic: Uuid, descriptor: Uuid, value: Vec<u8> },
    Close,
}

type EnabledSet = Arc<Mutex<HashSet<Uuid>>>;

pub struct BtleplugTransport {
    ops: mpsc::UnboundedSender<Op>,
    enabled: EnabledSet,
}

impl BtleplugTransport {
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn new(adapter: Adapter, inbox: SessionInbox, timeouts: BleTimeouts) -> Self {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let enabled = EnabledSet::default();
        let worker = Worker {
            adapter,
            inbox,
            timeouts,
            enabled: Arc::clone(&enabled),
            peripheral: None,
            tasks: Vec::new(),
        };
        tokio::spawn(worker.run(ops_rx));
        Self {
            ops: ops_tx,
            enabled,
        }
    }

    fn queue(&self, op: Op) -> Result<(), TransportError> {
        self.ops.send(op).map_err(|_| TransportError::LinkClosed)
    }
}

impl Transport for BtleplugTransport {
    fn connect(&mut self, device: &DeviceHandle) -> Result<(), TransportError> {
        self.queue(Op::Connect(device.clone()))
    }

    fn discover_services(&mut self) -> Result<(), TransportError> {
        self.queue(Op::Discover)
    }

    fn write_value(&mut self, characteristic: Uuid, value: &[u8]) -> Result<(), TransportError> {
        self.queue(Op::Write {
            characteristic,
            value: value.to_vec(),
        })
    }

    fn set_notification(
        &mut self,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), TransportError> {
        let mut set = self.enabled.lock().unwrap_or_else(PoisonError::into_inner);
        if enabled {
            set.insert(characteristic);
        } else {
            set.remove(&characteristic);
        }
        Ok(())
    }

    fn write_descriptor(
        &mut self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        self.queue(Op::WriteDescriptor {
            characteristic,
            descriptor,
            value: value.to_vec(),
        })
    }

    fn close(&mut self) {
        if self.queue(Op::Close).is_err() {
            debug!("BLE worker already gone");
        }
    }
}

// ── Worker ────────────────────────────────────────────────────────────────────

struct Worker {
    adapter: Adapter,
    inbox: SessionInbox,
    timeouts: BleTimeouts,
    enabled: EnabledSet,
    peripheral: Option<Peripheral>,
    /// Pump and watcher of the current link.
    tasks: Vec<JoinHandle<()>>,
}

impl Worker {
    async fn run(mut self, mut ops: mpsc::UnboundedReceiver<Op>) {
        while let Some(op) = ops.recv().await {
            debug!("BLE op: {op:?}");
            match op {
                Op::Connect(device) => self.connect(&device).await,
                Op::Discover => {
                    let result = self.discover().await;
                    self.post(SessionInput::ServicesDiscovered(result));
                }
                Op::Write {
                    characteristic,
                    value,
                } => {
                    let result = self.write(characteristic, &value).await;
                    self.post(SessionInput::WriteConfirmed {
                        channel: characteristic,
                        result,
                    });
                }
                Op::WriteDescriptor {
                    characteristic,
                    descriptor,
                    value,
                } => {
                    let result = self
                        .write_descriptor(characteristic, descriptor, &value)
                        .await;
                    self.post(SessionInput::DescriptorWritten {
                        channel: characteristic,
                        result,
                    });
                }
                Op::Close => self.teardown().await,
            }
        }
        self.teardown().await;
        debug!("BLE worker stopped");
    }

    fn post(&self, input: SessionInput) {
        if !self.inbox.post(input) {
            debug!("Session gone; dropping BLE completion");
        }
    }

    async fn connect(&mut self, device: &DeviceHandle) {
        self.teardown().await;
        match self.open(device).await {
            Ok(peripheral) => {
                info!("Connected: {device}");
                self.spawn_link_tasks(&peripheral).await;
                self.peripheral = Some(peripheral);
                self.post(SessionInput::LinkStateChanged(LinkState::Connected));
            }
            Err(e) => {
                warn!("Connect to {device} failed: {e}");
                self.post(SessionInput::ConnectAttemptFailed(e));
            }
        }
    }

    async fn open(&self, device: &DeviceHandle) -> Result<Peripheral, TransportError> {
        let peripheral = self
            .adapter
            .peripherals()
            .await
            .map_err(map_err)?
            .into_iter()
            .find(|p| p.id().to_string() == device.address)
            .ok_or_else(|| TransportError::DeviceNotFound(device.address.clone()))?;

        // BlueZ's Device1.Connect can block forever when the device is out of
        // range or the stack is wedged.
        tokio::time::timeout(self.timeouts.connect, peripheral.connect())
            .await
            .map_err(|_| TransportError::Timeout("connect"))?
            .map_err(map_err)?;
        Ok(peripheral)
    }

    async fn spawn_link_tasks(&mut self, peripheral: &Peripheral) {
        match peripheral.notifications().await {
            Ok(mut stream) => {
                let inbox = self.inbox.clone();
                let enabled = Arc::clone(&self.enabled);
                self.tasks.push(tokio::spawn(async move {
                    while let Some(n) = stream.next().await {
                        let wanted = enabled
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .contains(&n.uuid);
                        if !wanted {
                            debug!("Notification from {} without flag – dropped", n.uuid);
                            continue;
                        }
                        if !inbox.notify(n.uuid, n.value).await {
                            break;
                        }
                    }
                    debug!("Notification stream ended");
                }));
            }
            Err(e) => warn!("Could not open notification stream: {e}"),
        }

        // Adapter events fire on link loss (power-off, out of range) well
        // before the notification stream closes.
        match self.adapter.events().await {
            Ok(mut events) => {
                let inbox = self.inbox.clone();
                let id = peripheral.id();
                self.tasks.push(tokio::spawn(async move {
                    while let Some(event) = events.next().await {
                        if let CentralEvent::DeviceDisconnected(gone) = event {
                            if gone == id {
                                info!("Disconnect watcher: {gone:?} disconnected");
                                inbox.post(SessionInput::LinkStateChanged(LinkState::Disconnected));
                                break;
                            }
                        }
                    }
                }));
            }
            Err(e) => warn!("Disconnect watcher: could not subscribe to adapter events: {e}"),
        }
    }

    async fn discover(&self) -> Result<Option<ServiceHandle>, TransportError> {
        let peripheral = self.peripheral.as_ref().ok_or(TransportError::LinkClosed)?;

        // BlueZ reports the connection before its GATT cache is populated;
        // discovering too early returns an empty set.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        tokio::time::timeout(self.timeouts.discovery, peripheral.discover_services())
            .await
            .map_err(|_| TransportError::Timeout("discover_services"))?
            .map_err(map_err)?;

        let service = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == MUSE_SERVICE_UUID)
            .map(|s| ServiceHandle {
                uuid: s.uuid,
                characteristics: s.characteristics.iter().map(|c| c.uuid).collect(),
            });
        match &service {
            Some(s) => info!("Discovered {} ({} characteristics)", s.uuid, s.characteristics.len()),
            None => warn!("Muse service {MUSE_SERVICE_UUID} not advertised by peripheral"),
        }
        Ok(service)
    }

    fn find_char(&self, uuid: Uuid) -> Result<(&Peripheral, Characteristic), TransportError> {
        let peripheral = self.peripheral.as_ref().ok_or(TransportError::LinkClosed)?;
        let c = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(TransportError::CharacteristicMissing(uuid))?;
        Ok((peripheral, c))
    }

    /// A GATT error status from the peripheral surfaces as `WriteRejected`;
    /// link and permission failures keep their own variants.
    async fn write(&self, characteristic: Uuid, value: &[u8]) -> Result<(), TransportError> {
        let result = match self.find_char(characteristic) {
            Ok((p, c)) => p
                .write(&c, value, WriteType::WithResponse)
                .await
                .map_err(|e| rejected(characteristic, e)),
            Err(e) => Err(e),
        };
        log_outcome("write", characteristic, result)
    }

    /// CCCD writes go through `subscribe`/`unsubscribe`, which is the only
    /// portable way to toggle notifications (CoreBluetooth forbids direct
    /// CCCD writes). Other descriptors are written as-is.
    async fn write_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        let result = match self.find_char(characteristic) {
            Ok((p, c)) if descriptor == CCCD_UUID => {
                if value.first().is_some_and(|&b| b != 0) {
                    p.subscribe(&c).await.map_err(|e| rejected(characteristic, e))
                } else {
                    p.unsubscribe(&c).await.map_err(|e| rejected(characteristic, e))
                }
            }
            Ok((p, c)) => match c.descriptors.iter().find(|d| d.uuid == descriptor) {
                Some(d) => p.write_descriptor(d, value).await.map_err(map_err),
                None => Err(TransportError::CharacteristicMissing(descriptor)),
            },
            Err(e) => Err(e),
        };
        log_outcome("descriptor write", characteristic, result)
    }

    async fn teardown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.enabled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        if let Some(peripheral) = self.peripheral.take() {
            info!("Disconnecting {:?}", peripheral.id());
            if let Err(e) = peripheral.disconnect().await {
                debug!("disconnect(): {e}");
            }
        }
    }
}

fn log_outcome(
    what: &str,
    characteristic: Uuid,
    result: Result<(), TransportError>,
) -> Result<(), TransportError> {
    match &result {
        Ok(()) => debug!("{what} to {characteristic} ok"),
        Err(e) => warn!("{what} to {characteristic} failed: {e}"),
    }
    result
}

/// Backend errors on a write are the peripheral's answer, not a link fault.
fn rejected(characteristic: Uuid, e: btleplug::Error) -> TransportError {
    match map_err(e) {
        TransportError::Backend(msg) => {
            debug!("write to {characteristic}: {msg}");
            TransportError::WriteRejected(characteristic)
        }
        other => other,
    }
}

fn map_err(e: btleplug::Error) -> TransportError {
    match e {
        btleplug::Error::PermissionDenied => TransportError::PermissionDenied,
        btleplug::Error::NotConnected => TransportError::LinkClosed,
        btleplug::Error::DeviceNotFound => TransportError::DeviceNotFound(String::new()),
        btleplug::Error::TimedOut(_) => TransportError::Timeout("btleplug"),
        other => TransportError::Backend(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CONTROL_CHARACTERISTIC;

    #[test]
    fn test_write_errors_keep_their_cause() {
        assert_eq!(
            rejected(CONTROL_CHARACTERISTIC, btleplug::Error::PermissionDenied),
            TransportError::PermissionDenied
        );
        assert_eq!(
            rejected(CONTROL_CHARACTERISTIC, btleplug::Error::NotConnected),
            TransportError::LinkClosed
        );
        assert_eq!(
            rejected(
                CONTROL_CHARACTERISTIC,
                btleplug::Error::NotSupported("write".into())
            ),
            TransportError::WriteRejected(CONTROL_CHARACTERISTIC)
        );
    }

    #[test]
    fn test_log_outcome_passes_result_through() {
        let err = Err(TransportError::Timeout("connect"));
        assert_eq!(log_outcome("write", CONTROL_CHARACTERISTIC, err.clone()), err);
        assert_eq!(log_outcome("write", CONTROL_CHARACTERISTIC, Ok(())), Ok(()));
    }
}
