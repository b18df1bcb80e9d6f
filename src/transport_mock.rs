//! In-memory [`Transport`] that records every request.
//!
//! Nothing is sent anywhere: tests inspect [`MockTransport::requests`] and
//! feed the matching completions back into the session themselves. Clones
//! share one request log, so a test can keep a clone after handing the
//! transport to a running session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use crate::channels::data_channels;
use crate::error::TransportError;
use crate::protocol::{CONTROL_CHARACTERISTIC, MUSE_SERVICE_UUID};
use crate::transport::{ServiceHandle, Transport};
use crate::types::DeviceHandle;

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Connect(DeviceHandle),
    DiscoverServices,
    WriteValue { characteristic: Uuid, value: Vec<u8> },
    SetNotification { characteristic: Uuid, enabled: bool },
    WriteDescriptor { characteristic: Uuid, descriptor: Uuid, value: Vec<u8> },
    Close,
}

#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    log: Arc<Mutex<Vec<Request>>>,
    /// Refuse `connect` with this error.
    pub connect_error: Option<TransportError>,
    /// Refuse writes (value or descriptor) to these characteristics.
    pub rejected_writes: HashMap<Uuid, TransportError>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A service exposing the control channel and all four EEG channels.
    pub fn muse_service() -> ServiceHandle {
        let mut characteristics = vec![CONTROL_CHARACTERISTIC];
        characteristics.extend(data_channels().iter().map(|c| c.uuid()));
        ServiceHandle {
            uuid: MUSE_SERVICE_UUID,
            characteristics,
        }
    }

    /// Snapshot of every request recorded so far.
    pub fn requests(&self) -> Vec<Request> {
        self.log().clone()
    }

    /// Return and forget the recorded requests.
    pub fn take_requests(&self) -> Vec<Request> {
        std::mem::take(&mut *self.log())
    }

    fn log(&self) -> MutexGuard<'_, Vec<Request>> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, request: Request) {
        self.log().push(request);
    }

    fn check_write(&self, characteristic: Uuid) -> Result<(), TransportError> {
        match self.rejected_writes.get(&characteristic) {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

impl Transport for MockTransport {
    fn connect(&mut self, device: &DeviceHandle) -> Result<(), TransportError> {
        self.record(Request::Connect(device.clone()));
        match &self.connect_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn discover_services(&mut self) -> Result<(), TransportError> {
        self.record(Request::DiscoverServices);
        Ok(())
    }

    fn write_value(&mut self, characteristic: Uuid, value: &[u8]) -> Result<(), TransportError> {
        self.check_write(characteristic)?;
        self.record(Request::WriteValue {
            characteristic,
            value: value.to_vec(),
        });
        Ok(())
    }

    fn set_notification(
        &mut self,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), TransportError> {
        self.record(Request::SetNotification {
            characteristic,
            enabled,
        });
        Ok(())
    }

    fn write_descriptor(
        &mut self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        self.check_write(characteristic)?;
        self.record(Request::WriteDescriptor {
            characteristic,
            descriptor,
            value: value.to_vec(),
        });
        Ok(())
    }

    fn close(&mut self) {
        self.record(Request::Close);
    }
}
