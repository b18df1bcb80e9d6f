use std::time::Duration;

use anyhow::{anyhow, Result};
use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use log::{debug, info};
use tokio::sync::{mpsc, OnceCell};

use crate::ble::{BleTimeouts, BtleplugTransport};
use crate::runner::{spawn_session, SessionHandle};
use crate::session::SessionConfig;
use crate::types::{DeviceHandle, SessionEvent};

// ── MuseClientConfig ──────────────────────────────────────────────────────────

/// Configuration for [`MuseClient`].
#[derive(Debug, Clone)]
pub struct MuseClientConfig {
    /// BLE scan duration in seconds before giving up. Default: `15`.
    pub scan_timeout_secs: u64,
    /// Match devices whose advertised name starts with this string.
    ///
    /// The default `"Muse"` matches all known Muse models.  Use a more
    /// specific prefix (e.g. `"Muse-AB"`) to pick one headband in a room
    /// full of them.  Default: `"Muse"`.
    pub name_prefix: String,
    /// Upper bound on a single connect attempt. Default: `10`.
    pub connect_timeout_secs: u64,
    /// Upper bound on GATT service discovery. Default: `15`.
    pub discovery_timeout_secs: u64,
    /// Settings handed to every session this client opens.
    pub session: SessionConfig,
}

impl Default for MuseClientConfig {
    fn default() -> Self {
        Self {
            scan_timeout_secs: 15,
            name_prefix: "Muse".into(),
            connect_timeout_secs: 10,
            discovery_timeout_secs: 15,
            session: SessionConfig::default(),
        }
    }
}

impl MuseClientConfig {
    fn ble_timeouts(&self) -> BleTimeouts {
        BleTimeouts {
            connect: Duration::from_secs(self.connect_timeout_secs),
            discovery: Duration::from_secs(self.discovery_timeout_secs),
        }
    }
}

// ── MuseClient ────────────────────────────────────────────────────────────────

/// Entry point for live hardware: finds headbands and opens sessions on them.
///
/// The first Bluetooth adapter is acquired lazily and reused, so devices
/// returned by [`scan_all`](Self::scan_all) stay resolvable when passed to
/// [`open_session`](Self::open_session).
pub struct MuseClient {
    config: MuseClientConfig,
    adapter: OnceCell<Adapter>,
}

impl MuseClient {
    pub fn new(config: MuseClientConfig) -> Self {
        Self {
            config,
            adapter: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &MuseClientConfig {
        &self.config
    }

    async fn adapter(&self) -> Result<&Adapter> {
        self.adapter
            .get_or_try_init(|| async {
                let manager = Manager::new().await?;
                let adapter = manager
                    .adapters()
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
                wait_powered_on(&adapter).await;
                Ok::<_, anyhow::Error>(adapter)
            })
            .await
    }

    // ── Public: scan ─────────────────────────────────────────────────────────

    /// Scan for **all** nearby Muse devices and return them.
    ///
    /// The scan runs for `config.scan_timeout_secs` seconds so that every
    /// headband in range gets a chance to advertise.
    pub async fn scan_all(&self) -> Result<Vec<DeviceHandle>> {
        let adapter = self.adapter().await?;

        info!("scan_all: scanning for {} s …", self.config.scan_timeout_secs);
        adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(Duration::from_secs(self.config.scan_timeout_secs)).await;
        adapter.stop_scan().await.ok();

        let mut found = vec![];
        for p in adapter.peripherals().await? {
            if let Some(device) = self.as_muse(&p).await {
                info!("scan_all: found {device}");
                found.push(device);
            }
        }
        info!("scan_all: {} device(s) found", found.len());
        Ok(found)
    }

    /// Poll until the first matching headband appears or the scan timeout
    /// expires.
    pub async fn scan_first(&self) -> Result<DeviceHandle> {
        let adapter = self.adapter().await?;
        let timeout_secs = self.config.scan_timeout_secs;

        info!("Scanning for Muse devices (timeout: {timeout_secs} s) …");
        adapter.start_scan(ScanFilter::default()).await?;
        let result = tokio::time::timeout(Duration::from_secs(timeout_secs), async {
            loop {
                for p in adapter.peripherals().await.unwrap_or_default() {
                    if let Some(device) = self.as_muse(&p).await {
                        return device;
                    }
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        })
        .await;
        adapter.stop_scan().await.ok();

        let device = result
            .map_err(|_| anyhow!("Timed out scanning for a Muse device after {timeout_secs} s"))?;
        info!("Found device: {device}");
        Ok(device)
    }

    async fn as_muse(&self, p: &Peripheral) -> Option<DeviceHandle> {
        let name = p.properties().await.ok()??.local_name?;
        name.starts_with(&self.config.name_prefix)
            .then(|| DeviceHandle::new(p.id().to_string(), Some(name)))
    }

    // ── Public: sessions ─────────────────────────────────────────────────────

    /// Start a session against `device` and begin connecting.
    ///
    /// Progress, samples and failures arrive on the returned receiver; the
    /// handle requests status or disconnects.
    pub async fn open_session(
        &self,
        device: DeviceHandle,
    ) -> Result<(SessionHandle, mpsc::Receiver<SessionEvent>)> {
        let adapter = self.adapter().await?.clone();
        let timeouts = self.config.ble_timeouts();
        let (handle, rx) = spawn_session(self.config.session.clone(), |inbox| {
            BtleplugTransport::new(adapter, inbox, timeouts)
        });
        handle.connect(device)?;
        Ok((handle, rx))
    }

    /// Scan for the first headband and open a session on it.
    pub async fn connect(&self) -> Result<(SessionHandle, mpsc::Receiver<SessionEvent>)> {
        let device = self.scan_first().await?;
        self.open_session(device).await
    }
}

/// macOS: `CBCentralManager` starts in an "unknown" state and silently
/// ignores scans until it reports poweredOn. Elsewhere this is a no-op.
async fn wait_powered_on(adapter: &Adapter) {
    #[cfg(target_os = "macos")]
    {
        use btleplug::api::CentralState;
        use log::warn;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            match adapter.adapter_state().await {
                Ok(CentralState::PoweredOn) => {
                    info!("macOS: adapter is PoweredOn");
                    break;
                }
                Ok(state) if tokio::time::Instant::now() >= deadline => {
                    warn!("macOS: adapter still {state:?} after 3 s, proceeding anyway");
                    break;
                }
                Ok(state) => debug!("macOS: adapter state = {state:?}, waiting…"),
                Err(e) => {
                    warn!("macOS: adapter_state() error: {e}");
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
    #[cfg(not(target_os = "macos"))]
    {
        let _ = adapter;
        debug!("Adapter ready");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Preset;

    #[test]
    fn test_default_config() {
        let c = MuseClientConfig::default();
        assert_eq!(c.scan_timeout_secs, 15);
        assert_eq!(c.name_prefix, "Muse");
        assert_eq!(c.session.preset, Preset::P21);
        let t = c.ble_timeouts();
        assert_eq!(t.connect, Duration::from_secs(10));
        assert_eq!(t.discovery, Duration::from_secs(15));
    }
}
