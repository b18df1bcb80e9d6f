//! # muse-connect
//!
//! Session engine for streaming EEG from
//! [Interaxon Muse](https://choosemuse.com/) headbands over Bluetooth Low
//! Energy.
//!
//! A [`session::CommandSession`] walks one headband from link-up to
//! streaming: it discovers the Muse service, arms status notifications,
//! sends the `p21` → `d` → `s` handshake one confirmed write at a time and
//! subscribes the four EEG electrodes in order. Decoded samples, status text
//! and every state change come out as [`types::SessionEvent`]s.
//!
//! The session is sans-IO. Anything implementing [`transport::Transport`]
//! can drive it: [`ble::BtleplugTransport`] for real hardware,
//! [`transport_mock::MockTransport`] for tests.
//!
//! ## Quick start
//!
//! ```no_run
//! use muse_connect::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = MuseClient::new(MuseClientConfig::default());
//!     let (handle, mut rx) = client.connect().await?;
//!
//!     while let Some(event) = rx.recv().await {
//!         match event {
//!             SessionEvent::Sample { sample, .. } => {
//!                 println!("{}: {:?}", sample.channel_label, sample.values)
//!             }
//!             SessionEvent::StateChanged(SessionState::Disconnected) => break,
//!             _ => {}
//!         }
//!     }
//!     handle.disconnect()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`protocol`] | GATT UUIDs, presets, command frames, response decoding |
//! | [`parse`] | Notification decoders and control JSON reassembly |
//! | [`channels`] | The five Muse characteristics and their labels |
//! | [`session`] | The connection/handshake/subscription state machine |
//! | [`sequencer`] | One-at-a-time EEG subscription cursor |
//! | [`runner`] | tokio task that serializes session inputs |
//! | [`transport`] | The request/completion contract with the BLE stack |
//! | [`ble`] | `btleplug` implementation of the transport |
//! | [`muse_client`] | Adapter setup, scanning, opening live sessions |
//! | [`types`] | Events, states and decoded data |
//! | [`error`] | Typed errors |

pub mod ble;
pub mod channels;
pub mod error;
pub mod muse_client;
pub mod parse;
pub mod protocol;
pub mod runner;
pub mod sequencer;
pub mod session;
pub mod timestamp;
pub mod transport;
pub mod transport_mock;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
///
/// ```no_run
/// use muse_connect::prelude::*;
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let client = MuseClient::new(MuseClientConfig::default());
/// let device = client.scan_first().await?;
/// let (_handle, mut rx) = client.open_session(device).await?;
///
/// while let Some(ev) = rx.recv().await {
///     if let SessionEvent::Status(status) = ev {
///         println!("{}", status.text);
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub mod prelude {
    // ── Client ────────────────────────────────────────────────────────────────
    pub use crate::muse_client::{MuseClient, MuseClientConfig};
    pub use crate::runner::{spawn_session, SessionHandle, SessionInbox};
    pub use crate::session::{CommandSession, SessionConfig};

    // ── Events and data types ─────────────────────────────────────────────────
    pub use crate::channels::ChannelId;
    pub use crate::types::{
        ControlResponse, DeviceHandle, FailureReason, HandshakeStep, Sample, SessionEvent,
        SessionState, StatusEvent,
    };

    // ── Transport ─────────────────────────────────────────────────────────────
    pub use crate::transport::{LinkState, ServiceHandle, SessionInput, Transport};

    // ── Protocol ──────────────────────────────────────────────────────────────
    pub use crate::error::Error;
    pub use crate::protocol::{Command, Preset, EEG_FREQUENCY, EEG_SAMPLES_PER_READING};
}
