use std::io::{self, BufRead};

use anyhow::{anyhow, Result};
use log::{error, info, warn};

use muse_connect::muse_client::{MuseClient, MuseClientConfig};
use muse_connect::protocol::Preset;
use muse_connect::types::{SessionEvent, SessionState};

fn parse_args() -> Result<MuseClientConfig> {
    let mut config = MuseClientConfig::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--preset" => {
                let value = args.next().ok_or_else(|| anyhow!("--preset needs a value"))?;
                config.session.preset = value.parse::<Preset>()?;
            }
            "--prefix" => {
                config.name_prefix = args
                    .next()
                    .ok_or_else(|| anyhow!("--prefix needs a value"))?;
            }
            other => {
                return Err(anyhow!(
                    "unknown argument {other:?} (use --preset p21|p51, --prefix <name>)"
                ))
            }
        }
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=muse_connect=debug cargo run
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // ── Configuration ─────────────────────────────────────────────────────────
    let config = parse_args()?;
    info!("Preset: {}", config.session.preset.name());

    // ── Connect ───────────────────────────────────────────────────────────────
    let client = MuseClient::new(config);
    let (handle, mut rx) = client.connect().await?;

    info!("Commands (type + Enter):");
    info!("  s  – request device status");
    info!("  q  – disconnect and quit\n");

    // ── Stdin command loop ────────────────────────────────────────────────────
    // Lines are read on a dedicated OS thread so no StdinLock is held across
    // an await point.
    let stdin_handle = handle.clone();
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let sent = match line.trim() {
                "" => continue,
                "s" => stdin_handle.request_status(),
                "q" => {
                    info!("Quit requested.");
                    stdin_handle.disconnect()
                }
                other => {
                    warn!("Unknown command '{other}' (s = status, q = quit)");
                    continue;
                }
            };
            if let Err(e) = sent {
                error!("{e}");
                break;
            }
        }
    });

    // ── Main event loop ───────────────────────────────────────────────────────
    while let Some(event) = rx.recv().await {
        match event {
            SessionEvent::StateChanged(SessionState::Streaming) => {
                info!("✅  Streaming");
            }
            SessionEvent::StateChanged(SessionState::Disconnected) => {
                info!("❌  Disconnected from device.");
                break;
            }
            SessionEvent::StateChanged(state) => info!("State: {state:?}"),

            SessionEvent::ConnectFailed { device, error } => match error {
                Some(e) => error!("Could not connect to {device}: {e}"),
                None => error!("Could not connect to {device}"),
            },
            SessionEvent::Failed(reason) => {
                error!("Session failed: {reason}");
                handle.disconnect()?;
            }
            SessionEvent::SubscriptionFailed { channel, error } => {
                warn!("No data from {channel}: {error}");
            }
            SessionEvent::AllSubscribed => info!("All EEG channels subscribed"),

            // ── EEG ──────────────────────────────────────────────────────────
            SessionEvent::Sample {
                sample,
                timestamp_ms,
            } => {
                let first = sample.values.first().copied().unwrap_or(f64::NAN);
                println!(
                    "[EEG] ch={:4} idx={:5}  ts={timestamp_ms:.0} ms  sample[0]={first:8.3}",
                    sample.channel_label, sample.timestamp_ticks
                );
            }

            // ── Control ──────────────────────────────────────────────────────
            SessionEvent::Status(status) => {
                log::debug!("[STATUS] {:?}", status.text);
            }
            SessionEvent::Control(resp) => {
                println!("[CONTROL] {}", resp.raw);
            }
        }
    }

    info!("Event loop finished – exiting.");
    Ok(())
}
