//! GridPulse — main entry point.
//!
//! Wires the adapters to the domain core and runs the two workers:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Adapters: HttpClient · NvsStore · SystemClock ·          │
//! │           OtaPartition · (reboot)                        │
//! │  ───────────────── port boundary ─────────────────────   │
//! │ sampler thread:   DeviceClient ──▶ Ring                  │
//! │ main thread:      Orchestrator (drain → encode → wrap    │
//! │                   → POST → reply dispatch → FOTA)        │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Network attachment and time sync are platform services outside the
//! core; on the host build they are simply absent and `epoch_ms` degrades
//! to the monotonic count.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use log::{info, warn};

use gridpulse::adapters::http::HttpClient;
use gridpulse::adapters::nvs::NvsStore;
use gridpulse::adapters::partition::OtaPartition;
use gridpulse::adapters::time::SystemClock;
use gridpulse::acquisition::Sampler;
use gridpulse::app::ports::RebootPort;
use gridpulse::config::RuntimeConfig;
use gridpulse::device::DeviceClient;
use gridpulse::diagnostics::Diagnostics;
use gridpulse::ring::Ring;
use gridpulse::security::NonceStore;
use gridpulse::transport::{DeviceTransport, RetryPolicy};
use gridpulse::uplink::{Orchestrator, UplinkSettings};

/// Upload window. The ring is sized from this and the sampling period.
const UPLOAD_INTERVAL_MS: u32 = 60_000;

/// Compile-time defaults, overridable via environment on the host build.
struct Settings {
    device_base_url: String,
    cloud_base_url: String,
    auth_token: String,
    device_id: String,
    psk: String,
    secure_envelope: bool,
}

impl Settings {
    fn load() -> Self {
        fn var(name: &str, default: &str) -> String {
            std::env::var(name).unwrap_or_else(|_| default.to_string())
        }
        Self {
            device_base_url: var("GRIDPULSE_DEVICE_URL", "http://127.0.0.1:8080"),
            cloud_base_url: var("GRIDPULSE_CLOUD_URL", "http://127.0.0.1:9000"),
            auth_token: var("GRIDPULSE_API_KEY", ""),
            device_id: var("GRIDPULSE_DEVICE_ID", "gridpulse-01"),
            psk: var("GRIDPULSE_PSK", "change-me"),
            secure_envelope: var("GRIDPULSE_SECURE", "1") != "0",
        }
    }
}

struct SystemReboot;

impl RebootPort for SystemReboot {
    #[cfg(target_os = "espidf")]
    fn reboot(&mut self) {
        info!("rebooting into new firmware");
        unsafe { esp_idf_svc::sys::esp_restart() };
    }

    #[cfg(not(target_os = "espidf"))]
    fn reboot(&mut self) {
        info!("reboot requested (host simulation — exiting)");
        std::process::exit(0);
    }
}

fn init_logger() {
    #[cfg(target_os = "espidf")]
    {
        esp_idf_svc::sys::link_patches();
        esp_idf_svc::log::EspLogger::initialize_default();
    }
    #[cfg(not(target_os = "espidf"))]
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

fn main() -> Result<()> {
    init_logger();
    info!("gridpulse v{} starting", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load();
    let mut store = NvsStore::new().map_err(|e| anyhow::anyhow!("nvs init: {e}"))?;
    let mut partition = OtaPartition::new();
    let clock = SystemClock::new();

    let mut diag = Diagnostics::load_and_count_boot(&mut store);
    info!("boot #{}", diag.boot_count());

    let runtime = RuntimeConfig::load(&store);
    let ring_capacity = Ring::capacity_for(UPLOAD_INTERVAL_MS, runtime.sampling_interval);
    let ring = Arc::new(Mutex::new(Ring::new(ring_capacity)));
    let config = Arc::new(Mutex::new(runtime));
    info!("ring capacity {ring_capacity}");

    let (fault_tx, fault_rx) = crossbeam_channel::bounded(32);
    let (event_tx, event_rx) = crossbeam_channel::bounded(32);

    let retry = RetryPolicy::default();
    let sampler_client = DeviceClient::new(
        DeviceTransport::new(&settings.device_base_url, &settings.auth_token, retry),
        fault_tx.clone(),
    );
    let command_client = DeviceClient::new(
        DeviceTransport::new(&settings.device_base_url, &settings.auth_token, retry),
        fault_tx,
    );

    // One mandatory export-limit write once the link is up. The failure
    // is counted like any other device exchange: the client's fault event
    // reaches the first slot's sim_fault appendix, and the diag counter
    // records it for the `diag` appendix.
    {
        let mut http = HttpClient::new();
        if !command_client.set_export_power(&mut http, 10, "boot") {
            warn!("boot export-power write failed — continuing");
            diag.record_acq_fail_report();
        }
    }

    let running = Arc::new(AtomicBool::new(true));

    // ── sampler thread ────────────────────────────────────────
    let sampler = Sampler::new(
        sampler_client,
        Arc::clone(&ring),
        Arc::clone(&config),
        event_tx,
    );
    let sampler_running = Arc::clone(&running);
    let sampler_thread = std::thread::Builder::new()
        .name("sampler".into())
        .stack_size(48 * 1024)
        .spawn(move || {
            let mut http = HttpClient::new();
            let clock = SystemClock::new();
            sampler.run(&mut http, &clock, sampler_running);
        })
        .expect("sampler thread spawns");

    // ── orchestrator (this thread) ────────────────────────────
    let uplink_settings = UplinkSettings {
        device_id: settings.device_id,
        cloud_base_url: settings.cloud_base_url,
        auth_token: settings.auth_token,
        upload_interval_ms: UPLOAD_INTERVAL_MS,
        secure_envelope: settings.secure_envelope,
        psk: settings.psk.into_bytes(),
        retry,
    };
    let nonces = NonceStore::load(&store);
    let mut orchestrator = Orchestrator::new(
        uplink_settings,
        command_client,
        ring,
        config,
        event_rx,
        fault_rx,
        nonces,
        diag,
    );

    let mut http = HttpClient::new();
    let mut reboot = SystemReboot;
    orchestrator.bootstrap(&partition, &mut store);
    orchestrator.run(
        &mut http,
        &mut store,
        &mut partition,
        &clock,
        &mut reboot,
        running,
    );

    let _ = sampler_thread.join();
    Ok(())
}
