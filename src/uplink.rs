//! Uplink orchestrator — the slot-quantized consumer side.
//!
//! Each slot:
//!
//! 1. adopt a staged runtime config (persist it)
//! 2. drain the ring and the leaf event channels
//! 3. encode the batch (self-checked) or a `codec:"none"` sentinel
//! 4. merge the one-shot appendices at the body root
//! 5. wrap in the authenticated envelope when enabled
//! 6. POST to the cloud with bounded retries
//! 7. verify + interpret the reply (tolerant, per-key isolation)
//! 8. drive the FOTA engine's finalize
//! 9. execute a staged export-power command
//!
//! A reply carrying both a configuration update and a command is handled
//! atomically at the end of the slot: the config is staged for the next
//! slot, the command executes immediately and is reported next slot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::Receiver;
use log::{info, warn};
use serde_json::{json, Map, Value};

use crate::app::events::{AppEvent, DeviceFault, FaultEvent};
use crate::app::ports::{
    ClockPort, HttpPort, RebootPort, RegionState, StoragePort, UpdatePartitionPort,
};
use crate::codec;
use crate::config::{map_field_names, RuntimeConfig};
use crate::device::DeviceClient;
use crate::diagnostics::Diagnostics;
use crate::fota::{FotaEngine, Manifest};
use crate::ring::Ring;
use crate::sample::TimestampedRecord;
use crate::security::{self, NonceStore};
use crate::transport::RetryPolicy;

/// Per-call timeout for cloud exchanges.
const UPLINK_TIMEOUT_MS: u32 = 8_000;

/// Cloud-side settings the orchestrator runs with.
#[derive(Debug, Clone)]
pub struct UplinkSettings {
    pub device_id: String,
    pub cloud_base_url: String,
    pub auth_token: String,
    pub upload_interval_ms: u32,
    /// Wrap bodies and verify replies with the HMAC envelope.
    pub secure_envelope: bool,
    pub psk: Vec<u8>,
    pub retry: RetryPolicy,
}

/// What one slot did — surfaced for tests and the main-loop log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct SlotOutcome {
    pub samples: usize,
    pub posted: bool,
    pub reply_handled: bool,
}

pub struct Orchestrator {
    settings: UplinkSettings,
    upload_url: String,
    /// Client used for command execution (write path).
    device: DeviceClient,
    ring: Arc<Mutex<Ring>>,
    config: Arc<Mutex<RuntimeConfig>>,
    events_rx: Receiver<AppEvent>,
    faults_rx: Receiver<FaultEvent>,
    fota: FotaEngine,
    nonces: NonceStore,
    diag: Diagnostics,

    // ── staged one-shot state ─────────────────────────────────
    staged_config: Option<RuntimeConfig>,
    config_ack: Option<Value>,
    pending_command: Option<i64>,
    command_result: Option<Value>,
    fota_progress: Option<(u32, u32)>,
    fota_report: Option<(bool, bool)>,
    fota_failed_version: Option<String>,
    boot_ack_pending: bool,
    boot_ok_to_report: bool,
    event_tags: Vec<&'static str>,
    last_fault: Option<FaultEvent>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: UplinkSettings,
        device: DeviceClient,
        ring: Arc<Mutex<Ring>>,
        config: Arc<Mutex<RuntimeConfig>>,
        events_rx: Receiver<AppEvent>,
        faults_rx: Receiver<FaultEvent>,
        nonces: NonceStore,
        diag: Diagnostics,
    ) -> Self {
        let upload_url = format!(
            "{}/api/device/upload",
            settings.cloud_base_url.trim_end_matches('/')
        );
        Self {
            settings,
            upload_url,
            device,
            ring,
            config,
            events_rx,
            faults_rx,
            fota: FotaEngine::new(),
            nonces,
            diag,
            staged_config: None,
            config_ack: None,
            pending_command: None,
            command_result: None,
            fota_progress: None,
            fota_report: None,
            fota_failed_version: None,
            boot_ack_pending: false,
            boot_ok_to_report: false,
            event_tags: Vec::new(),
            last_fault: None,
        }
    }

    /// Inspect boot-time region states: a pending-verify image waits for
    /// its liveness proof (first successful uplink); an invalid update
    /// region means the previous apply rolled back.
    pub fn bootstrap(&mut self, part: &impl UpdatePartitionPort, store: &mut impl StoragePort) {
        if part.running_state() == RegionState::PendingVerify {
            info!("uplink: running image pending verify — will confirm after first upload");
            self.boot_ack_pending = true;
        }
        if part.update_region_state() == RegionState::Invalid {
            warn!("uplink: previous firmware rolled back");
            self.fota.acknowledge_rollback(store);
            self.fota_failed_version = self.fota.take_failed_version();
            self.event_tags.push("fota_rollback");
        }
    }

    // ── Slot ──────────────────────────────────────────────────

    pub fn run_slot(
        &mut self,
        http: &mut impl HttpPort,
        store: &mut impl StoragePort,
        part: &mut impl UpdatePartitionPort,
        clock: &impl ClockPort,
        reboot: &mut impl RebootPort,
    ) -> SlotOutcome {
        let mut outcome = SlotOutcome::default();

        // 1. adopt staged config
        if let Some(next) = self.staged_config.take() {
            if next.save(store).is_err() {
                warn!("uplink: staged config persist failed");
            }
            *self.config.lock().expect("config mutex") = next;
            info!("uplink: staged configuration adopted");
        }

        // 2. drain leaf channels, then the ring
        self.drain_channels();
        let (records, dropped) = {
            let mut ring = self.ring.lock().expect("ring mutex");
            (ring.snapshot_and_clear(), ring.take_dropped())
        };
        if dropped > 0 {
            self.diag.record_dropped_samples(dropped);
        }
        outcome.samples = records.len();

        // 3 + 4. body and appendices
        let mut body = self.build_batch_body(&records, clock);
        self.merge_appendices(&mut body, clock);
        let body_str = Value::Object(body).to_string();

        // 5. envelope
        let wire = if self.settings.secure_envelope {
            let nonce = self.nonces.next_device_nonce(store);
            security::wrap(&body_str, &self.settings.psk, nonce)
        } else {
            body_str
        };

        // 6. POST
        let reply = self.post_with_retry(http, wire.as_bytes());
        let Some(reply) = reply else {
            self.diag.record_uplink_failure(store);
            return outcome;
        };
        outcome.posted = true;

        // First successful uplink proves the new image is alive.
        if self.boot_ack_pending {
            match part.mark_valid() {
                Ok(()) => {
                    info!("uplink: firmware marked valid (rollback cancelled)");
                    self.boot_ack_pending = false;
                    self.boot_ok_to_report = true;
                    self.fota.acknowledge_boot_ok(store);
                }
                Err(_) => warn!("uplink: mark_valid failed — retrying next slot"),
            }
        }

        // 7. verify + interpret
        if let Some(inner) = self.authenticate_reply(&reply, store) {
            outcome.reply_handled = self.handle_reply(&inner, part, store);
        }

        // 8. FOTA finalize
        let fin = self.fota.finalize_and_apply(part, store);
        if fin.attempted {
            self.fota_report = Some((fin.verify_ok, fin.apply_ok));
            self.fota_failed_version = self.fota.take_failed_version();
            if fin.apply_ok {
                info!("uplink: firmware applied — handing off to reboot");
                reboot.reboot();
            }
        }

        // 9. execute a staged command
        if let Some(value) = self.pending_command.take() {
            let ok = self
                .device
                .set_export_power(http, value as i32, "cloud-command");
            self.command_result = Some(json!({
                "status": if ok { "success" } else { "failure" },
                "executed_at": clock.epoch_ms(),
                "value": value,
            }));
        }

        outcome
    }

    /// Slot loop. Sleeps out the remainder of each slot; the period is
    /// fixed at startup.
    pub fn run(
        mut self,
        http: &mut impl HttpPort,
        store: &mut impl StoragePort,
        part: &mut impl UpdatePartitionPort,
        clock: &impl ClockPort,
        reboot: &mut impl RebootPort,
        running: Arc<AtomicBool>,
    ) {
        while running.load(Ordering::Relaxed) {
            let slot_start = clock.monotonic_ms();
            let outcome = self.run_slot(http, store, part, clock, reboot);
            info!(
                "uplink: slot done (samples={} posted={})",
                outcome.samples, outcome.posted
            );

            let elapsed = clock.monotonic_ms().saturating_sub(slot_start);
            let remaining = u64::from(self.settings.upload_interval_ms).saturating_sub(elapsed);
            std::thread::sleep(std::time::Duration::from_millis(remaining));
        }
    }

    // ── internals ─────────────────────────────────────────────

    fn drain_channels(&mut self) {
        for fault in self.faults_rx.try_iter() {
            self.event_tags.push(fault.fault.tag());
            self.last_fault = Some(fault);
        }
        for event in self.events_rx.try_iter() {
            match event {
                AppEvent::BufferOverflow => self.diag.record_buffer_overflow(),
                AppEvent::AcqReadFail => self.diag.record_acq_fail_report(),
                AppEvent::SimFault(f) => self.last_fault = Some(f),
            }
            self.event_tags.push(event.tag());
        }
    }

    fn build_batch_body(
        &mut self,
        records: &[TimestampedRecord],
        clock: &impl ClockPort,
    ) -> Map<String, Value> {
        let mut body = Map::new();
        body.insert("device_id".into(), self.settings.device_id.clone().into());
        body.insert("seq".into(), 0.into());

        if records.is_empty() {
            body.insert("codec".into(), "none".into());
            body.insert("ts".into(), clock.epoch_ms().into());
            return body;
        }

        let (blob, report) = codec::run_self_check(records, clock);
        if !report.lossless_ok {
            // Still sent; the flag tells the server not to trust the blob.
            self.event_tags.push("codec_self_check");
        }

        use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
        body.insert("ts_start".into(), records[0].epoch_ms.into());
        body.insert(
            "ts_end".into(),
            records[records.len() - 1].epoch_ms.into(),
        );
        body.insert("codec".into(), report.method.into());
        body.insert(
            "order".into(),
            Value::Array(codec::field_order().iter().map(|n| (*n).into()).collect()),
        );
        body.insert(
            "ts_list".into(),
            Value::Array(records.iter().map(|r| r.epoch_ms.into()).collect()),
        );
        body.insert("block_b64".into(), BASE64.encode(&blob).into());
        body.insert("orig_samples".into(), report.n_samples.into());
        body.insert("orig_bytes".into(), report.orig_bytes.into());
        body.insert("comp_bytes".into(), report.comp_bytes.into());
        body.insert("encode_ms".into(), report.encode_ms.into());
        body.insert("lossless_ok".into(), report.lossless_ok.into());
        body
    }

    fn merge_appendices(&mut self, body: &mut Map<String, Value>, clock: &impl ClockPort) {
        if let Some(result) = self.command_result.take() {
            body.insert("command_result".into(), result);
        }
        if let Some(ack) = self.config_ack.take() {
            body.insert("config_ack".into(), ack);
        }

        let mut fota = Map::new();
        if self.fota.session_active() {
            fota.insert("next_chunk".into(), self.fota.next_chunk_for_cloud().into());
        }
        if let Some((written, total)) = self.fota_progress.take() {
            fota.insert("progress".into(), json!({"written": written, "total": total}));
        }
        if let Some((verify_ok, apply_ok)) = self.fota_report.take() {
            fota.insert("verify".into(), if verify_ok { "ok" } else { "fail" }.into());
            fota.insert("apply".into(), if apply_ok { "ok" } else { "fail" }.into());
        }
        if self.boot_ok_to_report {
            self.boot_ok_to_report = false;
            fota.insert("boot_ok".into(), true.into());
        }
        if let Some(version) = self.fota_failed_version.take() {
            fota.insert("failed_version".into(), version.into());
        }
        if let Some(tag) = self.fota.last_error() {
            fota.insert("error".into(), tag.into());
        }
        if !fota.is_empty() {
            body.insert("fota".into(), Value::Object(fota));
        }

        if let Some(fault) = self.last_fault.take() {
            let mut sim = Map::new();
            sim.insert("kind".into(), fault.fault.tag().into());
            sim.insert("addr".into(), fault.addr.into());
            sim.insert("count".into(), fault.count.into());
            sim.insert("write".into(), fault.write.into());
            if let DeviceFault::Exception(code) = fault.fault {
                sim.insert("exception".into(), code.into());
                sim.insert(
                    "exception_name".into(),
                    crate::modbus::exception_name(code).into(),
                );
            }
            body.insert("sim_fault".into(), Value::Object(sim));
        }

        if let Some(diag) = self.diag.take_snapshot_if_changed(clock) {
            body.insert("diag".into(), diag);
        }

        if !self.event_tags.is_empty() {
            let tags = core::mem::take(&mut self.event_tags);
            body.insert(
                "events".into(),
                Value::Array(tags.into_iter().map(Into::into).collect()),
            );
        }
    }

    fn post_with_retry(&self, http: &mut impl HttpPort, body: &[u8]) -> Option<Vec<u8>> {
        let headers = [
            ("Content-Type", "application/json"),
            ("Authorization", self.settings.auth_token.as_str()),
        ];
        for attempt in 0..=self.settings.retry.retries {
            if attempt > 0 {
                std::thread::sleep(std::time::Duration::from_millis(u64::from(
                    self.settings.retry.delay_for_attempt(attempt - 1),
                )));
            }
            match http.post(&self.upload_url, &headers, body, UPLINK_TIMEOUT_MS) {
                Ok(resp) if (200..300).contains(&resp.status) && !resp.body.is_empty() => {
                    return Some(resp.body);
                }
                Ok(resp) => warn!("uplink: POST rejected (status={})", resp.status),
                Err(e) => warn!("uplink: POST failed ({e})"),
            }
        }
        None
    }

    /// Strip the envelope (when in use) and return the inner JSON text.
    fn authenticate_reply(&mut self, reply: &[u8], store: &mut impl StoragePort) -> Option<String> {
        if !self.settings.secure_envelope {
            return String::from_utf8(reply.to_vec()).ok();
        }
        let text = core::str::from_utf8(reply).ok()?;
        let mut last_seen = self.nonces.cloud_nonce();
        match security::unwrap_and_verify(text, &self.settings.psk, &mut last_seen, true) {
            Ok(inner) => {
                self.nonces.commit_cloud_nonce(last_seen, store);
                String::from_utf8(inner).ok()
            }
            Err(e) => {
                warn!("uplink: reply envelope rejected ({e})");
                self.event_tags.push("reply_rejected");
                None
            }
        }
    }

    /// Interpret the inner reply. Each sub-object is isolated: a malformed
    /// one is skipped without tainting the rest.
    fn handle_reply(
        &mut self,
        inner: &str,
        part: &mut impl UpdatePartitionPort,
        store: &mut impl StoragePort,
    ) -> bool {
        let value: Value = match serde_json::from_str(inner) {
            Ok(v) => v,
            Err(_) => {
                warn!("uplink: reply is not JSON — ignored");
                return false;
            }
        };
        let Some(obj) = value.as_object() else {
            return false;
        };

        if let Some(update) = obj.get("config_update") {
            self.handle_config_update(update);
        }
        if let Some(command) = obj.get("command") {
            if let Some(v) = command.get("value").and_then(Value::as_i64) {
                self.pending_command = Some(v);
            } else {
                warn!("uplink: command without numeric value — ignored");
            }
        }
        if let Some(fota) = obj.get("fota").and_then(Value::as_object) {
            self.handle_fota_reply(fota, part, store);
        }
        true
    }

    fn handle_config_update(&mut self, update: &Value) {
        let Some(obj) = update.as_object() else {
            warn!("uplink: config_update not an object — ignored");
            return;
        };

        let current = self
            .staged_config
            .clone()
            .unwrap_or_else(|| self.config.lock().expect("config mutex").clone());
        let mut next = current.clone();
        let mut accepted: Vec<&str> = Vec::new();
        let mut rejected: Vec<&str> = Vec::new();
        let mut unchanged: Vec<&str> = Vec::new();

        if let Some(v) = obj.get("sampling_interval") {
            match v.as_u64() {
                Some(ms) if u32::try_from(ms).is_ok() => {
                    let candidate = RuntimeConfig {
                        sampling_interval: ms as u32,
                        ..next.clone()
                    };
                    if candidate.validate().is_err() {
                        rejected.push("sampling_interval");
                    } else if next.sampling_interval == ms as u32 {
                        unchanged.push("sampling_interval");
                    } else {
                        next.sampling_interval = ms as u32;
                        accepted.push("sampling_interval");
                    }
                }
                _ => rejected.push("sampling_interval"),
            }
        }

        if let Some(v) = obj.get("registers") {
            // Any non-string entry makes the whole list malformed.
            let names: Option<Vec<String>> = v.as_array().and_then(|a| {
                a.iter()
                    .map(|n| n.as_str().map(str::to_string))
                    .collect()
            });
            match names.as_deref().map(map_field_names) {
                Some(Ok(fields)) => {
                    if fields == next.fields {
                        unchanged.push("registers");
                    } else {
                        next.fields = fields;
                        accepted.push("registers");
                    }
                }
                _ => rejected.push("registers"),
            }
        }

        if !accepted.is_empty() {
            info!(
                "uplink: configuration staged (accepted: {:?}, rejected: {:?})",
                accepted, rejected
            );
            self.staged_config = Some(next);
        }
        self.config_ack = Some(json!({
            "accepted": accepted,
            "rejected": rejected,
            "unchanged": unchanged,
        }));
    }

    fn handle_fota_reply(
        &mut self,
        fota: &Map<String, Value>,
        part: &mut impl UpdatePartitionPort,
        store: &mut impl StoragePort,
    ) {
        if let Some(manifest) = fota.get("manifest") {
            match serde_json::from_value::<Manifest>(manifest.clone()) {
                Ok(mf) => {
                    if !self.fota.start(&mf, part, store) {
                        self.event_tags
                            .push(self.fota.last_error().unwrap_or("fota_start"));
                    }
                }
                Err(_) => warn!("uplink: malformed fota manifest — ignored"),
            }
        }

        if let (Some(number), Some(data)) = (
            fota.get("chunk_number").and_then(Value::as_u64),
            fota.get("data").and_then(Value::as_str),
        ) {
            let mut progress = None;
            let ok = self.fota.ingest_chunk(
                number as u32,
                data,
                part,
                store,
                |written, total| progress = Some((written, total)),
            );
            if ok {
                self.fota_progress = progress;
            } else {
                self.event_tags
                    .push(self.fota.last_error().unwrap_or("fota_chunk"));
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
