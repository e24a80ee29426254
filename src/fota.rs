//! Resumable firmware-update engine.
//!
//! ```text
//! idle ──start──▶ downloading ──ingest…──▶ finalize ──▶ verify_ok ──▶ boot_ok
//!                     │                        │            │
//!                     │ (restart)              ▼            ▼ (liveness never met)
//!                     └──▶ resume         verify_failed   boot_rollback
//! ```
//!
//! Chunks arrive strictly in order, base64-encoded, inside cloud replies.
//! Progress (`bytes_written`, `next_chunk`) and the manifest are persisted
//! on every accepted chunk, so a power cycle resumes mid-image: the
//! already-written bytes are re-read from the update region in ≤1 KiB
//! blocks to rebuild the streaming SHA-256 so the digest stays faithful to
//! on-media content.
//!
//! A hash mismatch at finalize is terminal for the session — the running
//! image keeps running and the failure is reported with the next upload.

use log::{error, info, warn};
use sha2::{Digest, Sha256};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use crate::app::ports::{StoragePort, UpdatePartitionPort};

/// Storage namespace and resume keys.
const NS_FOTA: &str = "fota";
const K_VERSION: &str = "mf.ver";
const K_HASH: &str = "mf.hash";
const K_SIZE: &str = "mf.size";
const K_WRITTEN: &str = "bytes_written";
const K_NEXT_CHUNK: &str = "next_chunk";

/// Resume re-read block size — kept small to cap memory pressure.
const RESUME_READ_BLOCK: usize = 1024;

/// Firmware image descriptor, as served by the cloud.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub size: u32,
    #[serde(rename = "hash")]
    pub hash_hex: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
}

fn default_chunk_size() -> u32 {
    1024
}

impl Manifest {
    pub fn total_chunks(&self) -> u32 {
        if self.chunk_size == 0 {
            return 0;
        }
        self.size.div_ceil(self.chunk_size)
    }
}

/// Session status codes for device → cloud reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FotaStatus {
    Idle = 0,
    Downloading = 1,
    VerifyOk = 2,
    VerifyFailed = 3,
    BootOk = 4,
    BootRollback = 5,
}

/// Result of one `finalize_and_apply` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinalizeOutcome {
    /// Whether a finalize attempt completed this call.
    pub attempted: bool,
    pub verify_ok: bool,
    pub apply_ok: bool,
}

/// Snapshot for the `fota` status appendix.
#[derive(Debug, Clone, Serialize)]
pub struct FotaSnapshot {
    pub active: bool,
    pub version: String,
    pub written: u32,
    pub total: u32,
    pub next_chunk: u32,
    pub finalize_requested: bool,
    pub finalized: bool,
    pub error: String,
}

pub struct FotaEngine {
    session_active: bool,
    manifest: Manifest,
    bytes_written: u32,
    next_chunk: u32,
    sha: Option<Sha256>,
    finalize_requested: bool,
    finalized: bool,
    last_error: Option<&'static str>,
    status: FotaStatus,
    /// Version that failed verify or rolled back, reported once.
    failed_version: Option<String>,
}

impl FotaEngine {
    pub fn new() -> Self {
        Self {
            session_active: false,
            manifest: Manifest::default(),
            bytes_written: 0,
            next_chunk: 0,
            sha: None,
            finalize_requested: false,
            finalized: false,
            last_error: None,
            status: FotaStatus::Idle,
            failed_version: None,
        }
    }

    // ── Queries ───────────────────────────────────────────────

    pub fn session_active(&self) -> bool {
        self.session_active
    }

    pub fn status(&self) -> FotaStatus {
        self.status
    }

    /// Chunk index to advertise to the cloud (0 when idle).
    pub fn next_chunk_for_cloud(&self) -> u32 {
        if self.session_active {
            self.next_chunk
        } else {
            0
        }
    }

    pub fn last_error(&self) -> Option<&'static str> {
        self.last_error
    }

    /// One-shot: the version of the image that failed verify/boot.
    pub fn take_failed_version(&mut self) -> Option<String> {
        self.failed_version.take()
    }

    pub fn snapshot(&self) -> FotaSnapshot {
        FotaSnapshot {
            active: self.session_active,
            version: self.manifest.version.clone(),
            written: self.bytes_written,
            total: self.manifest.size,
            next_chunk: self.next_chunk,
            finalize_requested: self.finalize_requested,
            finalized: self.finalized,
            error: self.last_error.unwrap_or("").to_string(),
        }
    }

    // ── start ─────────────────────────────────────────────────

    /// Begin (or resume) a session for `manifest`.
    ///
    /// A repeat of the active manifest is a no-op returning `true` —
    /// server-side retransmits must not reset progress. A *different*
    /// manifest while active aborts the old session first.
    pub fn start(
        &mut self,
        manifest: &Manifest,
        part: &mut impl UpdatePartitionPort,
        store: &mut impl StoragePort,
    ) -> bool {
        if self.session_active && self.manifest == *manifest {
            info!(
                "fota: duplicate manifest ignored (next_chunk={}, written={})",
                self.next_chunk, self.bytes_written
            );
            return true;
        }

        if self.session_active {
            warn!(
                "fota: new manifest {} replaces active session {}",
                manifest.version, self.manifest.version
            );
            part.abort();
            self.reset_session();
        }

        let persisted_version = store.get_str(NS_FOTA, K_VERSION).unwrap_or_default();
        let persisted_hash = store.get_str(NS_FOTA, K_HASH).unwrap_or_default();
        let persisted_size = store.get_u64(NS_FOTA, K_SIZE).unwrap_or(0);
        let mut written = store.get_u64(NS_FOTA, K_WRITTEN).unwrap_or(0);
        let mut next = store.get_u64(NS_FOTA, K_NEXT_CHUNK).unwrap_or(0);

        let can_resume = persisted_version == manifest.version
            && persisted_hash == manifest.hash_hex
            && persisted_size == u64::from(manifest.size)
            && written < u64::from(manifest.size);

        self.session_active = true;
        self.manifest = manifest.clone();
        self.last_error = None;
        self.finalize_requested = false;
        self.finalized = false;
        self.status = FotaStatus::Downloading;

        if can_resume && written > 0 {
            // Sanity-clamp persisted counters before trusting them.
            written = written.min(u64::from(manifest.size));
            if next > u64::from(manifest.total_chunks()) {
                next = 0;
            }

            if part.resume(manifest.size, written as u32).is_err() {
                self.fail_session("ota-begin", part);
                return false;
            }

            // Rebuild the rolling hash from what is actually on media.
            let mut sha = Sha256::new();
            let mut block = [0u8; RESUME_READ_BLOCK];
            let mut offset: u64 = 0;
            while offset < written {
                let len = RESUME_READ_BLOCK.min((written - offset) as usize);
                if part.read_back(offset as u32, &mut block[..len]).is_err() {
                    error!("fota: resume read failed at offset {offset}");
                    self.fail_session("resume-read", part);
                    return false;
                }
                sha.update(&block[..len]);
                offset += len as u64;
            }

            self.sha = Some(sha);
            self.bytes_written = written as u32;
            self.next_chunk = next as u32;
            warn!(
                "fota: resume version={} written={} next_chunk={} (hash rebuilt)",
                manifest.version, self.bytes_written, self.next_chunk
            );
        } else {
            if part.begin(manifest.size).is_err() {
                self.fail_session("ota-begin", part);
                return false;
            }
            self.sha = Some(Sha256::new());
            self.bytes_written = 0;
            self.next_chunk = 0;

            let ok = store.set_str(NS_FOTA, K_VERSION, &manifest.version).is_ok()
                && store.set_str(NS_FOTA, K_HASH, &manifest.hash_hex).is_ok()
                && store.set_u64(NS_FOTA, K_SIZE, u64::from(manifest.size)).is_ok()
                && store.set_u64(NS_FOTA, K_WRITTEN, 0).is_ok()
                && store.set_u64(NS_FOTA, K_NEXT_CHUNK, 0).is_ok();
            if !ok {
                warn!("fota: manifest persist failed — resume unavailable for this session");
            }
        }

        info!(
            "fota: start version={} size={} chunk={}",
            manifest.version, manifest.size, manifest.chunk_size
        );
        true
    }

    // ── ingest ────────────────────────────────────────────────

    /// Accept one base64 chunk. Strictly ordered: `number` must equal the
    /// expected index or the chunk is rejected (the server resends the
    /// right one). `on_progress` fires after every accepted chunk.
    pub fn ingest_chunk(
        &mut self,
        number: u32,
        data_b64: &str,
        part: &mut impl UpdatePartitionPort,
        store: &mut impl StoragePort,
        mut on_progress: impl FnMut(u32, u32),
    ) -> bool {
        if !self.session_active || self.finalized || self.sha.is_none() {
            return false;
        }

        if number != self.next_chunk {
            warn!(
                "fota: reject chunk #{number} (expecting #{})",
                self.next_chunk
            );
            self.last_error = Some("out-of-order");
            return false;
        }

        let data = match BASE64.decode(data_b64.trim().as_bytes()) {
            Ok(d) if !d.is_empty() => d,
            _ => {
                error!("fota: base64 decode failed at chunk #{number}");
                self.last_error = Some("bad-b64");
                return false;
            }
        };

        if self.bytes_written as u64 + data.len() as u64 > u64::from(self.manifest.size) {
            error!(
                "fota: chunk overflow: {} + {} > {}",
                self.bytes_written,
                data.len(),
                self.manifest.size
            );
            self.last_error = Some("overflow");
            return false;
        }

        if part.write(&data).is_err() {
            error!("fota: region write failed at chunk #{number}");
            self.last_error = Some("ota-write");
            return false;
        }

        if let Some(sha) = self.sha.as_mut() {
            sha.update(&data);
        }
        self.bytes_written += data.len() as u32;
        self.next_chunk = number + 1;

        let _ = store.set_u64(NS_FOTA, K_WRITTEN, u64::from(self.bytes_written));
        let _ = store.set_u64(NS_FOTA, K_NEXT_CHUNK, u64::from(self.next_chunk));

        info!(
            "fota: chunk #{number} accepted, {}/{} bytes",
            self.bytes_written, self.manifest.size
        );
        on_progress(self.bytes_written, self.manifest.size);

        if self.bytes_written == self.manifest.size {
            self.finalize_requested = true;
        }
        true
    }

    // ── finalize ──────────────────────────────────────────────

    /// Safe to call every slot; performs the finalize exactly once, when
    /// the full image is on media.
    pub fn finalize_and_apply(
        &mut self,
        part: &mut impl UpdatePartitionPort,
        store: &mut impl StoragePort,
    ) -> FinalizeOutcome {
        let mut outcome = FinalizeOutcome::default();
        if !self.session_active || self.finalized || self.sha.is_none() {
            return outcome;
        }
        if self.bytes_written != self.manifest.size {
            return outcome;
        }
        outcome.attempted = true;

        let digest: [u8; 32] = match self.sha.take() {
            Some(sha) => sha.finalize().into(),
            None => return FinalizeOutcome::default(),
        };

        let Some(expected) = parse_hash_hex(&self.manifest.hash_hex) else {
            error!("fota: bad manifest hash format");
            self.last_error = Some("bad-hash-format");
            self.conclude_session(part, store, FotaStatus::VerifyFailed);
            return outcome;
        };

        outcome.verify_ok = digest == expected;

        if part.end().is_err() {
            self.last_error = Some("ota-end");
            self.conclude_session(part, store, FotaStatus::VerifyFailed);
            outcome.verify_ok = false;
            return outcome;
        }

        if !outcome.verify_ok {
            error!("fota: SHA-256 mismatch — keeping current image");
            self.last_error = Some("hash-mismatch");
            self.failed_version = Some(self.manifest.version.clone());
            self.conclude_session(part, store, FotaStatus::VerifyFailed);
            return outcome;
        }

        match part.set_boot() {
            Ok(()) => {
                outcome.apply_ok = true;
                info!("fota: verified and boot region switched — reboot pending");
                self.conclude_session(part, store, FotaStatus::VerifyOk);
            }
            Err(_) => {
                error!("fota: set_boot failed");
                self.last_error = Some("set-boot");
                self.conclude_session(part, store, FotaStatus::VerifyFailed);
            }
        }
        outcome
    }

    // ── boot acknowledgement ──────────────────────────────────

    /// Record a successful first boot of the new image.
    pub fn acknowledge_boot_ok(&mut self, store: &mut impl StoragePort) {
        self.status = FotaStatus::BootOk;
        self.clear_persisted(store);
    }

    /// Record a rollback of the previously applied image.
    pub fn acknowledge_rollback(&mut self, store: &mut impl StoragePort) {
        self.status = FotaStatus::BootRollback;
        if let Some(version) = store.get_str(NS_FOTA, K_VERSION) {
            if !version.is_empty() {
                self.failed_version = Some(version);
            }
        }
        self.clear_persisted(store);
    }

    // ── internal ──────────────────────────────────────────────

    fn reset_session(&mut self) {
        self.session_active = false;
        self.manifest = Manifest::default();
        self.bytes_written = 0;
        self.next_chunk = 0;
        self.sha = None;
        self.finalize_requested = false;
        self.finalized = false;
        self.status = FotaStatus::Idle;
    }

    fn fail_session(&mut self, tag: &'static str, part: &mut impl UpdatePartitionPort) {
        self.last_error = Some(tag);
        part.abort();
        self.sha = None;
        self.session_active = false;
        self.status = FotaStatus::Idle;
    }

    /// Terminal close for the session: clears resume counters so a stale
    /// image can never be resumed into.
    fn conclude_session(
        &mut self,
        _part: &mut impl UpdatePartitionPort,
        store: &mut impl StoragePort,
        status: FotaStatus,
    ) {
        self.finalized = true;
        self.status = status;
        let _ = store.set_u64(NS_FOTA, K_WRITTEN, 0);
        let _ = store.set_u64(NS_FOTA, K_NEXT_CHUNK, 0);
    }

    fn clear_persisted(&mut self, store: &mut impl StoragePort) {
        let _ = store.delete(NS_FOTA, K_VERSION);
        let _ = store.delete(NS_FOTA, K_HASH);
        let _ = store.delete(NS_FOTA, K_SIZE);
        let _ = store.set_u64(NS_FOTA, K_WRITTEN, 0);
        let _ = store.set_u64(NS_FOTA, K_NEXT_CHUNK, 0);
    }
}

impl Default for FotaEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_hash_hex(hex: &str) -> Option<[u8; 32]> {
    if hex.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        let hi = (hex.as_bytes()[2 * i] as char).to_digit(16)?;
        let lo = (hex.as_bytes()[2 * i + 1] as char).to_digit(16)?;
        *byte = ((hi << 4) | lo) as u8;
    }
    Some(out)
}

// ── Tests ────────────────────────────────────────────────────
