//! Authenticated envelope — HMAC-SHA256 over a base64 payload, bound to a
//! monotonic nonce.
//!
//! ```text
//! { "nonce": <u64>, "payload": "<base64(inner)>", "mac": "<hex hmac>" }
//! ```
//!
//! The MAC covers the ASCII string `"<nonce>.<payload_b64>"` keyed with
//! the shared PSK. Crypto is the `hmac-sha256` crate — pure Rust,
//! identical on ESP-IDF and host targets.
//!
//! Replay protection is a pair of persisted nonces: the device nonce is
//! pre-incremented and committed *before* an envelope is emitted, the
//! cloud nonce is committed only after a reply verifies.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::app::ports::StoragePort;
use crate::error::SecurityError;

/// Storage namespace for the nonce pair.
const NS_SEC: &str = "sec";
const KEY_DEVICE_NONCE: &str = "nonce_device";
const KEY_CLOUD_NONCE: &str = "nonce_cloud";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    nonce: u64,
    payload: String,
    mac: String,
}

fn mac_hex(psk: &[u8], nonce: u64, payload_b64: &str) -> String {
    let msg = format!("{nonce}.{payload_b64}");
    let tag = hmac_sha256::HMAC::mac(msg.as_bytes(), psk);
    let mut s = String::with_capacity(64);
    for b in tag {
        use core::fmt::Write;
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Wrap an inner JSON body into an authenticated envelope.
pub fn wrap(inner_json: &str, psk: &[u8], next_nonce: u64) -> String {
    let payload = BASE64.encode(inner_json.as_bytes());
    let mac = mac_hex(psk, next_nonce, &payload);
    let env = Envelope {
        nonce: next_nonce,
        payload,
        mac,
    };
    serde_json::to_string(&env).expect("envelope serializes")
}

/// Verify an envelope and return the inner payload bytes.
///
/// Rejects on any missing field, MAC mismatch (case-insensitive hex
/// compare), or a nonce at or below `last_seen_nonce`. On success the
/// nonce high-water mark is advanced in place.
pub fn unwrap_and_verify(
    env_json: &str,
    psk: &[u8],
    last_seen_nonce: &mut u64,
    payload_is_base64: bool,
) -> Result<Vec<u8>, SecurityError> {
    let env: Envelope =
        serde_json::from_str(env_json).map_err(|_| SecurityError::Malformed)?;
    if env.payload.is_empty() || env.mac.is_empty() {
        return Err(SecurityError::Malformed);
    }

    let expected = mac_hex(psk, env.nonce, &env.payload);
    if !expected.eq_ignore_ascii_case(&env.mac) {
        return Err(SecurityError::HmacInvalid);
    }

    if env.nonce <= *last_seen_nonce {
        return Err(SecurityError::Replay);
    }
    *last_seen_nonce = env.nonce;

    if payload_is_base64 {
        let bin = BASE64
            .decode(env.payload.as_bytes())
            .map_err(|_| SecurityError::BadBase64)?;
        if bin.is_empty() {
            return Err(SecurityError::BadBase64);
        }
        Ok(bin)
    } else {
        Ok(env.payload.into_bytes())
    }
}

// ── Persisted nonce pair ─────────────────────────────────────

/// Monotonic nonce pair, reloaded on boot and committed around every
/// envelope operation.
#[derive(Debug, Default)]
pub struct NonceStore {
    device: u64,
    cloud: u64,
}

impl NonceStore {
    /// Reload both high-water marks; absent keys start at zero.
    pub fn load(store: &impl StoragePort) -> Self {
        Self {
            device: store.get_u64(NS_SEC, KEY_DEVICE_NONCE).unwrap_or(0),
            cloud: store.get_u64(NS_SEC, KEY_CLOUD_NONCE).unwrap_or(0),
        }
    }

    /// Pre-increment the device nonce and persist it before use. A failed
    /// persist still advances the in-memory counter — re-using a nonce is
    /// worse than skipping one.
    pub fn next_device_nonce(&mut self, store: &mut impl StoragePort) -> u64 {
        self.device += 1;
        if store.set_u64(NS_SEC, KEY_DEVICE_NONCE, self.device).is_err() {
            warn!("nonce: device high-water persist failed");
        }
        self.device
    }

    pub fn cloud_nonce(&self) -> u64 {
        self.cloud
    }

    pub fn device_nonce(&self) -> u64 {
        self.device
    }

    /// Commit the cloud high-water mark after a verified unwrap.
    pub fn commit_cloud_nonce(&mut self, value: u64, store: &mut impl StoragePort) {
        self.cloud = value;
        if store.set_u64(NS_SEC, KEY_CLOUD_NONCE, value).is_err() {
            warn!("nonce: cloud high-water persist failed");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
