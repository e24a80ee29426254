//! Device-side HTTP tunnel for Modbus frames.
//!
//! A frame exchange is one POST of `{"frame":"<HEX>"}` to the read or
//! write endpoint; a successful reply is HTTP 200 with a JSON body whose
//! `frame` field carries the response hex. Anything else is a failure and
//! goes through the bounded exponential backoff policy before giving up.
//!
//! Exhausted exchanges bump a process-wide counter the diagnostics
//! appendix reports; per-attempt noise stays inside this module.

use core::sync::atomic::{AtomicU32, Ordering};
use log::warn;
use serde::Serialize;

use crate::app::ports::{HttpError, HttpPort};
use crate::error::TransportError;

/// Per-call timeout for device exchanges.
const DEVICE_TIMEOUT_MS: u32 = 5_000;

static FAILED_EXCHANGES: AtomicU32 = AtomicU32::new(0);

/// Total frame exchanges that exhausted their retries since boot.
pub fn failed_exchanges() -> u32 {
    FAILED_EXCHANGES.load(Ordering::Relaxed)
}

/// Which device endpoint an exchange targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Read,
    Write,
}

impl Endpoint {
    fn path(self) -> &'static str {
        match self {
            Self::Read => "/api/inverter/read",
            Self::Write => "/api/inverter/write",
        }
    }
}

/// Bounded exponential backoff: attempt `k` waits
/// `min(base_ms << k, max_ms)` before the next try.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_ms: u32,
    pub max_ms: u32,
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> u32 {
        let exp = u64::from(self.base_ms) << attempt.min(31);
        exp.min(u64::from(self.max_ms)) as u32
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            base_ms: 250,
            max_ms: 2_000,
        }
    }
}

#[derive(Serialize)]
struct FrameBody<'a> {
    frame: &'a str,
}

/// The device-side transport adapter: endpoint mapping + retry policy +
/// authorization header.
pub struct DeviceTransport {
    base_url: String,
    auth_token: String,
    policy: RetryPolicy,
}

impl DeviceTransport {
    pub fn new(base_url: &str, auth_token: &str, policy: RetryPolicy) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token: auth_token.to_string(),
            policy,
        }
    }

    /// POST a hex frame and return the response frame field.
    ///
    /// Applies the retry policy; on exhaustion the last failure kind is
    /// returned and the process-wide failure counter is bumped once.
    pub fn post_frame(
        &self,
        http: &mut impl HttpPort,
        endpoint: Endpoint,
        frame_hex: &str,
    ) -> Result<String, TransportError> {
        let url = format!("{}{}", self.base_url, endpoint.path());
        let body = serde_json::to_vec(&FrameBody { frame: frame_hex }).expect("body serializes");

        let mut last = TransportError::Timeout;
        for attempt in 0..=self.policy.retries {
            if attempt > 0 {
                std::thread::sleep(std::time::Duration::from_millis(
                    self.policy.delay_for_attempt(attempt - 1) as u64,
                ));
            }
            match self.attempt(http, &url, &body) {
                Ok(frame) => return Ok(frame),
                Err(e) => last = e,
            }
        }

        FAILED_EXCHANGES.fetch_add(1, Ordering::Relaxed);
        warn!(
            "transport: {:?} exchange failed after {} attempts: {}",
            endpoint,
            self.policy.retries + 1,
            last
        );
        Err(last)
    }

    fn attempt(
        &self,
        http: &mut impl HttpPort,
        url: &str,
        body: &[u8],
    ) -> Result<String, TransportError> {
        let headers = [
            ("Content-Type", "application/json"),
            ("Authorization", self.auth_token.as_str()),
        ];
        let response = http
            .post(url, &headers, body, DEVICE_TIMEOUT_MS)
            .map_err(|e| match e {
                HttpError::Timeout => TransportError::Timeout,
                HttpError::Connect | HttpError::Io => TransportError::ServerRejected,
            })?;

        match response.status {
            200 => {}
            s if (400..500).contains(&s) => return Err(TransportError::AuthFailed),
            _ => return Err(TransportError::ServerRejected),
        }
        if response.body.is_empty() {
            return Err(TransportError::ServerRejected);
        }

        let value: serde_json::Value =
            serde_json::from_slice(&response.body).map_err(|_| TransportError::BadResponse)?;
        match value.get("frame").and_then(|f| f.as_str()) {
            Some(frame) if !frame.is_empty() => Ok(frame.to_string()),
            _ => Err(TransportError::BadResponse),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ports::HttpResponse;

    /// Scripted HTTP port: pops one canned result per call.
    struct ScriptedHttp {
        script: Vec<Result<HttpResponse, HttpError>>,
        calls: Vec<(String, Vec<u8>)>,
    }

    impl ScriptedHttp {
        fn new(script: Vec<Result<HttpResponse, HttpError>>) -> Self {
            Self {
                script,
                calls: Vec::new(),
            }
        }
    }

    impl HttpPort for ScriptedHttp {
        fn post(
            &mut self,
            url: &str,
            _headers: &[(&str, &str)],
            body: &[u8],
            _timeout_ms: u32,
        ) -> Result<HttpResponse, HttpError> {
            self.calls.push((url.to_string(), body.to_vec()));
            if self.script.is_empty() {
                Err(HttpError::Connect)
            } else {
                self.script.remove(0)
            }
        }
    }

    fn ok_frame(frame: &str) -> Result<HttpResponse, HttpError> {
        Ok(HttpResponse {
            status: 200,
            body: format!(r#"{{"frame":"{frame}"}}"#).into_bytes(),
        })
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            retries: 2,
            base_ms: 0,
            max_ms: 0,
        }
    }

    #[test]
    fn success_extracts_frame_field() {
        let mut http = ScriptedHttp::new(vec![ok_frame("110302002AABCD")]);
        let transport = DeviceTransport::new("http://dev/", "tok", fast());
        let frame = transport
            .post_frame(&mut http, Endpoint::Read, "11030000000AC5CD")
            .unwrap();
        assert_eq!(frame, "110302002AABCD");
        assert_eq!(http.calls.len(), 1);
        assert_eq!(http.calls[0].0, "http://dev/api/inverter/read");
        assert_eq!(
            http.calls[0].1,
            br#"{"frame":"11030000000AC5CD"}"#.to_vec()
        );
    }

    #[test]
    fn write_endpoint_path() {
        let mut http = ScriptedHttp::new(vec![ok_frame("AA")]);
        let transport = DeviceTransport::new("http://dev", "tok", fast());
        let _ = transport.post_frame(&mut http, Endpoint::Write, "AA");
        assert_eq!(http.calls[0].0, "http://dev/api/inverter/write");
    }

    #[test]
    fn retries_until_success() {
        let mut http = ScriptedHttp::new(vec![
            Err(HttpError::Timeout),
            Ok(HttpResponse {
                status: 503,
                body: b"busy".to_vec(),
            }),
            ok_frame("BB"),
        ]);
        let transport = DeviceTransport::new("http://dev", "tok", fast());
        let frame = transport
            .post_frame(&mut http, Endpoint::Read, "AA")
            .unwrap();
        assert_eq!(frame, "BB");
        assert_eq!(http.calls.len(), 3);
    }

    #[test]
    fn exhaustion_reports_last_failure_and_counts() {
        // Other tests bump the process-wide counter concurrently, so only
        // monotonic growth is asserted.
        let before = failed_exchanges();
        let mut http = ScriptedHttp::new(vec![
            Err(HttpError::Timeout),
            Err(HttpError::Timeout),
            Ok(HttpResponse {
                status: 401,
                body: b"no".to_vec(),
            }),
        ]);
        let transport = DeviceTransport::new("http://dev", "tok", fast());
        let err = transport
            .post_frame(&mut http, Endpoint::Read, "AA")
            .unwrap_err();
        assert_eq!(err, TransportError::AuthFailed);
        assert!(failed_exchanges() > before);
    }

    #[test]
    fn empty_body_and_missing_frame_are_failures() {
        for body in [Vec::new(), b"{}".to_vec(), b"{\"frame\":\"\"}".to_vec()] {
            let mut http = ScriptedHttp::new(vec![Ok(HttpResponse { status: 200, body })]);
            let transport = DeviceTransport::new(
                "http://dev",
                "tok",
                RetryPolicy {
                    retries: 0,
                    base_ms: 0,
                    max_ms: 0,
                },
            );
            assert!(transport.post_frame(&mut http, Endpoint::Read, "AA").is_err());
        }
    }

    #[test]
    fn backoff_delays_are_capped() {
        let policy = RetryPolicy {
            retries: 10,
            base_ms: 100,
            max_ms: 800,
        };
        assert_eq!(policy.delay_for_attempt(0), 100);
        assert_eq!(policy.delay_for_attempt(1), 200);
        assert_eq!(policy.delay_for_attempt(2), 400);
        assert_eq!(policy.delay_for_attempt(3), 800);
        assert_eq!(policy.delay_for_attempt(9), 800);
        assert_eq!(policy.delay_for_attempt(31), 800);
        assert_eq!(policy.delay_for_attempt(40), 800);
    }
}
