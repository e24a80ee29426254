//! HTTP client adapter.
//!
//! - **`target_os = "espidf"`** — `EspHttpConnection` through the
//!   `embedded-svc` client traits, with the IDF certificate bundle
//!   attached for HTTPS endpoints.
//! - **host** — a `ureq` agent, used by the simulation binary and any
//!   loopback test servers.
//!
//! Transport-level failures map onto [`HttpError`]; HTTP status codes are
//! returned as data so the caller applies its own success criterion.

use crate::app::ports::{HttpError, HttpPort, HttpResponse};

// ───────────────────────────────────────────────────────────────
// ESP-IDF backend
// ───────────────────────────────────────────────────────────────

#[cfg(target_os = "espidf")]
pub struct HttpClient;

#[cfg(target_os = "espidf")]
impl HttpClient {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(target_os = "espidf")]
impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "espidf")]
impl HttpPort for HttpClient {
    fn post(
        &mut self,
        url: &str,
        headers: &[(&str, &str)],
        body: &[u8],
        timeout_ms: u32,
    ) -> Result<HttpResponse, HttpError> {
        use embedded_svc::http::client::Client;
        use embedded_svc::http::Status;
        use embedded_svc::io::{Read, Write};
        use esp_idf_svc::http::client::{Configuration, EspHttpConnection};

        let config = Configuration {
            timeout: Some(core::time::Duration::from_millis(timeout_ms as u64)),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let connection = EspHttpConnection::new(&config).map_err(|_| HttpError::Connect)?;
        let mut client = Client::wrap(connection);

        let mut request = client.post(url, headers).map_err(|_| HttpError::Connect)?;
        request.write_all(body).map_err(|_| HttpError::Io)?;
        request.flush().map_err(|_| HttpError::Io)?;

        let mut response = request.submit().map_err(|_| HttpError::Timeout)?;
        let status = response.status();

        let mut out = Vec::new();
        let mut buf = [0u8; 512];
        loop {
            let n = response.read(&mut buf).map_err(|_| HttpError::Io)?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }

        Ok(HttpResponse { status, body: out })
    }
}

// ───────────────────────────────────────────────────────────────
// Host backend
// ───────────────────────────────────────────────────────────────

#[cfg(not(target_os = "espidf"))]
pub struct HttpClient {
    agent: ureq::Agent,
}

#[cfg(not(target_os = "espidf"))]
impl HttpClient {
    pub fn new() -> Self {
        Self {
            agent: ureq::AgentBuilder::new().build(),
        }
    }
}

#[cfg(not(target_os = "espidf"))]
impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(target_os = "espidf"))]
impl HttpPort for HttpClient {
    fn post(
        &mut self,
        url: &str,
        headers: &[(&str, &str)],
        body: &[u8],
        timeout_ms: u32,
    ) -> Result<HttpResponse, HttpError> {
        use std::io::Read;

        let mut request = self
            .agent
            .post(url)
            .timeout(std::time::Duration::from_millis(timeout_ms as u64));
        for (name, value) in headers {
            request = request.set(name, value);
        }

        let response = match request.send_bytes(body) {
            Ok(resp) => resp,
            // Non-2xx still carries a status + body the caller classifies.
            Err(ureq::Error::Status(_code, resp)) => resp,
            Err(ureq::Error::Transport(t)) => {
                return Err(match t.kind() {
                    ureq::ErrorKind::ConnectionFailed | ureq::ErrorKind::Dns => HttpError::Connect,
                    ureq::ErrorKind::Io => HttpError::Timeout,
                    _ => HttpError::Io,
                });
            }
        };

        let status = response.status();
        let mut body = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|_| HttpError::Io)?;
        Ok(HttpResponse { status, body })
    }
}
