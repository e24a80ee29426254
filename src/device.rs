//! High-level inverter client: grouped register reads and the single
//! actuation the cloud may request (export-power limit).
//!
//! Every failed exchange is classified and pushed as one structured
//! [`FaultEvent`] into a bounded channel the orchestrator owns; the
//! channel replaces the callback web the source design used. A full
//! channel silently drops the event — the next failure re-reports.

use crossbeam_channel::Sender;
use log::{info, warn};

use crate::app::events::{DeviceFault, FaultEvent};
use crate::app::ports::HttpPort;
use crate::error::FrameError;
use crate::modbus;
use crate::sample::{FieldId, Sample, ALL_FIELDS};
use crate::transport::{DeviceTransport, Endpoint};

/// Fixed slave address of the inverter behind the tunnel.
pub const SLAVE_ADDR: u8 = 0x11;

/// Fallback partition when the grouped read of 0..9 fails: contiguous
/// runs that isolate the registers most likely to fault independently.
const FALLBACK_GROUPS: [(u16, u16); 6] = [(0, 2), (2, 1), (3, 2), (5, 3), (8, 1), (9, 1)];

pub struct DeviceClient {
    transport: DeviceTransport,
    faults: Sender<FaultEvent>,
}

impl DeviceClient {
    pub fn new(transport: DeviceTransport, faults: Sender<FaultEvent>) -> Self {
        Self { transport, faults }
    }

    fn report(&self, fault: DeviceFault, addr: u16, count: u16, write: bool) {
        let event = FaultEvent {
            fault,
            addr,
            count,
            write,
        };
        if self.faults.try_send(event).is_err() {
            // Bounded channel full — drop; the next occurrence re-reports.
        }
    }

    /// Read `count` holding registers starting at `addr`, validating the
    /// echoed slave/function and the register count. Exactly one fault
    /// event is emitted per failed call.
    pub fn read_group(&self, http: &mut impl HttpPort, addr: u16, count: u16) -> Option<Vec<u16>> {
        let request = modbus::make_read_holding(SLAVE_ADDR, addr, count);
        let response = match self.transport.post_frame(http, Endpoint::Read, &request) {
            Ok(r) => r,
            Err(e) => {
                self.report(DeviceFault::Timeout(e), addr, count, false);
                return None;
            }
        };

        match modbus::parse_read_response(&response) {
            Ok((slave, func, regs)) => {
                if slave != SLAVE_ADDR || func != modbus::FUNC_READ_HOLDING {
                    warn!("device: unexpected header slave=0x{slave:02X} func=0x{func:02X}");
                    self.report(DeviceFault::HeaderMismatch, addr, count, false);
                    return None;
                }
                if regs.len() != count as usize {
                    warn!(
                        "device: register count mismatch (got {}, want {count}) [addr={addr}]",
                        regs.len()
                    );
                    self.report(DeviceFault::Malformed, addr, count, false);
                    return None;
                }
                Some(regs)
            }
            Err(FrameError::ExceptionFrame) => {
                // Re-parse as an exception frame for the code.
                match modbus::parse_exception_response(&response) {
                    Ok((_, _, code)) => {
                        warn!(
                            "device: modbus exception 0x{code:02X} ({}) [addr={addr} cnt={count}]",
                            modbus::exception_name(code)
                        );
                        self.report(DeviceFault::Exception(code), addr, count, false);
                    }
                    Err(_) => self.report(DeviceFault::Malformed, addr, count, false),
                }
                None
            }
            Err(e) => {
                warn!("device: malformed response ({e}) [addr={addr} cnt={count}]");
                self.report(DeviceFault::Malformed, addr, count, false);
                None
            }
        }
    }

    /// Read the full canonical set. Tries one grouped read of 0..9 first;
    /// on failure falls back to the fixed partition, populating whatever
    /// sub-reads succeed. Returns `true` iff at least one read landed.
    pub fn read_all(&self, http: &mut impl HttpPort, out: &mut Sample) -> bool {
        if let Some(regs) = self.read_group(http, 0, ALL_FIELDS.len() as u16) {
            for (field, value) in ALL_FIELDS.iter().zip(regs) {
                out.set(*field, value);
            }
            return true;
        }

        let mut ok_any = false;
        for (addr, count) in FALLBACK_GROUPS {
            if let Some(regs) = self.read_group(http, addr, count) {
                ok_any = true;
                for (k, value) in regs.into_iter().enumerate() {
                    if let Some(field) = FieldId::from_register(addr + k as u16) {
                        out.set(field, value);
                    }
                }
            }
        }
        ok_any
    }

    /// Read a pre-sorted, de-duplicated field selection, coalescing the
    /// ids into maximal contiguous register runs — one exchange per run.
    /// Each successful run updates only the fields it covers.
    pub fn read_selected(
        &self,
        http: &mut impl HttpPort,
        fields: &[FieldId],
        out: &mut Sample,
    ) -> bool {
        let mut ok_any = false;
        let mut i = 0;
        while i < fields.len() {
            let start = fields[i].register();
            let mut count: u16 = 1;
            while i + (count as usize) < fields.len()
                && fields[i + count as usize].register() == start + count
            {
                count += 1;
            }
            if let Some(regs) = self.read_group(http, start, count) {
                ok_any = true;
                for (k, value) in regs.into_iter().enumerate() {
                    if let Some(field) = FieldId::from_register(start + k as u16) {
                        out.set(field, value);
                    }
                }
            }
            i += count as usize;
        }
        ok_any
    }

    /// Write the export-power limit (register 8), clamped to 0..=100.
    /// The device must echo the request byte-for-byte.
    pub fn set_export_power(&self, http: &mut impl HttpPort, percent: i32, reason: &str) -> bool {
        let clamped = percent.clamp(0, 100);
        if clamped != percent {
            warn!("device: export power clamped to {clamped} from {percent}");
        }
        let addr = FieldId::ExportPercent.register();
        let request = modbus::make_write_single(SLAVE_ADDR, addr, clamped as u16);

        let response = match self.transport.post_frame(http, Endpoint::Write, &request) {
            Ok(r) => r,
            Err(e) => {
                self.report(DeviceFault::Timeout(e), addr, 1, true);
                return false;
            }
        };

        if response != request {
            match modbus::parse_exception_response(&response) {
                Ok((_, _, code)) => {
                    warn!(
                        "device: write exception 0x{code:02X} ({})",
                        modbus::exception_name(code)
                    );
                    self.report(DeviceFault::Exception(code), addr, 1, true);
                }
                Err(_) => {
                    warn!("device: write echo mismatch: {response}");
                    self.report(DeviceFault::HeaderMismatch, addr, 1, true);
                }
            }
            return false;
        }

        info!("device: export power set to {clamped}% ({reason})");
        true
    }
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ports::{HttpError, HttpResponse};
    use crate::error::TransportError;
    use crate::transport::RetryPolicy;
    use crossbeam_channel::bounded;

    /// Mock device endpoint: answers read requests from a register image
    /// and records writes; selected address ranges can be failed.
    struct MockInverter {
        regs: [u16; 10],
        fail_full_read: bool,
        fail_addrs: Vec<u16>,
        echo_writes: bool,
        write_log: Vec<(u16, u16)>,
    }

    impl MockInverter {
        fn new(regs: [u16; 10]) -> Self {
            Self {
                regs,
                fail_full_read: false,
                fail_addrs: Vec::new(),
                echo_writes: true,
                write_log: Vec::new(),
            }
        }

        fn respond(&mut self, frame_hex: &str) -> Option<String> {
            let bytes = modbus::hex_to_bytes(frame_hex);
            let (slave, func) = (bytes[0], bytes[1]);
            let addr = (u16::from(bytes[2]) << 8) | u16::from(bytes[3]);
            let operand = (u16::from(bytes[4]) << 8) | u16::from(bytes[5]);

            if func == modbus::FUNC_WRITE_SINGLE {
                self.write_log.push((addr, operand));
                return self.echo_writes.then(|| frame_hex.to_string());
            }

            let count = operand;
            if self.fail_full_read && count == 10 {
                return None;
            }
            if self.fail_addrs.iter().any(|a| (addr..addr + count).contains(a)) {
                return None;
            }

            let mut body = vec![slave, func, (count * 2) as u8];
            for r in addr..addr + count {
                let v = self.regs[r as usize];
                body.push((v >> 8) as u8);
                body.push((v & 0xFF) as u8);
            }
            let c = modbus::crc16(&body);
            body.push((c & 0xFF) as u8);
            body.push((c >> 8) as u8);
            Some(modbus::bytes_to_hex(&body))
        }
    }

    impl HttpPort for MockInverter {
        fn post(
            &mut self,
            _url: &str,
            _headers: &[(&str, &str)],
            body: &[u8],
            _timeout_ms: u32,
        ) -> Result<HttpResponse, HttpError> {
            let value: serde_json::Value = serde_json::from_slice(body).unwrap();
            let frame = value["frame"].as_str().unwrap();
            match self.respond(frame) {
                Some(reply) => Ok(HttpResponse {
                    status: 200,
                    body: format!(r#"{{"frame":"{reply}"}}"#).into_bytes(),
                }),
                None => Err(HttpError::Timeout),
            }
        }
    }

    fn client() -> (DeviceClient, crossbeam_channel::Receiver<FaultEvent>) {
        let (tx, rx) = bounded(16);
        let transport = DeviceTransport::new(
            "http://dev",
            "tok",
            RetryPolicy {
                retries: 0,
                base_ms: 0,
                max_ms: 0,
            },
        );
        (DeviceClient::new(transport, tx), rx)
    }

    const REGS: [u16; 10] = [300, 150, 210, 200, 100, 100, 100, 0, 90, 1000];

    #[test]
    fn read_all_grouped_path() {
        let (client, rx) = client();
        let mut http = MockInverter::new(REGS);
        let mut sample = Sample::default();
        assert!(client.read_all(&mut http, &mut sample));
        assert_eq!(sample.as_array(), REGS);
        assert!(rx.try_recv().is_err(), "no faults on the happy path");
    }

    #[test]
    fn read_all_falls_back_per_group() {
        let (client, rx) = client();
        let mut http = MockInverter::new(REGS);
        http.fail_full_read = true;
        http.fail_addrs = vec![2]; // fac1 group fails

        let mut sample = Sample::default();
        sample.fac1 = 777; // prior value must survive the failed group
        assert!(client.read_all(&mut http, &mut sample));

        assert_eq!(sample.vac1, 300);
        assert_eq!(sample.fac1, 777);
        assert_eq!(sample.pac, 1000);

        // full read + fac1 group each report one fault
        let faults: Vec<_> = rx.try_iter().collect();
        assert_eq!(faults.len(), 2);
        assert!(matches!(
            faults[0].fault,
            DeviceFault::Timeout(TransportError::Timeout)
        ));
    }

    #[test]
    fn read_all_false_when_everything_fails() {
        let (client, _rx) = client();
        let mut http = MockInverter::new(REGS);
        http.fail_full_read = true;
        http.fail_addrs = (0..10).collect();
        let mut sample = Sample::default();
        assert!(!client.read_all(&mut http, &mut sample));
    }

    #[test]
    fn read_selected_coalesces_runs() {
        let (client, _rx) = client();
        let mut http = MockInverter::new(REGS);
        let mut sample = Sample::default();
        // {vac1, iac1, fac1} and {temp} and {pac}: three exchanges
        let fields = [
            FieldId::Vac1,
            FieldId::Iac1,
            FieldId::Fac1,
            FieldId::Temp,
            FieldId::Pac,
        ];
        assert!(client.read_selected(&mut http, &fields, &mut sample));
        assert_eq!(sample.vac1, 300);
        assert_eq!(sample.fac1, 210);
        assert_eq!(sample.pac, 1000);
        assert_eq!(sample.vpv1, 0, "unselected fields untouched");
    }

    #[test]
    fn read_selected_partial_failure_updates_covered_fields_only() {
        let (client, _rx) = client();
        let mut http = MockInverter::new(REGS);
        http.fail_addrs = vec![9];
        let mut sample = Sample::default();
        let fields = [FieldId::Temp, FieldId::Pac];
        assert!(client.read_selected(&mut http, &fields, &mut sample));
        assert_eq!(sample.temp, 0);
        assert_eq!(sample.pac, 0, "failed run leaves prior value");
    }

    #[test]
    fn export_power_clamps_and_requires_echo() {
        let (client, rx) = client();
        let mut http = MockInverter::new(REGS);
        assert!(client.set_export_power(&mut http, 150, "test"));
        assert_eq!(http.write_log, vec![(8, 100)]);

        http.echo_writes = false;
        assert!(!client.set_export_power(&mut http, 50, "test"));
        let fault = rx.try_iter().last().unwrap();
        assert!(fault.write);
        assert_eq!(fault.addr, 8);
    }

    #[test]
    fn exception_response_is_classified() {
        struct ExceptionHttp;
        impl HttpPort for ExceptionHttp {
            fn post(
                &mut self,
                _url: &str,
                _headers: &[(&str, &str)],
                _body: &[u8],
                _timeout_ms: u32,
            ) -> Result<HttpResponse, HttpError> {
                let mut body = vec![SLAVE_ADDR, 0x83, 0x02];
                let c = modbus::crc16(&body);
                body.push((c & 0xFF) as u8);
                body.push((c >> 8) as u8);
                let hex = modbus::bytes_to_hex(&body);
                Ok(HttpResponse {
                    status: 200,
                    body: format!(r#"{{"frame":"{hex}"}}"#).into_bytes(),
                })
            }
        }

        let (client, rx) = client();
        let mut http = ExceptionHttp;
        assert!(client.read_group(&mut http, 0, 2).is_none());
        let fault = rx.try_recv().unwrap();
        assert_eq!(fault.fault, DeviceFault::Exception(0x02));
    }
}
