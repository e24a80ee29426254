//! Periodic register sampler — the producer side of the ring.
//!
//! One single-purpose worker: each tick reads the currently selected
//! fields (coalesced into register runs) or the full set, stamps the
//! snapshot, and pushes it into the shared ring. The sampling period is
//! re-read from the live config at the top of every loop, so a staged
//! configuration takes effect at the next tick.
//!
//! Read failures are rate-limited to one `acq_read_fail` event per three
//! consecutive failures; ring overwrites emit one `buffer_overflow` event
//! per occurrence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::Sender;
use log::debug;

use crate::app::events::AppEvent;
use crate::app::ports::{ClockPort, HttpPort};
use crate::config::RuntimeConfig;
use crate::device::DeviceClient;
use crate::ring::Ring;
use crate::sample::{Sample, TimestampedRecord};

/// Emit `acq_read_fail` once per this many consecutive failures.
const READ_FAIL_REPORT_EVERY: u32 = 3;

pub struct Sampler {
    client: DeviceClient,
    ring: Arc<Mutex<Ring>>,
    config: Arc<Mutex<RuntimeConfig>>,
    events: Sender<AppEvent>,
    /// Last known register values; failed sub-reads leave these in place.
    sample: Sample,
    consecutive_failures: u32,
}

impl Sampler {
    pub fn new(
        client: DeviceClient,
        ring: Arc<Mutex<Ring>>,
        config: Arc<Mutex<RuntimeConfig>>,
        events: Sender<AppEvent>,
    ) -> Self {
        Self {
            client,
            ring,
            config,
            events,
            sample: Sample::default(),
            consecutive_failures: 0,
        }
    }

    /// One acquisition cycle: read, stamp, enqueue.
    pub fn tick(&mut self, http: &mut impl HttpPort, clock: &impl ClockPort) {
        let (selects_all, fields) = {
            let cfg = self.config.lock().expect("config mutex");
            (cfg.selects_all(), cfg.fields.clone())
        };

        let ok_any = if selects_all {
            self.client.read_all(http, &mut self.sample)
        } else {
            self.client.read_selected(http, &fields, &mut self.sample)
        };

        if !ok_any {
            self.consecutive_failures += 1;
            if self.consecutive_failures % READ_FAIL_REPORT_EVERY == 0 {
                let _ = self.events.try_send(AppEvent::AcqReadFail);
            }
            return;
        }
        self.consecutive_failures = 0;

        let record = TimestampedRecord {
            epoch_ms: clock.epoch_ms(),
            sample: self.sample,
        };
        let overflowed = {
            let mut ring = self.ring.lock().expect("ring mutex");
            ring.push(record)
        };
        if overflowed {
            debug!("acq: ring overwrote oldest record");
            let _ = self.events.try_send(AppEvent::BufferOverflow);
        }
    }

    /// Worker loop. Returns when `running` clears.
    pub fn run(
        mut self,
        http: &mut impl HttpPort,
        clock: &impl ClockPort,
        running: Arc<AtomicBool>,
    ) {
        while running.load(Ordering::Relaxed) {
            let interval_ms = {
                let cfg = self.config.lock().expect("config mutex");
                cfg.sampling_interval
            };
            self.tick(http, clock);
            std::thread::sleep(std::time::Duration::from_millis(u64::from(interval_ms)));
        }
    }
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::time::SystemClock;
    use crate::app::ports::{HttpError, HttpResponse};
    use crate::modbus;
    use crate::sample::FieldId;
    use crate::transport::{DeviceTransport, RetryPolicy};
    use crossbeam_channel::bounded;

    /// Answers every read with a fixed register image, or fails outright.
    struct FixedInverter {
        regs: [u16; 10],
        fail: bool,
    }

    impl HttpPort for FixedInverter {
        fn post(
            &mut self,
            _url: &str,
            _headers: &[(&str, &str)],
            body: &[u8],
            _timeout_ms: u32,
        ) -> Result<HttpResponse, HttpError> {
            if self.fail {
                return Err(HttpError::Timeout);
            }
            let value: serde_json::Value = serde_json::from_slice(body).unwrap();
            let frame = modbus::hex_to_bytes(value["frame"].as_str().unwrap());
            let addr = (u16::from(frame[2]) << 8) | u16::from(frame[3]);
            let count = (u16::from(frame[4]) << 8) | u16::from(frame[5]);

            let mut reply = vec![frame[0], frame[1], (count * 2) as u8];
            for r in addr..addr + count {
                let v = self.regs[r as usize];
                reply.push((v >> 8) as u8);
                reply.push((v & 0xFF) as u8);
            }
            let c = modbus::crc16(&reply);
            reply.push((c & 0xFF) as u8);
            reply.push((c >> 8) as u8);
            let hex = modbus::bytes_to_hex(&reply);
            Ok(HttpResponse {
                status: 200,
                body: format!(r#"{{"frame":"{hex}"}}"#).into_bytes(),
            })
        }
    }

    fn sampler(
        ring_cap: usize,
        config: RuntimeConfig,
    ) -> (
        Sampler,
        Arc<Mutex<Ring>>,
        crossbeam_channel::Receiver<AppEvent>,
    ) {
        let (fault_tx, _fault_rx) = bounded(16);
        let (event_tx, event_rx) = bounded(16);
        let transport = DeviceTransport::new(
            "http://dev",
            "tok",
            RetryPolicy {
                retries: 0,
                base_ms: 0,
                max_ms: 0,
            },
        );
        let client = DeviceClient::new(transport, fault_tx);
        let ring = Arc::new(Mutex::new(Ring::new(ring_cap)));
        let config = Arc::new(Mutex::new(config));
        let sampler = Sampler::new(client, Arc::clone(&ring), config, event_tx);
        (sampler, ring, event_rx)
    }

    const REGS: [u16; 10] = [300, 150, 210, 200, 100, 100, 100, 0, 90, 1000];

    #[test]
    fn tick_pushes_timestamped_record() {
        let (mut sampler, ring, _events) = sampler(8, RuntimeConfig::default());
        let mut http = FixedInverter {
            regs: REGS,
            fail: false,
        };
        let clock = SystemClock::new();
        sampler.tick(&mut http, &clock);

        let mut ring = ring.lock().unwrap();
        assert_eq!(ring.size(), 1);
        let records = ring.snapshot_and_clear();
        assert_eq!(records[0].sample.as_array(), REGS);
    }

    #[test]
    fn selected_fields_only() {
        let config = RuntimeConfig {
            sampling_interval: 1_000,
            fields: vec![FieldId::Temp, FieldId::Pac],
        };
        let (mut sampler, ring, _events) = sampler(8, config);
        let mut http = FixedInverter {
            regs: REGS,
            fail: false,
        };
        let clock = SystemClock::new();
        sampler.tick(&mut http, &clock);

        let records = ring.lock().unwrap().snapshot_and_clear();
        assert_eq!(records[0].sample.pac, 1000);
        assert_eq!(records[0].sample.vac1, 0, "unselected fields stay default");
    }

    #[test]
    fn read_failures_are_rate_limited() {
        let (mut sampler, ring, events) = sampler(8, RuntimeConfig::default());
        let mut http = FixedInverter {
            regs: REGS,
            fail: true,
        };
        let clock = SystemClock::new();

        for _ in 0..7 {
            sampler.tick(&mut http, &clock);
        }
        assert_eq!(ring.lock().unwrap().size(), 0);
        let fails: Vec<_> = events
            .try_iter()
            .filter(|e| matches!(e, AppEvent::AcqReadFail))
            .collect();
        assert_eq!(fails.len(), 2, "one event per three consecutive failures");

        // a success resets the streak
        http.fail = false;
        sampler.tick(&mut http, &clock);
        http.fail = true;
        sampler.tick(&mut http, &clock);
        sampler.tick(&mut http, &clock);
        assert!(events
            .try_iter()
            .filter(|e| matches!(e, AppEvent::AcqReadFail))
            .next()
            .is_none());
    }

    #[test]
    fn overflow_emits_event_per_occurrence() {
        let (mut sampler, _ring, events) = sampler(2, RuntimeConfig::default());
        let mut http = FixedInverter {
            regs: REGS,
            fail: false,
        };
        let clock = SystemClock::new();
        for _ in 0..5 {
            sampler.tick(&mut http, &clock);
        }
        let overflows = events
            .try_iter()
            .filter(|e| matches!(e, AppEvent::BufferOverflow))
            .count();
        assert_eq!(overflows, 3);
    }
}
