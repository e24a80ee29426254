//! Update-partition adapter.
//!
//! - **`target_os = "espidf"`** — raw `esp_partition_*` I/O against the
//!   next OTA app partition, plus `esp_ota_set_boot_partition` and the
//!   rollback state queries. Writing through the partition API (instead of
//!   the `esp_ota_*` handle API) is what makes cross-reboot resume
//!   possible: a fresh `begin` erases the region, a `resume` does not.
//! - **host** — an in-memory region with the same open/offset semantics
//!   and test hooks for region states and content inspection.

use crate::app::ports::{PartitionError, RegionState, UpdatePartitionPort};
use log::{info, warn};

// ───────────────────────────────────────────────────────────────
// ESP-IDF backend
// ───────────────────────────────────────────────────────────────

#[cfg(target_os = "espidf")]
pub struct OtaPartition {
    part: *const esp_idf_svc::sys::esp_partition_t,
    write_offset: u32,
    image_size: u32,
    open: bool,
}

#[cfg(target_os = "espidf")]
impl OtaPartition {
    pub fn new() -> Self {
        Self {
            part: core::ptr::null(),
            write_offset: 0,
            image_size: 0,
            open: false,
        }
    }

    fn select_region(&mut self) -> Result<(), PartitionError> {
        // SAFETY: returns a borrowed pointer into the static partition
        // table, valid for the process lifetime.
        let part = unsafe {
            esp_idf_svc::sys::esp_ota_get_next_update_partition(core::ptr::null())
        };
        if part.is_null() {
            warn!("partition: no inactive update region");
            return Err(PartitionError::NoRegion);
        }
        self.part = part;
        Ok(())
    }

    fn map_state(raw: esp_idf_svc::sys::esp_ota_img_states_t) -> RegionState {
        use esp_idf_svc::sys::*;
        match raw {
            esp_ota_img_states_t_ESP_OTA_IMG_NEW
            | esp_ota_img_states_t_ESP_OTA_IMG_PENDING_VERIFY => RegionState::PendingVerify,
            esp_ota_img_states_t_ESP_OTA_IMG_VALID => RegionState::Valid,
            esp_ota_img_states_t_ESP_OTA_IMG_INVALID
            | esp_ota_img_states_t_ESP_OTA_IMG_ABORTED => RegionState::Invalid,
            _ => RegionState::Fresh,
        }
    }

    fn state_of(part: *const esp_idf_svc::sys::esp_partition_t) -> RegionState {
        if part.is_null() {
            return RegionState::Fresh;
        }
        let mut raw: esp_idf_svc::sys::esp_ota_img_states_t = 0;
        // SAFETY: part points into the static partition table.
        let ret = unsafe { esp_idf_svc::sys::esp_ota_get_state_partition(part, &mut raw) };
        if ret != esp_idf_svc::sys::ESP_OK {
            return RegionState::Fresh;
        }
        Self::map_state(raw)
    }
}

#[cfg(target_os = "espidf")]
impl Default for OtaPartition {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "espidf")]
impl UpdatePartitionPort for OtaPartition {
    fn begin(&mut self, image_size: u32) -> Result<(), PartitionError> {
        use esp_idf_svc::sys::*;
        self.select_region()?;
        // Erase enough 4 KiB sectors to hold the image.
        let erase_len = (image_size as usize + 4095) & !4095;
        // SAFETY: range is bounded by the region size; IDF validates.
        let ret = unsafe { esp_partition_erase_range(self.part, 0, erase_len) };
        if ret != ESP_OK {
            warn!("partition: erase failed ({ret})");
            return Err(PartitionError::Io);
        }
        self.write_offset = 0;
        self.image_size = image_size;
        self.open = true;
        info!("partition: begin ({image_size} bytes)");
        Ok(())
    }

    fn resume(&mut self, image_size: u32, written: u32) -> Result<(), PartitionError> {
        self.select_region()?;
        self.write_offset = written;
        self.image_size = image_size;
        self.open = true;
        info!("partition: resume at {written}/{image_size}");
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), PartitionError> {
        if !self.open {
            return Err(PartitionError::Io);
        }
        // SAFETY: data pointer/length are valid for the call duration.
        let ret = unsafe {
            esp_idf_svc::sys::esp_partition_write(
                self.part,
                self.write_offset as usize,
                data.as_ptr() as *const _,
                data.len(),
            )
        };
        if ret != esp_idf_svc::sys::ESP_OK {
            warn!("partition: write failed at {} ({ret})", self.write_offset);
            return Err(PartitionError::Io);
        }
        self.write_offset += data.len() as u32;
        Ok(())
    }

    fn read_back(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), PartitionError> {
        if !self.open {
            return Err(PartitionError::Io);
        }
        // SAFETY: buf pointer/length are valid for the call duration.
        let ret = unsafe {
            esp_idf_svc::sys::esp_partition_read(
                self.part,
                offset as usize,
                buf.as_mut_ptr() as *mut _,
                buf.len(),
            )
        };
        if ret != esp_idf_svc::sys::ESP_OK {
            return Err(PartitionError::Io);
        }
        Ok(())
    }

    fn end(&mut self) -> Result<(), PartitionError> {
        self.open = false;
        Ok(())
    }

    fn abort(&mut self) {
        self.open = false;
    }

    fn set_boot(&mut self) -> Result<(), PartitionError> {
        if self.part.is_null() {
            return Err(PartitionError::SetBoot);
        }
        // SAFETY: part points into the static partition table.
        let ret = unsafe { esp_idf_svc::sys::esp_ota_set_boot_partition(self.part) };
        if ret != esp_idf_svc::sys::ESP_OK {
            warn!("partition: set_boot failed ({ret})");
            return Err(PartitionError::SetBoot);
        }
        Ok(())
    }

    fn running_state(&self) -> RegionState {
        // SAFETY: returns a borrowed pointer into the static table.
        let running = unsafe { esp_idf_svc::sys::esp_ota_get_running_partition() };
        Self::state_of(running)
    }

    fn update_region_state(&self) -> RegionState {
        let next = unsafe {
            esp_idf_svc::sys::esp_ota_get_next_update_partition(core::ptr::null())
        };
        Self::state_of(next)
    }

    fn mark_valid(&mut self) -> Result<(), PartitionError> {
        let ret = unsafe { esp_idf_svc::sys::esp_ota_mark_app_valid_cancel_rollback() };
        if ret != esp_idf_svc::sys::ESP_OK {
            return Err(PartitionError::Io);
        }
        info!("partition: running image marked valid (rollback cancelled)");
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────
// Host simulation backend
// ───────────────────────────────────────────────────────────────

#[cfg(not(target_os = "espidf"))]
pub struct OtaPartition {
    region: Vec<u8>,
    write_offset: u32,
    image_size: u32,
    open: bool,
    boot_set: bool,
    running: RegionState,
    update_region: RegionState,
}

#[cfg(not(target_os = "espidf"))]
impl OtaPartition {
    pub fn new() -> Self {
        Self {
            region: Vec::new(),
            write_offset: 0,
            image_size: 0,
            open: false,
            boot_set: false,
            running: RegionState::Valid,
            update_region: RegionState::Fresh,
        }
    }

    // ── test hooks ────────────────────────────────────────────

    /// Bytes written so far, in write order.
    pub fn written_bytes(&self) -> &[u8] {
        &self.region[..self.write_offset as usize]
    }

    pub fn boot_region_switched(&self) -> bool {
        self.boot_set
    }

    pub fn set_running_state(&mut self, state: RegionState) {
        self.running = state;
    }

    pub fn set_update_region_state(&mut self, state: RegionState) {
        self.update_region = state;
    }
}

#[cfg(not(target_os = "espidf"))]
impl Default for OtaPartition {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(target_os = "espidf"))]
impl UpdatePartitionPort for OtaPartition {
    fn begin(&mut self, image_size: u32) -> Result<(), PartitionError> {
        self.region = vec![0xFF; image_size as usize];
        self.write_offset = 0;
        self.image_size = image_size;
        self.open = true;
        self.boot_set = false;
        info!("partition(sim): begin ({image_size} bytes)");
        Ok(())
    }

    fn resume(&mut self, image_size: u32, written: u32) -> Result<(), PartitionError> {
        if self.region.len() != image_size as usize || written as usize > self.region.len() {
            return Err(PartitionError::Io);
        }
        self.write_offset = written;
        self.image_size = image_size;
        self.open = true;
        info!("partition(sim): resume at {written}/{image_size}");
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), PartitionError> {
        if !self.open {
            return Err(PartitionError::Io);
        }
        let start = self.write_offset as usize;
        let end = start + data.len();
        if end > self.region.len() {
            return Err(PartitionError::Io);
        }
        self.region[start..end].copy_from_slice(data);
        self.write_offset = end as u32;
        Ok(())
    }

    fn read_back(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), PartitionError> {
        if !self.open {
            return Err(PartitionError::Io);
        }
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.region.len() {
            return Err(PartitionError::Io);
        }
        buf.copy_from_slice(&self.region[start..end]);
        Ok(())
    }

    fn end(&mut self) -> Result<(), PartitionError> {
        self.open = false;
        Ok(())
    }

    fn abort(&mut self) {
        self.open = false;
    }

    fn set_boot(&mut self) -> Result<(), PartitionError> {
        self.boot_set = true;
        self.update_region = RegionState::PendingVerify;
        Ok(())
    }

    fn running_state(&self) -> RegionState {
        self.running
    }

    fn update_region_state(&self) -> RegionState {
        self.update_region
    }

    fn mark_valid(&mut self) -> Result<(), PartitionError> {
        self.running = RegionState::Valid;
        Ok(())
    }
}

#[cfg(all(test, not(target_os = "espidf")))]
mod tests {
    use super::*;

    #[test]
    fn sequential_writes_land_in_order() {
        let mut part = OtaPartition::new();
        part.begin(8).unwrap();
        part.write(b"abcd").unwrap();
        part.write(b"efgh").unwrap();
        assert_eq!(part.written_bytes(), b"abcdefgh");
    }

    #[test]
    fn overflowing_write_fails() {
        let mut part = OtaPartition::new();
        part.begin(4).unwrap();
        assert!(part.write(b"12345").is_err());
    }

    #[test]
    fn resume_preserves_content_and_offset() {
        let mut part = OtaPartition::new();
        part.begin(8).unwrap();
        part.write(b"abcd").unwrap();
        part.end().unwrap();

        part.resume(8, 4).unwrap();
        let mut buf = [0u8; 4];
        part.read_back(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
        part.write(b"efgh").unwrap();
        assert_eq!(part.written_bytes(), b"abcdefgh");
    }

    #[test]
    fn resume_size_mismatch_fails() {
        let mut part = OtaPartition::new();
        part.begin(8).unwrap();
        assert!(part.resume(16, 4).is_err());
    }

    #[test]
    fn closed_handle_rejects_io() {
        let mut part = OtaPartition::new();
        assert!(part.write(b"x").is_err());
        part.begin(4).unwrap();
        part.end().unwrap();
        assert!(part.write(b"x").is_err());
    }
}
