//! Inverter register data model.
//!
//! A [`Sample`] is one snapshot of the ten holding registers the agent
//! cares about, in canonical field order. Register addresses 0..9 map
//! one-to-one onto [`FieldId`] discriminants, so the field id doubles as
//! the Modbus register address.

use serde::{Deserialize, Serialize};

/// Number of registers in the canonical set.
pub const FIELD_COUNT: usize = 10;

/// Canonical field order, shared by the acquisition path and the batch
/// codec. The discriminant is also the holding-register address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FieldId {
    Vac1 = 0,
    Iac1 = 1,
    Fac1 = 2,
    Vpv1 = 3,
    Vpv2 = 4,
    Ipv1 = 5,
    Ipv2 = 6,
    Temp = 7,
    ExportPercent = 8,
    Pac = 9,
}

/// All fields in canonical order.
pub const ALL_FIELDS: [FieldId; FIELD_COUNT] = [
    FieldId::Vac1,
    FieldId::Iac1,
    FieldId::Fac1,
    FieldId::Vpv1,
    FieldId::Vpv2,
    FieldId::Ipv1,
    FieldId::Ipv2,
    FieldId::Temp,
    FieldId::ExportPercent,
    FieldId::Pac,
];

impl FieldId {
    /// Holding-register address of this field.
    pub const fn register(self) -> u16 {
        self as u16
    }

    /// Canonical wire name (the name the cloud sees in `order[]`).
    pub const fn name(self) -> &'static str {
        match self {
            Self::Vac1 => "vac1",
            Self::Iac1 => "iac1",
            Self::Fac1 => "fac1",
            Self::Vpv1 => "vpv1",
            Self::Vpv2 => "vpv2",
            Self::Ipv1 => "ipv1",
            Self::Ipv2 => "ipv2",
            Self::Temp => "temp",
            Self::ExportPercent => "export_percent",
            Self::Pac => "pac",
        }
    }

    /// Map a register address back to a field id.
    pub fn from_register(addr: u16) -> Option<Self> {
        ALL_FIELDS.get(addr as usize).copied()
    }

    /// Resolve a cloud-supplied register name, including the accepted
    /// aliases (`voltage`, `current`, `frequency`, `temperature`,
    /// `export`, `power`). Case-insensitive.
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        match lower.as_str() {
            "voltage" | "vac1" => Some(Self::Vac1),
            "current" | "iac1" => Some(Self::Iac1),
            "frequency" | "fac1" => Some(Self::Fac1),
            "vpv1" => Some(Self::Vpv1),
            "vpv2" => Some(Self::Vpv2),
            "ipv1" => Some(Self::Ipv1),
            "ipv2" => Some(Self::Ipv2),
            "temperature" | "temp" => Some(Self::Temp),
            "export_percent" | "export" => Some(Self::ExportPercent),
            "pac" | "power" => Some(Self::Pac),
            _ => None,
        }
    }
}

/// One snapshot of the ten registers, raw device units. Scaling is a
/// presentation concern on the server side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sample {
    pub vac1: u16,
    pub iac1: u16,
    pub fac1: u16,
    pub vpv1: u16,
    pub vpv2: u16,
    pub ipv1: u16,
    pub ipv2: u16,
    pub temp: u16,
    pub export_percent: u16,
    pub pac: u16,
}

impl Sample {
    /// Values in canonical field order.
    pub fn as_array(&self) -> [u16; FIELD_COUNT] {
        [
            self.vac1,
            self.iac1,
            self.fac1,
            self.vpv1,
            self.vpv2,
            self.ipv1,
            self.ipv2,
            self.temp,
            self.export_percent,
            self.pac,
        ]
    }

    pub fn get(&self, field: FieldId) -> u16 {
        self.as_array()[field as usize]
    }

    pub fn set(&mut self, field: FieldId, value: u16) {
        match field {
            FieldId::Vac1 => self.vac1 = value,
            FieldId::Iac1 => self.iac1 = value,
            FieldId::Fac1 => self.fac1 = value,
            FieldId::Vpv1 => self.vpv1 = value,
            FieldId::Vpv2 => self.vpv2 = value,
            FieldId::Ipv1 => self.ipv1 = value,
            FieldId::Ipv2 => self.ipv2 = value,
            FieldId::Temp => self.temp = value,
            FieldId::ExportPercent => self.export_percent = value,
            FieldId::Pac => self.pac = value,
        }
    }
}

/// A sample stamped with wall-clock milliseconds at capture. When no time
/// sync has been obtained the stamp is the raw monotonic count (offset 0).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimestampedRecord {
    pub epoch_ms: u64,
    pub sample: Sample,
}
