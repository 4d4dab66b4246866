//! Resource units consumed by workloads.

use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Capacity triple-plus-one: cores, memory, SSD and HDD bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Units {
    /// Virtual cores.
    pub cru: u64,
    /// Memory in bytes.
    pub mru: u64,
    /// SSD storage in bytes.
    pub sru: u64,
    /// HDD storage in bytes.
    pub hru: u64,
}

impl Units {
    pub const ZERO: Units = Units {
        cru: 0,
        mru: 0,
        sru: 0,
        hru: 0,
    };

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

/// Saturating: sizes come from tenants and may be absurd.
impl Add for Units {
    type Output = Units;

    fn add(self, rhs: Units) -> Units {
        Units {
            cru: self.cru.saturating_add(rhs.cru),
            mru: self.mru.saturating_add(rhs.mru),
            sru: self.sru.saturating_add(rhs.sru),
            hru: self.hru.saturating_add(rhs.hru),
        }
    }
}

impl AddAssign for Units {
    fn add_assign(&mut self, rhs: Units) {
        *self = *self + rhs;
    }
}

/// Storage medium backing a disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskType {
    #[default]
    Ssd,
    Hdd,
}

impl DiskType {
    /// Units charged for `size` bytes on this medium.
    pub fn units(&self, size: u64) -> Units {
        match self {
            DiskType::Ssd => Units {
                sru: size,
                ..Units::ZERO
            },
            DiskType::Hdd => Units {
                hru: size,
                ..Units::ZERO
            },
        }
    }
}
