// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Bootloader capability bitset

use std::{fmt, ops::BitOr};

/// A single capability a bootloader backend may require or provide
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Capability {
    Uefi = 0b0000_0001,
    Gpt = 0b0000_0010,
    Legacy = 0b0000_0100,
    Extfs = 0b0000_1000,
    Fatfs = 0b0001_0000,
    Partless = 0b0010_0000,
}

/// A set of [`Capability`] flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapabilitySet(u8);

impl CapabilitySet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn of(caps: &[Capability]) -> Self {
        let mut bits = 0u8;
        let mut i = 0;
        while i < caps.len() {
            bits |= caps[i] as u8;
            i += 1;
        }
        Self(bits)
    }

    pub fn insert(&mut self, cap: Capability) {
        self.0 |= cap as u8;
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.0 & (cap as u8) == cap as u8
    }

    /// True iff `self` provides at least every capability `wanted` requires
    pub fn is_superset_of(&self, wanted: CapabilitySet) -> bool {
        self.0 & wanted.0 == wanted.0
    }
}

impl BitOr for CapabilitySet {
    type Output = CapabilitySet;

    fn bitor(self, rhs: Self) -> Self::Output {
        CapabilitySet(self.0 | rhs.0)
    }
}

impl BitOr<Capability> for CapabilitySet {
    type Output = CapabilitySet;

    fn bitor(self, rhs: Capability) -> Self::Output {
        CapabilitySet(self.0 | rhs as u8)
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Capability::Uefi, "UEFI"),
            (Capability::Gpt, "GPT"),
            (Capability::Legacy, "LEGACY"),
            (Capability::Extfs, "EXTFS"),
            (Capability::Fatfs, "FATFS"),
            (Capability::Partless, "PARTLESS"),
        ];
        let matched = names
            .iter()
            .filter(|(cap, _)| self.contains(*cap))
            .map(|(_, name)| *name)
            .collect::<Vec<_>>()
            .join("|");
        write!(f, "{matched}")
    }
}

/// Static capability sets for the known bootloader backends
pub mod sets {
    use super::{Capability::*, CapabilitySet};

    pub const ESP_CLASS: CapabilitySet = CapabilitySet::of(&[Uefi, Gpt, Fatfs]);
    pub const SHIM: CapabilitySet = CapabilitySet::of(&[Uefi, Gpt]);
    pub const SYSLINUX: CapabilitySet = CapabilitySet::of(&[Gpt, Legacy, Fatfs]);
    pub const EXTLINUX: CapabilitySet = CapabilitySet::of(&[Gpt, Legacy, Extfs]);
    pub const GRUB2: CapabilitySet = CapabilitySet::of(&[Legacy, Extfs]);
}

#[cfg(test)]
mod tests {
    use super::{sets, Capability};

    #[test]
    fn esp_class_is_superset_of_uefi_gpt() {
        let wanted = super::CapabilitySet::of(&[Capability::Uefi, Capability::Gpt]);
        assert!(sets::ESP_CLASS.is_superset_of(wanted));
        assert!(!sets::GRUB2.is_superset_of(wanted));
    }

    #[test]
    fn syslinux_not_superset_of_extfs() {
        let wanted = super::CapabilitySet::of(&[Capability::Legacy, Capability::Extfs]);
        assert!(!sets::SYSLINUX.is_superset_of(wanted));
        assert!(sets::EXTLINUX.is_superset_of(wanted));
    }
}
