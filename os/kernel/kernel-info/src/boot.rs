//! # Boot Memory Map
//!
//! The bootloader hands the kernel a list of physical ranges together with
//! their firmware-reported type. The frame allocator is seeded from it.

/// Firmware classification of a physical range.
///
/// Discriminants follow the multiboot memory map `type` field.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BootMemoryKind {
    /// Usable RAM.
    Available = 1,
    /// Reserved by firmware or hardware.
    Reserved = 2,
    /// ACPI tables; reclaimable once parsed.
    AcpiReclaimable = 3,
    /// ACPI non-volatile storage.
    AcpiNvs = 4,
    /// Defective RAM.
    BadMemory = 5,
}

impl BootMemoryKind {
    /// Decode a multiboot `type` value. Unknown values are treated as reserved.
    #[must_use]
    pub const fn from_multiboot(value: u32) -> Self {
        match value {
            1 => Self::Available,
            3 => Self::AcpiReclaimable,
            4 => Self::AcpiNvs,
            5 => Self::BadMemory,
            _ => Self::Reserved,
        }
    }
}

/// One `[start, end)` range of the boot memory map.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BootMemoryRegion {
    /// Inclusive physical start address.
    pub start: u64,
    /// Exclusive physical end address.
    pub end: u64,
    pub kind: BootMemoryKind,
}

impl BootMemoryRegion {
    #[must_use]
    pub const fn new(start: u64, end: u64, kind: BootMemoryKind) -> Self {
        Self { start, end, kind }
    }

    /// Build a region from the multiboot `(addr, len, type)` triple.
    #[must_use]
    pub const fn from_multiboot(addr: u64, len: u64, kind: u32) -> Self {
        Self::new(addr, addr.saturating_add(len), BootMemoryKind::from_multiboot(kind))
    }

    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn is_available(&self) -> bool {
        matches!(self.kind, BootMemoryKind::Available)
    }
}
