use kernel_vmem::VmemError;

/// Failures surfaced by the memory manager.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MemoryError {
    #[error("out of physical frames")]
    OutOfFrames,
    #[error("no size class holds {0} bytes")]
    NoSizeClass(usize),
    #[error("the dynamic size class table is full")]
    ClassTableFull,
    #[error("invalid free of 0x{0:016X}")]
    InvalidFree(u64),
    #[error("heap would shrink below its base")]
    HeapUnderflow,
    #[error("zero-length range")]
    EmptyRange,
    #[error("0x{0:016X} lies outside its window")]
    OutOfWindow(u64),
    #[error("no free virtual range of {0} bytes")]
    NoFreeRange(u64),
    #[error("0x{0:016X} is not mapped")]
    Unmapped(u64),
    #[error("the address space is in use")]
    ActiveAddressSpace,
    #[error("page table conflict: {0}")]
    Mapping(VmemError),
}

impl From<VmemError> for MemoryError {
    fn from(value: VmemError) -> Self {
        match value {
            VmemError::OutOfFrames => Self::OutOfFrames,
            other => Self::Mapping(other),
        }
    }
}
