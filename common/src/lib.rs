pub mod dma;
pub mod io;
mod logger;

pub use logger::{file_level, output_level, setup_logging};

/// Size of a page frame; every DMA allocation and physical mapping is a
/// multiple of it.
pub const PAGE_SIZE: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("out of physically contiguous memory (requested {0:#x} bytes)")]
    OutOfMemory(usize),
    #[error("no physical translation for virtual address {0:#x}")]
    Translation(usize),
    #[error("failed to map {len:#x} bytes of physical memory at {phys:#x}")]
    Map { phys: usize, len: usize },
    #[error("I/O port access to {0:#x} denied")]
    PortAccess(u16),
    #[error("interrupt service: {0}")]
    Interrupt(String),
    #[error("operation not supported by this service")]
    Unsupported,
    #[error("service I/O failed")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryType {
    Writeback,
    Uncacheable,
    WriteCombining,
    DeviceMemory,
}
impl Default for MemoryType {
    fn default() -> Self {
        Self::Writeback
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Prot {
    pub read: bool,
    pub write: bool,
}
impl Prot {
    pub const RO: Self = Self { read: true, write: false };
    pub const WO: Self = Self { read: false, write: true };
    pub const RW: Self = Self { read: true, write: true };
}

/// Rounds `addr` down to the start of its page.
pub const fn page_base(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Offset of `addr` within its page.
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_SIZE - 1)
}
