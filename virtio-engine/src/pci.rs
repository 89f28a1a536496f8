//! The slice of the PCI bus service a virtio driver consumes.

use std::rc::Rc;

use common::io::PortSpace;
use futures::future::LocalBoxFuture;

use crate::irq::InterruptLine;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PciBar {
    None,
    Memory32 { addr: u32, size: u32 },
    Memory64 { addr: u64, size: u64 },
    Port(u16),
}

impl PciBar {
    /// Physical base address of a memory BAR.
    pub fn memory_base(&self) -> Option<usize> {
        match *self {
            PciBar::Memory32 { addr, .. } => Some(addr as usize),
            PciBar::Memory64 { addr, .. } => Some(addr as usize),
            PciBar::None | PciBar::Port(_) => None,
        }
    }

    pub fn is_port(&self) -> bool {
        matches!(self, PciBar::Port(_))
    }
}

/// Body of a vendor-specific capability, starting right after the generic
/// `cap_vndr`/`cap_next`/`cap_len` header bytes.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct VendorSpecificCapability {
    pub data: Vec<u8>,
}

/// A PCI function handed to the driver by the bus service.
pub trait PciFunction {
    fn vendor_id(&self) -> u16;

    fn device_id(&self) -> u16;

    /// ## Panics
    /// If `index` is not below 6.
    fn bar(&self, index: u8) -> PciBar;

    /// All vendor-specific capabilities, in configuration-space order.
    fn vendor_capabilities(&self) -> Vec<VendorSpecificCapability>;

    /// Grants the process access to the ports of the I/O BAR `index`.
    fn enable_port_io(&self, index: u8) -> common::Result<Rc<dyn PortSpace>>;

    /// Returns the interrupt line assigned to the function.
    fn interrupt_line(&self) -> common::Result<Box<dyn InterruptLine>>;

    /// Lets the function raise interrupts on the bus.
    fn enable_bus_irq(&self) -> LocalBoxFuture<'_, common::Result<()>>;
}
