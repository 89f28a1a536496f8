//! Wire-level definitions from the VirtIO specification.
//!
//! <https://docs.oasis-open.org/virtio/virtio/v1.2/cs01/virtio-v1.2-cs01.html>

bitflags::bitflags! {
    /// [2.1 Device Status Field](https://docs.oasis-open.org/virtio/virtio/v1.2/cs01/virtio-v1.2-cs01.html#x1-110001)
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct DeviceStatusFlags: u8 {
        /// The driver has found the device and recognized it as a valid device.
        const ACKNOWLEDGE = 1;
        /// The driver knows how to drive the device.
        const DRIVER = 2;
        /// The driver is set up and ready to drive the device.
        const DRIVER_OK = 4;
        /// Feature negotiation is complete.
        const FEATURES_OK = 8;
        /// The device hit an error it cannot recover from without a reset.
        const DEVICE_NEEDS_RESET = 64;
        /// The driver has given up on the device.
        const FAILED = 128;
    }
}

bitflags::bitflags! {
    /// ISR status byte, shared by the legacy and the standard PCI transport.
    /// Reading it acknowledges the interrupt on the device side.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct IsrStatus: u8 {
        /// At least one virtqueue made progress.
        const QUEUE = 1 << 0;
        /// The device configuration changed.
        const CONFIG_CHANGE = 1 << 1;
    }
}

/// Compliance with version 1 of the VirtIO specification ("modern" device).
///
/// See `6 Reserved Feature Bits`.
pub const VIRTIO_F_VERSION_1: u32 = 32;

/// PCI vendor ID shared by every virtio function.
pub const VIRTIO_PCI_VENDOR: u16 = 0x1AF4;

mod split_virtqueue;
pub use split_virtqueue::*;

// Packed virtqueues (2.8) are not supported.

mod transport_pci;
pub use transport_pci::*;
