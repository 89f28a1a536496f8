//! [2.7 Split Virtqueues](https://docs.oasis-open.org/virtio/virtio/v1.2/cs01/virtio-v1.2-cs01.html#x1-350007)

use core::mem::size_of;
use core::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};

use crate::utils::{align_up, IncompleteArrayField, VolatileCell};
use static_assertions::const_assert_eq;

/// [2.7.5 The Virtqueue Descriptor table](https://docs.oasis-open.org/virtio/virtio/v1.2/cs01/virtio-v1.2-cs01.html#x1-430005)
#[repr(C, align(16))]
pub struct Descriptor {
    /// Address (guest-physical).
    address: AtomicU64,
    /// Length of the buffer.
    size: AtomicU32,
    flags: AtomicU16,
    /// Next field if flags & NEXT
    next: AtomicU16,
}

const_assert_eq!(core::mem::size_of::<Descriptor>(), 16);

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct DescriptorFlags: u16 {
        /// This marks a buffer as continuing via the next field.
        const NEXT = 1 << 0;
        /// This marks a buffer as device write-only (otherwise device read-only).
        const WRITE_ONLY = 1 << 1;
        /// This means the buffer contains a list of buffer descriptors.
        const INDIRECT = 1 << 2;
    }
}

impl Descriptor {
    pub fn set_addr(&self, addr: u64) {
        self.address.store(addr, Ordering::SeqCst)
    }

    pub fn set_size(&self, size: u32) {
        self.size.store(size, Ordering::SeqCst)
    }

    pub fn set_next(&self, next: u16) {
        self.next.store(next, Ordering::SeqCst)
    }

    pub fn set_flags(&self, flags: DescriptorFlags) {
        self.flags.store(flags.bits(), Ordering::SeqCst)
    }

    pub fn insert_flags(&self, flags: DescriptorFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    pub fn addr(&self) -> u64 {
        self.address.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> u32 {
        self.size.load(Ordering::SeqCst)
    }

    pub fn next(&self) -> u16 {
        self.next.load(Ordering::SeqCst)
    }

    pub fn flags(&self) -> DescriptorFlags {
        DescriptorFlags::from_bits_retain(self.flags.load(Ordering::SeqCst))
    }
}

// ======== Available Ring ========
//
// XXX: The driver uses the available ring to offer buffers to the
//      device. Each ring entry refers to the head of a descriptor
//      chain.

/// [2.7.6 The Virtqueue Available Ring](https://docs.oasis-open.org/virtio/virtio/v1.2/cs01/virtio-v1.2-cs01.html#x1-490006)
#[repr(C, align(2))]
pub struct AvailableRing {
    pub flags: VolatileCell<u16>,
    pub head_index: AtomicU16,
    pub elements: IncompleteArrayField<AvailableRingElement>,
}

const_assert_eq!(core::mem::size_of::<AvailableRing>(), 4);

#[repr(C)]
pub struct AvailableRingElement {
    pub table_index: AtomicU16,
}

impl AvailableRingElement {
    pub fn set_table_index(&self, index: u16) {
        self.table_index.store(index, Ordering::SeqCst)
    }

    pub fn table_index(&self) -> u16 {
        self.table_index.load(Ordering::SeqCst)
    }
}

const_assert_eq!(core::mem::size_of::<AvailableRingElement>(), 2);

#[repr(C)]
pub struct AvailableRingExtra {
    pub used_event: VolatileCell<u16>, // Only if `VIRTIO_F_EVENT_IDX`
}

const_assert_eq!(core::mem::size_of::<AvailableRingExtra>(), 2);

// ======== Used Ring ========

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct UsedRingFlags: u16 {
        /// The device does not want to be notified about new available buffers.
        const NO_NOTIFY = 1;
    }
}

/// [2.7.8 The Virtqueue Used Ring](https://docs.oasis-open.org/virtio/virtio/v1.2/cs01/virtio-v1.2-cs01.html#x1-540008)
#[repr(C, align(4))]
pub struct UsedRing {
    pub flags: VolatileCell<u16>,
    pub head_index: VolatileCell<u16>,
    pub elements: IncompleteArrayField<UsedRingElement>,
}

const_assert_eq!(core::mem::size_of::<UsedRing>(), 4);

#[repr(C)]
pub struct UsedRingElement {
    /// Head of the retired descriptor chain.
    pub table_index: VolatileCell<u32>,
    /// Number of bytes the device wrote into the chain.
    pub written: VolatileCell<u32>,
}

const_assert_eq!(core::mem::size_of::<UsedRingElement>(), 8);

#[repr(C)]
pub struct UsedRingExtra {
    pub avail_event: VolatileCell<u16>,
}

const_assert_eq!(core::mem::size_of::<UsedRingExtra>(), 2);

/// Alignment of the available ring for both PCI transports.
pub const AVAILABLE_ALIGN: usize = 2;
/// Legacy devices compute the used ring address from the table PFN, so it has
/// to start on a page boundary.
pub const LEGACY_USED_ALIGN: usize = 4096;
/// Alignment of the used ring when its address is programmed explicitly.
pub const USED_ALIGN: usize = 4;

/// Placement of the three parts of a split virtqueue inside one contiguous
/// region.
///
/// ## Reference
/// Section 2.7 Split Virtqueues of the specification v1.2 describes the
/// alignment and size of the queue parts; 4.1.5.1.3.1 the legacy layout.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct QueueLayout {
    pub queue_size: u16,
    pub available_offset: usize,
    pub used_offset: usize,
    /// Total size of the region in bytes.
    pub size: usize,
}

impl QueueLayout {
    /// ## Panics
    /// If `queue_size` is not a power of two or is zero.
    pub const fn new(queue_size: u16, used_align: usize) -> Self {
        assert!(queue_size.is_power_of_two());
        let n = queue_size as usize;

        let table = size_of::<Descriptor>() * n;
        let available = size_of::<AvailableRing>()
            + size_of::<AvailableRingElement>() * n
            + size_of::<AvailableRingExtra>();
        let used =
            size_of::<UsedRing>() + size_of::<UsedRingElement>() * n + size_of::<UsedRingExtra>();

        let available_offset = align_up(table, AVAILABLE_ALIGN);
        let used_offset = align_up(available_offset + available, used_align);

        Self {
            queue_size,
            available_offset,
            used_offset,
            size: used_offset + used,
        }
    }

    pub const fn legacy(queue_size: u16) -> Self {
        Self::new(queue_size, LEGACY_USED_ALIGN)
    }

    pub const fn standard(queue_size: u16) -> Self {
        Self::new(queue_size, USED_ALIGN)
    }
}
