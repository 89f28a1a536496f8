use std::ptr::{self, NonNull};
use std::rc::Rc;

use crate::{MemoryType, Prot, Result, PAGE_SIZE};

/// The privileged memory service a driver runs against.
///
/// It hands out physically contiguous memory for device DMA, translates
/// virtual addresses of driver buffers to physical ones and maps physical
/// ranges (BARs) into the driver's address space.
pub trait PhysicalMemory {
    /// Allocates `size` bytes of zeroed, physically contiguous memory mapped
    /// read-write. `size` must be a multiple of [`PAGE_SIZE`].
    ///
    /// Returns the physical address and the virtual mapping.
    fn alloc_contiguous(&self, size: usize) -> Result<(usize, NonNull<u8>)>;

    /// ## Safety
    /// `phys`, `virt` and `size` must describe an allocation returned by
    /// [`PhysicalMemory::alloc_contiguous`] that is no longer referenced.
    unsafe fn free_contiguous(&self, phys: usize, virt: NonNull<u8>, size: usize);

    /// Returns the physical address backing the virtual address `virt`.
    fn translate(&self, virt: usize) -> Result<usize>;

    /// Maps `len` bytes of physical memory at `base_phys`. Both must be page
    /// aligned.
    ///
    /// ## Safety
    /// The range must not alias memory owned by the driver.
    unsafe fn physmap(
        &self,
        base_phys: usize,
        len: usize,
        prot: Prot,
        ty: MemoryType,
    ) -> Result<NonNull<u8>>;

    /// ## Safety
    /// `virt` and `len` must describe a live mapping created by
    /// [`PhysicalMemory::physmap`].
    unsafe fn funmap(&self, virt: NonNull<u8>, len: usize);
}

fn assert_aligned(x: usize) {
    assert_eq!(x % PAGE_SIZE, 0);
}

/// An RAII guard of a physically contiguous DMA allocation. The region is
/// page-aligned and takes up whole pages.
pub struct DmaRegion {
    memory: Rc<dyn PhysicalMemory>,
    phys: usize,
    virt: NonNull<u8>,
    size: usize,
}

impl DmaRegion {
    /// Allocates a zeroed region of at least `size` bytes.
    pub fn zeroed(memory: Rc<dyn PhysicalMemory>, size: usize) -> Result<Self> {
        let size = size.next_multiple_of(PAGE_SIZE);
        let (phys, virt) = memory.alloc_contiguous(size)?;
        assert_aligned(phys);

        unsafe { ptr::write_bytes(virt.as_ptr(), 0, size) };

        Ok(Self {
            memory,
            phys,
            virt,
            size,
        })
    }

    /// Retrieve the byte address in physical memory, of this allocation.
    pub fn physical(&self) -> usize {
        self.phys
    }

    /// Retrieve the size in bytes of the alloc.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.virt.as_ptr()
    }

    /// Physical address of the byte at `offset`.
    pub fn physical_at(&self, offset: usize) -> usize {
        assert!(offset < self.size, "dma: offset {offset:#x} outside region");
        self.phys + offset
    }

    /// Pointer to the byte at `offset`.
    pub fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        assert!(offset < self.size, "dma: offset {offset:#x} outside region");
        // SAFETY: `offset` is inside the allocation.
        unsafe { NonNull::new_unchecked(self.virt.as_ptr().add(offset)) }
    }
}

impl std::fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaRegion")
            .field("phys", &format_args!("{:#x}", self.phys))
            .field("size", &self.size)
            .finish()
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        unsafe { self.memory.free_contiguous(self.phys, self.virt, self.size) }
    }
}
