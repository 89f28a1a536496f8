use std::ptr::NonNull;
use std::rc::Rc;

use common::dma::PhysicalMemory;
use common::{page_base, page_offset, MemoryType, Prot, PAGE_SIZE};

/// A window of device memory mapped into the process.
///
/// The underlying mapping covers whole pages; [`Mapping::get`] points at the
/// first byte of the requested range inside it.
pub struct Mapping {
    memory: Rc<dyn PhysicalMemory>,
    window: NonNull<u8>,
    window_len: usize,
    phys: usize,
    len: usize,
}

impl Mapping {
    /// Maps `len` bytes of device memory starting at `phys` as uncached
    /// read-write memory.
    pub fn new(memory: Rc<dyn PhysicalMemory>, phys: usize, len: usize) -> common::Result<Self> {
        let base = page_base(phys);
        let window_len = (page_offset(phys) + len).next_multiple_of(PAGE_SIZE).max(PAGE_SIZE);

        let window = unsafe { memory.physmap(base, window_len, Prot::RW, MemoryType::Uncacheable)? };

        log::trace!("virtio: mapped {len:#x} bytes of device memory at {phys:#x}");

        Ok(Self {
            memory,
            window,
            window_len,
            phys,
            len,
        })
    }

    /// Pointer to the first byte of the mapped range.
    pub fn get(&self) -> *mut u8 {
        // SAFETY: the window starts at the page containing `phys`.
        unsafe { self.window.as_ptr().add(page_offset(self.phys)) }
    }

    /// Physical address the mapping was requested for.
    pub fn physical(&self) -> usize {
        self.phys
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Views the start of the range as a `T`.
    ///
    /// ## Safety
    /// The device memory must have the layout of `T`.
    ///
    /// ## Panics
    /// If `T` does not fit in the range.
    pub unsafe fn as_ref<T>(&self) -> &T {
        assert!(core::mem::size_of::<T>() <= self.len);
        &*self.get().cast::<T>()
    }

    fn at<T>(&self, offset: usize) -> *mut T {
        assert!(
            offset + core::mem::size_of::<T>() <= self.len,
            "virtio: access at {offset:#x} outside of a {:#x} byte mapping",
            self.len
        );
        unsafe { self.get().add(offset).cast() }
    }

    pub fn read8(&self, offset: usize) -> u8 {
        unsafe { self.at::<u8>(offset).read_volatile() }
    }

    pub fn read16(&self, offset: usize) -> u16 {
        unsafe { self.at::<u16>(offset).read_volatile() }
    }

    pub fn read32(&self, offset: usize) -> u32 {
        unsafe { self.at::<u32>(offset).read_volatile() }
    }

    pub fn write16(&self, offset: usize, value: u16) {
        unsafe { self.at::<u16>(offset).write_volatile(value) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe { self.memory.funmap(self.window, self.window_len) }
    }
}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping")
            .field("phys", &format_args!("{:#x}", self.phys))
            .field("len", &self.len)
            .finish()
    }
}
