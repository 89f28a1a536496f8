//! Building descriptor chains.

use std::marker::PhantomData;

use common::{page_offset, PAGE_SIZE};

use crate::queue::Queue;
use crate::spec::DescriptorFlags;
use crate::transport::Error;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    /// The device reads the buffer.
    HostToDevice,
    /// The device writes into the buffer.
    DeviceToHost,
}

/// A borrowed byte range the device will access by DMA. Only views built
/// from a mutable slice may be written by the device.
#[derive(Debug, Copy, Clone)]
pub struct DmaBufferView<'a> {
    ptr: *const u8,
    len: usize,
    writable: bool,
    _marker: PhantomData<&'a [u8]>,
}

impl<'a> DmaBufferView<'a> {
    /// A buffer the device only reads.
    pub fn from_slice(buffer: &'a [u8]) -> Self {
        Self {
            ptr: buffer.as_ptr(),
            len: buffer.len(),
            writable: false,
            _marker: PhantomData,
        }
    }

    pub fn from_mut_slice(buffer: &'a mut [u8]) -> Self {
        Self {
            ptr: buffer.as_mut_ptr(),
            len: buffer.len(),
            writable: true,
            _marker: PhantomData,
        }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// ## Panics
    /// If the range does not lie within this view.
    pub fn subview(&self, offset: usize, len: usize) -> DmaBufferView<'a> {
        assert!(offset + len <= self.len, "virtio: subview out of bounds");
        Self {
            ptr: self.ptr.wrapping_add(offset),
            len,
            writable: self.writable,
            _marker: PhantomData,
        }
    }
}

/// Write access to one descriptor slot obtained from a [`Queue`].
///
/// Copies stay valid only while the descriptor is neither posted nor given
/// back; using one afterwards panics.
#[derive(Copy, Clone)]
pub struct Handle<'q> {
    queue: &'q Queue,
    table_index: u16,
    generation: u32,
}

impl<'q> Handle<'q> {
    pub(crate) fn new(queue: &'q Queue, table_index: u16, generation: u32) -> Self {
        Self {
            queue,
            table_index,
            generation,
        }
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }

    pub fn queue(&self) -> &'q Queue {
        self.queue
    }

    pub fn table_index(&self) -> u16 {
        self.table_index
    }

    /// Points the descriptor at `view`.
    ///
    /// The view must not cross a physical page boundary unless the memory
    /// behind it is physically contiguous.
    ///
    /// ## Panics
    /// If `view` is empty or longer than 4 GiB, if the device would write
    /// into a read-only view, or if the handle no longer owns its descriptor.
    pub fn setup_buffer(&self, direction: Direction, view: DmaBufferView<'_>) -> Result<(), Error> {
        self.queue.assert_held(self);
        assert!(!view.is_empty(), "virtio: descriptor for an empty buffer");
        assert!(
            direction == Direction::HostToDevice || view.is_writable(),
            "virtio: device-writable descriptor for a read-only buffer"
        );
        let length = u32::try_from(view.len()).unwrap_or_else(|_| {
            panic!("virtio: buffer of {} bytes does not fit a descriptor", view.len())
        });

        let physical = self.queue.memory().translate(view.as_ptr() as usize)?;

        let descriptor = self.queue.descriptor(self.table_index);
        descriptor.set_addr(physical as u64);
        descriptor.set_size(length);

        let mut flags = descriptor.flags() & DescriptorFlags::NEXT;
        if direction == Direction::DeviceToHost {
            flags |= DescriptorFlags::WRITE_ONLY;
        }
        descriptor.set_flags(flags);

        Ok(())
    }

    /// Makes `next` follow this descriptor.
    pub fn setup_link(&self, next: Handle<'_>) {
        assert!(
            std::ptr::eq(self.queue, next.queue),
            "virtio: cannot link descriptors of different queues"
        );
        self.queue.assert_held(self);
        self.queue.assert_held(&next);

        let descriptor = self.queue.descriptor(self.table_index);
        descriptor.set_next(next.table_index);
        descriptor.insert_flags(DescriptorFlags::NEXT);
    }
}

impl std::fmt::Debug for Handle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("queue", &self.queue.queue_index())
            .field("table_index", &self.table_index)
            .finish()
    }
}

/// Descriptors linked in the order they were appended.
///
/// Dropping a chain that was never posted gives its descriptors back to the
/// queue.
#[derive(Debug, Default)]
pub struct Chain<'q> {
    handles: Vec<Handle<'q>>,
}

impl<'q> Chain<'q> {
    pub fn new() -> Self {
        Self {
            handles: Vec::new(),
        }
    }

    pub fn append(&mut self, handle: Handle<'q>) {
        if let Some(tail) = self.handles.last() {
            tail.setup_link(handle);
        }
        self.handles.push(handle);
    }

    /// Head of the chain, which is what gets posted.
    pub fn front(&self) -> Option<Handle<'q>> {
        self.handles.first().copied()
    }

    pub fn back(&self) -> Option<Handle<'q>> {
        self.handles.last().copied()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Handle<'q>> {
        self.handles.iter()
    }

    /// Gives back every descriptor past the first `len` and terminates the
    /// chain there.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.handles.len() {
            return;
        }

        for handle in self.handles.drain(len..).rev() {
            if handle.queue.holds(&handle) {
                handle.queue.release(handle);
            }
        }

        if let Some(tail) = self.handles.last() {
            if tail.queue.holds(tail) {
                let descriptor = tail.queue.descriptor(tail.table_index);
                descriptor.set_flags(descriptor.flags() - DescriptorFlags::NEXT);
                descriptor.set_next(0);
            }
        }
    }

    /// Sets up the buffer of the last descriptor.
    ///
    /// ## Panics
    /// If the chain is empty.
    pub fn setup_buffer(&self, direction: Direction, view: DmaBufferView<'_>) -> Result<(), Error> {
        self.back()
            .expect("virtio: setup_buffer on an empty chain")
            .setup_buffer(direction, view)
    }
}

impl Drop for Chain<'_> {
    fn drop(&mut self) {
        for handle in self.handles.drain(..) {
            // Posted chains belong to the device now.
            if handle.queue.holds(&handle) {
                handle.queue.release(handle);
            }
        }
    }
}

/// Appends descriptors covering `view` to `chain`, one per page the view
/// touches.
///
/// On failure the descriptors appended so far are given back and `chain` is
/// left as it was.
pub async fn scatter_gather<'q>(
    direction: Direction,
    chain: &mut Chain<'q>,
    queue: &'q Queue,
    view: DmaBufferView<'_>,
) -> Result<(), Error> {
    let original_len = chain.len();
    let mut progress = 0;

    while progress < view.len() {
        let address = view.as_ptr() as usize + progress;
        let chunk = (PAGE_SIZE - page_offset(address)).min(view.len() - progress);

        let handle = queue.obtain_descriptor().await;
        chain.append(handle);
        if let Err(error) = handle.setup_buffer(direction, view.subview(progress, chunk)) {
            chain.truncate(original_len);
            return Err(error);
        }

        progress += chunk;
    }

    Ok(())
}
