use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{fence, Ordering};
use std::task::{Context, Poll};

use common::dma::{DmaRegion, PhysicalMemory};
use crossbeam_queue::SegQueue;
use futures::channel::oneshot;
use futures::FutureExt;

use crate::chain::{Chain, Handle};
use crate::doorbell::Doorbell;
use crate::spec::*;
use crate::transport::{Error, NotifyBell};

/// Marks unused ring slots; devices report it as an illegal index.
const RING_SENTINEL: u16 = 0xFFFF;

/// An in-flight request. Runs once the device retires its descriptor chain,
/// with the number of bytes the device wrote into the chain.
pub trait Request {
    fn complete(self: Box<Self>, written: u32);
}

impl<F> Request for F
where
    F: FnOnce(u32),
{
    fn complete(self: Box<Self>, written: u32) {
        (*self)(written)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SlotState {
    Free,
    /// Held by a [`Handle`] that has not been posted.
    Obtained,
    InFlight,
}

/// Ownership record of one descriptor. The generation changes every time the
/// descriptor is handed out, which exposes handles that outlived their turn.
#[derive(Debug, Copy, Clone)]
struct Slot {
    state: SlotState,
    generation: u32,
}

/// Resolves to the number of bytes the device wrote into a chain submitted
/// with [`Queue::submit`].
#[must_use = "futures do nothing unless polled"]
pub struct PendingRequest {
    receiver: oneshot::Receiver<u32>,
}

impl Future for PendingRequest {
    type Output = Result<u32, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.receiver
            .poll_unpin(cx)
            .map(|result| result.map_err(|_| Error::RequestDropped))
    }
}

/// One split virtqueue: the descriptor table, both rings and the driver's
/// bookkeeping of which descriptors are free and which are in flight.
///
/// All three parts live in a single physically contiguous region placed
/// according to a [`QueueLayout`].
pub struct Queue {
    queue_index: u16,
    queue_size: u16,
    layout: QueueLayout,
    region: DmaRegion,
    memory: Rc<dyn PhysicalMemory>,

    descriptor_stack: SegQueue<u16>,
    slots: Box<[Cell<Slot>]>,
    active_requests: RefCell<Vec<Option<Box<dyn Request>>>>,
    progress_head: Cell<u16>,
    descriptor_doorbell: Doorbell,
    notification_bell: Box<dyn NotifyBell>,
    registered: Cell<bool>,
}

impl Queue {
    pub(crate) fn new<N>(
        memory: Rc<dyn PhysicalMemory>,
        queue_index: u16,
        layout: QueueLayout,
        notification_bell: N,
    ) -> common::Result<Self>
    where
        N: NotifyBell + 'static,
    {
        let queue_size = layout.queue_size;
        let region = DmaRegion::zeroed(memory.clone(), layout.size)?;

        let descriptor_stack = SegQueue::new();
        (0..queue_size).for_each(|i| descriptor_stack.push(i));

        let queue = Self {
            queue_index,
            queue_size,
            layout,
            region,
            memory,
            descriptor_stack,
            slots: (0..queue_size)
                .map(|_| {
                    Cell::new(Slot {
                        state: SlotState::Free,
                        generation: 0,
                    })
                })
                .collect(),
            active_requests: RefCell::new((0..queue_size).map(|_| None).collect()),
            progress_head: Cell::new(0),
            descriptor_doorbell: Doorbell::new(),
            notification_bell: Box::new(notification_bell),
            registered: Cell::new(false),
        };

        for i in 0..queue_size {
            queue.available_element(i).set_table_index(RING_SENTINEL);
            queue
                .used_element(i)
                .table_index
                .set(u32::from(RING_SENTINEL));
        }

        Ok(queue)
    }

    pub fn queue_index(&self) -> u16 {
        self.queue_index
    }

    /// Number of descriptors in the table.
    pub fn queue_size(&self) -> u16 {
        self.queue_size
    }

    pub fn layout(&self) -> &QueueLayout {
        &self.layout
    }

    pub fn descriptor_physical(&self) -> usize {
        self.region.physical()
    }

    pub fn available_physical(&self) -> usize {
        self.region.physical_at(self.layout.available_offset)
    }

    pub fn used_physical(&self) -> usize {
        self.region.physical_at(self.layout.used_offset)
    }

    /// Number of used ring entries the driver has retired so far, modulo 2^16.
    pub fn progress_head(&self) -> u16 {
        self.progress_head.get()
    }

    pub(crate) fn memory(&self) -> &dyn PhysicalMemory {
        &*self.memory
    }

    /// Records that the device has been given the queue's addresses.
    pub(crate) fn mark_registered(&self) {
        self.registered.set(true);
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.registered.get()
    }

    fn slot(&self, index: u16) -> &Cell<Slot> {
        &self.slots[usize::from(index)]
    }

    /// Whether `handle` still owns its descriptor and has not been posted.
    pub(crate) fn holds(&self, handle: &Handle<'_>) -> bool {
        let slot = self.slot(handle.table_index()).get();
        std::ptr::eq(handle.queue(), self)
            && slot.state == SlotState::Obtained
            && slot.generation == handle.generation()
    }

    /// ## Panics
    /// If `handle` comes from another queue, has been posted or its
    /// descriptor has since been retired.
    pub(crate) fn assert_held(&self, handle: &Handle<'_>) {
        assert!(
            std::ptr::eq(handle.queue(), self),
            "virtio: descriptor handle used with a foreign queue"
        );

        let table_index = handle.table_index();
        let slot = self.slot(table_index).get();
        assert!(
            slot.generation == handle.generation(),
            "virtio: stale handle for descriptor {table_index}"
        );
        match slot.state {
            SlotState::Obtained => {}
            SlotState::InFlight => panic!("virtio: descriptor {table_index} is already in flight"),
            SlotState::Free => panic!("virtio: descriptor {table_index} was released"),
        }
    }

    fn push_free(&self, table_index: u16) {
        let slot = self.slot(table_index);
        slot.set(Slot {
            state: SlotState::Free,
            ..slot.get()
        });

        self.descriptor_stack.push(table_index);
        self.descriptor_doorbell.ring();
    }

    /// Gives back a descriptor that was obtained but never posted.
    ///
    /// ## Panics
    /// If `handle` no longer owns its descriptor.
    pub fn release(&self, handle: Handle<'_>) {
        self.assert_held(&handle);
        self.push_free(handle.table_index());
    }

    /// ## Panics
    /// If `index` is not below the queue size.
    pub fn descriptor(&self, index: u16) -> &Descriptor {
        assert!(index < self.queue_size, "virtio: descriptor {index} out of range");
        // SAFETY: the table starts the region and holds `queue_size` entries.
        unsafe { &*self.region.as_ptr().cast::<Descriptor>().add(usize::from(index)) }
    }

    fn available(&self) -> &AvailableRing {
        unsafe { &*self.region.ptr_at(self.layout.available_offset).as_ptr().cast() }
    }

    fn used(&self) -> &UsedRing {
        unsafe { &*self.region.ptr_at(self.layout.used_offset).as_ptr().cast() }
    }

    fn available_element(&self, counter: u16) -> &AvailableRingElement {
        let slot = usize::from(counter & (self.queue_size - 1));
        // SAFETY: the layout reserves `queue_size` elements behind the header.
        unsafe { &self.available().elements.as_slice(usize::from(self.queue_size))[slot] }
    }

    fn used_element(&self, counter: u16) -> &UsedRingElement {
        let slot = usize::from(counter & (self.queue_size - 1));
        // SAFETY: the layout reserves `queue_size` elements behind the header.
        unsafe { &self.used().elements.as_slice(usize::from(self.queue_size))[slot] }
    }

    /// Takes a free descriptor without suspending.
    pub fn try_obtain_descriptor(&self) -> Option<Handle<'_>> {
        let table_index = self.descriptor_stack.pop()?;

        let slot = self.slot(table_index);
        let Slot { state, generation } = slot.get();
        assert_eq!(
            state,
            SlotState::Free,
            "virtio: descriptor {table_index} on the free list is still in use"
        );
        let generation = generation.wrapping_add(1);
        slot.set(Slot {
            state: SlotState::Obtained,
            generation,
        });

        let descriptor = self.descriptor(table_index);
        descriptor.set_addr(0);
        descriptor.set_size(0);
        descriptor.set_flags(DescriptorFlags::empty());
        descriptor.set_next(0);

        Some(Handle::new(self, table_index, generation))
    }

    /// Takes a free descriptor, suspending until a completion returns one if
    /// the table is exhausted.
    pub async fn obtain_descriptor(&self) -> Handle<'_> {
        loop {
            if let Some(handle) = self.try_obtain_descriptor() {
                return handle;
            }

            log::trace!("virtio: queue #{} out of descriptors", self.queue_index);
            self.descriptor_doorbell.async_wait().await;
        }
    }

    /// Publishes the chain headed by `handle` on the available ring.
    ///
    /// Every descriptor linked from the head goes in flight with it. The
    /// device is not told about it until [`Queue::notify`].
    ///
    /// ## Panics
    /// If the head belongs to another queue, or any descriptor of the chain
    /// is already in flight or not owned by the caller.
    pub fn post_descriptor<R>(&self, handle: Handle<'_>, request: R)
    where
        R: Request + 'static,
    {
        self.assert_held(&handle);

        let table_index = handle.table_index();
        let members = self.chain_members(table_index);
        for &member in &members {
            let slot = self.slot(member);
            match slot.get().state {
                SlotState::Obtained => {}
                SlotState::InFlight => panic!("virtio: descriptor {member} is already in flight"),
                SlotState::Free => panic!("virtio: descriptor {member} is linked but not obtained"),
            }
        }
        for &member in &members {
            let slot = self.slot(member);
            slot.set(Slot {
                state: SlotState::InFlight,
                ..slot.get()
            });
        }

        {
            let mut active = self.active_requests.borrow_mut();
            let slot = &mut active[usize::from(table_index)];
            assert!(
                slot.is_none(),
                "virtio: descriptor {table_index} is already in flight"
            );
            *slot = Some(Box::new(request));
        }

        let ring = self.available();
        let head = ring.head_index.load(Ordering::SeqCst);
        self.available_element(head).set_table_index(table_index);

        // The descriptor and the ring slot must be visible before the index.
        fence(Ordering::SeqCst);
        ring.head_index.store(head.wrapping_add(1), Ordering::SeqCst);
    }

    /// Rings the device unless it asked not to be notified.
    pub fn notify(&self) {
        fence(Ordering::SeqCst);

        let flags = UsedRingFlags::from_bits_retain(self.used().flags.get());
        if !flags.contains(UsedRingFlags::NO_NOTIFY) {
            self.notification_bell.ring(self.queue_index);
        }
    }

    /// Posts `chain`, notifies the device and returns a future for the
    /// completion.
    ///
    /// ## Panics
    /// If `chain` is empty.
    pub fn submit(&self, chain: Chain<'_>) -> PendingRequest {
        let head = chain
            .front()
            .expect("virtio: cannot submit an empty chain");

        let (sender, receiver) = oneshot::channel();
        self.post_descriptor(head, move |written| {
            // The receiver may have given up on the result.
            let _ = sender.send(written);
        });
        self.notify();

        PendingRequest { receiver }
    }

    /// Retires every chain the device has put on the used ring.
    ///
    /// For each entry the request is detached and its descriptors are freed
    /// before the request completes, so the completion may use the queue
    /// again right away.
    pub fn process_interrupt(&self) {
        loop {
            let progress = self.progress_head.get();
            let used_head = self.used().head_index.get();
            if progress == used_head {
                break;
            }

            assert!(
                used_head.wrapping_sub(progress) <= self.queue_size,
                "virtio: queue #{} used head {used_head} ran ahead of {progress}",
                self.queue_index
            );

            // Read the element only after observing the index.
            fence(Ordering::SeqCst);

            let element = self.used_element(progress);
            let table_index = element.table_index.get();
            let written = element.written.get();

            assert!(
                table_index < u32::from(self.queue_size),
                "virtio: device retired invalid descriptor {table_index}"
            );
            let table_index = table_index as u16;

            let request = self.active_requests.borrow_mut()[usize::from(table_index)].take();
            let request = request.unwrap_or_else(|| {
                panic!("virtio: device retired descriptor {table_index} which is not in flight")
            });

            self.free_chain(table_index);
            request.complete(written);

            self.progress_head.set(progress.wrapping_add(1));
        }
    }

    fn free_chain(&self, head: u16) {
        for table_index in self.chain_members(head) {
            self.push_free(table_index);
        }
    }

    /// Indices of the chain starting at `head`, following NEXT links.
    fn chain_members(&self, head: u16) -> Vec<u16> {
        let mut members = Vec::new();
        let mut table_index = head;

        for _ in 0..self.queue_size {
            members.push(table_index);

            let descriptor = self.descriptor(table_index);
            if !descriptor.flags().contains(DescriptorFlags::NEXT) {
                return members;
            }
            table_index = descriptor.next();
        }

        panic!("virtio: descriptor chain at {head} does not terminate");
    }
}

#[cfg(test)]
impl Queue {
    /// Retires a chain as the device would.
    pub(crate) fn complete_as_device(&self, table_index: u16, written: u32) {
        let used = self.used();
        let head = used.head_index.get();

        let element = self.used_element(head);
        element.table_index.set(u32::from(table_index));
        element.written.set(written);
        used.head_index.set(head.wrapping_add(1));
    }

    pub(crate) fn set_no_notify(&self, suppress: bool) {
        let flags = if suppress {
            UsedRingFlags::NO_NOTIFY
        } else {
            UsedRingFlags::empty()
        };
        self.used().flags.set(flags.bits());
    }

    /// Sorted contents of the free list.
    pub(crate) fn free_indices(&self) -> Vec<u16> {
        let mut indices = Vec::new();
        while let Some(index) = self.descriptor_stack.pop() {
            indices.push(index);
        }
        indices.iter().for_each(|&i| self.descriptor_stack.push(i));

        indices.sort_unstable();
        indices
    }

    /// Chain heads published on the available ring, oldest first.
    pub(crate) fn published(&self) -> Vec<u16> {
        let head = self.available().head_index.load(Ordering::SeqCst);
        let start = head.wrapping_sub(head.min(self.queue_size));

        (0..head.wrapping_sub(start))
            .map(|i| self.available_element(start.wrapping_add(i)).table_index())
            .collect()
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        if self.is_registered() {
            log::warn!(
                "virtio: dropping queue #{} at {:#x}",
                self.queue_index,
                self.region.physical()
            );
        } else {
            log::debug!("virtio: discarding unregistered queue #{}", self.queue_index);
        }
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("queue_index", &self.queue_index)
            .field("queue_size", &self.queue_size)
            .field("region", &self.region)
            .field("progress_head", &self.progress_head.get())
            .finish()
    }
}
