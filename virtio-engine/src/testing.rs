//! Fake collaborators for host-side tests.

use std::alloc::{self, Layout};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::Once;
use std::task::{Poll, Waker};

use common::dma::PhysicalMemory;
use common::io::PortSpace;
use common::{MemoryType, Prot, PAGE_SIZE};
use futures::future::{self, LocalBoxFuture};
use futures::FutureExt;

use crate::chain::DmaBufferView;
use crate::irq::*;
use crate::isr_program::IsrProgram;
use crate::mapping::Mapping;
use crate::pci::{PciBar, PciFunction, VendorSpecificCapability};
use crate::spec::*;
use crate::standard_transport::StandardRegions;
use crate::transport::NotifyBell;

pub(crate) fn init_logging() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = common::setup_logging(
            "misc",
            "virtio",
            "virtio-engine-test",
            common::output_level(),
            common::file_level(),
        );
    });
}

fn page_layout(size: usize) -> Layout {
    Layout::from_size_align(size, PAGE_SIZE).unwrap()
}

fn alloc_pages(size: usize) -> NonNull<u8> {
    NonNull::new(unsafe { alloc::alloc_zeroed(page_layout(size)) }).unwrap()
}

struct Block {
    phys: usize,
    virt: NonNull<u8>,
    size: usize,
}

impl Block {
    fn contains_virt(&self, virt: usize) -> bool {
        (self.virt.as_ptr() as usize..self.virt.as_ptr() as usize + self.size).contains(&virt)
    }
}

/// Heap memory posing as physical memory. DMA allocations get synthetic
/// physical addresses; memory the fake does not know translates to itself.
pub(crate) struct FakeMemory {
    next_phys: Cell<usize>,
    allocations: RefCell<Vec<Block>>,
    mmio: RefCell<Vec<Block>>,
    untranslatable: RefCell<Vec<std::ops::Range<usize>>>,
    live_mappings: Cell<usize>,
}

impl FakeMemory {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            next_phys: Cell::new(0x10_0000),
            allocations: RefCell::new(Vec::new()),
            mmio: RefCell::new(Vec::new()),
            untranslatable: RefCell::new(Vec::new()),
            live_mappings: Cell::new(0),
        })
    }

    /// Backs `len` bytes of device memory at `phys` with zeroed heap memory.
    pub fn add_mmio(&self, phys: usize, len: usize) -> *mut u8 {
        let virt = alloc_pages(len);
        self.mmio.borrow_mut().push(Block {
            phys,
            virt,
            size: len,
        });
        virt.as_ptr()
    }

    /// Places the next DMA allocation at `phys`.
    pub fn set_next_physical(&self, phys: usize) {
        self.next_phys.set(phys);
    }

    /// Makes `translate` fail for virtual addresses in `virt`.
    pub fn refuse_translation(&self, virt: std::ops::Range<usize>) {
        self.untranslatable.borrow_mut().push(virt);
    }

    pub fn live_mappings(&self) -> usize {
        self.live_mappings.get()
    }

    pub fn live_allocations(&self) -> usize {
        self.allocations.borrow().len()
    }
}

impl PhysicalMemory for FakeMemory {
    fn alloc_contiguous(&self, size: usize) -> common::Result<(usize, NonNull<u8>)> {
        assert_eq!(size % PAGE_SIZE, 0);

        let phys = self.next_phys.get();
        self.next_phys.set(phys + size);

        let virt = alloc_pages(size);
        self.allocations
            .borrow_mut()
            .push(Block { phys, virt, size });
        Ok((phys, virt))
    }

    unsafe fn free_contiguous(&self, phys: usize, virt: NonNull<u8>, size: usize) {
        let mut allocations = self.allocations.borrow_mut();
        let position = allocations
            .iter()
            .position(|block| block.phys == phys && block.virt == virt && block.size == size)
            .expect("freeing unknown allocation");
        allocations.remove(position);

        alloc::dealloc(virt.as_ptr(), page_layout(size));
    }

    fn translate(&self, virt: usize) -> common::Result<usize> {
        if self
            .untranslatable
            .borrow()
            .iter()
            .any(|range| range.contains(&virt))
        {
            return Err(common::Error::Translation(virt));
        }

        Ok(self
            .allocations
            .borrow()
            .iter()
            .find(|block| block.contains_virt(virt))
            .map(|block| block.phys + (virt - block.virt.as_ptr() as usize))
            .unwrap_or(virt))
    }

    unsafe fn physmap(
        &self,
        base_phys: usize,
        len: usize,
        _prot: Prot,
        ty: MemoryType,
    ) -> common::Result<NonNull<u8>> {
        assert_eq!(base_phys % PAGE_SIZE, 0);
        assert_eq!(ty, MemoryType::Uncacheable);

        let mmio = self.mmio.borrow();
        let block = mmio
            .iter()
            .find(|block| block.phys <= base_phys && base_phys + len <= block.phys + block.size)
            .ok_or(common::Error::Map {
                phys: base_phys,
                len,
            })?;

        self.live_mappings.set(self.live_mappings.get() + 1);
        Ok(NonNull::new_unchecked(
            block.virt.as_ptr().add(base_phys - block.phys),
        ))
    }

    unsafe fn funmap(&self, _virt: NonNull<u8>, _len: usize) {
        self.live_mappings.set(self.live_mappings.get() - 1);
    }
}

impl Drop for FakeMemory {
    fn drop(&mut self) {
        for block in self.mmio.get_mut().drain(..) {
            unsafe { alloc::dealloc(block.virt.as_ptr(), page_layout(block.size)) };
        }
    }
}

/// Page-aligned DMA memory for building buffer views.
pub(crate) struct PageBuffer {
    memory: Rc<FakeMemory>,
    phys: usize,
    virt: NonNull<u8>,
    size: usize,
}

impl PageBuffer {
    pub fn new(memory: &Rc<FakeMemory>, pages: usize) -> Self {
        let size = pages * PAGE_SIZE;
        let (phys, virt) = memory.alloc_contiguous(size).unwrap();

        Self {
            memory: memory.clone(),
            phys,
            virt,
            size,
        }
    }

    pub fn physical(&self) -> usize {
        self.phys
    }

    /// Virtual address of byte `offset`.
    pub fn address(&self, offset: usize) -> usize {
        self.virt.as_ptr() as usize + offset
    }

    pub fn view(&self, offset: usize, len: usize) -> DmaBufferView<'_> {
        assert!(offset + len <= self.size);
        DmaBufferView::from_mut_slice(unsafe {
            std::slice::from_raw_parts_mut(self.virt.as_ptr().add(offset), len)
        })
    }
}

impl Drop for PageBuffer {
    fn drop(&mut self) {
        unsafe { self.memory.free_contiguous(self.phys, self.virt, self.size) }
    }
}

#[derive(Clone, Default)]
pub(crate) struct RecordingBell(Rc<RefCell<Vec<u16>>>);

impl RecordingBell {
    pub fn rung(&self) -> Vec<u16> {
        self.0.borrow().clone()
    }
}

impl NotifyBell for RecordingBell {
    fn ring(&self, queue_index: u16) {
        self.0.borrow_mut().push(queue_index);
    }
}

/// Register file of a legacy virtio device.
pub(crate) struct FakeLegacyDevice {
    device_features: Cell<u32>,
    driver_features: Cell<u32>,
    queue_sizes: Vec<u16>,
    queue_select: Cell<u16>,
    queue_pfns: RefCell<BTreeMap<u16, u32>>,
    notified: RefCell<Vec<u16>>,
    status: Cell<u8>,
    status_writes: RefCell<Vec<u8>>,
    stuck_status: Cell<Option<u8>>,
    isr: Cell<u8>,
    config: Vec<u8>,
}

impl FakeLegacyDevice {
    pub fn new(queue_sizes: &[u16]) -> Rc<Self> {
        Rc::new(Self {
            device_features: Cell::new(0),
            driver_features: Cell::new(0),
            queue_sizes: queue_sizes.to_vec(),
            queue_select: Cell::new(0),
            queue_pfns: RefCell::new(BTreeMap::new()),
            notified: RefCell::new(Vec::new()),
            status: Cell::new(0),
            status_writes: RefCell::new(Vec::new()),
            stuck_status: Cell::new(None),
            isr: Cell::new(0),
            config: (0..16).collect(),
        })
    }

    pub fn set_device_features(&self, features: u32) {
        self.device_features.set(features);
    }

    pub fn driver_features(&self) -> u32 {
        self.driver_features.get()
    }

    pub fn queue_pfn(&self, index: u16) -> Option<u32> {
        self.queue_pfns.borrow().get(&index).copied()
    }

    pub fn notified(&self) -> Vec<u16> {
        self.notified.borrow().clone()
    }

    pub fn status_writes(&self) -> Vec<u8> {
        self.status_writes.borrow().clone()
    }

    /// Makes the status register ignore writes.
    pub fn stick_status(&self, status: u8) {
        self.stuck_status.set(Some(status));
        self.status.set(status);
    }

    pub fn set_isr(&self, isr: u8) {
        self.isr.set(isr);
    }

    fn config_u32(&self, offset: u16) -> u32 {
        let at = usize::from(offset - LEGACY_DEVICE_CONFIG_OFFSET);
        u32::from_le_bytes(self.config[at..at + 4].try_into().unwrap())
    }
}

impl PortSpace for FakeLegacyDevice {
    fn read8(&self, offset: u16) -> u8 {
        match offset {
            18 => self.status.get(),
            19 => self.isr.replace(0),
            _ => panic!("unexpected 8-bit read at {offset}"),
        }
    }

    fn read16(&self, offset: u16) -> u16 {
        match offset {
            12 => {
                let select = usize::from(self.queue_select.get());
                self.queue_sizes.get(select).copied().unwrap_or(0)
            }
            14 => self.queue_select.get(),
            _ => panic!("unexpected 16-bit read at {offset}"),
        }
    }

    fn read32(&self, offset: u16) -> u32 {
        match offset {
            0 => self.device_features.get(),
            4 => self.driver_features.get(),
            8 => self.queue_pfn(self.queue_select.get()).unwrap_or(0),
            _ if offset >= LEGACY_DEVICE_CONFIG_OFFSET => self.config_u32(offset),
            _ => panic!("unexpected 32-bit read at {offset}"),
        }
    }

    fn write8(&self, offset: u16, value: u8) {
        match offset {
            18 => {
                self.status_writes.borrow_mut().push(value);
                if self.stuck_status.get().is_none() {
                    self.status.set(value);
                }
            }
            _ => panic!("unexpected 8-bit write at {offset}"),
        }
    }

    fn write16(&self, offset: u16, value: u16) {
        match offset {
            14 => self.queue_select.set(value),
            16 => self.notified.borrow_mut().push(value),
            _ => panic!("unexpected 16-bit write at {offset}"),
        }
    }

    fn write32(&self, offset: u16, value: u32) {
        match offset {
            4 => self.driver_features.set(value),
            8 => {
                self.queue_pfns
                    .borrow_mut()
                    .insert(self.queue_select.get(), value);
            }
            _ => panic!("unexpected 32-bit write at {offset}"),
        }
    }
}

#[derive(Default)]
struct IrqState {
    sequence: Cell<u64>,
    bits: Cell<u32>,
    waker: RefCell<Option<Waker>>,
    acks: RefCell<Vec<(IrqAck, u64)>>,
    automated: Cell<Option<IsrBinding>>,
    fail_next_wait: Cell<bool>,
}

impl IrqState {
    fn advance(&self) {
        self.sequence.set(self.sequence.get() + 1);
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }
}

/// An interrupt line raised by hand.
#[derive(Clone, Default)]
pub(crate) struct FakeIrq(Rc<IrqState>);

impl FakeIrq {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.advance();
    }

    /// Raises the line as an automated handler that found `bits` would.
    pub fn raise_bits(&self, bits: u32) {
        self.0.bits.set(self.0.bits.get() | bits);
        self.0.advance();
    }

    pub fn acks(&self) -> Vec<(IrqAck, u64)> {
        self.0.acks.borrow().clone()
    }

    pub fn automated(&self) -> Option<IsrBinding> {
        self.0.automated.get()
    }

    pub fn fail_next_wait(&self) {
        self.0.fail_next_wait.set(true);
    }
}

impl InterruptLine for FakeIrq {
    fn wait(&self, sequence: u64) -> LocalBoxFuture<'_, common::Result<u64>> {
        let state = self.0.clone();

        future::poll_fn(move |cx| {
            if state.fail_next_wait.replace(false) {
                return Poll::Ready(Err(common::Error::Interrupt("line revoked".into())));
            }

            let current = state.sequence.get();
            if current > sequence {
                Poll::Ready(Ok(current))
            } else {
                *state.waker.borrow_mut() = Some(cx.waker().clone());
                Poll::Pending
            }
        })
        .boxed_local()
    }

    fn acknowledge(&self, ack: IrqAck, sequence: u64) -> common::Result<()> {
        self.0.acks.borrow_mut().push((ack, sequence));
        Ok(())
    }

    fn automate(
        &self,
        _program: &CompiledIsr,
        binding: IsrBinding,
    ) -> common::Result<Box<dyn BitsetEvent>> {
        self.0.automated.set(Some(binding));
        Ok(Box::new(FakeEvent(self.0.clone())))
    }
}

struct FakeEvent(Rc<IrqState>);

impl BitsetEvent for FakeEvent {
    fn wait(&self, sequence: u64) -> LocalBoxFuture<'_, common::Result<(u64, u32)>> {
        let state = self.0.clone();

        future::poll_fn(move |cx| {
            let current = state.sequence.get();
            if current > sequence {
                Poll::Ready(Ok((current, state.bits.replace(0))))
            } else {
                *state.waker.borrow_mut() = Some(cx.waker().clone());
                Poll::Pending
            }
        })
        .boxed_local()
    }
}

/// Records the programs it is asked to compile.
#[derive(Clone, Default)]
pub(crate) struct FakeCompiler {
    programs: Rc<RefCell<Vec<Vec<u8>>>>,
}

impl FakeCompiler {
    pub fn programs(&self) -> Vec<Vec<u8>> {
        self.programs.borrow().clone()
    }

    pub fn offload(&self) -> Rc<IsrOffload> {
        let compiler = self.clone();

        IsrOffload::new(move || {
            let compiler: Rc<dyn IsrCompiler> = Rc::new(compiler.clone());
            future::ready(Ok(compiler)).boxed_local()
        })
    }
}

impl IsrCompiler for FakeCompiler {
    fn compile(
        &self,
        code: &[u8],
        bindings: &[BindType],
    ) -> LocalBoxFuture<'_, common::Result<CompiledIsr>> {
        assert_eq!(bindings, &IsrProgram::BINDINGS);

        self.programs.borrow_mut().push(code.to_vec());
        let handle = self.programs.borrow().len() as u64;
        future::ready(Ok(CompiledIsr { handle })).boxed_local()
    }
}

pub(crate) struct FakeFunction {
    pub vendor: u16,
    pub bars: [PciBar; 6],
    pub capabilities: Vec<VendorSpecificCapability>,
    pub ports: Option<Rc<FakeLegacyDevice>>,
    pub irq: FakeIrq,
    pub bus_irq_enabled: Rc<Cell<bool>>,
}

impl FakeFunction {
    fn blank(irq: FakeIrq) -> Self {
        Self {
            vendor: VIRTIO_PCI_VENDOR,
            bars: [PciBar::None; 6],
            capabilities: Vec::new(),
            ports: None,
            irq,
            bus_irq_enabled: Rc::new(Cell::new(false)),
        }
    }

    /// A legacy-only function with its registers behind BAR 0.
    pub fn legacy(device: Rc<FakeLegacyDevice>, irq: FakeIrq) -> Self {
        let mut function = Self::blank(irq);
        function.bars[0] = PciBar::Port(0xc040);
        function.ports = Some(device);
        function
    }
}

impl PciFunction for FakeFunction {
    fn vendor_id(&self) -> u16 {
        self.vendor
    }

    fn device_id(&self) -> u16 {
        0x1000
    }

    fn bar(&self, index: u8) -> PciBar {
        self.bars[usize::from(index)]
    }

    fn vendor_capabilities(&self) -> Vec<VendorSpecificCapability> {
        self.capabilities.clone()
    }

    fn enable_port_io(&self, index: u8) -> common::Result<Rc<dyn PortSpace>> {
        match (self.bars[usize::from(index)], &self.ports) {
            (PciBar::Port(_), Some(ports)) => Ok(ports.clone()),
            (PciBar::Port(port), None) => Err(common::Error::PortAccess(port)),
            _ => Err(common::Error::Unsupported),
        }
    }

    fn interrupt_line(&self) -> common::Result<Box<dyn InterruptLine>> {
        Ok(Box::new(self.irq.clone()))
    }

    fn enable_bus_irq(&self) -> LocalBoxFuture<'_, common::Result<()>> {
        self.bus_irq_enabled.set(true);
        future::ready(Ok(())).boxed_local()
    }
}

pub(crate) const MODERN_BAR: usize = 0xfe00_0000;
pub(crate) const MODERN_BAR_INDEX: u8 = 4;
pub(crate) const MODERN_BAR_SIZE: usize = 0x4000;
pub(crate) const COMMON_OFFSET: usize = 0;
pub(crate) const NOTIFY_OFFSET: usize = 0x1000;
pub(crate) const NOTIFY_LEN: usize = 0x100;
pub(crate) const NOTIFY_MULTIPLIER: u32 = 4;
pub(crate) const ISR_OFFSET: usize = 0x2010;
pub(crate) const DEVICE_OFFSET: usize = 0x3000;
pub(crate) const DEVICE_LEN: usize = 0x100;

// Field offsets in the common configuration structure.
pub(crate) const DEVICE_FEATURE_SELECT: usize = 0;
pub(crate) const DEVICE_FEATURE: usize = 4;
pub(crate) const DRIVER_FEATURE_SELECT: usize = 8;
pub(crate) const DRIVER_FEATURE: usize = 12;
pub(crate) const NUM_QUEUES: usize = 18;
pub(crate) const DEVICE_STATUS: usize = 20;
pub(crate) const QUEUE_SELECT: usize = 22;
pub(crate) const QUEUE_SIZE: usize = 24;
pub(crate) const QUEUE_ENABLE: usize = 28;
pub(crate) const QUEUE_NOTIFY_OFF: usize = 30;
pub(crate) const QUEUE_DESC_LO: usize = 32;
pub(crate) const QUEUE_DRIVER_LO: usize = 40;
pub(crate) const QUEUE_DEVICE_LO: usize = 48;
pub(crate) const QUEUE_DEVICE_HI: usize = 52;

/// Encodes a virtio vendor capability body.
pub(crate) fn capability(
    cfg_type: CfgType,
    bar: u8,
    offset: usize,
    length: usize,
    multiplier: Option<u32>,
) -> VendorSpecificCapability {
    let mut data = vec![cfg_type as u8, bar, 0, 0, 0];
    data.extend((offset as u32).to_le_bytes());
    data.extend((length as u32).to_le_bytes());
    if let Some(multiplier) = multiplier {
        data.extend(multiplier.to_le_bytes());
    }
    VendorSpecificCapability { data }
}

/// A modern device whose registers are plain memory behind one BAR.
///
/// Nothing reacts to register writes, so tests preset what the device would
/// report.
pub(crate) struct ModernDevice {
    pub memory: Rc<FakeMemory>,
    bar: *mut u8,
}

impl ModernDevice {
    pub fn new(memory: &Rc<FakeMemory>) -> Self {
        let bar = memory.add_mmio(MODERN_BAR, MODERN_BAR_SIZE);
        let device = Self {
            memory: memory.clone(),
            bar,
        };
        device.set_common_u16(NUM_QUEUES, 4);
        device
    }

    pub fn capabilities(&self) -> Vec<VendorSpecificCapability> {
        let bar = MODERN_BAR_INDEX;
        vec![
            capability(CfgType::Common, bar, COMMON_OFFSET, 0x38, None),
            capability(CfgType::Notify, bar, NOTIFY_OFFSET, NOTIFY_LEN, Some(NOTIFY_MULTIPLIER)),
            capability(CfgType::Isr, bar, ISR_OFFSET, 4, None),
            capability(CfgType::Device, bar, DEVICE_OFFSET, DEVICE_LEN, None),
        ]
    }

    pub fn function(&self, irq: FakeIrq) -> FakeFunction {
        let mut function = FakeFunction::blank(irq);
        function.bars[usize::from(MODERN_BAR_INDEX)] = PciBar::Memory64 {
            addr: MODERN_BAR as u64,
            size: MODERN_BAR_SIZE as u64,
        };
        function.capabilities = self.capabilities();
        function
    }

    pub fn regions(&self) -> StandardRegions {
        let map = |offset: usize, len: usize| {
            Mapping::new(self.memory.clone(), MODERN_BAR + offset, len).unwrap()
        };

        StandardRegions {
            common: map(COMMON_OFFSET, 0x38),
            notify: map(NOTIFY_OFFSET, NOTIFY_LEN),
            notify_multiplier: NOTIFY_MULTIPLIER,
            isr: map(ISR_OFFSET, 4),
            device: map(DEVICE_OFFSET, DEVICE_LEN),
        }
    }

    fn at<T>(&self, offset: usize) -> *mut T {
        assert!(offset + std::mem::size_of::<T>() <= MODERN_BAR_SIZE);
        unsafe { self.bar.add(offset).cast() }
    }

    pub fn common_u16(&self, field: usize) -> u16 {
        unsafe { self.at::<u16>(COMMON_OFFSET + field).read_volatile() }
    }

    pub fn common_u32(&self, field: usize) -> u32 {
        unsafe { self.at::<u32>(COMMON_OFFSET + field).read_volatile() }
    }

    pub fn common_u8(&self, field: usize) -> u8 {
        unsafe { self.at::<u8>(COMMON_OFFSET + field).read_volatile() }
    }

    fn set_common_u16(&self, field: usize, value: u16) {
        unsafe { self.at::<u16>(COMMON_OFFSET + field).write_volatile(value) }
    }

    /// Value the device shows for whatever feature word is selected.
    pub fn set_device_feature(&self, value: u32) {
        unsafe { self.at::<u32>(COMMON_OFFSET + DEVICE_FEATURE).write_volatile(value) }
    }

    /// Size and notify offset the device shows for the next selected queue.
    pub fn set_queue(&self, size: u16, notify_off: u16) {
        self.set_common_u16(QUEUE_SIZE, size);
        self.set_common_u16(QUEUE_NOTIFY_OFF, notify_off);
    }

    pub fn notify_u16(&self, offset: usize) -> u16 {
        unsafe { self.at::<u16>(NOTIFY_OFFSET + offset).read_volatile() }
    }

    pub fn set_isr(&self, isr: u8) {
        unsafe { self.at::<u8>(ISR_OFFSET).write_volatile(isr) }
    }

    pub fn set_device_config(&self, offset: usize, value: u32) {
        unsafe { self.at::<u32>(DEVICE_OFFSET + offset).write_volatile(value) }
    }
}
