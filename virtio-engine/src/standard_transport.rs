use std::convert::Infallible;
use std::rc::Rc;

use common::dma::PhysicalMemory;
use common::{page_base, page_offset};

use crate::irq::{InterruptLine, IrqAck, IsrBinding, IsrOffload};
use crate::isr_program::IsrProgram;
use crate::mapping::Mapping;
use crate::pci::PciFunction;
use crate::queue::Queue;
use crate::spec::*;
use crate::transport::{dispatch_isr, queue_layout, Error, NotifyBell, QueueTable};

struct StandardBell(*mut u16);

impl NotifyBell for StandardBell {
    #[inline]
    fn ring(&self, queue_index: u16) {
        // SAFETY: the register was checked to lie inside the notify mapping,
        //         which outlives every queue of the transport.
        unsafe { self.0.write_volatile(queue_index) }
    }
}

/// The four device regions advertised through vendor capabilities.
pub(crate) struct StandardRegions {
    pub common: Mapping,
    pub notify: Mapping,
    pub notify_multiplier: u32,
    pub isr: Mapping,
    pub device: Mapping,
}

/// The virtio 1.0 PCI interface, configured through memory-mapped
/// capability regions.
pub struct StandardPciTransport {
    function: Box<dyn PciFunction>,
    memory: Rc<dyn PhysicalMemory>,
    irq: Box<dyn InterruptLine>,
    isr_offload: Option<Rc<IsrOffload>>,
    queue_region_limit: usize,

    // Queues hold pointers into `regions.notify` and are dropped first.
    queues: QueueTable,
    regions: StandardRegions,
}

impl StandardPciTransport {
    /// ## Panics
    /// If the common region is too small for [`CommonCfg`].
    pub(crate) fn new(
        function: Box<dyn PciFunction>,
        memory: Rc<dyn PhysicalMemory>,
        irq: Box<dyn InterruptLine>,
        regions: StandardRegions,
        isr_offload: Option<Rc<IsrOffload>>,
        queue_region_limit: usize,
    ) -> Self {
        assert!(regions.common.len() >= core::mem::size_of::<CommonCfg>());

        Self {
            function,
            memory,
            irq,
            isr_offload,
            queue_region_limit,
            queues: QueueTable::default(),
            regions,
        }
    }

    fn common(&self) -> &CommonCfg {
        // SAFETY: the mapping is large enough, checked in `new`.
        unsafe { self.regions.common.as_ref() }
    }

    pub fn pci_function(&self) -> &dyn PciFunction {
        &*self.function
    }

    pub fn load_config(&self, offset: u16) -> u32 {
        self.regions.device.read32(usize::from(offset))
    }

    pub fn config_generation(&self) -> u32 {
        u32::from(self.common().config_generation.get())
    }

    pub fn num_queues(&self) -> u16 {
        self.common().num_queues.get()
    }

    pub fn reset(&self) {
        let common = self.common();

        common.device_status.set(DeviceStatusFlags::empty());
        // Upon reset, the device must initialize device status to 0.
        assert_eq!(
            common.device_status.get(),
            DeviceStatusFlags::empty(),
            "virtio: device did not reset"
        );
    }

    pub fn device_status(&self) -> DeviceStatusFlags {
        self.common().device_status.get()
    }

    pub(crate) fn insert_status(&self, status: DeviceStatusFlags) {
        let common = self.common();
        common.device_status.set(common.device_status.get() | status);
    }

    pub fn check_device_feature(&self, feature: u32) -> bool {
        let common = self.common();

        common.device_feature_select.set(feature >> 5);
        (common.device_feature.get() & (1 << (feature & 31))) != 0
    }

    pub fn ack_driver_feature(&self, feature: u32) {
        let common = self.common();

        common.driver_feature_select.set(feature >> 5);
        let current = common.driver_feature.get();
        common.driver_feature.set(current | (1 << (feature & 31)));
    }

    pub fn finalize_features(&self) {
        assert!(
            self.check_device_feature(VIRTIO_F_VERSION_1),
            "virtio: device does not offer VIRTIO_F_VERSION_1"
        );
        self.ack_driver_feature(VIRTIO_F_VERSION_1);

        self.insert_status(DeviceStatusFlags::FEATURES_OK);

        // Re-read device status to ensure the `FEATURES_OK` bit is still set: otherwise,
        // the device does not support our subset of features and the device is unusable.
        assert!(
            self.device_status()
                .contains(DeviceStatusFlags::FEATURES_OK),
            "virtio: device rejected the negotiated features"
        );
    }

    pub fn claim_queues(&mut self, max: u16) {
        self.queues.claim(max);
    }

    pub fn setup_queue(&self, index: u16) -> Result<&Queue, Error> {
        let slot = self.queues.vacant(index);
        let common = self.common();

        common.queue_select.set(index);
        let queue_size = common.queue_size.get();
        let notify_index = common.queue_notify_off.get();

        let layout = queue_layout(index, queue_size, USED_ALIGN, self.queue_region_limit)?;

        let notify_offset = usize::from(notify_index) * self.regions.notify_multiplier as usize;
        if notify_offset + core::mem::size_of::<u16>() > self.regions.notify.len() {
            return Err(Error::NotifyOutOfRange {
                index,
                offset: notify_offset,
            });
        }
        let bell = StandardBell(unsafe { self.regions.notify.get().add(notify_offset).cast() });

        let queue = Queue::new(self.memory.clone(), index, layout, bell)?;

        let halves = |addr: usize| (addr as u32, ((addr as u64) >> 32) as u32);
        let (lo, hi) = halves(queue.descriptor_physical());
        common.queue_desc_lo.set(lo);
        common.queue_desc_hi.set(hi);
        let (lo, hi) = halves(queue.available_physical());
        common.queue_driver_lo.set(lo);
        common.queue_driver_hi.set(hi);
        let (lo, hi) = halves(queue.used_physical());
        common.queue_device_lo.set(lo);
        common.queue_device_hi.set(hi);

        // Enable the queue.
        common.queue_enable.set(1);
        queue.mark_registered();

        log::info!("virtio: enabled queue #{index} (size={queue_size})");
        Ok(slot.get_or_init(|| queue))
    }

    pub async fn run_device(&self) -> Result<Infallible, Error> {
        self.insert_status(DeviceStatusFlags::DRIVER_OK);
        log::info!("virtio: device is live");

        match &self.isr_offload {
            Some(offload) => self.serve_offloaded(offload).await,
            None => self.serve_polled().await,
        }
    }

    async fn serve_polled(&self) -> Result<Infallible, Error> {
        self.function.enable_bus_irq().await?;
        self.irq.acknowledge(IrqAck::Kick, 0)?;

        let mut sequence = 0;
        loop {
            sequence = self.irq.wait(sequence).await?;

            // Reading the register clears it.
            let isr = self.regions.isr.read8(0);
            if isr == 0 {
                self.irq.acknowledge(IrqAck::Nack, sequence)?;
                continue;
            }
            self.irq.acknowledge(IrqAck::Acknowledge, sequence)?;

            dispatch_isr(
                IsrStatus::from_bits_retain(isr),
                || self.device_status(),
                &self.queues,
            );
        }
    }

    async fn serve_offloaded(&self, offload: &IsrOffload) -> Result<Infallible, Error> {
        let compiler = offload.compiler().await.map_err(Error::Offload)?;

        let program = IsrProgram::virtio_isr(0);
        let compiled = compiler
            .compile(&program.encode(), &IsrProgram::BINDINGS)
            .await?;

        let isr = self.regions.isr.physical();
        let event = self.irq.automate(
            &compiled,
            IsrBinding {
                region_phys: page_base(isr),
                offset: page_offset(isr),
            },
        )?;
        log::debug!("virtio: ISR handled by compiled program {}", compiled.handle);

        self.function.enable_bus_irq().await?;
        self.irq.acknowledge(IrqAck::Kick, 0)?;

        let mut sequence = 0;
        loop {
            let (next, bits) = event.wait(sequence).await?;
            sequence = next;

            let isr = IsrStatus::from_bits_truncate(bits as u8);
            assert!(!isr.is_empty(), "virtio: ISR program raised {bits:#x}");

            dispatch_isr(isr, || self.device_status(), &self.queues);
        }
    }
}
