use std::cell::Cell;
use std::convert::Infallible;
use std::rc::Rc;

use common::dma::PhysicalMemory;
use common::io::PortSpace;

use crate::irq::{InterruptLine, IrqAck};
use crate::pci::PciFunction;
use crate::queue::Queue;
use crate::spec::*;
use crate::transport::{dispatch_isr, queue_layout, Error, NotifyBell, QueueTable};

struct LegacyBell(Rc<dyn PortSpace>);

impl NotifyBell for LegacyBell {
    #[inline]
    fn ring(&self, queue_index: u16) {
        self.0.write16(LegacyRegister::QueueNotify as u16, queue_index)
    }
}

/// The virtio 0.9.5 interface: one I/O port window and a shared interrupt
/// line.
pub struct LegacyPciTransport {
    function: Box<dyn PciFunction>,
    memory: Rc<dyn PhysicalMemory>,
    ports: Rc<dyn PortSpace>,
    irq: Box<dyn InterruptLine>,
    queue_region_limit: usize,

    driver_features: Cell<u32>,
    queues: QueueTable,
}

impl LegacyPciTransport {
    pub(crate) fn new(
        function: Box<dyn PciFunction>,
        memory: Rc<dyn PhysicalMemory>,
        ports: Rc<dyn PortSpace>,
        irq: Box<dyn InterruptLine>,
        queue_region_limit: usize,
    ) -> Self {
        Self {
            function,
            memory,
            ports,
            irq,
            queue_region_limit,
            driver_features: Cell::new(0),
            queues: QueueTable::default(),
        }
    }

    fn read8(&self, register: LegacyRegister) -> u8 {
        self.ports.read8(register as u16)
    }

    fn write8(&self, register: LegacyRegister, value: u8) {
        self.ports.write8(register as u16, value)
    }

    pub fn pci_function(&self) -> &dyn PciFunction {
        &*self.function
    }

    pub fn load_config(&self, offset: u16) -> u32 {
        self.ports.read32(LEGACY_DEVICE_CONFIG_OFFSET + offset)
    }

    /// Legacy devices have no configuration generation counter.
    pub fn config_generation(&self) -> u32 {
        0
    }

    pub fn reset(&self) {
        self.write8(LegacyRegister::DeviceStatus, 0);

        let status = self.read8(LegacyRegister::DeviceStatus);
        assert_eq!(status, 0, "virtio: device did not reset");
    }

    pub fn device_status(&self) -> DeviceStatusFlags {
        DeviceStatusFlags::from_bits_retain(self.read8(LegacyRegister::DeviceStatus))
    }

    pub(crate) fn insert_status(&self, status: DeviceStatusFlags) {
        let old = self.device_status();
        self.write8(LegacyRegister::DeviceStatus, (old | status).bits());
    }

    pub fn check_device_feature(&self, feature: u32) -> bool {
        if feature >= 32 {
            return false;
        }
        self.ports.read32(LegacyRegister::DeviceFeatures as u16) & (1 << feature) != 0
    }

    /// Acknowledged features reach the device in [`Self::run_device`].
    pub fn ack_driver_feature(&self, feature: u32) {
        assert!(
            feature < 32,
            "virtio: cannot ack feature {feature} on a legacy device"
        );
        self.driver_features.set(self.driver_features.get() | (1 << feature));
    }

    // Legacy devices do not have the `FEATURES_OK` bit.
    pub fn finalize_features(&self) {}

    pub fn claim_queues(&mut self, max: u16) {
        self.queues.claim(max);
    }

    pub fn setup_queue(&self, index: u16) -> Result<&Queue, Error> {
        let slot = self.queues.vacant(index);

        self.ports.write16(LegacyRegister::QueueSelect as u16, index);
        let queue_size = self.ports.read16(LegacyRegister::QueueSize as u16);

        let layout = queue_layout(index, queue_size, LEGACY_USED_ALIGN, self.queue_region_limit)?;
        let queue = Queue::new(
            self.memory.clone(),
            index,
            layout,
            LegacyBell(self.ports.clone()),
        )?;

        let pfn = queue.descriptor_physical() >> LEGACY_QUEUE_ADDRESS_SHIFT;
        let pfn = u32::try_from(pfn)
            .map_err(|_| Error::QueueAddressOutOfRange(queue.descriptor_physical()))?;
        self.ports.write32(LegacyRegister::QueueAddress as u16, pfn);
        queue.mark_registered();

        log::info!("virtio: enabled legacy queue #{index} (size={queue_size})");
        Ok(slot.get_or_init(|| queue))
    }

    pub async fn run_device(&self) -> Result<Infallible, Error> {
        self.ports.write32(
            LegacyRegister::DriverFeatures as u16,
            self.driver_features.get(),
        );
        self.insert_status(DeviceStatusFlags::DRIVER_OK);
        log::info!("virtio: legacy device is live");

        self.function.enable_bus_irq().await?;
        self.irq.acknowledge(IrqAck::Kick, 0)?;

        let mut sequence = 0;
        loop {
            sequence = self.irq.wait(sequence).await?;

            // Reading the register clears it.
            let isr = self.read8(LegacyRegister::IsrStatus);
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
}
