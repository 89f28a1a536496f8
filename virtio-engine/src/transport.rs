use std::cell::OnceCell;
use std::convert::Infallible;
use std::rc::Rc;

use crate::legacy_transport::LegacyPciTransport;
use crate::pci::PciFunction;
use crate::queue::Queue;
use crate::spec::*;
use crate::standard_transport::StandardPciTransport;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("vendor {0:#06x} is not a virtio device")]
    NotVirtio(u16),
    #[error("the device offers no usable transport")]
    NoTransport,
    #[error("queue #{0} is not available")]
    QueueUnavailable(u16),
    #[error("queue #{index} reports size {size}, which is not a power of two")]
    InvalidQueueSize { index: u16, size: u16 },
    #[error("queue #{index} needs {size:#x} bytes, more than the {limit:#x} byte limit")]
    QueueRegionTooLarge { index: u16, size: usize, limit: usize },
    #[error("queue memory at {0:#x} is not addressable by the device")]
    QueueAddressOutOfRange(usize),
    #[error("notify register of queue #{index} at offset {offset:#x} is outside the notify region")]
    NotifyOutOfRange { index: u16, offset: usize },
    #[error("{cfg_type:?} region is only {length} bytes")]
    CapabilityTooShort { cfg_type: CfgType, length: usize },
    #[error("the queue was dropped before the request completed")]
    RequestDropped,
    #[error("ISR offload is unavailable: {0}")]
    Offload(Rc<common::Error>),
    #[error("platform service failed")]
    Platform(#[from] common::Error),
}

/// Tells the device that queue `queue_index` has new available buffers.
pub trait NotifyBell {
    fn ring(&self, queue_index: u16);
}

/// Queue slots reserved by [`Transport::claim_queues`].
#[derive(Default)]
pub(crate) struct QueueTable {
    slots: Vec<OnceCell<Queue>>,
}

impl QueueTable {
    pub fn claim(&mut self, max: u16) {
        if usize::from(max) > self.slots.len() {
            self.slots.resize_with(usize::from(max), OnceCell::new);
        }
    }

    /// Returns the still empty slot for `index`.
    ///
    /// ## Panics
    /// If `index` was not claimed or is already set up.
    pub fn vacant(&self, index: u16) -> &OnceCell<Queue> {
        let slot = self
            .slots
            .get(usize::from(index))
            .unwrap_or_else(|| panic!("virtio: queue #{index} was not claimed"));
        assert!(slot.get().is_none(), "virtio: queue #{index} is already set up");
        slot
    }

    pub fn iter(&self) -> impl Iterator<Item = &Queue> {
        self.slots.iter().filter_map(OnceCell::get)
    }
}

/// Validates the size a device reports for queue `index` and lays the queue
/// out.
pub(crate) fn queue_layout(
    index: u16,
    size: u16,
    used_align: usize,
    limit: usize,
) -> Result<QueueLayout, Error> {
    if size == 0 {
        return Err(Error::QueueUnavailable(index));
    }
    if !size.is_power_of_two() {
        return Err(Error::InvalidQueueSize { index, size });
    }

    let layout = QueueLayout::new(size, used_align);
    if layout.size > limit {
        return Err(Error::QueueRegionTooLarge {
            index,
            size: layout.size,
            limit,
        });
    }

    Ok(layout)
}

/// Acts on an ISR status the device raised.
///
/// ## Panics
/// If the device signals a configuration change while requesting a reset.
pub(crate) fn dispatch_isr(
    isr: IsrStatus,
    device_status: impl FnOnce() -> DeviceStatusFlags,
    queues: &QueueTable,
) {
    if isr.contains(IsrStatus::CONFIG_CHANGE) {
        log::info!("virtio: device configuration changed");
        assert!(
            !device_status().contains(DeviceStatusFlags::DEVICE_NEEDS_RESET),
            "virtio: device requested a reset"
        );
    }

    if isr.contains(IsrStatus::QUEUE) {
        queues.iter().for_each(Queue::process_interrupt);
    }
}

/// A virtio device reached through one of the PCI transports.
pub enum Transport {
    Legacy(LegacyPciTransport),
    Standard(StandardPciTransport),
}

macro_rules! dispatch {
    ($self:expr, $t:ident => $body:expr) => {
        match $self {
            Transport::Legacy($t) => $body,
            Transport::Standard($t) => $body,
        }
    };
}

impl Transport {
    pub fn pci_function(&self) -> &dyn PciFunction {
        dispatch!(self, t => t.pci_function())
    }

    /// Reads 32 bits of device specific configuration at `offset`.
    pub fn load_config(&self, offset: u16) -> u32 {
        dispatch!(self, t => t.load_config(offset))
    }

    /// Each time the device configuration changes this number will be updated.
    pub fn config_generation(&self) -> u32 {
        dispatch!(self, t => t.config_generation())
    }

    /// Number of queues the device supports, if the transport reports it.
    pub fn num_queues(&self) -> Option<u16> {
        match self {
            Transport::Legacy(_) => None,
            Transport::Standard(t) => Some(t.num_queues()),
        }
    }

    pub fn reset(&self) {
        dispatch!(self, t => t.reset())
    }

    pub fn device_status(&self) -> DeviceStatusFlags {
        dispatch!(self, t => t.device_status())
    }

    /// Returns whether the device supports the specified feature.
    pub fn check_device_feature(&self, feature: u32) -> bool {
        dispatch!(self, t => t.check_device_feature(feature))
    }

    /// Acknowledges the specified feature.
    ///
    /// **Note**: [`Transport::check_device_feature`] must be used to check whether
    /// the device supports the feature before acknowledging it.
    pub fn ack_driver_feature(&self, feature: u32) {
        dispatch!(self, t => t.ack_driver_feature(feature))
    }

    /// Completes feature negotiation.
    ///
    /// ## Panics
    /// If the device rejects the negotiated features.
    pub fn finalize_features(&self) {
        dispatch!(self, t => t.finalize_features())
    }

    /// Reserves slots for queues `0..max`.
    pub fn claim_queues(&mut self, max: u16) {
        dispatch!(self, t => t.claim_queues(max))
    }

    /// Allocates queue `index` and registers it with the device.
    ///
    /// ## Panics
    /// If `index` was not claimed or is already set up.
    pub fn setup_queue(&self, index: u16) -> Result<&Queue, Error> {
        dispatch!(self, t => t.setup_queue(index))
    }

    /// Marks the driver ready and services device interrupts from then on.
    ///
    /// Only returns if an interrupt service fails.
    pub async fn run_device(&self) -> Result<Infallible, Error> {
        dispatch!(self, t => t.run_device().await)
    }
}
