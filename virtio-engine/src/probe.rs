use std::rc::Rc;

use common::dma::PhysicalMemory;

use crate::irq::IsrOffload;
use crate::legacy_transport::LegacyPciTransport;
use crate::mapping::Mapping;
use crate::pci::PciFunction;
use crate::spec::*;
use crate::standard_transport::{StandardPciTransport, StandardRegions};
use crate::transport::{Error, Transport};

/// Default upper bound on the memory of a single queue.
pub const DEFAULT_QUEUE_REGION_LIMIT: usize = 0x4000;

/// Which transports [`discover`] may use.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum DiscoverMode {
    LegacyOnly,
    ModernOnly,
    /// Prefer the standard transport, fall back to the legacy one.
    #[default]
    Transitional,
}

impl DiscoverMode {
    fn allows_modern(self) -> bool {
        matches!(self, Self::ModernOnly | Self::Transitional)
    }

    fn allows_legacy(self) -> bool {
        matches!(self, Self::LegacyOnly | Self::Transitional)
    }
}

#[derive(Clone)]
pub struct DiscoverConfig {
    pub mode: DiscoverMode,
    /// Largest queue region, in bytes, a transport will allocate.
    pub queue_region_limit: usize,
    /// Process-wide ISR compiler connection. Without it the standard
    /// transport reads the ISR register on every interrupt.
    pub isr_offload: Option<Rc<IsrOffload>>,
}

impl Default for DiscoverConfig {
    fn default() -> Self {
        Self {
            mode: DiscoverMode::default(),
            queue_region_limit: DEFAULT_QUEUE_REGION_LIMIT,
            isr_offload: None,
        }
    }
}

/// Maps the four virtio structures. `Ok(None)` if the device does not
/// advertise all of them.
fn map_standard_regions(
    function: &dyn PciFunction,
    memory: &Rc<dyn PhysicalMemory>,
) -> Result<Option<StandardRegions>, Error> {
    let mut common = None;
    let mut notify = None;
    let mut isr = None;
    let mut device = None;

    for vendor in function.vendor_capabilities() {
        let capability = match PciCapability::parse(&vendor.data) {
            Ok(capability) => capability,
            Err(CapabilityParseError::UnknownType(_)) => continue,
            Err(err) => {
                log::warn!("virtio: ignoring malformed capability ({err:?})");
                continue;
            }
        };

        match capability.cfg_type {
            CfgType::Common | CfgType::Notify | CfgType::Isr | CfgType::Device => {}
            _ => continue,
        }

        if capability.bar >= 6 {
            log::warn!("virtio: {capability:?} names a nonexistent BAR");
            continue;
        }

        let bar = function.bar(capability.bar);
        let Some(base) = bar.memory_base() else {
            log::warn!("virtio: skipping {:?} structure in {bar:?}", capability.cfg_type);
            continue;
        };

        log::trace!("virtio-engine::device-probe: {capability:?}");

        let mapping = Mapping::new(
            memory.clone(),
            base + capability.offset as usize,
            capability.length as usize,
        )?;

        // The first capability of each type wins.
        match capability.cfg_type {
            CfgType::Common => {
                common.get_or_insert(mapping);
            }
            CfgType::Notify => {
                let multiplier = capability.notify_off_multiplier.unwrap_or(0);
                notify.get_or_insert((mapping, multiplier));
            }
            CfgType::Isr => {
                isr.get_or_insert(mapping);
            }
            CfgType::Device => {
                device.get_or_insert(mapping);
            }
            _ => unreachable!(),
        }
    }

    let (Some(common), Some((notify, notify_multiplier)), Some(isr), Some(device)) =
        (common, notify, isr, device)
    else {
        return Ok(None);
    };

    if common.len() < core::mem::size_of::<CommonCfg>() {
        return Err(Error::CapabilityTooShort {
            cfg_type: CfgType::Common,
            length: common.len(),
        });
    }

    Ok(Some(StandardRegions {
        common,
        notify,
        notify_multiplier,
        isr,
        device,
    }))
}

/// VirtIO Device Discovery
///
/// Picks a transport for `function` and brings the device to the `DRIVER`
/// state.
///
/// ## Device State
/// After this function, the device will have been successfully reset and is ready for use.
///
/// The caller is required to do the following:
/// * Negotiate the device and driver supported features (finalize via [`Transport::finalize_features`])
/// * Create the device specific virtio queues (via [`Transport::claim_queues`] and
///   [`Transport::setup_queue`]). This is *required* to be done before starting the device.
/// * Finally start the device (via [`Transport::run_device`]). At this point, the device
///   is alive.
///
/// ## Panics
/// If the device does not read back a zero status after reset.
pub fn discover(
    function: Box<dyn PciFunction>,
    memory: Rc<dyn PhysicalMemory>,
    config: DiscoverConfig,
) -> Result<Transport, Error> {
    let vendor = function.vendor_id();
    if vendor != VIRTIO_PCI_VENDOR {
        return Err(Error::NotVirtio(vendor));
    }

    log::debug!(
        "virtio: probing {vendor:04x}:{:04x} ({:?})",
        function.device_id(),
        config.mode
    );

    let irq = function.interrupt_line()?;

    if config.mode.allows_modern() {
        if let Some(regions) = map_standard_regions(&*function, &memory)? {
            let transport = StandardPciTransport::new(
                function,
                memory,
                irq,
                regions,
                config.isr_offload,
                config.queue_region_limit,
            );

            transport.reset();
            log::info!("virtio: successfully reset the device");

            // XXX: According to the virtio specification v1.2, setting the ACKNOWLEDGE and DRIVER bits
            //      in `device_status` is required to be done in two steps.
            transport.insert_status(DeviceStatusFlags::ACKNOWLEDGE);
            transport.insert_status(DeviceStatusFlags::DRIVER);

            log::info!("virtio: using standard PCI transport");
            return Ok(Transport::Standard(transport));
        }

        log::debug!("virtio: device lacks the standard capabilities");
    }

    if config.mode.allows_legacy() && function.bar(0).is_port() {
        let ports = function.enable_port_io(0)?;
        let transport =
            LegacyPciTransport::new(function, memory, ports, irq, config.queue_region_limit);

        transport.reset();
        log::info!("virtio: successfully reset the device");

        transport.insert_status(DeviceStatusFlags::ACKNOWLEDGE);
        transport.insert_status(DeviceStatusFlags::DRIVER);

        log::info!("virtio: using legacy PCI transport");
        return Ok(Transport::Legacy(transport));
    }

    Err(Error::NoTransport)
}
