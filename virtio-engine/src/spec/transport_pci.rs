//! [4.1 Virtio Over PCI Bus](https://docs.oasis-open.org/virtio/virtio/v1.2/cs01/virtio-v1.2-cs01.html#x1-1150001)

use super::DeviceStatusFlags;
use crate::utils::VolatileCell;
use static_assertions::const_assert_eq;

/// Capability ID of vendor-specific PCI capabilities, which is how virtio
/// structures are advertised.
pub const PCI_CAP_ID_VENDOR: u8 = 0x09;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum CfgType {
    /// Common Configuration.
    Common = 1,
    /// Notifications.
    Notify = 2,
    /// ISR Status.
    Isr = 3,
    /// Device specific configuration.
    Device = 4,
    /// PCI configuration access.
    PciConfig = 5,
    /// Shared memory region.
    SharedMemory = 8,
    /// Vendor-specific data.
    Vendor = 9,
}

impl TryFrom<u8> for CfgType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        Ok(match value {
            1 => Self::Common,
            2 => Self::Notify,
            3 => Self::Isr,
            4 => Self::Device,
            5 => Self::PciConfig,
            8 => Self::SharedMemory,
            9 => Self::Vendor,
            other => return Err(other),
        })
    }
}

/// [4.1.4 Virtio Structure PCI Capabilities](https://docs.oasis-open.org/virtio/virtio/v1.2/cs01/virtio-v1.2-cs01.html#x1-1240004)
///
/// Decoded from the capability body, i.e. without the generic `cap_vndr`,
/// `cap_next` and `cap_len` bytes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PciCapability {
    /// Identifies the structure.
    pub cfg_type: CfgType,
    /// Where to find it.
    pub bar: u8,
    /// Multiple capabilities of the same type.
    pub id: u8,
    /// Offset within the bar.
    pub offset: u32,
    /// Length of the structure, in bytes.
    pub length: u32,
    /// Multiplier for `queue_notify_off`; only present on
    /// [`CfgType::Notify`] capabilities.
    pub notify_off_multiplier: Option<u32>,
}

/// Body size of `struct virtio_pci_cap` without the generic header.
pub const PCI_CAPABILITY_LEN: usize = 13;
/// Body size of `struct virtio_pci_notify_cap` without the generic header.
pub const PCI_CAPABILITY_NOTIFY_LEN: usize = PCI_CAPABILITY_LEN + 4;

/// Reasons a vendor capability does not describe a usable virtio structure.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CapabilityParseError {
    Truncated(usize),
    UnknownType(u8),
}

impl PciCapability {
    pub fn parse(data: &[u8]) -> Result<Self, CapabilityParseError> {
        if data.len() < PCI_CAPABILITY_LEN {
            return Err(CapabilityParseError::Truncated(data.len()));
        }

        let le32 = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);

        let cfg_type = CfgType::try_from(data[0]).map_err(CapabilityParseError::UnknownType)?;
        let notify_off_multiplier = match cfg_type {
            CfgType::Notify if data.len() < PCI_CAPABILITY_NOTIFY_LEN => {
                return Err(CapabilityParseError::Truncated(data.len()))
            }
            CfgType::Notify => Some(le32(13)),
            _ => None,
        };

        Ok(Self {
            cfg_type,
            bar: data[1],
            id: data[2],
            // data[3..5] is padding.
            offset: le32(5),
            length: le32(9),
            notify_off_multiplier,
        })
    }
}

/// `struct virtio_pci_common_cfg` as of virtio 1.0. 64-bit queue addresses
/// are split into halves so that each access is a single 32-bit store.
#[derive(Debug)]
#[repr(C)]
pub struct CommonCfg {
    // About the whole device.
    /// Selects which 32 feature bits `device_feature` shows.
    pub device_feature_select: VolatileCell<u32>,
    /// Feature bits offered by the device. Read-only for the driver.
    pub device_feature: VolatileCell<u32>,
    /// Selects which 32 feature bits `driver_feature` shows.
    pub driver_feature_select: VolatileCell<u32>,
    /// Feature bits accepted by the driver.
    pub driver_feature: VolatileCell<u32>,
    pub config_msix_vector: VolatileCell<u16>,
    /// Maximum number of virtqueues supported. Read-only for the driver.
    pub num_queues: VolatileCell<u16>,
    /// Writing 0 into this field resets the device.
    pub device_status: VolatileCell<DeviceStatusFlags>,
    /// Changes every time the configuration noticeably changes.
    pub config_generation: VolatileCell<u8>,

    // About a specific virtqueue.
    pub queue_select: VolatileCell<u16>,
    /// Maximum queue size on reset; 0 means the queue is unavailable.
    pub queue_size: VolatileCell<u16>,
    pub queue_msix_vector: VolatileCell<u16>,
    /// 1 - enabled; 0 - disabled.
    pub queue_enable: VolatileCell<u16>,
    /// Index into the notification structure, in units of the notify
    /// multiplier. Read-only for the driver.
    pub queue_notify_off: VolatileCell<u16>,
    pub queue_desc_lo: VolatileCell<u32>,
    pub queue_desc_hi: VolatileCell<u32>,
    pub queue_driver_lo: VolatileCell<u32>,
    pub queue_driver_hi: VolatileCell<u32>,
    pub queue_device_lo: VolatileCell<u32>,
    pub queue_device_hi: VolatileCell<u32>,
}

const_assert_eq!(core::mem::size_of::<CommonCfg>(), 56);

/// Register offsets of the legacy (virtio 0.9.5) I/O port interface, without
/// MSI-X.
#[derive(Debug, Copy, Clone)]
#[repr(u16)]
pub enum LegacyRegister {
    DeviceFeatures = 0, // u32
    DriverFeatures = 4, // u32
    QueueAddress = 8,   // u32
    QueueSize = 12,     // u16
    QueueSelect = 14,   // u16
    QueueNotify = 16,   // u16
    DeviceStatus = 18,  // u8
    IsrStatus = 19,     // u8
}

/// Start of the device specific configuration in the legacy port window when
/// MSI-X is disabled.
pub const LEGACY_DEVICE_CONFIG_OFFSET: u16 = 20;

/// The legacy interface takes the queue address as a 4096-byte page frame
/// number.
pub const LEGACY_QUEUE_ADDRESS_SHIFT: u32 = 12;
