//! Driver-side virtio core: PCI transport negotiation, split virtqueues and
//! interrupt-driven completion of descriptor chains.
//!
//! Everything here runs on a single thread; the futures returned by the
//! queues and transports can be driven by any single-threaded executor.

pub mod chain;
pub mod doorbell;
pub mod irq;
pub mod isr_program;
pub mod legacy_transport;
pub mod mapping;
pub mod pci;
pub mod queue;
pub mod spec;
pub mod standard_transport;
pub mod transport;
pub mod utils;

mod probe;
#[cfg(test)]
mod testing;

pub use chain::{scatter_gather, Chain, Direction, DmaBufferView, Handle};
pub use probe::{discover, DiscoverConfig, DiscoverMode, DEFAULT_QUEUE_REGION_LIMIT};
pub use queue::{PendingRequest, Queue, Request};
pub use transport::{Error, Transport};
