//! The interrupt service, plus the optional out-of-line ISR offload.
//!
//! Without offload, every interrupt wakes the driver, which then reads the
//! ISR register itself. With offload, a tiny program compiled by a separate
//! service reads the register in the interrupt path and only raises a
//! bitset event when one of the virtio bits is set.

use std::cell::RefCell;
use std::rc::Rc;

use futures::future::{LocalBoxFuture, Shared};
use futures::FutureExt;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IrqAck {
    /// The interrupt was ours and has been handled.
    Acknowledge,
    /// The interrupt was not ours; let other handlers of the line look at it.
    Nack,
    /// Re-arm the line without reference to a particular occurrence.
    Kick,
}

pub trait InterruptLine {
    /// Resolves with the sequence number of the first interrupt that
    /// occurred after `sequence`.
    fn wait(&self, sequence: u64) -> LocalBoxFuture<'_, common::Result<u64>>;

    fn acknowledge(&self, ack: IrqAck, sequence: u64) -> common::Result<()>;

    /// Installs `program` as the first-level handler of this line and returns
    /// the event it raises.
    fn automate(
        &self,
        program: &CompiledIsr,
        binding: IsrBinding,
    ) -> common::Result<Box<dyn BitsetEvent>> {
        let _ = (program, binding);
        Err(common::Error::Unsupported)
    }
}

/// An event that accumulates bits raised by an automated interrupt handler.
pub trait BitsetEvent {
    /// Resolves with the new sequence number and the bits raised since
    /// `sequence`.
    fn wait(&self, sequence: u64) -> LocalBoxFuture<'_, common::Result<(u64, u32)>>;
}

/// Kind of each value an ISR program is bound to, in slot order.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BindType {
    MemoryView,
    Offset,
    BitsetEvent,
}

/// Opaque handle of a program accepted by the compiler service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledIsr {
    pub handle: u64,
}

/// Where the automated handler finds the ISR register: a physical page and
/// the register's byte offset inside it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct IsrBinding {
    pub region_phys: usize,
    pub offset: usize,
}

/// Connection to the ISR compiler service.
pub trait IsrCompiler {
    fn compile(
        &self,
        code: &[u8],
        bindings: &[BindType],
    ) -> LocalBoxFuture<'_, common::Result<CompiledIsr>>;
}

type Connector = Box<dyn Fn() -> LocalBoxFuture<'static, common::Result<Rc<dyn IsrCompiler>>>>;
type Connection = Shared<LocalBoxFuture<'static, Result<Rc<dyn IsrCompiler>, Rc<common::Error>>>>;

/// Process-wide, lazily established connection to the ISR compiler.
///
/// The first transport that needs the compiler starts connecting; every
/// other transport awaits the same connection attempt. A failed attempt is
/// not retried.
pub struct IsrOffload {
    connect: Connector,
    connection: RefCell<Option<Connection>>,
}

impl IsrOffload {
    pub fn new<F>(connect: F) -> Rc<Self>
    where
        F: Fn() -> LocalBoxFuture<'static, common::Result<Rc<dyn IsrCompiler>>> + 'static,
    {
        Rc::new(Self {
            connect: Box::new(connect),
            connection: RefCell::new(None),
        })
    }

    pub async fn compiler(&self) -> Result<Rc<dyn IsrCompiler>, Rc<common::Error>> {
        let connection = self
            .connection
            .borrow_mut()
            .get_or_insert_with(|| {
                log::debug!("virtio: connecting to the ISR compiler");
                (self.connect)()
                    .map(|result| result.map_err(Rc::new))
                    .boxed_local()
                    .shared()
            })
            .clone();

        connection.await
    }
}
