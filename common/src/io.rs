use core::{
    cmp::PartialEq,
    marker::PhantomData,
    ops::{BitAnd, BitOr, Not},
};

/// IO abstraction
pub trait Io {
    /// Value type for IO, usually some unsigned number
    type Value: Copy
        + PartialEq
        + BitAnd<Output = Self::Value>
        + BitOr<Output = Self::Value>
        + Not<Output = Self::Value>;

    /// Read the underlying value
    fn read(&self) -> Self::Value;
    /// Write the underlying value
    fn write(&mut self, value: Self::Value);

    /// Check whether the underlying value contains bit flags
    #[inline(always)]
    fn readf(&self, flags: Self::Value) -> bool {
        (self.read() & flags) == flags
    }

    /// Enable or disable specific bit flags
    #[inline(always)]
    fn writef(&mut self, flags: Self::Value, value: bool) {
        let tmp: Self::Value = match value {
            true => self.read() | flags,
            false => self.read() & !flags,
        };
        self.write(tmp);
    }
}

/// Generic PIO
#[derive(Copy, Clone)]
pub struct Pio<T> {
    port: u16,
    value: PhantomData<T>,
}

impl<T> Pio<T> {
    /// Create a PIO from a given port
    pub const fn new(port: u16) -> Self {
        Pio::<T> {
            port,
            value: PhantomData,
        }
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
mod pio_impl {
    use core::arch::asm;

    use super::{Io, Pio};

    impl Io for Pio<u8> {
        type Value = u8;

        #[inline(always)]
        fn read(&self) -> u8 {
            let value: u8;
            unsafe {
                asm!("in al, dx", in("dx") self.port, out("al") value, options(nostack, nomem, preserves_flags));
            }
            value
        }

        #[inline(always)]
        fn write(&mut self, value: u8) {
            unsafe {
                asm!("out dx, al", in("dx") self.port, in("al") value, options(nostack, nomem, preserves_flags));
            }
        }
    }

    impl Io for Pio<u16> {
        type Value = u16;

        #[inline(always)]
        fn read(&self) -> u16 {
            let value: u16;
            unsafe {
                asm!("in ax, dx", in("dx") self.port, out("ax") value, options(nostack, nomem, preserves_flags));
            }
            value
        }

        #[inline(always)]
        fn write(&mut self, value: u16) {
            unsafe {
                asm!("out dx, ax", in("dx") self.port, in("ax") value, options(nostack, nomem, preserves_flags));
            }
        }
    }

    impl Io for Pio<u32> {
        type Value = u32;

        #[inline(always)]
        fn read(&self) -> u32 {
            let value: u32;
            unsafe {
                asm!("in eax, dx", in("dx") self.port, out("eax") value, options(nostack, nomem, preserves_flags));
            }
            value
        }

        #[inline(always)]
        fn write(&mut self, value: u32) {
            unsafe {
                asm!("out dx, eax", in("dx") self.port, in("eax") value, options(nostack, nomem, preserves_flags));
            }
        }
    }
}

/// A window of I/O ports, addressed relative to its base.
///
/// Legacy virtio devices expose their whole register file this way.
pub trait PortSpace {
    fn read8(&self, offset: u16) -> u8;
    fn read16(&self, offset: u16) -> u16;
    fn read32(&self, offset: u16) -> u32;

    fn write8(&self, offset: u16, value: u8);
    fn write16(&self, offset: u16, value: u16);
    fn write32(&self, offset: u16, value: u32);
}

/// Port range of a BAR, accessed with `in`/`out` instructions. The process
/// must already hold I/O privileges for it.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[derive(Debug, Copy, Clone)]
pub struct PortRange {
    base: u16,
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl PortRange {
    /// ## Safety
    /// The caller must own the ports starting at `base`.
    pub const unsafe fn new(base: u16) -> Self {
        Self { base }
    }

    pub fn base(&self) -> u16 {
        self.base
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl PortSpace for PortRange {
    fn read8(&self, offset: u16) -> u8 {
        Pio::<u8>::new(self.base + offset).read()
    }

    fn read16(&self, offset: u16) -> u16 {
        Pio::<u16>::new(self.base + offset).read()
    }

    fn read32(&self, offset: u16) -> u32 {
        Pio::<u32>::new(self.base + offset).read()
    }

    fn write8(&self, offset: u16, value: u8) {
        Pio::<u8>::new(self.base + offset).write(value)
    }

    fn write16(&self, offset: u16, value: u16) {
        Pio::<u16>::new(self.base + offset).write(value)
    }

    fn write32(&self, offset: u16, value: u32) {
        Pio::<u32>::new(self.base + offset).write(value)
    }
}
