use core::cell::UnsafeCell;
use core::fmt::Debug;
use core::marker::PhantomData;

/// A register or shared-memory field that is only ever accessed with volatile
/// loads and stores, since the device may change it at any time.
#[repr(transparent)]
pub struct VolatileCell<T> {
    value: UnsafeCell<T>,
}

impl<T: Copy> VolatileCell<T> {
    #[inline]
    pub const fn new(value: T) -> Self {
        Self {
            value: UnsafeCell::new(value),
        }
    }

    /// Returns a copy of the contained value.
    #[inline]
    pub fn get(&self) -> T {
        unsafe { core::ptr::read_volatile(self.value.get()) }
    }

    /// Sets the contained value.
    #[inline]
    pub fn set(&self, value: T) {
        unsafe { core::ptr::write_volatile(self.value.get(), value) }
    }
}

impl<T> Debug for VolatileCell<T>
where
    T: Debug + Copy,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolatileCell")
            .field("value", &self.get())
            .finish()
    }
}

/// Trailing array of a ring header whose length is only known at runtime.
#[repr(C)]
pub struct IncompleteArrayField<T>(PhantomData<T>, [T; 0]);

impl<T> IncompleteArrayField<T> {
    #[inline]
    pub const fn new() -> Self {
        IncompleteArrayField(PhantomData, [])
    }

    /// ## Safety
    /// `len` elements must be initialized and live behind the header.
    #[inline]
    pub unsafe fn as_slice(&self, len: usize) -> &[T] {
        core::slice::from_raw_parts(self.as_ptr(), len)
    }

    #[inline]
    pub fn as_ptr(&self) -> *const T {
        self as *const _ as *const T
    }
}

/// Rounds `val` up to the next multiple of `align`, which must be a power of two.
pub const fn align_up(val: usize, align: usize) -> usize {
    assert!(align.is_power_of_two());
    (val + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_boundary() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 2), 2);
        assert_eq!(align_up(128, 2), 128);
        assert_eq!(align_up(150, 4096), 4096);
        assert_eq!(align_up(4097, 4), 4100);
    }

    #[test]
    fn volatile_cell_is_shared_writable() {
        let cell = VolatileCell::new(3u16);
        cell.set(7);
        assert_eq!(cell.get(), 7);
    }
}
