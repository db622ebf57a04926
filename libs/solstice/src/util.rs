//! Overflow-checked arithmetic and memory helpers.

use std::sync::atomic::{Ordering, compiler_fence};

use crate::Error;

mod sealed {
    pub trait Sealed {}
}

/// Primitive integers with overflow-detecting arithmetic.
pub trait CheckedArith: Copy + sealed::Sealed {
    fn checked_add(self, rhs: Self) -> Option<Self>;
    fn checked_sub(self, rhs: Self) -> Option<Self>;
    fn checked_mul(self, rhs: Self) -> Option<Self>;
}

macro_rules! impl_checked_arith {
    ($($ty:ty),*) => {
        $(
            impl sealed::Sealed for $ty {}
            impl CheckedArith for $ty {
                fn checked_add(self, rhs: Self) -> Option<Self> {
                    <$ty>::checked_add(self, rhs)
                }
                fn checked_sub(self, rhs: Self) -> Option<Self> {
                    <$ty>::checked_sub(self, rhs)
                }
                fn checked_mul(self, rhs: Self) -> Option<Self> {
                    <$ty>::checked_mul(self, rhs)
                }
            }
        )*
    };
}

impl_checked_arith!(i32, u32, i64, u64, isize, usize);

/// `a + b`, or `Error::Overflow` when the exact result does not fit.
pub fn checked_add<T: CheckedArith>(a: T, b: T) -> Result<T, Error> {
    a.checked_add(b).ok_or(Error::Overflow)
}

/// `a - b`, or `Error::Overflow` when the exact result does not fit.
pub fn checked_sub<T: CheckedArith>(a: T, b: T) -> Result<T, Error> {
    a.checked_sub(b).ok_or(Error::Overflow)
}

/// `a * b`, or `Error::Overflow` when the exact result does not fit.
pub fn checked_mul<T: CheckedArith>(a: T, b: T) -> Result<T, Error> {
    a.checked_mul(b).ok_or(Error::Overflow)
}

/// Zero a region in a way the optimizer cannot elide, for buffers that held
/// key material.
pub fn clear_memory_secure(buf: &mut [u8]) {
    for byte in buf.iter_mut() {
        // volatile so the dead-store eliminator leaves it alone
        unsafe { std::ptr::write_volatile(byte, 0) };
    }
    compiler_fence(Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_detects_overflow() {
        assert!(matches!(checked_add(u32::MAX, 1), Err(Error::Overflow)));
        assert_eq!(checked_add(u32::MAX - 1, 1).unwrap(), u32::MAX);
        assert!(matches!(checked_add(i32::MAX, 1), Err(Error::Overflow)));
        assert_eq!(checked_add(-1i32, i32::MIN + 1).unwrap(), i32::MIN);
    }

    #[test]
    fn sub_detects_overflow() {
        assert!(matches!(checked_sub(0u64, 1), Err(Error::Overflow)));
        assert_eq!(checked_sub(1u64, 1).unwrap(), 0);
        assert!(matches!(checked_sub(i64::MIN, 1), Err(Error::Overflow)));
    }

    #[test]
    fn mul_detects_overflow() {
        assert!(matches!(
            checked_mul(usize::MAX / 2 + 1, 2),
            Err(Error::Overflow)
        ));
        assert_eq!(checked_mul(6usize, 7).unwrap(), 42);
    }

    #[test]
    fn secure_clear_zeroes() {
        let mut buf = [0xaau8; 64];
        clear_memory_secure(&mut buf);
        assert!(buf.iter().all(|b| *b == 0));
    }
}
