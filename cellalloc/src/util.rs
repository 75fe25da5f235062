use std::{fmt, ptr::NonNull};

/// Divide, rounding up
pub const fn divroundup(num: usize, divisor: usize) -> usize {
    (num + divisor - 1) / divisor
}

/// Round `num` up to a multiple of `multiple`
pub const fn roundto(num: usize, multiple: usize) -> usize {
    divroundup(num, multiple) * multiple
}

/// Address wrapper that prints as hex, for tracing fields
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsizePtr(pub usize);

impl fmt::Debug for UsizePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl<T: ?Sized> From<*const T> for UsizePtr {
    fn from(value: *const T) -> Self {
        Self(value as *const () as usize)
    }
}

impl<T: ?Sized> From<*mut T> for UsizePtr {
    fn from(value: *mut T) -> Self {
        Self(value as *const () as usize)
    }
}

impl<T: ?Sized> From<NonNull<T>> for UsizePtr {
    fn from(value: NonNull<T>) -> Self {
        Self(value.as_ptr() as *const () as usize)
    }
}

impl<T: ?Sized> From<&T> for UsizePtr {
    fn from(value: &T) -> Self {
        Self(value as *const T as *const () as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divroundup_test() {
        assert_eq!(divroundup(0, 4), 0);
        assert_eq!(divroundup(4, 4), 1);
        assert_eq!(divroundup(5, 4), 2);
    }

    #[test]
    fn roundto_test() {
        assert_eq!(roundto(0, 8), 0);
        assert_eq!(roundto(1, 8), 8);
        assert_eq!(roundto(20, 8), 24);
        assert_eq!(roundto(24, 8), 24);
    }

    #[test]
    fn usizeptr_debug_test() {
        let p = UsizePtr(0xdead_beef);
        assert_eq!(format!("{:?}", p), "0xdeadbeef");
        let x = 5u64;
        assert_eq!(UsizePtr::from(&x).0, &x as *const u64 as usize);
    }
}
