use std::fmt;

/// Divide, rounding up
pub const fn divroundup(num: usize, divisor: usize) -> usize {
    (num + divisor - 1) / divisor
}

/// Round `num` up to a multiple of `multiple`
pub const fn roundto(num: usize, multiple: usize) -> usize {
    divroundup(num, multiple) * multiple
}

/// Round `addr` up to a multiple of `align` (which must be a power of 2),
/// wrapping around on overflow instead of panicking
pub const fn align_up_wrapping(addr: usize, align: usize) -> usize {
    addr.wrapping_add(align - 1) & !(align - 1)
}

/// Wrapper that prints a pointer-ish value as hex,
/// for sticking addresses into tracing fields
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
        assert_eq!(roundto(8, 8), 8);
        assert_eq!(roundto(4097, 4096), 8192);
    }

    #[test]
    fn align_up_wrapping_test() {
        assert_eq!(align_up_wrapping(0x1001, 0x10), 0x1010);
        assert_eq!(align_up_wrapping(0x1010, 0x10), 0x1010);
        assert_eq!(align_up_wrapping(usize::MAX, 8), 0);
    }

    #[test]
    fn usize_ptr_debug() {
        let x = UsizePtr(0xdead_beef);
        assert_eq!(format!("{:?}", x), "0xdeadbeef");
    }
}
