use bytes::Buf;

use crate::error::RelayError;

macro_rules! get_checked_impl {
    ($checked_getter: ident, $ty:ty, $getter: ident) => {
        fn $checked_getter(&mut self) -> Result<$ty, RelayError> {
            if self.remaining() < size_of::<$ty>() {
                return Err(RelayError::Truncated);
            }
            Ok(self.$getter())
        }
    }
}

/// Big-endian reads that report a short buffer as [RelayError::Truncated] instead of panicking.
pub trait BufExt: Buf {
    get_checked_impl!(get_u16_checked, u16, get_u16);
    get_checked_impl!(get_u32_checked, u32, get_u32);
    get_checked_impl!(get_u64_checked, u64, get_u64);
}

impl <T: Buf> BufExt for T {
}

/// Splits off the next `len` bytes without copying
pub fn split_checked<'a>(buf: &mut &'a [u8], len: usize) -> Result<&'a [u8], RelayError> {
    if buf.len() < len {
        return Err(RelayError::Truncated);
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}
