use anyhow::anyhow;
use bytes::{Buf, Bytes};


macro_rules! get_checked_impl {
    ($checked_getter: ident, $ty:ty, $getter: ident) => {
        fn $checked_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < std::mem::size_of::<$ty>() {
                return Err(anyhow!("buffer underflow reading {}: {} bytes remaining", stringify!($ty), self.remaining()));
            }
            Ok(self.$getter())
        }
    }
}

/// Bounds-checked reads for deserializing peer-controlled data: running out of bytes is an
///  error rather than a panic.
pub trait BufExt: Buf {
    get_checked_impl!(checked_u8, u8, get_u8);
    get_checked_impl!(checked_u16_le, u16, get_u16_le);
    get_checked_impl!(checked_u32_le, u32, get_u32_le);

    fn checked_bool(&mut self) -> anyhow::Result<bool> {
        match self.checked_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            n => Err(anyhow!("invalid boolean value {}", n)),
        }
    }

    /// reads a u16 length prefix followed by that many bytes
    fn checked_len_prefixed_bytes(&mut self) -> anyhow::Result<Bytes> {
        let len = self.checked_u16_le()? as usize;
        if self.remaining() < len {
            return Err(anyhow!("buffer underflow: {} bytes announced, {} remaining", len, self.remaining()));
        }
        Ok(self.copy_to_bytes(len))
    }
}

impl <T: Buf> BufExt for T {
}

#[cfg(test)]
mod test {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::exact(b"\x34\x12", Some(0x1234))]
    #[case::remainder(b"\x01\x00\xff", Some(1))]
    #[case::too_short(b"\x01", None)]
    #[case::empty(b"", None)]
    fn test_checked_u16_le(#[case] mut buf: &[u8], #[case] expected: Option<u16>) {
        match buf.checked_u16_le() {
            Ok(actual) => assert_eq!(Some(actual), expected),
            Err(_) => assert!(expected.is_none()),
        }
    }

    #[rstest]
    #[case::f(b"\0", Some(false))]
    #[case::t(b"\x01", Some(true))]
    #[case::invalid(b"\x02", None)]
    fn test_checked_bool(#[case] mut buf: &[u8], #[case] expected: Option<bool>) {
        assert_eq!(buf.checked_bool().ok(), expected);
    }

    #[rstest]
    #[case::complete(b"\x03\0abc", b"abc", b"")]
    #[case::remainder(b"\x01\0abc", b"a", b"bc")]
    #[case::empty(b"\0\0", b"", b"")]
    fn test_checked_len_prefixed_bytes(#[case] mut buf: &[u8], #[case] expected: &[u8], #[case] buf_after: &[u8]) {
        let actual = buf.checked_len_prefixed_bytes().unwrap();
        assert_eq!(actual.as_ref(), expected);
        assert_eq!(buf, buf_after);
    }

    #[test]
    fn test_checked_len_prefixed_bytes_underflow() {
        let mut buf: &[u8] = b"\x05\0abc";
        assert!(buf.checked_len_prefixed_bytes().is_err());
    }
}
