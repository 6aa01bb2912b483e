//! Fixed-width encoding for index keys and values.

/// A type that encodes to a fixed number of bytes inside a block page
/// slot.
///
/// The width is the same for every instance of the type, so slot offsets
/// can be computed arithmetically. All provided implementations use
/// little-endian byte order; a custom implementation only has to be
/// self-consistent, since slot bytes are never interpreted by anything
/// but the codec that wrote them.
pub trait FixedCodec: Copy {
    /// Encoded width in bytes.
    const WIDTH: usize;

    /// Writes the encoded form into `buf`, which is exactly
    /// [`WIDTH`](FixedCodec::WIDTH) bytes long.
    fn encode_into(&self, buf: &mut [u8]);

    /// Reads a value back from `buf`, which is exactly
    /// [`WIDTH`](FixedCodec::WIDTH) bytes long.
    fn decode_from(buf: &[u8]) -> Self;
}

macro_rules! impl_fixed_codec_for_int {
    ($($ty:ty),* $(,)?) => {
        $(
            impl FixedCodec for $ty {
                const WIDTH: usize = std::mem::size_of::<$ty>();

                #[inline]
                fn encode_into(&self, buf: &mut [u8]) {
                    buf.copy_from_slice(&self.to_le_bytes());
                }

                #[inline]
                fn decode_from(buf: &[u8]) -> Self {
                    <$ty>::from_le_bytes(buf.try_into().expect("codec width mismatch"))
                }
            }
        )*
    };
}

impl_fixed_codec_for_int!(i16, u16, i32, u32, i64, u64);
