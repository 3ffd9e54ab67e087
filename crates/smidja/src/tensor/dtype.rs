/// Element types understood by the kernel engine.
///
/// `PackedF16` is a tagged variant, not a flag on a shared tensor class:
/// a packed tensor is logically f32 but stores two scaled `f16` values per
/// `u32` lane along its trailing axis. Conversions go through the explicit
/// `packed` codec, never implicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// Standard 32-bit float.
    F32,
    /// 32-bit signed integer, primarily for class labels and token ids.
    I32,
    /// Two half-precision floats per 32-bit storage lane.
    PackedF16,
}

impl DType {
    /// Bytes per *storage* element. For `PackedF16` this is the lane size;
    /// one lane carries two logical values.
    pub fn size_of(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::I32 => 4,
            DType::PackedF16 => 4,
        }
    }

    pub fn is_packed(&self) -> bool {
        matches!(self, DType::PackedF16)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::I32 => "i32",
            DType::PackedF16 => "packed_f16",
        }
    }
}

/// Number of `u32` lanes needed to store a logical trailing dimension of
/// `last` f32 values in packed form. Odd lengths round up; the spare half
/// of the final lane is zero-filled by the codec.
pub fn packed_lanes(last: usize) -> usize {
    last.div_ceil(2)
}
