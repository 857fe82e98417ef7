use serde::{Deserialize, Serialize};

/// Element type tag of a [`FrameBuffer`](super::FrameBuffer).
///
/// - `Bit`: 1-bit binary, packed 64 frames per machine word
/// - `Uint8`: 8-bit binary-coded level, `raw / 255` in [0, 1]
/// - `Fixed16`: Q8.8 signed fixed point
/// - `Fp32`: 32-bit float
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Bit,
    Uint8,
    Fixed16,
    Fp32,
}

impl DataType {
    /// Size of one element in bits.
    pub fn bit_size(self) -> usize {
        match self {
            DataType::Bit => 1,
            DataType::Uint8 => 8,
            DataType::Fixed16 => 16,
            DataType::Fp32 => 32,
        }
    }
}

/// Q8.8 fixed-point value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fixed16(pub i16);

impl Fixed16 {
    pub const FRACTION_BITS: u32 = 8;
    const SCALE: f32 = (1 << Self::FRACTION_BITS) as f32;

    pub fn from_f32(v: f32) -> Fixed16 {
        let raw = (v * Self::SCALE).round().clamp(i16::MIN as f32, i16::MAX as f32);
        Fixed16(raw as i16)
    }

    pub fn to_f32(self) -> f32 {
        self.0 as f32 / Self::SCALE
    }
}

/// Rust types that can be stored in a frame buffer.
///
/// The tag is resolved at compile time, so typed views never need a runtime
/// type check beyond comparing against the buffer's own [`DataType`].
pub trait Element: Copy + Send + Sync + 'static {
    const DATA_TYPE: DataType;

    fn from_fp32(v: f32) -> Self;
    fn to_fp32(self) -> f32;
}

impl Element for f32 {
    const DATA_TYPE: DataType = DataType::Fp32;

    fn from_fp32(v: f32) -> Self {
        v
    }

    fn to_fp32(self) -> f32 {
        self
    }
}

impl Element for bool {
    const DATA_TYPE: DataType = DataType::Bit;

    fn from_fp32(v: f32) -> Self {
        v > 0.5
    }

    fn to_fp32(self) -> f32 {
        if self { 1.0 } else { 0.0 }
    }
}

impl Element for u8 {
    const DATA_TYPE: DataType = DataType::Uint8;

    fn from_fp32(v: f32) -> Self {
        (v.clamp(0.0, 1.0) * 255.0).round() as u8
    }

    fn to_fp32(self) -> f32 {
        self as f32 / 255.0
    }
}

impl Element for Fixed16 {
    const DATA_TYPE: DataType = DataType::Fixed16;

    fn from_fp32(v: f32) -> Self {
        Fixed16::from_f32(v)
    }

    fn to_fp32(self) -> f32 {
        self.to_f32()
    }
}
