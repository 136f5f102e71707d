//! Numeric kinds of tile dimensions and the point-format tags that group them.

/// Storage kind of one dimension. The discriminant is the on-disk code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum DimKind {
    I8 = 1,
    I16 = 2,
    I32 = 3,
    I64 = 4,
    U8 = 11,
    U16 = 12,
    U32 = 13,
    U64 = 14,
    F32 = 21,
    F64 = 22,
}

impl DimKind {
    pub fn from_code(code: u8) -> Option<Self> {
        let kind = match code {
            1 => DimKind::I8,
            2 => DimKind::I16,
            3 => DimKind::I32,
            4 => DimKind::I64,
            11 => DimKind::U8,
            12 => DimKind::U16,
            13 => DimKind::U32,
            14 => DimKind::U64,
            21 => DimKind::F32,
            22 => DimKind::F64,
            _ => return None,
        };

        Some(kind)
    }

    /// Size in bytes of one stored value.
    #[inline]
    pub fn size(self) -> usize {
        match self {
            DimKind::I8 | DimKind::U8 => 1,
            DimKind::I16 | DimKind::U16 => 2,
            DimKind::I32 | DimKind::U32 | DimKind::F32 => 4,
            DimKind::I64 | DimKind::U64 | DimKind::F64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DimKind::I8 => "int8",
            DimKind::I16 => "int16",
            DimKind::I32 => "int32",
            DimKind::I64 => "int64",
            DimKind::U8 => "uint8",
            DimKind::U16 => "uint16",
            DimKind::U32 => "uint32",
            DimKind::U64 => "uint64",
            DimKind::F32 => "float",
            DimKind::F64 => "double",
        }
    }

    /// Decode a little-endian value from the first `size()` bytes of `b`.
    #[inline]
    pub fn read_f64(self, b: &[u8]) -> f64 {
        match self {
            DimKind::I8 => b[0] as i8 as f64,
            DimKind::U8 => b[0] as f64,
            DimKind::I16 => i16::from_le_bytes([b[0], b[1]]) as f64,
            DimKind::U16 => u16::from_le_bytes([b[0], b[1]]) as f64,
            DimKind::I32 => i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            DimKind::U32 => u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            DimKind::F32 => f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            DimKind::I64 => {
                i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f64
            }
            DimKind::U64 => {
                u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f64
            }
            DimKind::F64 => {
                f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
            }
        }
    }

    /// Encode `value` into the first `size()` bytes of `out`.
    ///
    /// Integer kinds round to nearest and saturate at the kind's range; NaN stores as 0.
    #[inline]
    pub fn write_f64(self, value: f64, out: &mut [u8]) {
        match self {
            DimKind::I8 => out[0] = (value.round() as i8) as u8,
            DimKind::U8 => out[0] = value.round() as u8,
            DimKind::I16 => out[..2].copy_from_slice(&(value.round() as i16).to_le_bytes()),
            DimKind::U16 => out[..2].copy_from_slice(&(value.round() as u16).to_le_bytes()),
            DimKind::I32 => out[..4].copy_from_slice(&(value.round() as i32).to_le_bytes()),
            DimKind::U32 => out[..4].copy_from_slice(&(value.round() as u32).to_le_bytes()),
            DimKind::F32 => out[..4].copy_from_slice(&(value as f32).to_le_bytes()),
            DimKind::I64 => out[..8].copy_from_slice(&(value.round() as i64).to_le_bytes()),
            DimKind::U64 => out[..8].copy_from_slice(&(value.round() as u64).to_le_bytes()),
            DimKind::F64 => out[..8].copy_from_slice(&value.to_le_bytes()),
        }
    }
}

impl std::fmt::Display for DimKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Names of the three coordinate dimensions. Every tile starts with these, stored as
/// scaled `i32`.
pub const COORDINATE_NAMES: [&str; 3] = ["X", "Y", "Z"];

const BASE_DIMENSIONS: &[(&str, DimKind)] = &[
    ("X", DimKind::I32),
    ("Y", DimKind::I32),
    ("Z", DimKind::I32),
    ("Intensity", DimKind::U16),
    ("ReturnNumber", DimKind::U8),
    ("NumberOfReturns", DimKind::U8),
    ("Synthetic", DimKind::U8),
    ("KeyPoint", DimKind::U8),
    ("Withheld", DimKind::U8),
    ("Overlap", DimKind::U8),
    ("ScanChannel", DimKind::U8),
    ("ScanDirectionFlag", DimKind::U8),
    ("EdgeOfFlightLine", DimKind::U8),
    ("Classification", DimKind::U8),
    ("UserData", DimKind::U8),
    ("ScanAngleRank", DimKind::F32),
    ("PointSourceId", DimKind::U16),
    ("GpsTime", DimKind::F64),
];

const RGB_DIMENSIONS: &[(&str, DimKind)] = &[
    ("Red", DimKind::U16),
    ("Green", DimKind::U16),
    ("Blue", DimKind::U16),
];

const NIR_DIMENSIONS: &[(&str, DimKind)] = &[("Infrared", DimKind::U16)];

/// Point-format tag of a tile. Decides which dimensions are standard and which are extra.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PointFormat {
    /// Coordinates, returns, classification, time.
    Base = 6,
    /// `Base` plus Red/Green/Blue.
    Rgb = 7,
    /// `Rgb` plus near infrared.
    RgbNir = 8,
}

impl PointFormat {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            6 => Some(PointFormat::Base),
            7 => Some(PointFormat::Rgb),
            8 => Some(PointFormat::RgbNir),
            _ => None,
        }
    }

    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Standard dimensions of this tag in storage order.
    pub fn standard_dimensions(self) -> Vec<(&'static str, DimKind)> {
        let mut dims = BASE_DIMENSIONS.to_vec();

        if matches!(self, PointFormat::Rgb | PointFormat::RgbNir) {
            dims.extend_from_slice(RGB_DIMENSIONS);
        }

        if self == PointFormat::RgbNir {
            dims.extend_from_slice(NIR_DIMENSIONS);
        }

        dims
    }

    pub fn is_standard(self, name: &str) -> bool {
        self.standard_dimensions()
            .iter()
            .any(|(standard, _)| standard.eq_ignore_ascii_case(name))
    }
}
