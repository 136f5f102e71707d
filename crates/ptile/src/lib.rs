//! PTILE: self-describing point tile format written by the tiler.
//!
//! - X/Y/Z stored as i32 steps: `value = stored * scale + offset` per axis.
//! - Any number of further dimensions, each stored in its own numeric kind.
//! - A point-format tag (6/7/8) telling readers which dimensions are standard.
//! - Optional bucket key (x, y, z, level) of the grid cell the tile came from.
//! - Optional deflate compression of the record payload.
//!
//! File layout (little-endian):
//!   00  : [u8;4]  magic = b"PTIL"
//!   04  : u32     version = 1
//!   08  : u32     flags (bitfield)
//!                 bit 0 => bucket key present (16 bytes)
//!                 bit 1 => record payload deflated
//!   0C  : u8      point format tag, [u8;3] reserved
//!   10  : u64     points_count
//!   18  : f64[3]  scale
//!   30  : f64[3]  offset
//!   48  : f64[3]  min
//!   60  : f64[3]  max
//!   78  : u16     dimension count
//!   ..  : per dimension: u8 name_len, name bytes, u8 kind code, u8 flags (bit 0 => extra)
//!   ..  : i32[4]  bucket key           (if bit0)
//!   ..  : u64     payload_len
//!   ..  : payload (points_count * record_size bytes, or deflate stream if bit1)

mod kind;

pub use kind::{DimKind, PointFormat, COORDINATE_NAMES};

use std::fs::File;
use std::io::{self, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

pub const PTILE_MAGIC: [u8; 4] = *b"PTIL";
pub const PTILE_VERSION: u32 = 1;

const FLAG_KEY: u32 = 1 << 0;
const FLAG_DEFLATE: u32 = 1 << 1;
const DIM_FLAG_EXTRA: u8 = 1 << 0;

/// One dimension of a tile's schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileDimension {
    pub name: String,
    pub kind: DimKind,
    /// Not part of the point format's standard set.
    pub extra: bool,
}

impl TileDimension {
    pub fn new(name: impl Into<String>, kind: DimKind, extra: bool) -> Self {
        Self {
            name: name.into(),
            kind,
            extra,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TileHeader {
    pub point_format: PointFormat,
    pub point_count: u64,
    pub scale: [f64; 3],
    pub offset: [f64; 3],
    pub min: [f64; 3],
    pub max: [f64; 3],
    pub key: Option<[i32; 4]>,
    pub dimensions: Vec<TileDimension>,
    pub compressed: bool,
    /// Stored payload length; filled in by the reader, ignored by the writer.
    pub payload_len: u64,
}

impl TileHeader {
    /// Bytes per record under this schema.
    pub fn record_size(&self) -> usize {
        self.dimensions.iter().map(|d| d.kind.size()).sum()
    }

    /// Byte offset of dimension `index` within a record.
    pub fn dimension_offset(&self, index: usize) -> usize {
        self.dimensions[..index].iter().map(|d| d.kind.size()).sum()
    }

    pub fn dimension_index(&self, name: &str) -> Option<usize> {
        self.dimensions
            .iter()
            .position(|d| d.name.eq_ignore_ascii_case(name))
    }

    fn check_coordinates(&self) -> io::Result<()> {
        for (axis, name) in COORDINATE_NAMES.iter().enumerate() {
            match self.dimensions.get(axis) {
                Some(dim) if dim.name == *name && dim.kind == DimKind::I32 => {}
                _ => return Err(bad("tile must start with X, Y, Z stored as int32")),
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    pub header: TileHeader,
    /// `point_count * record_size` bytes of packed, uncompressed records.
    pub records: Vec<u8>,
}

impl Tile {
    #[inline]
    pub fn point_count(&self) -> u64 {
        self.header.point_count
    }

    #[inline]
    pub fn record_size(&self) -> usize {
        self.header.record_size()
    }

    /// Value of dimension `dim` for point `point`; coordinates come back in world units.
    pub fn value(&self, point: usize, dim: usize) -> f64 {
        let size = self.record_size();
        let at = point * size + self.header.dimension_offset(dim);
        let raw = self.header.dimensions[dim].kind.read_f64(&self.records[at..]);

        if dim < 3 {
            raw * self.header.scale[dim] + self.header.offset[dim]
        } else {
            raw
        }
    }
}

#[inline(always)]
fn read_array<R: Read, const N: usize>(r: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)
        .map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => io::Error::new(ErrorKind::UnexpectedEof, "truncated PTILE"),
            _ => e,
        })?;
    Ok(buf)
}

#[inline(always)]
fn le_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    Ok(read_array::<R, 1>(r)?[0])
}

#[inline(always)]
fn le_u16<R: Read>(r: &mut R) -> io::Result<u16> {
    Ok(u16::from_le_bytes(read_array(r)?))
}

#[inline(always)]
fn le_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    Ok(u32::from_le_bytes(read_array(r)?))
}

#[inline(always)]
fn le_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    Ok(u64::from_le_bytes(read_array(r)?))
}

#[inline(always)]
fn le_i32<R: Read>(r: &mut R) -> io::Result<i32> {
    Ok(i32::from_le_bytes(read_array(r)?))
}

#[inline(always)]
fn le_f64x3<R: Read>(r: &mut R) -> io::Result<[f64; 3]> {
    Ok([
        f64::from_le_bytes(read_array(r)?),
        f64::from_le_bytes(read_array(r)?),
        f64::from_le_bytes(read_array(r)?),
    ])
}

#[cold]
fn bad(msg: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, msg)
}

/// Read a header, leaving `r` positioned at the start of the payload.
pub fn read_header<R: Read>(r: &mut R) -> io::Result<TileHeader> {
    if read_array::<R, 4>(r)? != PTILE_MAGIC {
        return Err(bad("bad PTILE magic"));
    }

    let version = le_u32(r)?;
    if version != PTILE_VERSION {
        return Err(bad("unsupported PTILE version"));
    }

    let flags = le_u32(r)?;
    let has_key = (flags & FLAG_KEY) != 0;
    let compressed = (flags & FLAG_DEFLATE) != 0;

    let format_code = le_u8(r)?;
    let point_format =
        PointFormat::from_code(format_code).ok_or_else(|| bad("unknown point format"))?;
    let _reserved = read_array::<R, 3>(r)?;

    let point_count = le_u64(r)?;
    let scale = le_f64x3(r)?;
    let offset = le_f64x3(r)?;
    let min = le_f64x3(r)?;
    let max = le_f64x3(r)?;

    if scale.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
        return Err(bad("scale must be finite and > 0"));
    }

    let dim_count = le_u16(r)? as usize;
    let mut dimensions = Vec::with_capacity(dim_count);

    for _ in 0..dim_count {
        let name_len = le_u8(r)? as usize;
        let mut name = vec![0u8; name_len];
        r.read_exact(&mut name)?;
        let name = String::from_utf8(name).map_err(|_| bad("dimension name is not UTF-8"))?;

        let kind = DimKind::from_code(le_u8(r)?).ok_or_else(|| bad("unknown dimension kind"))?;
        let dim_flags = le_u8(r)?;

        dimensions.push(TileDimension {
            name,
            kind,
            extra: (dim_flags & DIM_FLAG_EXTRA) != 0,
        });
    }

    let key = if has_key {
        Some([le_i32(r)?, le_i32(r)?, le_i32(r)?, le_i32(r)?])
    } else {
        None
    };

    let payload_len = le_u64(r)?;

    let header = TileHeader {
        point_format,
        point_count,
        scale,
        offset,
        min,
        max,
        key,
        dimensions,
        compressed,
        payload_len,
    };

    header.check_coordinates()?;

    Ok(header)
}

/// Turn a stored payload into packed records, checking the record count.
pub fn decode_payload(header: &TileHeader, payload: &[u8]) -> io::Result<Vec<u8>> {
    let expected = (header.point_count as usize)
        .checked_mul(header.record_size())
        .ok_or_else(|| bad("records size overflow"))?;

    let records = if header.compressed {
        miniz_oxide::inflate::decompress_to_vec(payload)
            .map_err(|e| bad(&format!("inflate failed: {:?}", e.status)))?
    } else {
        payload.to_vec()
    };

    if records.len() != expected {
        return Err(bad("record payload length != points * record size"));
    }

    Ok(records)
}

/// Parse a tile from a contiguous byte slice. This is the single source of truth for parsing.
pub fn parse_tile_bytes(mut p: &[u8]) -> io::Result<Tile> {
    let header = read_header(&mut p)?;

    let len = usize::try_from(header.payload_len).map_err(|_| bad("payload too large"))?;
    if p.len() < len {
        return Err(io::Error::new(ErrorKind::UnexpectedEof, "truncated PTILE"));
    }

    let records = decode_payload(&header, &p[..len])?;

    Ok(Tile { header, records })
}

/// Fast path: prefer mmap; fall back to a single read.
#[cfg(feature = "mmap")]
pub fn read_file<P: AsRef<Path>>(path: P) -> io::Result<Tile> {
    let file = File::open(path)?;
    let map = unsafe { memmap2::MmapOptions::new().map(&file)? };
    parse_tile_bytes(&map)
}

#[cfg(not(feature = "mmap"))]
pub fn read_file<P: AsRef<Path>>(path: P) -> io::Result<Tile> {
    let bytes = std::fs::read(path)?;
    parse_tile_bytes(&bytes)
}

pub fn write_file<P: AsRef<Path>>(path: P, tile: &Tile) -> io::Result<()> {
    let header = &tile.header;
    header.check_coordinates()?;

    let expected = (header.point_count as usize)
        .checked_mul(header.record_size())
        .ok_or_else(|| bad("records size overflow"))?;
    if tile.records.len() != expected {
        return Err(bad("records length != points * record size"));
    }

    if header.dimensions.len() > u16::MAX as usize {
        return Err(bad("too many dimensions"));
    }

    let mut flags = 0u32;

    if header.key.is_some() {
        flags |= FLAG_KEY;
    }

    if header.compressed {
        flags |= FLAG_DEFLATE;
    }

    let compressed;
    let payload: &[u8] = if header.compressed {
        compressed = miniz_oxide::deflate::compress_to_vec(&tile.records, 6);
        &compressed
    } else {
        &tile.records
    };

    let mut file = BufWriter::new(File::create(path)?);

    file.write_all(&PTILE_MAGIC)?;

    write_u32(&mut file, PTILE_VERSION)?;
    write_u32(&mut file, flags)?;

    file.write_all(&[header.point_format.code(), 0, 0, 0])?;
    write_u64(&mut file, header.point_count)?;

    write_f64x3(&mut file, &header.scale)?;
    write_f64x3(&mut file, &header.offset)?;
    write_f64x3(&mut file, &header.min)?;
    write_f64x3(&mut file, &header.max)?;

    write_u16(&mut file, header.dimensions.len() as u16)?;

    for dim in &header.dimensions {
        let name = dim.name.as_bytes();
        if name.is_empty() || name.len() > u8::MAX as usize {
            return Err(bad("dimension name must be 1..=255 bytes"));
        }

        file.write_all(&[name.len() as u8])?;
        file.write_all(name)?;
        file.write_all(&[dim.kind as u8])?;
        file.write_all(&[if dim.extra { DIM_FLAG_EXTRA } else { 0 }])?;
    }

    if let Some(key) = header.key {
        for v in key {
            write_i32(&mut file, v)?;
        }
    }

    write_u64(&mut file, payload.len() as u64)?;
    file.write_all(payload)?;

    file.flush()?;

    Ok(())
}

#[inline]
fn write_u16<W: Write>(w: &mut W, v: u16) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

#[inline]
fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

#[inline]
fn write_u64<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

#[inline]
fn write_i32<W: Write>(w: &mut W, v: i32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

#[inline]
fn write_f64x3<W: Write>(w: &mut W, v: &[f64; 3]) -> io::Result<()> {
    for x in v {
        w.write_all(&x.to_le_bytes())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tile(compressed: bool) -> Tile {
        let dimensions = vec![
            TileDimension::new("X", DimKind::I32, false),
            TileDimension::new("Y", DimKind::I32, false),
            TileDimension::new("Z", DimKind::I32, false),
            TileDimension::new("Intensity", DimKind::U16, false),
            TileDimension::new("Reflectance", DimKind::F64, true),
        ];

        let mut records = Vec::new();
        for i in 0..4i32 {
            records.extend_from_slice(&(i * 1000).to_le_bytes());
            records.extend_from_slice(&(-i).to_le_bytes());
            records.extend_from_slice(&7i32.to_le_bytes());
            records.extend_from_slice(&(i as u16 * 10).to_le_bytes());
            records.extend_from_slice(&(i as f64 * 0.25).to_le_bytes());
        }

        Tile {
            header: TileHeader {
                point_format: PointFormat::Base,
                point_count: 4,
                scale: [0.01, 0.01, 0.001],
                offset: [100.0, 200.0, 0.0],
                min: [100.0, 199.97, 0.007],
                max: [130.0, 200.0, 0.007],
                key: Some([1, 0, 2, 3]),
                dimensions,
                compressed,
                payload_len: 0,
            },
            records,
        }
    }

    #[test]
    fn writes_and_reads_back_a_tile() -> io::Result<()> {
        for compressed in [false, true] {
            let dir = tempfile::tempdir()?;
            let path = dir.path().join("t.ptile");
            let tile = sample_tile(compressed);

            write_file(&path, &tile)?;
            let back = read_file(&path)?;

            assert_eq!(back.records, tile.records);
            assert_eq!(back.header.dimensions, tile.header.dimensions);
            assert_eq!(back.header.key, Some([1, 0, 2, 3]));
            assert_eq!(back.header.compressed, compressed);
            assert_eq!(back.point_count(), 4);

            assert!((back.value(3, 0) - 130.0).abs() < 1e-9);
            assert!((back.value(2, 1) - 199.98).abs() < 1e-9);
            assert_eq!(back.value(2, 3), 20.0);
            assert_eq!(back.value(1, 4), 0.25);
        }

        Ok(())
    }

    #[test]
    fn header_is_readable_without_payload() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("t.ptile");
        write_file(&path, &sample_tile(false))?;

        let bytes = std::fs::read(&path)?;
        let mut p = &bytes[..];
        let header = read_header(&mut p)?;

        assert_eq!(header.record_size(), 12 + 2 + 8);
        assert_eq!(header.payload_len as usize, p.len());
        assert_eq!(header.dimension_index("reflectance"), Some(4));
        assert_eq!(header.dimension_offset(4), 14);

        Ok(())
    }

    #[test]
    fn rejects_bad_input() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("t.ptile");

        let mut short = sample_tile(false);
        short.records.pop();
        assert_eq!(
            write_file(&path, &short).unwrap_err().kind(),
            ErrorKind::InvalidData
        );

        let mut no_xyz = sample_tile(false);
        no_xyz.header.dimensions.swap(0, 3);
        assert!(write_file(&path, &no_xyz).is_err());

        write_file(&path, &sample_tile(false))?;
        let bytes = std::fs::read(&path)?;

        assert_eq!(
            parse_tile_bytes(&bytes[..bytes.len() - 1]).unwrap_err().kind(),
            ErrorKind::UnexpectedEof
        );

        let mut wrong_magic = bytes.clone();
        wrong_magic[0] = b'X';
        assert_eq!(
            parse_tile_bytes(&wrong_magic).unwrap_err().kind(),
            ErrorKind::InvalidData
        );

        Ok(())
    }
}
