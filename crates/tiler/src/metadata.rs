//! `tiling.json`: summary of a finished run for read-side tooling.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{IoContext, Result};
use crate::grid::{Bounds3, SpatialGrid};
use crate::layout::Layout;
use crate::materializer::{derive_offset, derive_scale, TileSummary};

pub const METADATA_FILE: &str = "tiling.json";
pub const METADATA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub size: usize,
    pub extra: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridEntry {
    pub origin: [f64; 3],
    pub cell_size: [f64; 3],
    pub cells: [i32; 3],
    pub level: u32,
    pub cubic: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileEntry {
    /// `level-x-y-z`
    pub name: String,
    /// x, y, z, level
    pub key: [i32; 4],
    pub file: String,
    pub points: u64,
    pub bounds: Bounds3,
    pub scale: [f64; 3],
    pub offset: [f64; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub version: u32,
    pub points: u64,
    pub point_format: u8,
    pub bounds: Bounds3,
    pub processing_bounds: Bounds3,
    pub scale: [f64; 3],
    pub offset: [f64; 3],
    pub dimensions: Vec<DimensionEntry>,
    pub grid: GridEntry,
    pub tiles: Vec<TileEntry>,
}

/// Median of each axis over `offsets`.
pub fn median_offset(offsets: &[[f64; 3]]) -> Option<[f64; 3]> {
    if offsets.is_empty() {
        return None;
    }

    let mut median = [0.0; 3];
    for (axis, out) in median.iter_mut().enumerate() {
        let mut values: Vec<f64> = offsets.iter().map(|o| o[axis]).collect();
        values.sort_by(f64::total_cmp);
        *out = values[values.len() / 2];
    }

    Some(median)
}

impl RunMetadata {
    /// Global scale follows the tile rules over the conforming bounds; the offset is the
    /// median source offset when sources declared one.
    pub fn new(
        grid: &SpatialGrid,
        layout: &Layout,
        scale: Option<[f64; 3]>,
        min_scale: f64,
        source_offsets: &[[f64; 3]],
        tiles: &[TileSummary],
    ) -> Self {
        let bounds = grid.conforming_bounds();
        let extent = bounds.extent();
        let median = median_offset(source_offsets);

        let mut global_scale = [0.0; 3];
        let mut global_offset = [0.0; 3];
        for axis in 0..3 {
            global_scale[axis] = match scale {
                Some(s) => s[axis],
                None => derive_scale(extent[axis], min_scale),
            };
            global_offset[axis] = match median {
                Some(m) => m[axis],
                None => derive_offset(bounds.min[axis], extent[axis], global_scale[axis]),
            };
        }

        // What was tiled, not what the headers announced.
        let points: u64 = tiles.iter().map(|t| t.point_count).sum();

        let format = layout.point_format();
        let dimensions = layout
            .fields()
            .iter()
            .map(|f| DimensionEntry {
                name: f.name.clone(),
                kind: f.kind.name().to_string(),
                size: f.kind.size(),
                extra: !format.is_standard(&f.name),
            })
            .collect();

        let tiles = tiles
            .iter()
            .map(|t| TileEntry {
                name: t.key.to_string(),
                key: t.key.to_array(),
                file: t.file_name(),
                points: t.point_count,
                bounds: t.bounds,
                scale: t.scale,
                offset: t.offset,
            })
            .collect();

        Self {
            version: METADATA_VERSION,
            points,
            point_format: format.code(),
            bounds,
            processing_bounds: grid.processing_bounds(),
            scale: global_scale,
            offset: global_offset,
            dimensions,
            grid: GridEntry {
                origin: grid.origin(),
                cell_size: grid.cell_size(),
                cells: grid.cells(),
                level: grid.level(),
                cubic: grid.cubic(),
            },
            tiles,
        }
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        let path = dir.join(METADATA_FILE);
        let file = File::create(&path).io_context(|| format!("create {}", path.display()))?;
        let mut out = BufWriter::new(file);

        serde_json::to_writer_pretty(&mut out, self)
            .map_err(std::io::Error::from)
            .io_context(|| format!("write {}", path.display()))?;
        out.flush().io_context(|| format!("flush {}", path.display()))
    }

    pub fn read(dir: &Path) -> Result<Self> {
        let path = dir.join(METADATA_FILE);
        let file = File::open(&path).io_context(|| format!("open {}", path.display()))?;

        serde_json::from_reader(BufReader::new(file))
            .map_err(std::io::Error::from)
            .io_context(|| format!("parse {}", path.display()))
    }
}
