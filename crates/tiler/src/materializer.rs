//! Turns one bucket file into a finished ptile.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use ptile::{PointFormat, Tile, TileDimension, TileHeader};

use crate::bucket_writer::BucketFile;
use crate::error::{Error, Result};
use crate::grid::Bounds3;
use crate::key::BucketKey;
use crate::layout::Layout;

/// Largest step count the derived scale allows across an axis. Leaves headroom under `i32::MAX`.
const MAX_STEPS: f64 = 2e9;

/// Smallest power of ten that keeps `range` within `MAX_STEPS` steps, floored at `min_scale`.
pub fn derive_scale(range: f64, min_scale: f64) -> f64 {
    let exp = (range / MAX_STEPS).log10().ceil();
    let scale = 10f64.powf(exp);

    if scale.is_finite() && scale > min_scale {
        scale
    } else {
        min_scale
    }
}

/// Offset a whole number of `scale` steps above `min`, near the middle of the range.
pub fn derive_offset(min: f64, range: f64, scale: f64) -> f64 {
    min + ((range / scale) / 2.0).trunc() * scale
}

#[derive(Debug, Clone)]
pub struct TileSettings {
    pub output_dir: PathBuf,
    /// Configured scale. Used as is.
    pub scale: Option<[f64; 3]>,
    /// Scale declared by the sources. Replaced per axis when a tile would overflow with it.
    pub external_scale: Option<[f64; 3]>,
    pub min_scale: f64,
    pub sort_by_time: bool,
    pub compress: bool,
    pub keep_scratch: bool,
}

/// What one materialized tile holds.
#[derive(Debug, Clone, PartialEq)]
pub struct TileSummary {
    pub key: BucketKey,
    pub path: PathBuf,
    pub point_count: u64,
    pub point_format: PointFormat,
    pub bounds: Bounds3,
    pub scale: [f64; 3],
    pub offset: [f64; 3],
}

impl TileSummary {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

pub fn tile_path(dir: &Path, key: BucketKey) -> PathBuf {
    dir.join(format!("{key}.ptile"))
}

pub struct TileMaterializer {
    layout: Arc<Layout>,
    settings: Arc<TileSettings>,
}

impl TileMaterializer {
    pub fn new(layout: Arc<Layout>, settings: Arc<TileSettings>) -> Self {
        Self { layout, settings }
    }

    pub fn materialize(&self, bucket: &BucketFile) -> Result<TileSummary> {
        let key = bucket.key;
        let layout = &*self.layout;
        let settings = &*self.settings;
        let point_size = layout.point_size();

        let bytes = std::fs::read(&bucket.path)
            .map_err(|e| Error::materialize(key, format!("read {}: {e}", bucket.path.display())))?;

        if bytes.len() % point_size != 0 {
            return Err(Error::materialize(
                key,
                format!(
                    "{} bytes is not a whole number of {point_size}-byte records",
                    bytes.len()
                ),
            ));
        }

        let count = bytes.len() / point_size;
        if count as u64 != bucket.points {
            warn!(
                "tile {key}: writer counted {} points, bucket holds {count}",
                bucket.points
            );
        }

        let mut bounds = Bounds3::empty();
        for record in bytes.chunks_exact(point_size) {
            bounds.grow_point(layout.xyz(record));
        }
        if count == 0 {
            bounds = Bounds3::new([0.0; 3], [0.0; 3]);
        }

        let extent = bounds.extent();
        let mut scale = [0.0; 3];
        let mut offset = [0.0; 3];

        for axis in 0..3 {
            scale[axis] = self.axis_scale(key, axis, extent[axis]);
            offset[axis] = derive_offset(bounds.min[axis], extent[axis], scale[axis]);
        }

        let order = self.record_order(&bytes, count);

        let point_format = layout.point_format();
        let (dimensions, sources) = self.output_dimensions(point_format);
        let record_size: usize = dimensions.iter().map(|d| d.kind.size()).sum();
        let mut records = vec![0u8; count * record_size];

        for (out, &index) in records.chunks_exact_mut(record_size).zip(&order) {
            let record = &bytes[index * point_size..(index + 1) * point_size];
            let mut at = 0;

            for (i, (dim, source)) in dimensions.iter().zip(&sources).enumerate() {
                if i < 3 {
                    let steps = ((layout.read(record, i) - offset[i]) / scale[i]).round();
                    if !(steps >= i32::MIN as f64 && steps <= i32::MAX as f64) {
                        return Err(Error::materialize(
                            key,
                            format!("{} does not fit in int32 at scale {}", dim.name, scale[i]),
                        ));
                    }
                    out[at..at + 4].copy_from_slice(&(steps as i32).to_le_bytes());
                } else if let Some(field) = source {
                    dim.kind.write_f64(layout.read(record, *field), &mut out[at..]);
                }
                at += dim.kind.size();
            }
        }

        let path = tile_path(&settings.output_dir, key);
        let tile = Tile {
            header: TileHeader {
                point_format,
                point_count: count as u64,
                scale,
                offset,
                min: bounds.min,
                max: bounds.max,
                key: Some(key.to_array()),
                dimensions,
                compressed: settings.compress,
                payload_len: 0,
            },
            records,
        };

        ptile::write_file(&path, &tile)
            .map_err(|e| Error::materialize(key, format!("write {}: {e}", path.display())))?;

        if !settings.keep_scratch {
            std::fs::remove_file(&bucket.path).map_err(|e| {
                Error::materialize(key, format!("remove {}: {e}", bucket.path.display()))
            })?;
        }

        info!(
            "OK tile {key} -> {} ({count} pts, scale {:?})",
            path.display(),
            scale
        );

        Ok(TileSummary {
            key,
            path,
            point_count: count as u64,
            point_format,
            bounds,
            scale,
            offset,
        })
    }

    fn axis_scale(&self, key: BucketKey, axis: usize, range: f64) -> f64 {
        let settings = &*self.settings;

        if let Some(scale) = settings.scale {
            return scale[axis];
        }

        let derived = derive_scale(range, settings.min_scale);
        match settings.external_scale {
            Some(external) if external[axis] > 0.0 => {
                if range / external[axis] < MAX_STEPS {
                    external[axis]
                } else {
                    warn!(
                        "tile {key}: source scale {} overflows int32 over a {range} range, using {derived}",
                        external[axis]
                    );
                    derived
                }
            }
            _ => derived,
        }
    }

    /// Record indices in output order: by GpsTime when asked for and present, else as stored.
    fn record_order(&self, bytes: &[u8], count: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..count).collect();

        if !self.settings.sort_by_time {
            return order;
        }

        if let Some(time) = self.layout.index_of("GpsTime") {
            let size = self.layout.point_size();
            let times: Vec<f64> = bytes
                .chunks_exact(size)
                .map(|r| self.layout.read(r, time))
                .collect();
            order.sort_by(|a, b| times[*a].total_cmp(&times[*b]));
        }

        order
    }

    /// The format's standard dimensions then the layout's extras, each with its layout field.
    fn output_dimensions(&self, format: PointFormat) -> (Vec<TileDimension>, Vec<Option<usize>>) {
        let layout = &*self.layout;
        let mut dims = Vec::new();
        let mut sources = Vec::new();

        for (name, kind) in format.standard_dimensions() {
            dims.push(TileDimension::new(name, kind, false));
            sources.push(layout.index_of(name));
        }

        for (index, field) in layout.fields().iter().enumerate() {
            if !format.is_standard(&field.name) {
                dims.push(TileDimension::new(field.name.clone(), field.kind, true));
                sources.push(Some(index));
            }
        }

        debug!(
            "output schema: {}",
            dims.iter()
                .map(|d| format!("{}:{}", d.name, d.kind))
                .collect::<Vec<_>>()
                .join(",")
        );

        (dims, sources)
    }
}
