//! Fixtures shared by the unit tests.

use std::path::Path;

use ptile::{DimKind, PointFormat, Tile, TileDimension, TileHeader};

use crate::error::{Error, Result};

/// Quantum of source coordinates. A power of two keeps integer coordinates exact.
pub const SOURCE_SCALE: f64 = 1.0 / 1024.0;

/// `n` points stepping diagonally from `origin` in x (by `step`) and y (by `step / 2`).
pub fn grid_points(n: usize, origin: [f64; 3], step: f64) -> Vec<[f64; 3]> {
    (0..n)
        .map(|i| {
            let t = i as f64 * step;
            [origin[0] + t, origin[1] + t / 2.0, origin[2]]
        })
        .collect()
}

/// Write `points` as a ptile source. Each extra dimension needs one value per point.
pub fn write_source(
    path: &Path,
    points: &[[f64; 3]],
    extras: &[(&str, &[f64])],
    compressed: bool,
) -> Result<()> {
    let mut dimensions = vec![
        TileDimension::new("X", DimKind::I32, false),
        TileDimension::new("Y", DimKind::I32, false),
        TileDimension::new("Z", DimKind::I32, false),
    ];

    let standard = PointFormat::RgbNir.standard_dimensions();
    for (name, values) in extras {
        assert_eq!(values.len(), points.len(), "one value per point for {name}");
        let kind = standard
            .iter()
            .find(|(s, _)| s.eq_ignore_ascii_case(name))
            .map(|(_, k)| *k)
            .unwrap_or(DimKind::F64);
        let extra = !PointFormat::Base.is_standard(name);
        dimensions.push(TileDimension::new(*name, kind, extra));
    }

    let mut min = [f64::INFINITY; 3];
    let mut max = [f64::NEG_INFINITY; 3];
    let record_size: usize = dimensions.iter().map(|d| d.kind.size()).sum();
    let mut records = vec![0u8; points.len() * record_size];

    for (i, p) in points.iter().enumerate() {
        let record = &mut records[i * record_size..(i + 1) * record_size];
        let mut at = 0;
        for axis in 0..3 {
            min[axis] = min[axis].min(p[axis]);
            max[axis] = max[axis].max(p[axis]);
            DimKind::I32.write_f64(p[axis] / SOURCE_SCALE, &mut record[at..]);
            at += 4;
        }
        for (dim, (_, values)) in dimensions[3..].iter().zip(extras) {
            dim.kind.write_f64(values[i], &mut record[at..]);
            at += dim.kind.size();
        }
    }

    if points.is_empty() {
        min = [0.0; 3];
        max = [0.0; 3];
    }

    let tile = Tile {
        header: TileHeader {
            point_format: PointFormat::Base,
            point_count: points.len() as u64,
            scale: [SOURCE_SCALE; 3],
            offset: [0.0; 3],
            min,
            max,
            key: None,
            dimensions,
            compressed,
            payload_len: 0,
        },
        records,
    };

    ptile::write_file(path, &tile).map_err(|e| Error::io(format!("write {}", path.display()), e))
}
