use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use ::las::point::{Format, ScanDirection};
use ::las::{Point, Reader};

use super::{PointSource, SourcePreview};
use crate::error::{Error, Result};
use crate::grid::Bounds3;

const ALWAYS: [&str; 16] = [
    "X",
    "Y",
    "Z",
    "Intensity",
    "ReturnNumber",
    "NumberOfReturns",
    "ScanDirectionFlag",
    "EdgeOfFlightLine",
    "Classification",
    "Synthetic",
    "KeyPoint",
    "Withheld",
    "Overlap",
    "ScanAngleRank",
    "UserData",
    "PointSourceId",
];

/// Optional attribute groups carried by a LAS point format.
#[derive(Debug, Clone, Copy)]
struct Groups {
    scan_channel: bool,
    gps_time: bool,
    color: bool,
    nir: bool,
}

impl Groups {
    fn of(format: &Format) -> Self {
        Self {
            scan_channel: format.is_extended,
            gps_time: format.has_gps_time,
            color: format.has_color,
            nir: format.has_nir,
        }
    }

    fn dimensions(self) -> Vec<String> {
        let mut dims: Vec<String> = ALWAYS.iter().map(|d| d.to_string()).collect();
        if self.scan_channel {
            dims.push("ScanChannel".into());
        }
        if self.gps_time {
            dims.push("GpsTime".into());
        }
        if self.color {
            dims.extend(["Red", "Green", "Blue"].map(String::from));
        }
        if self.nir {
            dims.push("Infrared".into());
        }
        dims
    }

    /// Flatten `point` into `values` in `dimensions()` order.
    fn fill(self, point: &Point, values: &mut Vec<f64>) {
        values.clear();
        values.extend_from_slice(&[
            point.x,
            point.y,
            point.z,
            point.intensity as f64,
            point.return_number as f64,
            point.number_of_returns as f64,
            (point.scan_direction == ScanDirection::LeftToRight) as u8 as f64,
            point.is_edge_of_flight_line as u8 as f64,
            u8::from(point.classification) as f64,
            point.is_synthetic as u8 as f64,
            point.is_key_point as u8 as f64,
            point.is_withheld as u8 as f64,
            point.is_overlap as u8 as f64,
            point.scan_angle as f64,
            point.user_data as f64,
            point.point_source_id as f64,
        ]);

        if self.scan_channel {
            values.push(point.scanner_channel as f64);
        }
        if self.gps_time {
            values.push(point.gps_time.unwrap_or(0.0));
        }
        if self.color {
            let (r, g, b) = point
                .color
                .map(|c| (c.red, c.green, c.blue))
                .unwrap_or_default();
            values.extend_from_slice(&[r as f64, g as f64, b as f64]);
        }
        if self.nir {
            values.push(point.nir.unwrap_or(0) as f64);
        }
    }
}

/// LAS/LAZ reader backed by the `las` crate.
pub struct LasSource {
    path: PathBuf,
    reader: Reader,
    groups: Groups,
}

impl LasSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::decode(path, e))?;
        let reader = Reader::new(BufReader::new(file)).map_err(|e| Error::decode(path, e))?;
        let groups = Groups::of(reader.header().point_format());

        Ok(Self {
            path: path.to_path_buf(),
            reader,
            groups,
        })
    }
}

impl PointSource for LasSource {
    fn preview(&mut self) -> Result<SourcePreview> {
        let header = self.reader.header();
        let bounds = header.bounds();
        let transforms = header.transforms();

        Ok(SourcePreview {
            point_count: header.number_of_points(),
            bounds: Bounds3::new(
                [bounds.min.x, bounds.min.y, bounds.min.z],
                [bounds.max.x, bounds.max.y, bounds.max.z],
            ),
            dimensions: self.groups.dimensions(),
            scale: Some([
                transforms.x.scale,
                transforms.y.scale,
                transforms.z.scale,
            ]),
            offset: Some([
                transforms.x.offset,
                transforms.y.offset,
                transforms.z.offset,
            ]),
            seekable: true,
        })
    }

    fn stream(
        &mut self,
        start: u64,
        limit: u64,
        visit: &mut dyn FnMut(&[f64]) -> Result<()>,
    ) -> Result<u64> {
        // Always seek: an earlier call may have left the reader anywhere.
        self.reader
            .seek(start)
            .map_err(|e| Error::decode(&self.path, e))?;

        let groups = self.groups;
        let mut values = Vec::with_capacity(groups.dimensions().len());
        let mut visited = 0u64;

        for point in self.reader.points() {
            if visited == limit {
                break;
            }

            let point = point.map_err(|e| Error::decode(&self.path, e))?;
            groups.fill(&point, &mut values);
            visit(values.as_slice())?;
            visited += 1;
        }

        Ok(visited)
    }
}
