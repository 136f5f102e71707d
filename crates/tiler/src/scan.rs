//! Sequential preview of every source before any parallel work starts.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::TilerConfig;
use crate::error::{Error, Result};
use crate::grid::{Bounds3, SpatialGrid};
use crate::source::{open_source, SourceFormat};

/// One unit of partition work: a whole source file or a chunk of one.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDescriptor {
    pub path: PathBuf,
    pub format: SourceFormat,
    /// Points in this descriptor (the chunk length for chunks).
    pub point_count: u64,
    pub bounds: Bounds3,
    /// Dimensions of this source that survive the filter.
    pub dimensions: Vec<String>,
    /// First point of the chunk.
    pub start: u64,
    /// Points in the whole file.
    pub file_points: u64,
}

impl SourceDescriptor {
    #[inline]
    pub fn is_chunk(&self) -> bool {
        self.point_count != self.file_points
    }

    /// `path` or `path[start..end]` for chunks.
    pub fn label(&self) -> String {
        if self.is_chunk() {
            format!(
                "{}[{}..{}]",
                self.path.display(),
                self.start,
                self.start + self.point_count
            )
        } else {
            self.path.display().to_string()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanResult {
    pub descriptors: Vec<SourceDescriptor>,
    pub grid: SpatialGrid,
    /// Union input for the layout: every retained name of every source.
    pub dimension_names: Vec<String>,
    /// Per-axis max of the scales sources declared.
    pub external_scale: Option<[f64; 3]>,
    /// Offsets sources declared, one entry per file.
    pub source_offsets: Vec<[f64; 3]>,
    pub total_points: u64,
    pub file_count: usize,
}

/// Files named by `inputs`. Directories contribute the recognised files directly inside them.
pub fn expand_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for input in inputs {
        if !input.is_dir() {
            files.push(input.clone());
            continue;
        }

        for entry in WalkDir::new(input)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| Error::scan(input, e))?;
            if entry.file_type().is_file() && SourceFormat::sniff(entry.path()).is_some() {
                files.push(entry.into_path());
            }
        }
    }

    Ok(files)
}

/// Keep a source dimension when the filter names it, case-insensitively, or it is X/Y/Z.
fn retained(filter: Option<&HashSet<String>>, name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    match filter {
        None => true,
        Some(keep) => matches!(upper.as_str(), "X" | "Y" | "Z") || keep.contains(&upper),
    }
}

/// Scan errors keep the path of the file that failed.
fn as_scan_error(path: &Path, err: Error) -> Error {
    match err {
        Error::Scan { .. } => err,
        Error::Decode { path, message } => Error::Scan { path, message },
        other => Error::scan(path, other),
    }
}

pub fn scan(config: &TilerConfig) -> Result<ScanResult> {
    let files = expand_inputs(&config.inputs)?;
    if files.is_empty() {
        return Err(Error::Config("no point cloud files found in the inputs".into()));
    }

    let filter: Option<HashSet<String>> = config
        .dimensions
        .as_ref()
        .map(|names| names.iter().map(|n| n.to_ascii_uppercase()).collect());

    let mut grid = SpatialGrid::new(config.sizing, config.cubic);
    if let Some(level) = config.level {
        grid.set_level(level);
    }

    let mut descriptors = Vec::new();
    let mut dimension_names = Vec::new();
    let mut external_scale: Option<[f64; 3]> = None;
    let mut source_offsets = Vec::new();
    let mut total_points = 0;

    for path in &files {
        let format = SourceFormat::sniff(path)
            .ok_or_else(|| Error::scan(path, "can't infer reader from file extension"))?;
        let mut source = open_source(path).map_err(|e| as_scan_error(path, e))?;
        let preview = source.preview().map_err(|e| as_scan_error(path, e))?;

        debug!(
            "scan {}: {} points, {} dims, bounds {:?}..{:?}",
            path.display(),
            preview.point_count,
            preview.dimensions.len(),
            preview.bounds.min,
            preview.bounds.max
        );

        if preview.point_count == 0 {
            warn!("{} holds no points, skipping", path.display());
            continue;
        }

        let dimensions: Vec<String> = preview
            .dimensions
            .iter()
            .filter(|d| retained(filter.as_ref(), d))
            .cloned()
            .collect();
        dimension_names.extend(dimensions.iter().cloned());

        if let Some(scale) = preview.scale.filter(|s| s.iter().all(|v| *v > 0.0)) {
            let merged = external_scale.get_or_insert([0.0; 3]);
            for i in 0..3 {
                merged[i] = merged[i].max(scale[i]);
            }
        }
        if let Some(offset) = preview.offset {
            source_offsets.push(offset);
        }

        grid.expand(&preview.bounds, preview.point_count);
        total_points += preview.point_count;

        let whole = SourceDescriptor {
            path: path.clone(),
            format,
            point_count: preview.point_count,
            bounds: preview.bounds,
            dimensions,
            start: 0,
            file_points: preview.point_count,
        };

        if preview.seekable && preview.point_count >= config.chunk_points {
            let mut start = 0;
            while start < preview.point_count {
                let count = config.chunk_points.min(preview.point_count - start);
                descriptors.push(SourceDescriptor {
                    start,
                    point_count: count,
                    ..whole.clone()
                });
                start += count;
            }
        } else {
            descriptors.push(whole);
        }
    }

    // Largest first so the long jobs start early; stable for equal sizes.
    descriptors.sort_by(|a, b| b.point_count.cmp(&a.point_count));

    if let Some(limit) = config.file_limit {
        descriptors.truncate(limit);
    }

    info!(
        "Scanned {} files: {} points in {} jobs, grid level {} cells {:?}",
        files.len(),
        total_points,
        descriptors.len(),
        grid.level(),
        grid.cells()
    );

    Ok(ScanResult {
        descriptors,
        grid,
        dimension_names,
        external_scale,
        source_offsets,
        total_points,
        file_count: files.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{grid_points, write_source};

    fn config(inputs: Vec<PathBuf>) -> TilerConfig {
        TilerConfig {
            inputs,
            ..TilerConfig::default()
        }
    }

    #[test]
    fn expands_directories_and_chunks_large_files() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| Error::io("tempdir", e))?;
        let points = grid_points(10, [0.0; 3], 0.1);

        write_source(&dir.path().join("b.ptile"), &points, &[], false)?;
        write_source(&dir.path().join("a.ptile"), &points[..3], &[], false)?;
        write_source(&dir.path().join("c.ptile"), &points, &[], true)?;
        std::fs::write(dir.path().join("notes.txt"), b"not a cloud")
            .map_err(|e| Error::io("notes", e))?;

        let found = expand_inputs(&[dir.path().to_path_buf()])?;
        let names: Vec<_> = found
            .iter()
            .filter_map(|p| p.file_name()?.to_str())
            .collect();
        assert_eq!(names, ["a.ptile", "b.ptile", "c.ptile"]);

        let scanned = scan(&TilerConfig {
            chunk_points: 4,
            ..config(vec![dir.path().to_path_buf()])
        })?;

        assert_eq!(scanned.total_points, 23);
        assert_eq!(scanned.file_count, 3);

        // c is deflated so it stays whole; b splits into 4 + 4 + 2.
        let sizes: Vec<(u64, u64)> = scanned
            .descriptors
            .iter()
            .map(|d| (d.point_count, d.start))
            .collect();
        assert_eq!(sizes, [(10, 0), (4, 0), (4, 4), (3, 0), (2, 8)]);
        assert!(scanned.descriptors[1].is_chunk());
        assert!(!scanned.descriptors[3].is_chunk());

        let covered: u64 = scanned
            .descriptors
            .iter()
            .filter(|d| d.path.ends_with("b.ptile"))
            .map(|d| d.point_count)
            .sum();
        assert_eq!(covered, 10);

        Ok(())
    }

    #[test]
    fn filters_dimensions_but_keeps_coordinates() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| Error::io("tempdir", e))?;
        let path = dir.path().join("a.ptile");
        let points = grid_points(2, [0.0; 3], 1.0);
        write_source(
            &path,
            &points,
            &[("Intensity", &[1.0, 2.0][..]), ("Reflectance", &[0.5, 0.6][..])],
            false,
        )?;

        let scanned = scan(&TilerConfig {
            dimensions: Some(vec!["intensity".into()]),
            ..config(vec![path])
        })?;

        assert_eq!(scanned.dimension_names, ["X", "Y", "Z", "Intensity"]);
        assert_eq!(scanned.descriptors[0].dimensions, ["X", "Y", "Z", "Intensity"]);

        Ok(())
    }

    #[test]
    fn unreadable_input_is_a_scan_error() {
        let missing = PathBuf::from("/definitely/not/here.las");
        assert!(matches!(scan(&config(vec![missing])), Err(Error::Scan { .. })));

        let unknown = PathBuf::from("cloud.xyz");
        assert!(matches!(scan(&config(vec![unknown])), Err(Error::Scan { .. })));
    }
}
