use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::grid::GridSizing;

/// Everything a run needs to know. Built by the caller, checked by [`TilerConfig::validate`].
#[derive(Debug, Clone)]
pub struct TilerConfig {
    /// Source files, or directories whose files are all sources.
    pub inputs: Vec<PathBuf>,
    /// Destination of the finished tiles and `tiling.json`.
    pub output_dir: PathBuf,
    /// Where bucket files live during the run. Defaults to `<output_dir>/scratch`.
    pub scratch_dir: Option<PathBuf>,

    pub sizing: GridSizing,
    /// Grid over a cube anchored at the bounds minimum instead of the bounds themselves.
    pub cubic: bool,
    /// Fixed subdivision level, only with density sizing.
    pub level: Option<u32>,
    /// Keep only these dimensions (X, Y, Z are always kept).
    pub dimensions: Option<Vec<String>>,

    pub file_threads: usize,
    pub writer_threads: usize,
    pub tile_threads: usize,
    /// Batches each writer queue holds before submitters block.
    pub queue_depth: usize,
    /// Append handles each writer thread keeps open.
    pub max_open_files: usize,

    /// Records per key a file job buffers before submitting.
    pub batch_points: usize,
    /// Upper bound on bytes a file job buffers across all keys.
    pub max_buffered_bytes: usize,
    /// Seekable sources with at least this many points are split into chunks of this size.
    pub chunk_points: u64,

    /// Explicit per-axis scale for every tile.
    pub scale: Option<[f64; 3]>,
    /// Smallest scale the derivation may pick.
    pub min_scale: f64,
    pub sort_by_time: bool,
    pub compress: bool,
    pub keep_scratch: bool,
    /// Debug aid: only process the first N file jobs.
    pub file_limit: Option<usize>,
}

impl Default for TilerConfig {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            inputs: Vec::new(),
            output_dir: PathBuf::from("tiles"),
            scratch_dir: None,
            sizing: GridSizing::default(),
            cubic: true,
            level: None,
            dimensions: None,
            file_threads: threads,
            writer_threads: (threads / 2).max(1),
            tile_threads: threads,
            queue_depth: 64,
            max_open_files: 128,
            batch_points: 8192,
            max_buffered_bytes: 256 << 20,
            chunk_points: 5_000_000,
            scale: None,
            min_scale: 1e-4,
            sort_by_time: true,
            compress: false,
            keep_scratch: false,
            file_limit: None,
        }
    }
}

impl TilerConfig {
    pub fn scratch_path(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| self.output_dir.join("scratch"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.inputs.is_empty() {
            return Err(Error::Config("no input files given".into()));
        }

        match self.sizing {
            GridSizing::Density { points_per_cell } if points_per_cell == 0 => {
                return Err(Error::Config("points per cell must be > 0".into()));
            }
            GridSizing::CellSize(len) if !(len.is_finite() && len > 0.0) => {
                return Err(Error::Config(format!("cell size {len} must be finite and > 0")));
            }
            GridSizing::CellSize(_) if self.level.is_some() => {
                return Err(Error::Config(
                    "a fixed level only applies to density sizing".into(),
                ));
            }
            _ => {}
        }

        for (name, value) in [
            ("file threads", self.file_threads),
            ("writer threads", self.writer_threads),
            ("tile threads", self.tile_threads),
            ("queue depth", self.queue_depth),
            ("max open files", self.max_open_files),
            ("batch points", self.batch_points),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be > 0")));
            }
        }

        if self.chunk_points == 0 {
            return Err(Error::Config("chunk points must be > 0".into()));
        }

        if let Some(scale) = self.scale {
            if scale.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
                return Err(Error::Config(format!("scale {scale:?} must be finite and > 0")));
            }
        }

        if !(self.min_scale.is_finite() && self.min_scale > 0.0) {
            return Err(Error::Config("min scale must be finite and > 0".into()));
        }

        Ok(())
    }
}
