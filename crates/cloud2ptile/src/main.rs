use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;

use tiler::{GridSizing, Tiler, TilerConfig};

/// Re-partition LAS/LAZ (or ptile) point clouds into a grid of self-contained `.ptile` tiles.
#[derive(Parser, Debug, Clone)]
#[command(name = "cloud2ptile", version, about, long_about = None)]
struct Args {
    /// Input files, or directories whose point cloud files are all inputs.
    #[arg(required = true, env = "CLOUD2PTILE_INPUTS", value_delimiter = ',')]
    inputs: Vec<PathBuf>,

    /// Destination of the tiles and `tiling.json`.
    #[arg(long, short, env = "CLOUD2PTILE_OUTPUT_DIR", default_value = "tiles")]
    output_dir: PathBuf,

    /// Scratch directory for bucket files. Default: `<output-dir>/scratch`.
    #[arg(long, env = "CLOUD2PTILE_SCRATCH_DIR")]
    scratch_dir: Option<PathBuf>,

    /// Target number of points per tile; the grid subdivides until it gets there.
    #[arg(long, env = "CLOUD2PTILE_POINTS_PER_TILE", default_value_t = 2_000_000)]
    points_per_tile: u64,

    /// Fixed tile edge length in source units. Overrides --points-per-tile.
    #[arg(long, env = "CLOUD2PTILE_CELL_SIZE", conflicts_with = "level")]
    cell_size: Option<f64>,

    /// Fixed subdivision level (2^level tiles per axis).
    #[arg(long, env = "CLOUD2PTILE_LEVEL")]
    level: Option<u32>,

    /// Grid over the data bounds as they are instead of a cube around them.
    #[arg(long, env = "CLOUD2PTILE_NO_CUBE", default_value_t = false)]
    no_cube: bool,

    /// Only keep these dimensions (comma separated). X, Y and Z are always kept.
    #[arg(long, env = "CLOUD2PTILE_DIMS", value_delimiter = ',')]
    dims: Option<Vec<String>>,

    /// Threads reading sources. Default: available cores.
    #[arg(long, env = "CLOUD2PTILE_FILE_THREADS")]
    file_threads: Option<usize>,

    /// Threads appending bucket files. Default: half the cores.
    #[arg(long, env = "CLOUD2PTILE_WRITER_THREADS")]
    writer_threads: Option<usize>,

    /// Threads writing tiles. Default: available cores.
    #[arg(long, env = "CLOUD2PTILE_TILE_THREADS")]
    tile_threads: Option<usize>,

    /// Batches each writer thread may have queued before readers block.
    #[arg(long, env = "CLOUD2PTILE_QUEUE_DEPTH")]
    queue_depth: Option<usize>,

    /// Open bucket files per writer thread.
    #[arg(long, env = "CLOUD2PTILE_MAX_OPEN_FILES")]
    max_open_files: Option<usize>,

    /// Records per bucket a reader buffers before handing them to a writer.
    #[arg(long, env = "CLOUD2PTILE_BATCH_POINTS")]
    batch_points: Option<usize>,

    /// Bytes of pending batches one reader may hold before flushing them all.
    #[arg(long, env = "CLOUD2PTILE_MAX_BUFFERED_BYTES")]
    max_buffered_bytes: Option<usize>,

    /// Split seekable sources with at least this many points into chunks of this size.
    #[arg(long, env = "CLOUD2PTILE_CHUNK_POINTS")]
    chunk_points: Option<u64>,

    /// Output scale, one value for all axes or `x,y,z`. Default: derived per tile.
    #[arg(long, env = "CLOUD2PTILE_SCALE", value_delimiter = ',')]
    scale: Option<Vec<f64>>,

    /// Smallest scale the per-tile derivation may pick.
    #[arg(long, env = "CLOUD2PTILE_MIN_SCALE", default_value_t = 1e-4)]
    min_scale: f64,

    /// Keep records in arrival order instead of sorting by GpsTime.
    #[arg(long, env = "CLOUD2PTILE_NO_TIME_SORT", default_value_t = false)]
    no_time_sort: bool,

    /// Deflate tile payloads.
    #[arg(long, env = "CLOUD2PTILE_COMPRESS", default_value_t = false)]
    compress: bool,

    /// Leave bucket files in scratch after their tile is written.
    #[arg(long, env = "CLOUD2PTILE_KEEP_SCRATCH", default_value_t = false)]
    keep_scratch: bool,

    /// Debug: only process the first N file jobs.
    #[arg(long, env = "CLOUD2PTILE_FILE_LIMIT")]
    file_limit: Option<usize>,
}

impl Args {
    fn into_config(self) -> Result<TilerConfig> {
        let defaults = TilerConfig::default();

        let scale = match self.scale.as_deref() {
            None => None,
            Some([s]) => Some([*s; 3]),
            Some([x, y, z]) => Some([*x, *y, *z]),
            Some(other) => bail!("--scale takes 1 or 3 values, got {}", other.len()),
        };

        let sizing = match self.cell_size {
            Some(length) => GridSizing::CellSize(length),
            None => GridSizing::Density {
                points_per_cell: self.points_per_tile,
            },
        };

        Ok(TilerConfig {
            inputs: self.inputs,
            output_dir: self.output_dir,
            scratch_dir: self.scratch_dir,
            sizing,
            cubic: !self.no_cube,
            level: self.level,
            dimensions: self.dims,
            file_threads: self.file_threads.unwrap_or(defaults.file_threads),
            writer_threads: self.writer_threads.unwrap_or(defaults.writer_threads),
            tile_threads: self.tile_threads.unwrap_or(defaults.tile_threads),
            queue_depth: self.queue_depth.unwrap_or(defaults.queue_depth),
            max_open_files: self.max_open_files.unwrap_or(defaults.max_open_files),
            batch_points: self.batch_points.unwrap_or(defaults.batch_points),
            max_buffered_bytes: self
                .max_buffered_bytes
                .unwrap_or(defaults.max_buffered_bytes),
            chunk_points: self.chunk_points.unwrap_or(defaults.chunk_points),
            scale,
            min_scale: self.min_scale,
            sort_by_time: !self.no_time_sort,
            compress: self.compress,
            keep_scratch: self.keep_scratch,
            file_limit: self.file_limit,
        })
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.into_config()?;

    info!(
        "Tiling {} input(s) -> {}",
        config.inputs.len(),
        config.output_dir.display()
    );

    let summary = Tiler::new(config)
        .run()
        .context("tiling run failed")?;

    info!(
        "Done: {} points in {} tiles",
        summary.points_read,
        summary.tiles.len()
    );

    Ok(())
}
