//! Two-phase driver: partition every source into buckets, then materialize every bucket.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::bucket_writer::{BucketInventory, BucketWriter};
use crate::config::TilerConfig;
use crate::error::{Error, IoContext, Phase, Result};
use crate::file_processor::{BatchLimits, FileProcessor};
use crate::job_pool::JobPool;
use crate::layout::Layout;
use crate::materializer::{TileMaterializer, TileSettings, TileSummary};
use crate::metadata::{RunMetadata, METADATA_FILE};
use crate::scan::{scan, ScanResult};

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub points_read: u64,
    pub tiles: Vec<TileSummary>,
    pub metadata: RunMetadata,
}

pub struct Tiler {
    config: TilerConfig,
}

impl Tiler {
    pub fn new(config: TilerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TilerConfig {
        &self.config
    }

    pub fn run(&self) -> Result<RunSummary> {
        let config = &self.config;
        let started = Instant::now();

        config.validate()?;
        let scratch = config.scratch_path();
        check_preconditions(&config.output_dir, &scratch)?;

        std::fs::create_dir_all(&config.output_dir)
            .io_context(|| format!("create {}", config.output_dir.display()))?;
        std::fs::create_dir_all(&scratch)
            .io_context(|| format!("create {}", scratch.display()))?;

        let ScanResult {
            descriptors,
            grid,
            dimension_names,
            external_scale,
            source_offsets,
            total_points,
            file_count,
        } = scan(config)?;

        let layout = Arc::new(Layout::build(&dimension_names)?);
        info!("Layout: {layout}");

        let grid = Arc::new(grid);
        info!(
            "Partitioning {total_points} points from {file_count} files in {} jobs \
             ({} file threads, {} writer threads)",
            descriptors.len(),
            config.file_threads,
            config.writer_threads
        );

        let (points_read, inventory) = self.partition(descriptors, &layout, &grid, &scratch)?;
        info!(
            "Partitioned {points_read} points into {} buckets in {:.2?}",
            inventory.len(),
            started.elapsed()
        );

        let settings = Arc::new(TileSettings {
            output_dir: config.output_dir.clone(),
            scale: config.scale,
            external_scale,
            min_scale: config.min_scale,
            sort_by_time: config.sort_by_time,
            compress: config.compress,
            keep_scratch: config.keep_scratch,
        });
        let tiles = self.materialize(inventory, &layout, settings)?;

        if !config.keep_scratch {
            // Only succeeds when empty; a non-empty scratch dir is left for inspection.
            if let Err(e) = std::fs::remove_dir(&scratch) {
                debug!("scratch {} kept: {e}", scratch.display());
            }
        }

        let metadata = RunMetadata::new(
            &grid,
            &layout,
            config.scale,
            config.min_scale,
            &source_offsets,
            &tiles,
        );
        metadata.write(&config.output_dir)?;

        info!(
            "Wrote {} tiles ({points_read} points) to {} in {:.2?}",
            tiles.len(),
            config.output_dir.display(),
            started.elapsed()
        );

        Ok(RunSummary {
            points_read,
            tiles,
            metadata,
        })
    }

    fn partition(
        &self,
        descriptors: Vec<crate::scan::SourceDescriptor>,
        layout: &Arc<Layout>,
        grid: &Arc<crate::grid::SpatialGrid>,
        scratch: &Path,
    ) -> Result<(u64, BucketInventory)> {
        let config = &self.config;

        let writer = Arc::new(BucketWriter::new(
            scratch,
            layout.point_size(),
            config.writer_threads,
            config.queue_depth,
            config.max_open_files,
        )?);
        let pool = JobPool::new("file", config.file_threads)?;
        let points = Arc::new(Mutex::new(0u64));
        let limits = BatchLimits {
            batch_points: config.batch_points,
            max_buffered_bytes: config.max_buffered_bytes,
        };

        for descriptor in descriptors {
            let label = descriptor.label();
            let processor = FileProcessor::new(
                descriptor,
                Arc::clone(layout),
                Arc::clone(grid),
                Arc::clone(&writer),
                limits,
            );
            let points = Arc::clone(&points);

            pool.add(label, move || {
                let n = processor.run()?;
                *points.lock() += n;
                Ok(())
            });
        }

        pool.join();
        let mut errors = pool.take_errors();

        // The writer must drain and close every bucket before any is read back.
        let inventory = match writer.stop() {
            Ok(inventory) => Some(inventory),
            Err(err) => {
                errors.push(err);
                None
            }
        };

        match inventory {
            Some(inventory) if errors.is_empty() => {
                let points = *points.lock();
                Ok((points, inventory))
            }
            _ => Err(Error::Phase {
                phase: Phase::Partition,
                errors,
            }),
        }
    }

    fn materialize(
        &self,
        inventory: BucketInventory,
        layout: &Arc<Layout>,
        settings: Arc<TileSettings>,
    ) -> Result<Vec<TileSummary>> {
        let pool = JobPool::new("tile", self.config.tile_threads)?;
        let materializer = Arc::new(TileMaterializer::new(Arc::clone(layout), settings));
        let tiles = Arc::new(Mutex::new(Vec::with_capacity(inventory.len())));

        // BTreeMap order: jobs start in key order.
        for (key, bucket) in inventory {
            let materializer = Arc::clone(&materializer);
            let tiles = Arc::clone(&tiles);

            pool.add(format!("tile {key}"), move || {
                let summary = materializer.materialize(&bucket)?;
                tiles.lock().push(summary);
                Ok(())
            });
        }

        pool.join();
        let errors = pool.take_errors();
        if !errors.is_empty() {
            return Err(Error::Phase {
                phase: Phase::Materialize,
                errors,
            });
        }

        let mut tiles = std::mem::take(&mut *tiles.lock());
        tiles.sort_by_key(|t| t.key);
        Ok(tiles)
    }
}

/// Refuse to run over the output of an earlier run.
fn check_preconditions(output_dir: &Path, scratch: &Path) -> Result<()> {
    let metadata = output_dir.join(METADATA_FILE);
    if metadata.exists() {
        return Err(Error::Precondition(format!(
            "{} already exists; remove it or pick another output directory",
            metadata.display()
        )));
    }

    if scratch.is_dir() {
        let entries = std::fs::read_dir(scratch)
            .io_context(|| format!("list {}", scratch.display()))?;
        for entry in entries {
            let entry = entry.io_context(|| format!("list {}", scratch.display()))?;
            if entry.path().extension().is_some_and(|ext| ext == "bin") {
                return Err(Error::Precondition(format!(
                    "scratch directory {} holds bucket files from an earlier run",
                    scratch.display()
                )));
            }
        }
    } else if scratch.exists() {
        warn!("scratch path {} is not a directory", scratch.display());
        return Err(Error::Precondition(format!(
            "scratch path {} is not a directory",
            scratch.display()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridSizing;
    use crate::key::BucketKey;
    use crate::testing::{grid_points, write_source};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn tmp() -> Result<tempfile::TempDir> {
        tempfile::tempdir().map_err(|e| Error::io("tempdir", e))
    }

    fn config(inputs: Vec<PathBuf>, output_dir: PathBuf) -> TilerConfig {
        TilerConfig {
            inputs,
            output_dir,
            sizing: GridSizing::CellSize(1.0),
            file_threads: 2,
            writer_threads: 2,
            tile_threads: 2,
            ..TilerConfig::default()
        }
    }

    fn tile_counts(summary: &RunSummary) -> BTreeMap<BucketKey, u64> {
        summary
            .tiles
            .iter()
            .map(|t| (t.key, t.point_count))
            .collect()
    }

    #[test]
    fn two_files_two_tiles() -> Result<()> {
        let dir = tmp()?;
        let a = dir.path().join("a.ptile");
        let b = dir.path().join("b.ptile");
        write_source(&a, &grid_points(10, [0.0; 3], 0.1), &[("Intensity", &[9.0; 10][..])], false)?;
        write_source(&b, &grid_points(5, [1.0, 0.0, 0.0], 0.1), &[], false)?;

        let out = dir.path().join("out");
        let summary = Tiler::new(config(vec![a, b], out.clone())).run()?;

        assert_eq!(summary.points_read, 15);
        assert_eq!(
            tile_counts(&summary),
            BTreeMap::from([
                (BucketKey::new(0, 0, 0, 0), 10),
                (BucketKey::new(1, 0, 0, 0), 5),
            ])
        );

        // Only the tiles, the metadata and nothing left in scratch.
        let mut names: Vec<String> = std::fs::read_dir(&out)
            .map_err(|e| Error::io("list", e))?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, ["0-0-0-0.ptile", "0-1-0-0.ptile", METADATA_FILE]);

        // Intensity came from a only; b's points read back as zero.
        let b_tile = ptile::read_file(out.join("0-1-0-0.ptile")).map_err(|e| Error::io("read", e))?;
        let intensity = b_tile
            .header
            .dimension_index("Intensity")
            .ok_or(Error::Layout("intensity".into()))?;
        assert!((0..5).all(|p| b_tile.value(p, intensity) == 0.0));

        let a_tile = ptile::read_file(out.join("0-0-0-0.ptile")).map_err(|e| Error::io("read", e))?;
        assert!((0..10).all(|p| a_tile.value(p, intensity) == 9.0));

        let meta = RunMetadata::read(&out)?;
        assert_eq!(meta.points, 15);
        assert_eq!(meta.tiles.len(), 2);

        Ok(())
    }

    #[test]
    fn thread_count_does_not_change_buckets() -> Result<()> {
        let dir = tmp()?;
        let mut inputs = Vec::new();
        for f in 0..4 {
            let path = dir.path().join(format!("s{f}.ptile"));
            let origin = [f as f64 * 0.7, f as f64 * 0.3, 0.25 * f as f64];
            write_source(&path, &grid_points(40, origin, 0.09), &[], false)?;
            inputs.push(path);
        }

        let mut results = Vec::new();
        for threads in [1, 4] {
            let cfg = TilerConfig {
                file_threads: threads,
                writer_threads: threads,
                tile_threads: threads,
                batch_points: 3,
                chunk_points: 15,
                ..config(inputs.clone(), dir.path().join(format!("out-{threads}")))
            };
            results.push(Tiler::new(cfg).run()?);
        }

        assert_eq!(results[0].points_read, 160);
        assert_eq!(results[1].points_read, 160);
        assert_eq!(tile_counts(&results[0]), tile_counts(&results[1]));

        let total: u64 = tile_counts(&results[1]).values().sum();
        assert_eq!(total, 160);

        Ok(())
    }

    #[test]
    fn metadata_counts_tiled_points_when_jobs_are_limited() -> Result<()> {
        let dir = tmp()?;
        let a = dir.path().join("a.ptile");
        let b = dir.path().join("b.ptile");
        write_source(&a, &grid_points(10, [0.0; 3], 0.1), &[], false)?;
        write_source(&b, &grid_points(5, [1.0, 0.0, 0.0], 0.1), &[], false)?;

        let out = dir.path().join("out");
        let cfg = TilerConfig {
            file_limit: Some(1),
            ..config(vec![a, b], out.clone())
        };
        let summary = Tiler::new(cfg).run()?;

        // The larger source runs first; the second job is dropped.
        assert_eq!(summary.points_read, 10);
        assert_eq!(summary.metadata.points, 10);
        assert_eq!(RunMetadata::read(&out)?.points, 10);

        Ok(())
    }

    #[test]
    fn refuses_to_overwrite_an_earlier_run() -> Result<()> {
        let dir = tmp()?;
        let a = dir.path().join("a.ptile");
        write_source(&a, &grid_points(3, [0.0; 3], 0.1), &[], false)?;

        let out = dir.path().join("out");
        Tiler::new(config(vec![a.clone()], out.clone())).run()?;

        assert!(matches!(
            Tiler::new(config(vec![a.clone()], out.clone())).run(),
            Err(Error::Precondition(_))
        ));

        let fresh = dir.path().join("fresh");
        let scratch = fresh.join("scratch");
        std::fs::create_dir_all(&scratch).map_err(|e| Error::io("mkdir", e))?;
        std::fs::write(scratch.join("0-0-0-0.bin"), b"").map_err(|e| Error::io("touch", e))?;

        assert!(matches!(
            Tiler::new(config(vec![a], fresh)).run(),
            Err(Error::Precondition(_))
        ));

        Ok(())
    }

    #[test]
    fn decode_failure_fails_the_partition_phase() -> Result<()> {
        let dir = tmp()?;
        let good = dir.path().join("good.ptile");
        write_source(&good, &grid_points(5, [0.0; 3], 0.1), &[], false)?;

        // Header announces 50 points, payload is cut short after scanning.
        let bad = dir.path().join("bad.ptile");
        write_source(&bad, &grid_points(50, [0.0; 3], 0.01), &[], false)?;
        let bytes = std::fs::read(&bad).map_err(|e| Error::io("read", e))?;
        std::fs::write(&bad, &bytes[..bytes.len() - 100]).map_err(|e| Error::io("write", e))?;

        let out = dir.path().join("out");
        match Tiler::new(config(vec![good, bad.clone()], out.clone())).run() {
            Err(Error::Phase {
                phase: Phase::Partition,
                errors,
            }) => {
                assert_eq!(errors.len(), 1);
                assert!(matches!(&errors[0], Error::Decode { path, .. } if *path == bad));
            }
            other => panic!("expected a partition failure, got {other:?}"),
        }

        assert!(!out.join(METADATA_FILE).exists());
        Ok(())
    }
}
