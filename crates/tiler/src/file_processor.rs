//! Streams one source (or chunk) and routes every point to its bucket.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::bucket_writer::BucketWriter;
use crate::error::{Error, Result};
use crate::grid::SpatialGrid;
use crate::key::BucketKey;
use crate::layout::Layout;
use crate::progress::Tick;
use crate::scan::SourceDescriptor;

const PROGRESS_EVERY: u64 = 1_000_000;

/// Per-job buffering limits.
#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    /// Records per key before the batch is submitted.
    pub batch_points: usize,
    /// Bytes across all local batches before everything is submitted.
    pub max_buffered_bytes: usize,
}

pub struct FileProcessor {
    descriptor: SourceDescriptor,
    layout: Arc<Layout>,
    grid: Arc<SpatialGrid>,
    writer: Arc<BucketWriter>,
    limits: BatchLimits,
}

impl FileProcessor {
    pub fn new(
        descriptor: SourceDescriptor,
        layout: Arc<Layout>,
        grid: Arc<SpatialGrid>,
        writer: Arc<BucketWriter>,
        limits: BatchLimits,
    ) -> Self {
        Self {
            descriptor,
            layout,
            grid,
            writer,
            limits,
        }
    }

    /// Stream the source into the writer. Returns the number of points routed.
    pub fn run(self) -> Result<u64> {
        let path = self.descriptor.path.clone();

        self.route().map_err(|err| match err {
            Error::Decode { .. } | Error::File { .. } => err,
            other => Error::File {
                path,
                source: Box::new(other),
            },
        })
    }

    fn route(&self) -> Result<u64> {
        let d = &self.descriptor;
        let label = d.label();
        let layout = &*self.layout;
        let point_size = layout.point_size();

        let mut source = d.format.open(&d.path)?;
        let preview = source.preview()?;

        // source dimension index -> layout field index, for the dimensions kept
        let mapping: Vec<(usize, usize)> = preview
            .dimensions
            .iter()
            .enumerate()
            .filter(|(_, name)| d.dimensions.iter().any(|k| k.eq_ignore_ascii_case(name)))
            .filter_map(|(i, name)| layout.index_of(name).map(|f| (i, f)))
            .collect();

        let mut xyz = [0usize; 3];
        for (axis, name) in ptile::COORDINATE_NAMES.iter().enumerate() {
            xyz[axis] = preview
                .dimensions
                .iter()
                .position(|n| n.eq_ignore_ascii_case(name))
                .ok_or_else(|| Error::decode(&d.path, format!("source has no {name} dimension")))?;
        }

        let batch_bytes = self.limits.batch_points.max(1) * point_size;
        let mut batches: HashMap<BucketKey, Vec<u8>> = HashMap::new();
        let mut buffered = 0usize;
        let mut count = 0u64;
        let mut tick = Tick::new(PROGRESS_EVERY);

        let visited = source.stream(d.start, d.point_count, &mut |values: &[f64]| {
            let key = self
                .grid
                .key_for(values[xyz[0]], values[xyz[1]], values[xyz[2]]);

            let batch = batches.entry(key).or_default();
            if batch.capacity() == 0 {
                batch.reserve_exact(batch_bytes);
            }

            // Fields the source lacks stay zero.
            let at = batch.len();
            batch.resize(at + point_size, 0);
            let record = &mut batch[at..];
            for &(src, field) in &mapping {
                layout.write(record, field, values[src]);
            }
            buffered += point_size;

            if batch.len() >= batch_bytes {
                buffered -= batch.len();
                self.writer.submit(key, std::mem::take(batch))?;
            }

            if buffered > self.limits.max_buffered_bytes {
                debug!("{label}: {buffered} bytes buffered, flushing all batches");
                for (key, batch) in batches.iter_mut() {
                    if !batch.is_empty() {
                        self.writer.submit(*key, std::mem::take(batch))?;
                    }
                }
                buffered = 0;
            }

            count += 1;
            if tick.should(count) {
                info!(
                    "{label}: {:>11} / {} points, rate {:5.2} M/s",
                    count,
                    d.point_count,
                    tick.rate_mps(count)
                );
            }

            Ok(())
        })?;

        for (key, batch) in batches {
            self.writer.submit(key, batch)?;
        }

        if visited != d.point_count {
            warn!(
                "{label}: header announced {} points, read {visited}",
                d.point_count
            );
        }

        debug!(
            "{label}: routed {visited} points in {:.2?}",
            tick.elapsed()
        );

        Ok(visited)
    }
}
