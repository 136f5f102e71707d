//! Out-of-core tiler for point clouds.
//!
//! A run scans every source once to size a regular grid and agree on one record
//! layout, streams all sources concurrently into per-bucket scratch files, and then
//! turns every bucket into a self-describing `.ptile` with its own scale and offset.
//!
//! ```no_run
//! use tiler::{Tiler, TilerConfig};
//!
//! let config = TilerConfig {
//!     inputs: vec!["clouds/".into()],
//!     output_dir: "tiles".into(),
//!     ..TilerConfig::default()
//! };
//! let summary = Tiler::new(config).run()?;
//! println!("{} tiles", summary.tiles.len());
//! # Ok::<(), tiler::Error>(())
//! ```

pub mod bucket_writer;
pub mod config;
pub mod error;
pub mod file_processor;
pub mod grid;
pub mod job_pool;
pub mod key;
pub mod layout;
pub mod materializer;
pub mod metadata;
pub mod pipeline;
pub mod scan;
pub mod source;

mod progress;

#[cfg(test)]
mod testing;

pub use bucket_writer::{BucketFile, BucketInventory, BucketWriter};
pub use config::TilerConfig;
pub use error::{Error, Phase, Result};
pub use grid::{Bounds3, GridSizing, SpatialGrid};
pub use job_pool::JobPool;
pub use key::BucketKey;
pub use layout::{Layout, LayoutField};
pub use materializer::{TileMaterializer, TileSettings, TileSummary};
pub use metadata::RunMetadata;
pub use pipeline::{RunSummary, Tiler};
pub use scan::{ScanResult, SourceDescriptor};
pub use source::{PointSource, SourceFormat, SourcePreview};
