//! Point sources: the readers the tiler pulls points from.
//!
//! Every format implements [`PointSource`]. Points are pushed through a visitor as one
//! `f64` per dimension, in the order of [`SourcePreview::dimensions`].

mod las;
mod ptile;

use std::path::Path;

pub use self::las::LasSource;
pub use self::ptile::PtileSource;

use crate::error::{Error, Result};
use crate::grid::Bounds3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceFormat {
    Las,
    Ptile,
}

impl SourceFormat {
    /// Pick a reader from the file extension.
    pub fn sniff(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "las" | "laz" => Some(SourceFormat::Las),
            "ptile" => Some(SourceFormat::Ptile),
            _ => None,
        }
    }

    pub fn open(self, path: &Path) -> Result<Box<dyn PointSource>> {
        Ok(match self {
            SourceFormat::Las => Box::new(LasSource::open(path)?),
            SourceFormat::Ptile => Box::new(PtileSource::open(path)?),
        })
    }
}

/// What a source reports before streaming.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcePreview {
    pub point_count: u64,
    pub bounds: Bounds3,
    pub dimensions: Vec<String>,
    /// Per-axis scale declared by the file, if the format has one.
    pub scale: Option<[f64; 3]>,
    pub offset: Option<[f64; 3]>,
    /// Whether `stream` can start at an arbitrary point without reading what precedes it.
    pub seekable: bool,
}

pub trait PointSource {
    fn preview(&mut self) -> Result<SourcePreview>;

    /// Visit up to `limit` points starting at index `start`. Returns the number visited.
    fn stream(
        &mut self,
        start: u64,
        limit: u64,
        visit: &mut dyn FnMut(&[f64]) -> Result<()>,
    ) -> Result<u64>;
}

pub fn open_source(path: &Path) -> Result<Box<dyn PointSource>> {
    let format = SourceFormat::sniff(path)
        .ok_or_else(|| Error::scan(path, "can't infer reader from file extension"))?;
    format.open(path)
}
