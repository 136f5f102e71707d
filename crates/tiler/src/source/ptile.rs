use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use ::ptile::TileHeader;

use super::{PointSource, SourcePreview};
use crate::error::{Error, Result};
use crate::grid::Bounds3;

/// Records read per `read_exact` when streaming an uncompressed payload.
const READ_CHUNK_POINTS: usize = 4096;

/// Reads tiles written by this crate back as a point source.
pub struct PtileSource {
    path: PathBuf,
    reader: BufReader<File>,
    header: TileHeader,
    payload_start: u64,
}

impl PtileSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::decode(path, e))?;
        let mut reader = BufReader::new(file);

        let header = ::ptile::read_header(&mut reader).map_err(|e| Error::decode(path, e))?;
        let payload_start = reader
            .stream_position()
            .map_err(|e| Error::decode(path, e))?;

        Ok(Self {
            path: path.to_path_buf(),
            reader,
            header,
            payload_start,
        })
    }

    #[inline]
    fn visit_records(
        &self,
        records: &[u8],
        values: &mut Vec<f64>,
        visit: &mut dyn FnMut(&[f64]) -> Result<()>,
    ) -> Result<u64> {
        let h = &self.header;
        let size = h.record_size();
        let offsets: Vec<usize> = (0..h.dimensions.len())
            .map(|i| h.dimension_offset(i))
            .collect();

        let mut visited = 0;
        for record in records.chunks_exact(size) {
            values.clear();
            for (i, dim) in h.dimensions.iter().enumerate() {
                let raw = dim.kind.read_f64(&record[offsets[i]..]);
                values.push(if i < 3 {
                    raw * h.scale[i] + h.offset[i]
                } else {
                    raw
                });
            }
            visit(values.as_slice())?;
            visited += 1;
        }

        Ok(visited)
    }
}

impl PointSource for PtileSource {
    fn preview(&mut self) -> Result<SourcePreview> {
        let h = &self.header;

        Ok(SourcePreview {
            point_count: h.point_count,
            bounds: Bounds3::new(h.min, h.max),
            dimensions: h.dimensions.iter().map(|d| d.name.clone()).collect(),
            scale: Some(h.scale),
            offset: Some(h.offset),
            seekable: !h.compressed,
        })
    }

    fn stream(
        &mut self,
        start: u64,
        limit: u64,
        visit: &mut dyn FnMut(&[f64]) -> Result<()>,
    ) -> Result<u64> {
        let size = self.header.record_size();
        let total = self.header.point_count;
        let start = start.min(total);
        let count = limit.min(total - start) as usize;
        let mut values = Vec::with_capacity(self.header.dimensions.len());

        if self.header.compressed {
            self.reader
                .seek(SeekFrom::Start(self.payload_start))
                .map_err(|e| Error::decode(&self.path, e))?;

            // The header's length is only trusted as far as the file backs it.
            let file_len = self
                .reader
                .get_ref()
                .metadata()
                .map_err(|e| Error::decode(&self.path, e))?
                .len();
            let available = file_len.saturating_sub(self.payload_start);
            let mut payload = Vec::with_capacity(self.header.payload_len.min(available) as usize);
            (&mut self.reader)
                .take(self.header.payload_len)
                .read_to_end(&mut payload)
                .map_err(|e| Error::decode(&self.path, e))?;

            if payload.len() as u64 != self.header.payload_len {
                return Err(Error::decode(
                    &self.path,
                    format!(
                        "payload is {} bytes, header says {}",
                        payload.len(),
                        self.header.payload_len
                    ),
                ));
            }

            let records = ::ptile::decode_payload(&self.header, &payload)
                .map_err(|e| Error::decode(&self.path, e))?;

            let from = start as usize * size;
            let to = from + count * size;
            return self.visit_records(&records[from..to], &mut values, visit);
        }

        self.reader
            .seek(SeekFrom::Start(self.payload_start + start * size as u64))
            .map_err(|e| Error::decode(&self.path, e))?;

        let mut buf = vec![0u8; READ_CHUNK_POINTS * size];
        let mut remaining = count;
        let mut visited = 0;

        while remaining > 0 {
            let n = remaining.min(READ_CHUNK_POINTS);
            let chunk = &mut buf[..n * size];
            self.reader
                .read_exact(chunk)
                .map_err(|e| Error::decode(&self.path, e))?;

            visited += self.visit_records(chunk, &mut values, visit)?;
            remaining -= n;
        }

        Ok(visited)
    }
}
