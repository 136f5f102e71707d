//! Global record layout shared by every component of a run.
//!
//! The layout is the union of the dimension names reported by all sources. Well-known
//! names get a fixed kind and a fixed position at the front of the record, everything
//! else is stored as `f64` under a canonical spelling (first letter upper case, the rest
//! lower case) and packed after them in alphabetical order. The same set of names
//! therefore always yields the same offsets and the same field names, whatever their case.

use std::collections::BTreeMap;

use ptile::{DimKind, PointFormat};

use crate::error::{Error, Result};

/// Well-known dimensions in packing order.
const KNOWN_DIMENSIONS: &[(&str, DimKind)] = &[
    ("X", DimKind::F64),
    ("Y", DimKind::F64),
    ("Z", DimKind::F64),
    ("Intensity", DimKind::U16),
    ("ReturnNumber", DimKind::U8),
    ("NumberOfReturns", DimKind::U8),
    ("ScanDirectionFlag", DimKind::U8),
    ("EdgeOfFlightLine", DimKind::U8),
    ("Classification", DimKind::U8),
    ("Synthetic", DimKind::U8),
    ("KeyPoint", DimKind::U8),
    ("Withheld", DimKind::U8),
    ("Overlap", DimKind::U8),
    ("ScanChannel", DimKind::U8),
    ("ScanAngleRank", DimKind::F32),
    ("UserData", DimKind::U8),
    ("PointSourceId", DimKind::U16),
    ("GpsTime", DimKind::F64),
    ("Red", DimKind::U16),
    ("Green", DimKind::U16),
    ("Blue", DimKind::U16),
    ("Infrared", DimKind::U16),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutField {
    pub name: String,
    pub kind: DimKind,
    /// Byte offset within a record.
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    fields: Vec<LayoutField>,
    point_size: usize,
}

impl Layout {
    /// Union the per-source dimension names into one frozen layout.
    ///
    /// Fails when no names were seen or when X, Y or Z is missing.
    pub fn build<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        // lowercase name -> canonical spelling
        let mut seen: BTreeMap<String, String> = BTreeMap::new();

        for name in names {
            let name = name.as_ref();
            if name.is_empty() {
                continue;
            }

            let lower = name.to_ascii_lowercase();
            if !seen.contains_key(&lower) {
                let canonical = canonical_name(&lower);
                seen.insert(lower, canonical);
            }
        }

        if seen.is_empty() {
            return Err(Error::Layout("no dimensions found in any source".into()));
        }

        let mut fields = Vec::with_capacity(seen.len());
        let mut offset = 0;

        let mut push = |name: String, kind: DimKind, fields: &mut Vec<LayoutField>| {
            fields.push(LayoutField { name, kind, offset });
            offset += kind.size();
        };

        for (known, kind) in KNOWN_DIMENSIONS {
            if seen.remove(&known.to_ascii_lowercase()).is_some() {
                push(known.to_string(), *kind, &mut fields);
            }
        }

        // BTreeMap iteration is already sorted by the lowercase name.
        for (_, name) in seen {
            push(name, DimKind::F64, &mut fields);
        }

        let point_size = fields.iter().map(|f| f.kind.size()).sum();
        let layout = Self { fields, point_size };

        for axis in ptile::COORDINATE_NAMES {
            if layout.index_of(axis).is_none() {
                return Err(Error::Layout(format!("required dimension {axis} is missing")));
            }
        }

        Ok(layout)
    }

    #[inline]
    pub fn fields(&self) -> &[LayoutField] {
        &self.fields
    }

    /// Bytes per record.
    #[inline]
    pub fn point_size(&self) -> usize {
        self.point_size
    }

    /// Case-insensitive lookup.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields
            .iter()
            .position(|f| f.name.eq_ignore_ascii_case(name))
    }

    pub fn field(&self, name: &str) -> Option<&LayoutField> {
        self.index_of(name).map(|i| &self.fields[i])
    }

    /// X, Y and Z always occupy the first three fields.
    #[inline]
    pub fn xyz(&self, record: &[u8]) -> [f64; 3] {
        [
            self.read(record, 0),
            self.read(record, 1),
            self.read(record, 2),
        ]
    }

    #[inline]
    pub fn read(&self, record: &[u8], field: usize) -> f64 {
        let f = &self.fields[field];
        f.kind.read_f64(&record[f.offset..])
    }

    #[inline]
    pub fn write(&self, record: &mut [u8], field: usize, value: f64) {
        let f = &self.fields[field];
        f.kind.write_f64(value, &mut record[f.offset..]);
    }

    /// Richest point-format tag whose optional groups appear in the layout.
    pub fn point_format(&self) -> PointFormat {
        if self.index_of("Infrared").is_some() {
            PointFormat::RgbNir
        } else if ["Red", "Green", "Blue"]
            .iter()
            .any(|c| self.index_of(c).is_some())
        {
            PointFormat::Rgb
        } else {
            PointFormat::Base
        }
    }
}

fn canonical_name(lower: &str) -> String {
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

impl std::fmt::Display for Layout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} bytes/point:", self.point_size)?;
        for field in &self.fields {
            write!(f, " {}({}@{})", field.name, field.kind, field.offset)?;
        }
        Ok(())
    }
}
