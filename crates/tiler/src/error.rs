use std::fmt;
use std::path::PathBuf;

use crate::key::BucketKey;

/// Everything that can fail a tiling run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A source could not be opened or previewed. Raised before any parallel work.
    #[error("scan {}: {message}", path.display())]
    Scan { path: PathBuf, message: String },

    /// A source failed mid-stream inside a file job.
    #[error("decode {}: {message}", path.display())]
    Decode { path: PathBuf, message: String },

    /// Appending to a bucket file failed.
    #[error("write bucket {key}: {source}")]
    Write {
        key: BucketKey,
        #[source]
        source: std::io::Error,
    },

    /// Any other failure of a file job, tagged with the source it was reading.
    #[error("{}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },

    #[error("materialize tile {key}: {message}")]
    Materialize { key: BucketKey, message: String },

    /// Destination or scratch directory holds output from an earlier run.
    #[error("precondition: {0}")]
    Precondition(String),

    #[error("layout: {0}")]
    Layout(String),

    #[error("config: {0}")]
    Config(String),

    #[error("job '{job}' panicked: {message}")]
    JobPanicked { job: String, message: String },

    #[error("bucket writer is stopped")]
    WriterStopped,

    #[error("{source} ({context})")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Every error recorded by one phase, reported after its join.
    #[error("{phase} phase failed with {} error(s):{}", errors.len(), ErrorList(errors))]
    Phase { phase: Phase, errors: Vec<Error> },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Partition,
    Materialize,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Partition => "partition",
            Phase::Materialize => "materialize",
        })
    }
}

struct ErrorList<'a>(&'a [Error]);

impl fmt::Display for ErrorList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for err in self.0 {
            write!(f, "\n  - {err}")?;
        }
        Ok(())
    }
}

impl Error {
    pub(crate) fn scan(path: impl Into<PathBuf>, message: impl fmt::Display) -> Self {
        Error::Scan {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub(crate) fn decode(path: impl Into<PathBuf>, message: impl fmt::Display) -> Self {
        Error::Decode {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub(crate) fn materialize(key: BucketKey, message: impl fmt::Display) -> Self {
        Error::Materialize {
            key,
            message: message.to_string(),
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }
}

/// Attach a short description to I/O failures, like `anyhow::Context` does for the binary.
pub(crate) trait IoContext<T> {
    fn io_context<C: Into<String>>(self, context: impl FnOnce() -> C) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<C: Into<String>>(self, context: impl FnOnce() -> C) -> Result<T> {
        self.map_err(|e| Error::io(context(), e))
    }
}
