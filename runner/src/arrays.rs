pub mod dataset;
mod native;
mod nco;

pub use dataset::{DataType, Dataset, Dimension, Statistic, Variable, DEFAULT_FILL};
pub use native::NativeTool;
pub use nco::NcoTool;

use crate::{
    config::{ArrayConfig, ConfigErrors},
    process::ProcessError,
};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArrayError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to decode dataset {path}: {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Failed to encode dataset: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("Dimension {0} not found")]
    MissingDimension(String),
    #[error("Variable {0} not found")]
    MissingVariable(String),
    #[error("Index {index} is out of range for dimension {dim} with length {len}")]
    IndexOutOfRange {
        dim: String,
        index: usize,
        len: usize,
    },
    #[error("Shapes don't line up: {0}")]
    ShapeMismatch(String),
    #[error("Unsupported content in {path}: {reason}")]
    Unsupported { path: PathBuf, reason: String },
    #[error("No inputs given")]
    NoInputs,
}

/// Requested chunk size for a dimension of a concatenated file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkSize {
    Full,
    Fixed(usize),
}

/// Layout hint passed to `concatenate`, backends without chunking ignore it
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChunkLayout {
    pub chunks: Vec<(String, ChunkSize)>,
}

impl ChunkLayout {
    pub fn none() -> Self {
        Self::default()
    }

    /// one chunk per (Y, X) coordinate pair, used for restart and status variables
    pub fn per_cell(y: &str, x: &str) -> Self {
        Self {
            chunks: vec![
                (y.to_string(), ChunkSize::Fixed(1)),
                (x.to_string(), ChunkSize::Fixed(1)),
            ],
        }
    }

    /// the whole time axis per cell, used for time series variables
    pub fn temporal(time: &str, y: &str, x: &str) -> Self {
        Self {
            chunks: vec![
                (time.to_string(), ChunkSize::Full),
                (y.to_string(), ChunkSize::Fixed(1)),
                (x.to_string(), ChunkSize::Fixed(1)),
            ],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Operations the batch engine needs from a gridded array tool
pub trait ArrayTool {
    fn read(&self, path: &Path) -> Result<Dataset, ArrayError>;

    fn write(&self, dataset: &Dataset, path: &Path) -> Result<(), ArrayError>;

    /// dimension names and lengths without loading the data
    fn dimensions(&self, path: &Path) -> Result<Vec<Dimension>, ArrayError>;

    fn subset(&self, src: &Path, dim: &str, index: usize, dst: &Path) -> Result<(), ArrayError>;

    fn rename_dimension(&self, src: &Path, from: &str, to: &str, dst: &Path)
        -> Result<(), ArrayError>;

    fn concatenate(
        &self,
        inputs: &[PathBuf],
        dim: &str,
        dst: &Path,
        layout: &ChunkLayout,
    ) -> Result<(), ArrayError>;

    fn ensemble(&self, inputs: &[PathBuf], statistic: Statistic, dst: &Path)
        -> Result<(), ArrayError>;
}

#[derive(Clone, Debug)]
pub enum ArrayBackends {
    Nco(NcoTool),
    Native(NativeTool),
}

impl ArrayBackends {
    pub fn load(config: &ArrayConfig) -> Result<Self, ConfigErrors> {
        match config.backend.as_str() {
            "nco" => Ok(Self::Nco(NcoTool::default())),
            "native" => Ok(Self::Native(NativeTool)),
            _ => Err(ConfigErrors::UnsupportedArrayBackend(config.backend.clone())),
        }
    }

    fn tool(&self) -> &dyn ArrayTool {
        match self {
            Self::Nco(tool) => tool,
            Self::Native(tool) => tool,
        }
    }
}

impl ArrayTool for ArrayBackends {
    fn read(&self, path: &Path) -> Result<Dataset, ArrayError> {
        self.tool().read(path)
    }

    fn write(&self, dataset: &Dataset, path: &Path) -> Result<(), ArrayError> {
        self.tool().write(dataset, path)
    }

    fn dimensions(&self, path: &Path) -> Result<Vec<Dimension>, ArrayError> {
        self.tool().dimensions(path)
    }

    fn subset(&self, src: &Path, dim: &str, index: usize, dst: &Path) -> Result<(), ArrayError> {
        self.tool().subset(src, dim, index, dst)
    }

    fn rename_dimension(
        &self,
        src: &Path,
        from: &str,
        to: &str,
        dst: &Path,
    ) -> Result<(), ArrayError> {
        self.tool().rename_dimension(src, from, to, dst)
    }

    fn concatenate(
        &self,
        inputs: &[PathBuf],
        dim: &str,
        dst: &Path,
        layout: &ChunkLayout,
    ) -> Result<(), ArrayError> {
        self.tool().concatenate(inputs, dim, dst, layout)
    }

    fn ensemble(
        &self,
        inputs: &[PathBuf],
        statistic: Statistic,
        dst: &Path,
    ) -> Result<(), ArrayError> {
        self.tool().ensemble(inputs, statistic, dst)
    }
}

/// length of `dim` in the file at `path`
pub fn dimension_len(
    tool: &dyn ArrayTool,
    path: &Path,
    dim: &str,
) -> Result<usize, ArrayError> {
    tool.dimensions(path)?
        .into_iter()
        .find(|dimension| dimension.name == dim)
        .map(|dimension| dimension.len)
        .ok_or_else(|| ArrayError::MissingDimension(dim.to_string()))
}
