use super::{ArrayError, ArrayTool, ChunkLayout, Dataset, Dimension, Statistic};
use std::{
    fs::{self, File},
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};
use tracing::trace;

/// In process backend, datasets are stored as JSON next to each other
#[derive(Clone, Copy, Debug, Default)]
pub struct NativeTool;

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ArrayError + '_ {
    move |source| ArrayError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl NativeTool {
    fn read_all(&self, inputs: &[PathBuf]) -> Result<Vec<Dataset>, ArrayError> {
        inputs.iter().map(|path| self.read(path)).collect()
    }
}

impl ArrayTool for NativeTool {
    fn read(&self, path: &Path) -> Result<Dataset, ArrayError> {
        let reader = BufReader::new(File::open(path).map_err(io_error(path))?);

        serde_json::from_reader(reader).map_err(|source| ArrayError::Decode {
            path: path.to_path_buf(),
            source,
        })
    }

    fn write(&self, dataset: &Dataset, path: &Path) -> Result<(), ArrayError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }

        let writer = BufWriter::new(File::create(path).map_err(io_error(path))?);
        serde_json::to_writer(writer, dataset)?;

        Ok(())
    }

    fn dimensions(&self, path: &Path) -> Result<Vec<Dimension>, ArrayError> {
        Ok(self.read(path)?.dimensions)
    }

    fn subset(&self, src: &Path, dim: &str, index: usize, dst: &Path) -> Result<(), ArrayError> {
        let subset = self.read(src)?.isel(dim, index)?;
        self.write(&subset, dst)
    }

    fn rename_dimension(
        &self,
        src: &Path,
        from: &str,
        to: &str,
        dst: &Path,
    ) -> Result<(), ArrayError> {
        let mut dataset = self.read(src)?;
        dataset.rename_dimension(from, to)?;
        self.write(&dataset, dst)
    }

    fn concatenate(
        &self,
        inputs: &[PathBuf],
        dim: &str,
        dst: &Path,
        layout: &ChunkLayout,
    ) -> Result<(), ArrayError> {
        trace!(layout = ?layout, "Chunk layout is not applied by the native backend");
        let joined = Dataset::concatenate(&self.read_all(inputs)?, dim)?;
        self.write(&joined, dst)
    }

    fn ensemble(
        &self,
        inputs: &[PathBuf],
        statistic: Statistic,
        dst: &Path,
    ) -> Result<(), ArrayError> {
        let combined = Dataset::ensemble(&self.read_all(inputs)?, statistic)?;
        self.write(&combined, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrays::dataset::tests::grid;
    use ndarray::Array2;

    #[test]
    fn subset_and_concatenate_through_files() {
        let directory = tempfile::tempdir().unwrap();
        let source = directory.path().join("run-mask.nc");
        let tool = NativeTool;
        let dataset = grid(
            "run",
            Array2::from_shape_fn((2, 3), |(y, x)| (y + x) as f64),
            -9999.0,
        );
        tool.write(&dataset, &source).unwrap();

        let pieces = (0..3)
            .map(|index| {
                let path = directory.path().join(format!("piece-{index}.nc"));
                tool.subset(&source, "X", index, &path).unwrap();
                path
            })
            .collect::<Vec<_>>();

        let joined = directory.path().join("joined.nc");
        tool.concatenate(&pieces, "X", &joined, &ChunkLayout::none())
            .unwrap();

        assert_eq!(tool.read(&joined).unwrap(), dataset);
        assert_eq!(
            tool.dimensions(&pieces[0]).unwrap()[1],
            Dimension {
                name: "X".to_string(),
                len: 1,
                unlimited: false
            }
        );
    }

    #[test]
    fn rename_dimension_rewrites_variables() {
        let directory = tempfile::tempdir().unwrap();
        let source = directory.path().join("status.nc");
        let renamed = directory.path().join("renamed.nc");
        let tool = NativeTool;
        tool.write(&grid("run_status", Array2::zeros((1, 1)), -9999.0), &source)
            .unwrap();

        tool.rename_dimension(&source, "Y", "y", &renamed).unwrap();

        let dataset = tool.read(&renamed).unwrap();
        assert_eq!(dataset.variables["run_status"].dims, vec!["y", "X"]);
        assert!(dataset.has_dimension("y"));
    }
}
