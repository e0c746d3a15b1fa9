use crate::{
    arrays::{ArrayBackends, ArrayError, ArrayTool, ChunkLayout, Dimension},
    batch::SplitAxis,
    scratch::ScratchFile,
};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

pub const TIME_DIMENSION: &str = "time";

/// restart and status files use the capitalised spatial dimensions
pub fn uses_capital_axis(file_name: &str) -> bool {
    file_name.contains("restart") || file_name.contains("run_status")
}

/// preferred axis name for `file_name`, the other casing is used when the file lacks it
pub fn axis_name(file_name: &str, axis: SplitAxis, dimensions: &[Dimension]) -> Result<String, ArrayError> {
    let (preferred, other) = if uses_capital_axis(file_name) {
        (axis.upper(), axis.lower())
    } else {
        (axis.lower(), axis.upper())
    };

    let has = |name: &str| dimensions.iter().any(|dimension| dimension.name == name);
    if has(preferred) {
        Ok(preferred.to_string())
    } else if has(other) {
        warn!(file = file_name, expected = preferred, found = other, "Unexpected axis casing");
        Ok(other.to_string())
    } else {
        Err(ArrayError::MissingDimension(preferred.to_string()))
    }
}

/// chunking for the merged file, status variables per cell and time series along time
pub fn layout_for(file_name: &str, dimensions: &[Dimension]) -> ChunkLayout {
    let has = |name: &str| dimensions.iter().any(|dimension| dimension.name == name);

    if uses_capital_axis(file_name) && has("Y") && has("X") {
        ChunkLayout::per_cell("Y", "X")
    } else if has(TIME_DIMENSION) && has("y") && has("x") {
        ChunkLayout::temporal(TIME_DIMENSION, "y", "x")
    } else {
        ChunkLayout::none()
    }
}

/// cells covered by one batch file
pub fn spatial_cells(dimensions: &[Dimension]) -> usize {
    let len = |names: [&str; 2]| {
        dimensions
            .iter()
            .find(|dimension| names.contains(&dimension.name.as_str()))
            .map_or(1, |dimension| dimension.len)
    };

    len(["Y", "y"]) * len(["X", "x"])
}

fn group_size(count: usize) -> usize {
    ((count as f64).sqrt().ceil() as usize).max(2)
}

/// Concatenate groups of inputs in parallel and join the intermediate files
#[instrument(skip(tool, inputs, layout), fields(count = inputs.len()), level = "debug")]
pub fn chunked(
    tool: &ArrayBackends,
    inputs: &[PathBuf],
    dim: &str,
    dst: &Path,
    layout: &ChunkLayout,
    scratch_dir: &Path,
) -> Result<(), ArrayError> {
    let size = group_size(inputs.len());
    let groups: Vec<&[PathBuf]> = inputs.chunks(size).collect();
    debug!(groups = groups.len(), size = size, "Concatenating in groups");

    let intermediates = groups
        .par_iter()
        .map(|group| {
            let scratch = ScratchFile::new(scratch_dir, ".nc");
            tool.concatenate(group, dim, &scratch, &ChunkLayout::none())?;
            Ok(scratch)
        })
        .collect::<Result<Vec<ScratchFile>, ArrayError>>()?;

    let paths: Vec<PathBuf> = intermediates.iter().map(|scratch| scratch.to_path_buf()).collect();
    tool.concatenate(&paths, dim, dst, layout)
}

/// Join every instance of one output file along the split axis
pub fn merge_file(
    tool: &ArrayBackends,
    file_name: &str,
    inputs: &[PathBuf],
    axis: SplitAxis,
    dst: &Path,
    chunked_threshold: usize,
) -> Result<(), ArrayError> {
    let (first, _) = inputs.split_first().ok_or(ArrayError::NoInputs)?;
    let dimensions = tool.dimensions(first)?;
    let dim = axis_name(file_name, axis, &dimensions)?;
    let cells = spatial_cells(&dimensions) * inputs.len();

    if cells > chunked_threshold {
        let layout = layout_for(file_name, &dimensions);
        info!(file = file_name, cells = cells, layout = ?layout, "Merging in chunks");
        let scratch_dir = dst.parent().unwrap_or_else(|| Path::new("."));
        chunked(tool, inputs, &dim, dst, &layout, scratch_dir)
    } else {
        debug!(file = file_name, cells = cells, dim = %dim, "Merging directly");
        tool.concatenate(inputs, &dim, dst, &ChunkLayout::none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrays::{dataset::tests::grid, NativeTool};
    use ndarray::Array2;
    use std::fs;

    fn dims(names: &[(&str, usize)]) -> Vec<Dimension> {
        names
            .iter()
            .map(|(name, len)| Dimension {
                name: name.to_string(),
                len: *len,
                unlimited: false,
            })
            .collect()
    }

    #[test]
    fn axis_casing_depends_on_the_file() {
        let capital = dims(&[("Y", 1), ("X", 4)]);
        let lower = dims(&[("time", 12), ("y", 1), ("x", 4)]);

        assert_eq!(axis_name("restart-eq.nc", SplitAxis::Y, &capital).unwrap(), "Y");
        assert_eq!(axis_name("GPP_monthly_tr.nc", SplitAxis::X, &lower).unwrap(), "x");
        // falls back to whatever the file has
        assert_eq!(axis_name("GPP_monthly_tr.nc", SplitAxis::Y, &capital).unwrap(), "Y");
        assert!(axis_name("run_status.nc", SplitAxis::Y, &dims(&[("time", 1)])).is_err());
    }

    #[test]
    fn chunk_layouts_follow_the_file_kind() {
        assert_eq!(
            layout_for("run_status.nc", &dims(&[("Y", 1), ("X", 4)])),
            ChunkLayout::per_cell("Y", "X")
        );
        assert_eq!(
            layout_for("GPP_monthly_tr.nc", &dims(&[("time", 12), ("y", 1), ("x", 4)])),
            ChunkLayout::temporal("time", "y", "x")
        );
        assert!(layout_for("notes.nc", &dims(&[("z", 3)])).is_empty());
    }

    #[test]
    fn chunked_and_direct_merges_agree() {
        let directory = tempfile::tempdir().unwrap();
        let tool = ArrayBackends::Native(NativeTool);

        let inputs: Vec<PathBuf> = (0..7)
            .map(|index| {
                let path = directory.path().join(format!("batch_{index}.nc"));
                let values = Array2::from_shape_fn((1, 3), |(_, x)| (index * 10 + x) as f64);
                tool.write(&grid("run_status", values, -9999.0), &path).unwrap();
                path
            })
            .collect();

        let direct = directory.path().join("direct.nc");
        let chunked = directory.path().join("merged").join("chunked.nc");
        fs::create_dir_all(chunked.parent().unwrap()).unwrap();

        merge_file(&tool, "run_status.nc", &inputs, SplitAxis::Y, &direct, 1000).unwrap();
        merge_file(&tool, "run_status.nc", &inputs, SplitAxis::Y, &chunked, 1).unwrap();

        let direct = tool.read(&direct).unwrap();
        assert_eq!(direct.dimension_len("Y"), Some(7));
        assert_eq!(direct, tool.read(&chunked).unwrap());

        // intermediates are gone
        assert_eq!(fs::read_dir(chunked.parent().unwrap()).unwrap().count(), 1);
    }
}
