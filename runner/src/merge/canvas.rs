use crate::{
    arrays::{ArrayError, ArrayTool, Dataset, Variable},
    status::STATUS_VARIABLE,
};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Outcome of reassembling one output file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CanvasSummary {
    pub extent: usize,
    pub placed: Vec<usize>,
    pub skipped: Vec<usize>,
}

/// Full size copy of `template` along `dim` where every variable spanning `dim` is filled
pub fn allocate(template: &Dataset, dim: &str, expected: usize, status_sentinel: f64) -> Result<(Dataset, usize), ArrayError> {
    let extent = template
        .dimension_len(dim)
        .ok_or_else(|| ArrayError::MissingDimension(dim.to_string()))?;
    let mut canvas = template.clone();
    canvas.set_dimension_len(dim, extent * expected);

    for (name, variable) in canvas.variables.iter_mut() {
        let Some(axis) = variable.axis_of(dim) else {
            continue;
        };

        let mut shape = variable.data.shape().to_vec();
        shape[axis] = extent * expected;
        let fill = if name == STATUS_VARIABLE {
            status_sentinel
        } else {
            variable.fill_or_default()
        };

        let mut filled = Variable::filled(variable.dims.clone(), variable.dtype, &shape, fill);
        filled.attributes = variable.attributes.clone();
        *variable = filled;
    }

    Ok((canvas, extent))
}

/// Overlay whatever batch files exist onto a sentinel filled canvas of `expected` batches
pub fn reassemble(
    tool: &dyn ArrayTool,
    instances: &[(usize, PathBuf)],
    dim: &str,
    expected: usize,
    status_sentinel: f64,
    dst: &Path,
) -> Result<CanvasSummary, ArrayError> {
    // the first readable batch file provides the structure
    let mut unreadable = Vec::new();
    let mut template = None;
    for (index, path) in instances {
        match tool.read(path) {
            Ok(dataset) => {
                template = Some(dataset);
                break;
            }
            Err(error) => {
                warn!(error = %error, path = ?path, "Failed to read batch file, leaving its region empty");
                unreadable.push(*index);
            }
        }
    }

    let template = template.ok_or(ArrayError::NoInputs)?;
    let (mut canvas, extent) = allocate(&template, dim, expected, status_sentinel)?;
    let mut summary = CanvasSummary {
        extent,
        skipped: unreadable.clone(),
        ..Default::default()
    };

    for (index, path) in instances {
        if unreadable.contains(index) {
            continue;
        }
        if *index >= expected {
            warn!(batch = index, expected = expected, "Batch index beyond the expected count, skipping");
            summary.skipped.push(*index);
            continue;
        }

        let part = match tool.read(path) {
            Ok(part) => part,
            Err(error) => {
                warn!(error = %error, path = ?path, "Failed to read batch file, leaving its region empty");
                summary.skipped.push(*index);
                continue;
            }
        };

        if part.dimension_len(dim) != Some(extent) {
            warn!(
                path = ?path,
                found = ?part.dimension_len(dim),
                expected = extent,
                "Batch file extent differs from the template, leaving its region empty"
            );
            summary.skipped.push(*index);
            continue;
        }

        let offset = index * extent;
        let mut placed = true;
        for (name, variable) in canvas.variables.iter_mut() {
            if variable.axis_of(dim).is_none() {
                continue;
            }

            match part.variable(name) {
                Ok(source) => variable.place(dim, offset, source)?,
                Err(_) => {
                    debug!(variable = %name, path = ?path, "Variable missing in batch file");
                    placed = false;
                }
            }
        }

        if placed {
            summary.placed.push(*index);
        } else {
            summary.skipped.push(*index);
        }
    }

    tool.write(&canvas, dst)?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrays::{dataset::tests::grid, NativeTool};
    use ndarray::{s, Array2, Ix2};
    use serde_json::Value;
    use std::fs;

    fn batch_file(directory: &Path, index: usize, name: &str, value: f64) -> PathBuf {
        let path = directory.join(format!("batch_{index}.nc"));
        let mut dataset = grid(name, Array2::from_elem((1, 4), value), -9999.0);
        dataset
            .attributes
            .insert("source".to_string(), Value::from(format!("batch {index}")));
        NativeTool.write(&dataset, &path).unwrap();
        path
    }

    #[test]
    fn missing_batches_stay_sentinel() {
        let directory = tempfile::tempdir().unwrap();
        let dst = directory.path().join("merged.nc");
        let instances: Vec<(usize, PathBuf)> = [1, 3]
            .into_iter()
            .map(|index| (index, batch_file(directory.path(), index, "GPP", index as f64 + 0.5)))
            .collect();

        let summary = reassemble(&NativeTool, &instances, "Y", 5, -99.0, &dst).unwrap();
        assert_eq!(summary.placed, vec![1, 3]);

        let merged = NativeTool.read(&dst).unwrap();
        assert_eq!(merged.dimension_len("Y"), Some(5));
        let data = merged
            .variable("GPP")
            .unwrap()
            .data
            .view()
            .into_dimensionality::<Ix2>()
            .unwrap();

        for row in 0..5 {
            let expected = if row == 1 || row == 3 { row as f64 + 0.5 } else { -9999.0 };
            assert!(data.slice(s![row, ..]).iter().all(|value| *value == expected), "row {row}");
        }
        // metadata comes from the first available batch
        assert_eq!(merged.attributes["source"], Value::from("batch 1"));
    }

    #[test]
    fn run_status_uses_its_own_sentinel() {
        let directory = tempfile::tempdir().unwrap();
        let dst = directory.path().join("run_status.nc");
        let instances = vec![(0, batch_file(directory.path(), 0, STATUS_VARIABLE, 100.0))];

        reassemble(&NativeTool, &instances, "Y", 3, -99.0, &dst).unwrap();

        let merged = NativeTool.read(&dst).unwrap();
        let status = merged.variable(STATUS_VARIABLE).unwrap();
        let data = status.data.view().into_dimensionality::<Ix2>().unwrap();
        assert_eq!(data.dim(), (3, 4));
        assert!(data.slice(s![0, ..]).iter().all(|value| *value == 100.0));
        assert!(data.slice(s![1.., ..]).iter().all(|value| *value == -99.0));
        assert_eq!(status.fill_value(), Some(-9999.0));
    }

    #[test]
    fn mismatched_extents_are_skipped() {
        let directory = tempfile::tempdir().unwrap();
        let first = batch_file(directory.path(), 0, "GPP", 1.0);
        let wide = directory.path().join("wide.nc");
        NativeTool
            .write(&grid("GPP", Array2::from_elem((2, 4), 7.0), -9999.0), &wide)
            .unwrap();

        let summary = reassemble(
            &NativeTool,
            &[(0, first), (1, wide), (9, directory.path().join("missing.nc"))],
            "Y",
            2,
            -99.0,
            &directory.path().join("merged.nc"),
        )
        .unwrap();

        assert_eq!(summary.placed, vec![0]);
        assert_eq!(summary.skipped, vec![1, 9]);
    }

    #[test]
    fn unreadable_leading_batch_is_not_the_template() {
        let directory = tempfile::tempdir().unwrap();
        let garbled = batch_file(directory.path(), 0, "GPP", 1.0);
        fs::write(&garbled, b"garbage").unwrap();
        let instances = vec![
            (0, garbled),
            (1, batch_file(directory.path(), 1, "GPP", 2.0)),
            (2, batch_file(directory.path(), 2, "GPP", 3.0)),
        ];
        let dst = directory.path().join("merged.nc");

        let summary = reassemble(&NativeTool, &instances, "Y", 3, -99.0, &dst).unwrap();
        assert_eq!(summary.placed, vec![1, 2]);
        assert_eq!(summary.skipped, vec![0]);

        let merged = NativeTool.read(&dst).unwrap();
        assert_eq!(merged.attributes["source"], Value::from("batch 1"));
        let data = merged
            .variable("GPP")
            .unwrap()
            .data
            .view()
            .into_dimensionality::<Ix2>()
            .unwrap()
            .to_owned();
        assert!(data.slice(s![0, ..]).iter().all(|value| *value == -9999.0));
        assert!(data.slice(s![2, ..]).iter().all(|value| *value == 3.0));
    }

    #[test]
    fn nothing_readable_is_an_error() {
        let directory = tempfile::tempdir().unwrap();
        let garbled = directory.path().join("batch_0.nc");
        fs::write(&garbled, b"garbage").unwrap();

        assert!(matches!(
            reassemble(&NativeTool, &[(0, garbled)], "Y", 2, -99.0, &directory.path().join("merged.nc")),
            Err(ArrayError::NoInputs)
        ));
    }
}
