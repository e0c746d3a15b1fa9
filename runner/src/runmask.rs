use crate::arrays::{ArrayError, ArrayTool, Dataset, Variable};
use ndarray::{Array2, Ix2};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub const RUN_VARIABLE: &str = "run";

#[derive(Error, Debug)]
pub enum RunMaskError {
    #[error(transparent)]
    Array(#[from] ArrayError),
    #[error("Run mask variable must have the dimensions (Y, X), found {0:?}")]
    Layout(Vec<String>),
    #[error("Run mask has no enabled cell")]
    Empty,
    #[error("Cell {cell} is outside of the {y_len}x{x_len} grid")]
    OutOfRange { cell: Cell, y_len: usize, x_len: usize },
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cell {
    pub y: usize,
    pub x: usize,
}

impl std::fmt::Display for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(Y={}, X={})", self.y, self.x)
    }
}

/// Boolean grid of the cells the model should run
#[derive(Clone, Debug)]
pub struct RunMask {
    pub grid: Array2<bool>,
    // the dataset the mask was read from, kept so batch copies stay structurally identical
    source: Dataset,
}

impl RunMask {
    pub fn from_dataset(source: Dataset) -> Result<Self, RunMaskError> {
        let variable = source.variable(RUN_VARIABLE)?;

        if variable.dims != ["Y", "X"] {
            return Err(RunMaskError::Layout(variable.dims.clone()));
        }

        let values = variable
            .data
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|error| ArrayError::ShapeMismatch(error.to_string()))?;
        let grid = values.mapv(|value| value.is_finite() && value != 0.0 && !variable.is_fill(value));

        Ok(Self { grid, source })
    }

    pub fn load(tool: &dyn ArrayTool, path: &Path) -> Result<Self, RunMaskError> {
        let mask = Self::from_dataset(tool.read(path)?)?;

        if mask.count() == 0 {
            return Err(RunMaskError::Empty);
        }

        Ok(mask)
    }

    pub fn y_len(&self) -> usize {
        self.grid.nrows()
    }

    pub fn x_len(&self) -> usize {
        self.grid.ncols()
    }

    pub fn count(&self) -> usize {
        self.grid.iter().filter(|enabled| **enabled).count()
    }

    /// enabled cells in row major order
    pub fn enabled_cells(&self) -> Vec<Cell> {
        self.grid
            .indexed_iter()
            .filter(|(_, enabled)| **enabled)
            .map(|((y, x), _)| Cell { y, x })
            .collect()
    }

    pub fn is_enabled(&self, cell: Cell) -> bool {
        self.grid.get((cell.y, cell.x)).copied().unwrap_or(false)
    }

    /// copy of the mask with every cell disabled
    pub fn zeroed(&self) -> Self {
        Self {
            grid: Array2::from_elem(self.grid.raw_dim(), false),
            source: self.source.clone(),
        }
    }

    pub fn enable(&mut self, cell: Cell) -> Result<(), RunMaskError> {
        let (y_len, x_len) = self.grid.dim();

        match self.grid.get_mut((cell.y, cell.x)) {
            Some(enabled) => {
                *enabled = true;
                Ok(())
            }
            None => Err(RunMaskError::OutOfRange { cell, y_len, x_len }),
        }
    }

    pub fn to_dataset(&self) -> Result<Dataset, RunMaskError> {
        let mut dataset = self.source.clone();
        let template = self.source.variable(RUN_VARIABLE)?;
        let mut run = Variable::new(
            template.dims.clone(),
            template.dtype,
            self.grid.mapv(|enabled| if enabled { 1.0 } else { 0.0 }).into_dyn(),
        );
        run.attributes = template.attributes.clone();
        dataset.variables.insert(RUN_VARIABLE.to_string(), run);

        Ok(dataset)
    }

    pub fn write(&self, tool: &dyn ArrayTool, path: &Path) -> Result<(), RunMaskError> {
        Ok(tool.write(&self.to_dataset()?, path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrays::dataset::tests::grid;

    fn mask(values: Array2<f64>) -> RunMask {
        RunMask::from_dataset(grid(RUN_VARIABLE, values, -9999.0)).unwrap()
    }

    #[test]
    fn enabled_cells_are_row_major() {
        let mask = mask(Array2::from_shape_vec((2, 3), vec![0.0, 1.0, 1.0, 1.0, 0.0, 1.0]).unwrap());

        assert_eq!(mask.count(), 4);
        assert_eq!(
            mask.enabled_cells(),
            vec![
                Cell { y: 0, x: 1 },
                Cell { y: 0, x: 2 },
                Cell { y: 1, x: 0 },
                Cell { y: 1, x: 2 },
            ]
        );
    }

    #[test]
    fn zeroed_copy_is_reenabled_selectively() {
        let full = mask(Array2::ones((3, 3)));
        let mut batch = full.zeroed();

        assert_eq!(batch.count(), 0);
        batch.enable(Cell { y: 2, x: 1 }).unwrap();
        assert_eq!(batch.enabled_cells(), vec![Cell { y: 2, x: 1 }]);
        assert!(matches!(
            batch.enable(Cell { y: 3, x: 0 }),
            Err(RunMaskError::OutOfRange { .. })
        ));

        let dataset = batch.to_dataset().unwrap();
        assert_eq!(dataset.variables[RUN_VARIABLE].data[[2, 1]], 1.0);
        assert_eq!(dataset.variables[RUN_VARIABLE].data[[0, 0]], 0.0);
    }

    #[test]
    fn fill_values_are_disabled() {
        let mask = mask(Array2::from_shape_vec((1, 2), vec![-9999.0, 1.0]).unwrap());

        assert_eq!(mask.enabled_cells(), vec![Cell { y: 0, x: 1 }]);
    }
}
