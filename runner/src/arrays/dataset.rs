use super::ArrayError;
use ndarray::{ArrayD, Axis, IxDyn, Slice, Zip};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// NetCDF default fill value for floats, used whenever a variable carries no `_FillValue`
pub const DEFAULT_FILL: f64 = 9.969209968386869e36;

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Byte,
    Ubyte,
    Short,
    Ushort,
    Int,
    Uint,
    Int64,
    Uint64,
    Float,
    Double,
}

impl DataType {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "byte" => Self::Byte,
            "ubyte" => Self::Ubyte,
            "short" => Self::Short,
            "ushort" => Self::Ushort,
            "int" => Self::Int,
            "uint" => Self::Uint,
            "int64" => Self::Int64,
            "uint64" => Self::Uint64,
            "float" => Self::Float,
            "double" => Self::Double,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Byte => "byte",
            Self::Ubyte => "ubyte",
            Self::Short => "short",
            Self::Ushort => "ushort",
            Self::Int => "int",
            Self::Uint => "uint",
            Self::Int64 => "int64",
            Self::Uint64 => "uint64",
            Self::Float => "float",
            Self::Double => "double",
        }
    }

    pub fn is_integer(&self) -> bool {
        !matches!(self, Self::Float | Self::Double)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Dimension {
    pub name: String,
    pub len: usize,
    #[serde(default)]
    pub unlimited: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Variable {
    pub dims: Vec<String>,
    pub dtype: DataType,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    pub data: ArrayD<f64>,
}

impl Variable {
    pub fn new(dims: Vec<String>, dtype: DataType, data: ArrayD<f64>) -> Self {
        Self {
            dims,
            dtype,
            attributes: BTreeMap::new(),
            data,
        }
    }

    /// a variable of the given shape where every element is `fill`
    pub fn filled(dims: Vec<String>, dtype: DataType, shape: &[usize], fill: f64) -> Self {
        Self::new(dims, dtype, ArrayD::from_elem(IxDyn(shape), fill))
    }

    pub fn axis_of(&self, dim: &str) -> Option<usize> {
        self.dims.iter().position(|name| name == dim)
    }

    pub fn fill_value(&self) -> Option<f64> {
        self.attributes
            .get("_FillValue")
            .or_else(|| self.attributes.get("missing_value"))
            .and_then(|value| match value {
                Value::Array(values) => values.first().and_then(Value::as_f64),
                value => value.as_f64(),
            })
    }

    pub fn fill_or_default(&self) -> f64 {
        self.fill_value().unwrap_or(DEFAULT_FILL)
    }

    pub fn is_fill(&self, value: f64) -> bool {
        !value.is_finite() || Some(value) == self.fill_value() || value == DEFAULT_FILL
    }

    pub fn units(&self) -> Option<&str> {
        self.attributes.get("units").and_then(Value::as_str)
    }

    /// Copy `part` into this variable at `offset` along `dim`
    pub fn place(&mut self, dim: &str, offset: usize, part: &Variable) -> Result<(), ArrayError> {
        let axis = self
            .axis_of(dim)
            .ok_or_else(|| ArrayError::MissingDimension(dim.to_string()))?;
        let own = self.data.shape();
        let other = part.data.shape();

        let compatible = own.len() == other.len()
            && own
                .iter()
                .zip(other)
                .enumerate()
                .all(|(index, (a, b))| index == axis || a == b)
            && offset + other[axis] <= own[axis];

        if !compatible {
            return Err(ArrayError::ShapeMismatch(format!(
                "cannot place {other:?} at {dim}={offset} into {own:?}"
            )));
        }

        let length = other[axis];
        self.data
            .slice_axis_mut(Axis(axis), Slice::from(offset..offset + length))
            .assign(&part.data);

        Ok(())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct Dataset {
    pub dimensions: Vec<Dimension>,
    pub variables: BTreeMap<String, Variable>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Statistic {
    Average,
    Maximum,
}

impl Statistic {
    pub fn nco_name(&self) -> &'static str {
        match self {
            Self::Average => "avg",
            Self::Maximum => "max",
        }
    }
}

impl Dataset {
    pub fn dimension_len(&self, name: &str) -> Option<usize> {
        self.dimensions
            .iter()
            .find(|dimension| dimension.name == name)
            .map(|dimension| dimension.len)
    }

    /// Variables whose shape or values are not the same in both datasets, one sided ones included
    pub fn differing_variables(&self, other: &Self) -> Vec<String> {
        let names: BTreeSet<&String> = self.variables.keys().chain(other.variables.keys()).collect();

        names
            .into_iter()
            .filter(|name| match (self.variables.get(*name), other.variables.get(*name)) {
                (Some(left), Some(right)) => {
                    left.data.shape() != right.data.shape()
                        || left
                            .data
                            .iter()
                            .zip(right.data.iter())
                            .any(|(a, b)| a != b && !(a.is_nan() && b.is_nan()))
                }
                _ => true,
            })
            .cloned()
            .collect()
    }

    pub fn has_dimension(&self, name: &str) -> bool {
        self.dimension_len(name).is_some()
    }

    pub fn set_dimension_len(&mut self, name: &str, len: usize) {
        match self.dimensions.iter_mut().find(|dimension| dimension.name == name) {
            Some(dimension) => dimension.len = len,
            None => self.dimensions.push(Dimension {
                name: name.to_string(),
                len,
                unlimited: false,
            }),
        }
    }

    pub fn variable(&self, name: &str) -> Result<&Variable, ArrayError> {
        self.variables
            .get(name)
            .ok_or_else(|| ArrayError::MissingVariable(name.to_string()))
    }

    /// Select a single index along `dim`, the dimension is kept with length 1
    pub fn isel(&self, dim: &str, index: usize) -> Result<Self, ArrayError> {
        let len = self
            .dimension_len(dim)
            .ok_or_else(|| ArrayError::MissingDimension(dim.to_string()))?;

        if index >= len {
            return Err(ArrayError::IndexOutOfRange {
                dim: dim.to_string(),
                index,
                len,
            });
        }

        let mut selected = self.clone();
        selected.set_dimension_len(dim, 1);

        for variable in selected.variables.values_mut() {
            if let Some(axis) = variable.axis_of(dim) {
                variable.data = variable
                    .data
                    .slice_axis(Axis(axis), Slice::from(index..index + 1))
                    .to_owned();
            }
        }

        Ok(selected)
    }

    pub fn rename_dimension(&mut self, from: &str, to: &str) -> Result<(), ArrayError> {
        let dimension = self
            .dimensions
            .iter_mut()
            .find(|dimension| dimension.name == from)
            .ok_or_else(|| ArrayError::MissingDimension(from.to_string()))?;
        dimension.name = to.to_string();

        for variable in self.variables.values_mut() {
            for name in variable.dims.iter_mut().filter(|name| *name == from) {
                *name = to.to_string();
            }
        }

        Ok(())
    }

    /// Concatenate datasets along `dim`, variables without `dim` are taken from the first part
    pub fn concatenate(parts: &[Dataset], dim: &str) -> Result<Self, ArrayError> {
        let (first, _) = parts.split_first().ok_or(ArrayError::NoInputs)?;
        let mut joined = first.clone();
        let mut total = 0;

        for part in parts {
            total += part
                .dimension_len(dim)
                .ok_or_else(|| ArrayError::MissingDimension(dim.to_string()))?;
        }

        joined.set_dimension_len(dim, total);

        for (name, variable) in joined.variables.iter_mut() {
            let Some(axis) = variable.axis_of(dim) else {
                continue;
            };

            let views = parts
                .iter()
                .map(|part| part.variable(name).map(|variable| variable.data.view()))
                .collect::<Result<Vec<_>, _>>()?;

            variable.data = ndarray::concatenate(Axis(axis), &views)
                .map_err(|error| ArrayError::ShapeMismatch(format!("{name}: {error}")))?;
        }

        Ok(joined)
    }

    /// Element wise statistic over all members, fill values are skipped
    pub fn ensemble(parts: &[Dataset], statistic: Statistic) -> Result<Self, ArrayError> {
        let (first, _) = parts.split_first().ok_or(ArrayError::NoInputs)?;
        let mut combined = first.clone();

        for (name, variable) in combined.variables.iter_mut() {
            let fill = variable.fill_or_default();
            let members = parts
                .iter()
                .map(|part| part.variable(name))
                .collect::<Result<Vec<_>, _>>()?;

            if let Some(member) = members
                .iter()
                .find(|member| member.data.shape() != variable.data.shape())
            {
                return Err(ArrayError::ShapeMismatch(format!(
                    "{name}: {:?} vs {:?}",
                    member.data.shape(),
                    variable.data.shape()
                )));
            }

            let mut accumulated = ArrayD::<f64>::zeros(variable.data.raw_dim());
            let mut counts = ArrayD::<f64>::zeros(variable.data.raw_dim());

            for member in &members {
                Zip::from(&mut accumulated)
                    .and(&mut counts)
                    .and(&member.data)
                    .for_each(|accumulated, count, &value| {
                        if member.is_fill(value) {
                            return;
                        }

                        *accumulated = match statistic {
                            _ if *count == 0.0 => value,
                            Statistic::Average => *accumulated + value,
                            Statistic::Maximum => accumulated.max(value),
                        };
                        *count += 1.0;
                    });
            }

            Zip::from(&mut variable.data)
                .and(&accumulated)
                .and(&counts)
                .for_each(|target, &accumulated, &count| {
                    *target = match statistic {
                        _ if count == 0.0 => fill,
                        Statistic::Average => accumulated / count,
                        Statistic::Maximum => accumulated,
                    };
                });
        }

        Ok(combined)
    }
}
