use super::{ArrayError, ArrayTool, ChunkLayout, ChunkSize, DataType, Dataset, Dimension, Statistic, Variable};
use crate::{
    process::{capture, command},
    scratch::ScratchFile,
};
use itertools::Itertools;
use ndarray::{ArrayD, IxDyn};
use serde_json::{Map, Value};
use std::{
    collections::BTreeMap,
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, instrument, warn};

/// NetCDF backend driving the NCO command line tools
#[derive(Clone, Debug)]
pub struct NcoTool {
    pub ncks: String,
    pub ncrename: String,
    pub ncrcat: String,
    pub nces: String,
    pub ncgen: String,
}

impl Default for NcoTool {
    fn default() -> Self {
        Self {
            ncks: "ncks".to_string(),
            ncrename: "ncrename".to_string(),
            ncrcat: "ncrcat".to_string(),
            nces: "nces".to_string(),
            ncgen: "ncgen".to_string(),
        }
    }
}

fn scratch_dir(dst: &Path) -> PathBuf {
    dst.parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn flatten(value: &Value, fill: f64, into: &mut Vec<f64>) {
    match value {
        Value::Array(values) => values.iter().for_each(|value| flatten(value, fill, into)),
        Value::Number(number) => into.push(number.as_f64().unwrap_or(fill)),
        _ => into.push(fill),
    }
}

fn parse_dimensions(document: &Value) -> Vec<Dimension> {
    document
        .get("dimensions")
        .and_then(Value::as_object)
        .map(|dimensions| {
            dimensions
                .iter()
                .filter_map(|(name, len)| {
                    Some(Dimension {
                        name: name.clone(),
                        len: usize::try_from(len.as_u64()?).ok()?,
                        unlimited: false,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn object_to_map(value: Option<&Value>) -> BTreeMap<String, Value> {
    value
        .and_then(Value::as_object)
        .map(|attributes| {
            attributes
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        })
        .unwrap_or_default()
}

/// Translate the JSON dump of `ncks --jsn` into a dataset
pub(crate) fn parse_json_dump(document: &Value, path: &Path) -> Result<Dataset, ArrayError> {
    let dimensions = parse_dimensions(document);
    let mut variables = BTreeMap::new();
    let empty = Map::new();

    for (name, description) in document
        .get("variables")
        .and_then(Value::as_object)
        .unwrap_or(&empty)
    {
        let type_name = description
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("double");
        let Some(dtype) = DataType::parse(type_name) else {
            warn!(variable = %name, dtype = type_name, path = ?path, "Skipping non numeric variable");
            continue;
        };

        let dims = description
            .get("shape")
            .and_then(Value::as_array)
            .map(|shape| {
                shape
                    .iter()
                    .filter_map(|dim| dim.as_str().map(String::from))
                    .collect_vec()
            })
            .unwrap_or_default();
        let shape = dims
            .iter()
            .map(|dim| {
                dimensions
                    .iter()
                    .find(|dimension| &dimension.name == dim)
                    .map(|dimension| dimension.len)
                    .ok_or_else(|| ArrayError::MissingDimension(dim.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut variable = Variable::new(dims, dtype, ArrayD::zeros(IxDyn(&shape)));
        variable.attributes = object_to_map(description.get("attributes"));

        let mut values = Vec::with_capacity(variable.data.len());
        if let Some(data) = description.get("data") {
            flatten(data, variable.fill_or_default(), &mut values);
        }

        variable.data = ArrayD::from_shape_vec(IxDyn(&shape), values).map_err(|error| {
            ArrayError::Unsupported {
                path: path.to_path_buf(),
                reason: format!("data of {name} doesn't match its shape: {error}"),
            }
        })?;
        variables.insert(name.clone(), variable);
    }

    Ok(Dataset {
        dimensions,
        variables,
        attributes: object_to_map(document.get("attributes")),
    })
}

fn suffix(dtype: DataType) -> &'static str {
    match dtype {
        DataType::Byte => "b",
        DataType::Ubyte => "ub",
        DataType::Short => "s",
        DataType::Ushort => "us",
        DataType::Int | DataType::Double => "",
        DataType::Uint => "u",
        DataType::Int64 => "ll",
        DataType::Uint64 => "ull",
        DataType::Float => "f",
    }
}

fn format_number(value: f64, dtype: DataType) -> String {
    if dtype.is_integer() {
        format!("{}{}", value as i64, suffix(dtype))
    } else {
        format!("{value:?}{}", suffix(dtype))
    }
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn format_attribute(value: &Value, dtype: Option<DataType>) -> Option<String> {
    match value {
        Value::String(text) => Some(format!("\"{}\"", escape(text))),
        Value::Number(number) => match (dtype, number.as_i64()) {
            (Some(dtype), _) => number.as_f64().map(|value| format_number(value, dtype)),
            (None, Some(integer)) => Some(integer.to_string()),
            (None, None) => number.as_f64().map(|value| format!("{value:?}")),
        },
        Value::Array(values) => {
            let formatted = values
                .iter()
                .map(|value| format_attribute(value, dtype))
                .collect::<Option<Vec<_>>>()?;

            (!formatted.is_empty()).then(|| formatted.join(", "))
        }
        _ => None,
    }
}

/// Render a dataset as CDL text for `ncgen`
pub(crate) fn to_cdl(dataset: &Dataset) -> String {
    let mut cdl = String::from("netcdf dataset {\ndimensions:\n");

    for dimension in &dataset.dimensions {
        if dimension.unlimited {
            let _ = writeln!(cdl, "\t{} = UNLIMITED ; // ({} currently)", dimension.name, dimension.len);
        } else {
            let _ = writeln!(cdl, "\t{} = {} ;", dimension.name, dimension.len);
        }
    }

    cdl.push_str("variables:\n");
    for (name, variable) in &dataset.variables {
        if variable.dims.is_empty() {
            let _ = writeln!(cdl, "\t{} {name} ;", variable.dtype.name());
        } else {
            let _ = writeln!(
                cdl,
                "\t{} {name}({}) ;",
                variable.dtype.name(),
                variable.dims.join(", ")
            );
        }

        for (key, value) in &variable.attributes {
            // fill values have to carry the type of their variable
            let dtype = matches!(key.as_str(), "_FillValue" | "missing_value")
                .then_some(variable.dtype);

            match format_attribute(value, dtype) {
                Some(value) => {
                    let _ = writeln!(cdl, "\t\t{name}:{key} = {value} ;");
                }
                None => debug!(variable = %name, attribute = %key, "Dropping attribute without CDL form"),
            }
        }
    }

    if !dataset.attributes.is_empty() {
        cdl.push_str("\n// global attributes:\n");
        for (key, value) in &dataset.attributes {
            if let Some(value) = format_attribute(value, None) {
                let _ = writeln!(cdl, "\t\t:{key} = {value} ;");
            }
        }
    }

    cdl.push_str("data:\n");
    for (name, variable) in &dataset.variables {
        let fill = variable.fill_value();
        let values = variable
            .data
            .iter()
            .map(|&value| {
                if Some(value) == fill || !value.is_finite() {
                    "_".to_string()
                } else {
                    format_number(value, variable.dtype)
                        .trim_end_matches(char::is_alphabetic)
                        .to_string()
                }
            })
            .join(", ");

        let _ = writeln!(cdl, "\n {name} = {values} ;");
    }

    cdl.push_str("}\n");
    cdl
}

impl NcoTool {
    fn dump(&self, path: &Path, metadata_only: bool) -> Result<Value, ArrayError> {
        let mut ncks = command(&self.ncks, ["--jsn"]);
        if metadata_only {
            ncks.arg("-m");
        }
        ncks.arg(path);

        let captured = capture(&mut ncks)?;
        serde_json::from_str(&captured.stdout).map_err(|source| ArrayError::Decode {
            path: path.to_path_buf(),
            source,
        })
    }

    fn chunk_arguments(&self, inputs: &[PathBuf], layout: &ChunkLayout) -> Result<Vec<String>, ArrayError> {
        if layout.is_empty() {
            return Ok(Vec::new());
        }

        let dimensions = match inputs.first() {
            Some(first) => self.dimensions(first)?,
            None => return Err(ArrayError::NoInputs),
        };
        let mut arguments = vec!["-4".to_string(), "--cnk_plc=all".to_string()];

        for (dim, size) in &layout.chunks {
            let size = match size {
                ChunkSize::Fixed(size) => *size,
                ChunkSize::Full => match dimensions.iter().find(|dimension| &dimension.name == dim) {
                    Some(dimension) => dimension.len.max(1),
                    // hint for a dimension this file doesn't have
                    None => continue,
                },
            };

            arguments.push("--cnk_dmn".to_string());
            arguments.push(format!("{dim},{size}"));
        }

        Ok(arguments)
    }
}

impl ArrayTool for NcoTool {
    fn read(&self, path: &Path) -> Result<Dataset, ArrayError> {
        parse_json_dump(&self.dump(path, false)?, path)
    }

    fn write(&self, dataset: &Dataset, path: &Path) -> Result<(), ArrayError> {
        let cdl = ScratchFile::new(&scratch_dir(path), ".cdl");
        fs::write(cdl.path(), to_cdl(dataset)).map_err(|source| ArrayError::Io {
            path: cdl.to_path_buf(),
            source,
        })?;

        capture(
            command(&self.ncgen, ["-k", "nc4", "-o"])
                .arg(path)
                .arg(cdl.path()),
        )?;

        Ok(())
    }

    fn dimensions(&self, path: &Path) -> Result<Vec<Dimension>, ArrayError> {
        Ok(parse_dimensions(&self.dump(path, true)?))
    }

    fn subset(&self, src: &Path, dim: &str, index: usize, dst: &Path) -> Result<(), ArrayError> {
        capture(
            command(&self.ncks, ["-O", "-h", "-d"])
                .arg(format!("{dim},{index}"))
                .arg(src)
                .arg(dst),
        )?;

        Ok(())
    }

    fn rename_dimension(
        &self,
        src: &Path,
        from: &str,
        to: &str,
        dst: &Path,
    ) -> Result<(), ArrayError> {
        capture(
            command(&self.ncrename, ["-O", "-h", "-d"])
                .arg(format!("{from},{to}"))
                .arg(src)
                .arg(dst),
        )?;

        Ok(())
    }

    #[instrument(skip(self, inputs), fields(count = inputs.len()), level = "debug")]
    fn concatenate(
        &self,
        inputs: &[PathBuf],
        dim: &str,
        dst: &Path,
        layout: &ChunkLayout,
    ) -> Result<(), ArrayError> {
        if inputs.is_empty() {
            return Err(ArrayError::NoInputs);
        }

        // ncrcat only joins along the record dimension
        let scratch = scratch_dir(dst);
        let records = inputs
            .iter()
            .map(|input| {
                let record = ScratchFile::new(&scratch, ".nc");
                capture(
                    command(&self.ncks, ["-O", "-h", "--mk_rec_dmn", dim])
                        .arg(input)
                        .arg(record.path()),
                )?;

                Ok(record)
            })
            .collect::<Result<Vec<_>, ArrayError>>()?;

        let mut ncrcat = command(&self.ncrcat, ["-O", "-h"]);
        ncrcat.args(self.chunk_arguments(inputs, layout)?);
        ncrcat.args(records.iter().map(|record| record.path()));
        ncrcat.arg(dst);
        capture(&mut ncrcat)?;

        Ok(())
    }

    fn ensemble(
        &self,
        inputs: &[PathBuf],
        statistic: Statistic,
        dst: &Path,
    ) -> Result<(), ArrayError> {
        if inputs.is_empty() {
            return Err(ArrayError::NoInputs);
        }

        capture(
            command(&self.nces, ["-O", "-h", "-y", statistic.nco_name()])
                .args(inputs)
                .arg(dst),
        )?;

        Ok(())
    }
}
