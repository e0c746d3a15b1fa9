use serde_json::{Map, Value};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, warn};

/// All path keys of the `IO` section with their location inside a batch directory
pub const IO_PATHS: [(&str, &str); 15] = [
    ("parameter_dir", "parameters/"),
    ("output_dir", "output/"),
    ("output_spec_file", "config/output_spec.csv"),
    ("runmask_file", "input/run-mask.nc"),
    ("hist_climate_file", "input/historic-climate.nc"),
    ("proj_climate_file", "input/projected-climate.nc"),
    ("veg_class_file", "input/vegetation.nc"),
    ("drainage_file", "input/drainage.nc"),
    ("soil_texture_file", "input/soil-texture.nc"),
    ("co2_file", "input/co2.nc"),
    ("proj_co2_file", "input/projected-co2.nc"),
    ("topo_file", "input/topo.nc"),
    ("fri_fire_file", "input/fri-fire.nc"),
    ("hist_exp_fire_file", "input/historic-explicit-fire.nc"),
    ("proj_exp_fire_file", "input/projected-explicit-fire.nc"),
];

/// `IO` keys that point at an input data file
pub const INPUT_FILE_KEYS: [&str; 12] = [
    "runmask_file",
    "hist_climate_file",
    "proj_climate_file",
    "veg_class_file",
    "drainage_file",
    "soil_texture_file",
    "co2_file",
    "proj_co2_file",
    "topo_file",
    "fri_fire_file",
    "hist_exp_fire_file",
    "proj_exp_fire_file",
];

#[derive(Error, Debug)]
pub enum ModelConfigError {
    #[error("Failed to access model configuration {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Model configuration {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Model configuration has no IO section")]
    MissingIoSection,
}

/// Remove `//` line comments while leaving string contents untouched
pub fn strip_comments(content: &str) -> String {
    let mut cleaned = String::with_capacity(content.len());

    for line in content.lines() {
        let mut in_string = false;
        let mut escaped = false;
        let mut cut = line.len();
        let mut previous_slash = false;

        for (index, character) in line.char_indices() {
            if in_string {
                match character {
                    _ if escaped => escaped = false,
                    '\\' => escaped = true,
                    '"' => in_string = false,
                    _ => {}
                }
                continue;
            }

            match character {
                '"' => {
                    in_string = true;
                    previous_slash = false;
                }
                '/' if previous_slash => {
                    cut = index - 1;
                    break;
                }
                '/' => previous_slash = true,
                _ => previous_slash = false,
            }
        }

        cleaned.push_str(&line[..cut]);
        cleaned.push('\n');
    }

    cleaned
}

/// The model configuration file (`config.js`)
#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub document: Value,
}

impl ModelConfig {
    pub fn parse(content: &str, path: &Path) -> Result<Self, ModelConfigError> {
        let document = serde_json::from_str(&strip_comments(content)).map_err(|source| {
            ModelConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })?;

        Ok(Self { document })
    }

    pub fn load(path: &Path) -> Result<Self, ModelConfigError> {
        debug!(path = ?path, "Reading model configuration");
        let content = fs::read_to_string(path).map_err(|source| ModelConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&content, path)
    }

    fn io_section(&self) -> Option<&Map<String, Value>> {
        self.document.get("IO").and_then(Value::as_object)
    }

    fn io_section_mut(&mut self) -> Result<&mut Map<String, Value>, ModelConfigError> {
        self.document
            .get_mut("IO")
            .and_then(Value::as_object_mut)
            .ok_or(ModelConfigError::MissingIoSection)
    }

    pub fn io_path(&self, key: &str) -> Option<&str> {
        self.io_section()
            .and_then(|io| io.get(key))
            .and_then(Value::as_str)
    }

    pub fn set_io_path(&mut self, key: &str, value: impl Into<String>) -> Result<(), ModelConfigError> {
        self.io_section_mut()?
            .insert(key.to_string(), Value::String(value.into()));

        Ok(())
    }

    /// Point every input file key at `input_dir`, keeping the file names
    pub fn retarget_inputs(&mut self, input_dir: &Path) -> Result<(), ModelConfigError> {
        let mut prefix = input_dir.to_string_lossy().into_owned();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }

        for key in INPUT_FILE_KEYS {
            let file_name = match self.io_path(key) {
                Some(current) => current.rsplit('/').next().unwrap_or(current).to_string(),
                None => {
                    warn!(key = key, "Model configuration lacks input key, skipping");
                    continue;
                }
            };

            self.set_io_path(key, format!("{prefix}{file_name}"))?;
        }

        Ok(())
    }

    /// Only rewrite run mask and output folder, inputs stay shared
    pub fn localize_outputs(&mut self, batch_dir: &Path) -> Result<(), ModelConfigError> {
        self.set_io_path(
            "runmask_file",
            batch_dir.join("run-mask.nc").to_string_lossy(),
        )?;
        self.set_io_path("output_dir", format!("{}/", batch_dir.join("output").display()))
    }

    /// Rewrite all path keys to batch local paths
    pub fn localize(&mut self, batch_dir: &Path) -> Result<(), ModelConfigError> {
        let prefix = batch_dir.to_string_lossy();

        for (key, relative) in IO_PATHS {
            self.set_io_path(key, format!("{prefix}/{relative}"))?;
        }

        Ok(())
    }

    pub fn to_string_pretty(&self) -> String {
        // serializing a Value can't fail
        serde_json::to_string_pretty(&self.document).unwrap_or_default()
    }

    pub fn write(&self, path: &Path) -> Result<(), ModelConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ModelConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        fs::write(path, self.to_string_pretty()).map_err(|source| ModelConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
