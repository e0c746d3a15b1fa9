use super::{io_error, Command, CommandError, Context};
use crate::{
    arrays::{ArrayBackends, ArrayError, ArrayTool},
    config::{check_executable, ConfigErrors},
    model_config::ModelConfig,
    runmask::RunMask,
    scratch::ScratchFile,
    split::slice::{INPUT_FILES, INPUT_FILES_TO_COPY, RUN_MASK_FILE},
};
use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use tracing::{debug, error, info, warn};

/// Prepare the shared work directory and the model installation
#[derive(Debug, Clone, Default)]
pub struct InitCommand;

impl Command for InitCommand {
    fn execute(&self, ctx: &Context) -> Result<(), CommandError> {
        let layout = &ctx.layout;

        for dir in [layout.work_dir.clone(), layout.batch_root.clone(), layout.log_dir()] {
            fs::create_dir_all(&dir).map_err(io_error(&dir))?;
            debug!(path = ?dir, "Created directory");
        }

        let binary = &layout.dvmdostem_bin;
        match check_executable(binary) {
            Ok(true) => debug!(path = ?binary, "Model binary is executable"),
            Ok(false) => {
                warn!(path = ?binary, "Model binary is not executable, fixing its permissions");
                let mut permissions = fs::metadata(binary).map_err(io_error(binary))?.permissions();
                permissions.set_mode(permissions.mode() | 0o111);
                fs::set_permissions(binary, permissions).map_err(io_error(binary))?;
            }
            Err(ConfigErrors::FileNotFound(path)) => warn!(
                "No model binary at {}, install dvm-dos-tem below the configured basedir",
                path.display()
            ),
            Err(error) => return Err(error.into()),
        }

        info!(
            work_dir = ?layout.work_dir,
            "The initialization is successfully completed"
        );
        Ok(())
    }
}

/// Point the global `config.js` at an input data set
#[derive(Debug, Clone)]
pub struct InputCommand {
    pub input: PathBuf,
}

impl Command for InputCommand {
    fn execute(&self, ctx: &Context) -> Result<(), CommandError> {
        let input = ctx.environment.expand(&self.input);
        if !input.is_dir() {
            return Err(CommandError::MissingDirectory(input));
        }

        let layout = &ctx.layout;
        let mut model = ModelConfig::load(&layout.config_path)?;
        model.retarget_inputs(&input)?;
        // the model expects the trailing slash on directories
        model.set_io_path("parameter_dir", format!("{}/", layout.parameters_path.display()))?;
        model.set_io_path("output_dir", format!("{}/", layout.batch_root.display()))?;
        model.set_io_path("output_spec_file", layout.output_spec_path.to_string_lossy())?;
        model.write(&layout.config_path)?;

        info!(
            config = ?layout.config_path,
            input = ?input,
            "config.js is updated according to the provided input path"
        );
        Ok(())
    }
}

/// Cut a single grid cell out of every input file
#[derive(Debug, Clone)]
pub struct ExtractCellCommand {
    pub input: PathBuf,
    pub output: PathBuf,
    pub x: usize,
    pub y: usize,
}

fn extract(tool: &ArrayBackends, src: &Path, x: usize, y: usize, dst: &Path) -> Result<(), ArrayError> {
    let scratch = ScratchFile::new(dst.parent().unwrap_or_else(|| Path::new(".")), ".nc");
    tool.subset(src, "X", x, &scratch)?;
    tool.subset(&scratch, "Y", y, dst)
}

impl Command for ExtractCellCommand {
    fn execute(&self, ctx: &Context) -> Result<(), CommandError> {
        let input = ctx.environment.expand(&self.input);
        let output = ctx.environment.expand(&self.output);
        if !input.is_dir() {
            return Err(CommandError::MissingDirectory(input));
        }

        let mask = RunMask::load(&ctx.arrays, &input.join(RUN_MASK_FILE))?;
        if self.x >= mask.x_len() || self.y >= mask.y_len() {
            return Err(CommandError::CellOutOfRange {
                x: self.x,
                y: self.y,
                x_len: mask.x_len(),
                y_len: mask.y_len(),
            });
        }

        fs::create_dir_all(&output).map_err(io_error(&output))?;

        let mut failed = 0;
        for name in INPUT_FILES {
            let src = input.join(name);
            let dst = output.join(name);

            let result = if INPUT_FILES_TO_COPY.contains(&name) {
                fs::copy(&src, &dst).map(|_| ()).map_err(io_error(&src))
            } else {
                extract(&ctx.arrays, &src, self.x, self.y, &dst).map_err(CommandError::from)
            };

            if let Err(failure) = result {
                error!(file = name, error = %failure, "Failed to extract input file");
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(CommandError::Partial {
                what: "input files",
                failed,
                total: INPUT_FILES.len(),
            });
        }

        info!(x = self.x, y = self.y, output = ?output, "Extracted cell");
        Ok(())
    }
}
