use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum FirmwareError {
    #[error("firmware path {0} has no parent directory")]
    NoSketchDir(PathBuf),
    #[error("failed to launch {tool}: {source}")]
    Launch {
        tool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{tool} exited with {status}: {stderr}")]
    ToolFailed {
        tool: String,
        status: String,
        stderr: String,
    },
}

/// Build tool that turns a sketch into firmware and flashes it.
pub trait FirmwareToolchain: Send + Sync {
    fn compile(&self, sketch_dir: &Path, fqbn: &str, output_dir: &Path) -> Result<(), FirmwareError>;
    fn upload(&self, sketch_dir: &Path, fqbn: &str, port: &str) -> Result<(), FirmwareError>;
}

/// Sketch directory for a firmware source path (`.../blink/blink.ino` -> `.../blink`).
pub fn sketch_dir(firmware_path: &Path) -> Result<PathBuf, FirmwareError> {
    firmware_path
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| FirmwareError::NoSketchDir(firmware_path.to_path_buf()))
}

#[derive(Debug, Clone)]
pub struct ArduinoCli {
    program: String,
}

impl ArduinoCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }

    fn run(&self, args: &[&str]) -> Result<(), FirmwareError> {
        info!("running {} {}", self.program, args.join(" "));
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|source| FirmwareError::Launch {
                tool: self.program.clone(),
                source,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(FirmwareError::ToolFailed {
                tool: self.program.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

impl Default for ArduinoCli {
    fn default() -> Self {
        Self::new("arduino-cli")
    }
}

impl FirmwareToolchain for ArduinoCli {
    fn compile(&self, sketch_dir: &Path, fqbn: &str, output_dir: &Path) -> Result<(), FirmwareError> {
        let sketch = sketch_dir.to_string_lossy();
        let output = output_dir.to_string_lossy();
        self.run(&["compile", "--fqbn", fqbn, "--output-dir", &output, &sketch])
    }

    fn upload(&self, sketch_dir: &Path, fqbn: &str, port: &str) -> Result<(), FirmwareError> {
        let sketch = sketch_dir.to_string_lossy();
        self.run(&["upload", "--fqbn", fqbn, "--port", port, "--input-dir", &sketch, &sketch])
    }
}
