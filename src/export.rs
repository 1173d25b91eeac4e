use std::io;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("export command is empty")]
    EmptyCommand,
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// Something that publishes a freshly written snapshot (plots, uploads, ...).
pub trait ExportHook {
    fn export(&mut self, snapshot: &Path) -> Result<(), ExportError>;
}

impl<F> ExportHook for F
where
    F: FnMut(&Path) -> Result<(), ExportError>,
{
    fn export(&mut self, snapshot: &Path) -> Result<(), ExportError> {
        self(snapshot)
    }
}

/// Runs an external program with the snapshot path as its final argument.
#[derive(Debug, Clone)]
pub struct CommandExporter {
    program: String,
    args: Vec<String>,
}

impl CommandExporter {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from an argv list such as `["./teleop_plotter.py", "--upload"]`.
    pub fn from_argv(argv: &[String]) -> Result<Self, ExportError> {
        let (program, args) = argv.split_first().ok_or(ExportError::EmptyCommand)?;
        Ok(Self::new(program.clone(), args.to_vec()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl ExportHook for CommandExporter {
    fn export(&mut self, snapshot: &Path) -> Result<(), ExportError> {
        debug!(program = %self.program, snapshot = %snapshot.display(), "running export");

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(snapshot)
            .output()
            .map_err(|source| ExportError::Launch {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ExportError::Failed {
                program: self.program.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!(program = %self.program, "export finished");
        Ok(())
    }
}
