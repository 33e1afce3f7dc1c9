use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, info};
use crate::error::ToolError;
use crate::recipe::RuntimeVersion;

/// The external tools that build and populate an environment.
///
/// Implementations may assume `path` is an existing, empty directory when `create`
/// is called, and an environment created by `create` when `install` is called.
pub trait Tooling: Send + Sync {
    /// Bootstraps an isolated environment at `path` from the base interpreter.
    fn create(&self, path: &Path, version: &RuntimeVersion) -> Result<(), ToolError>;

    /// Installs `args` (pip install arguments) into the environment at `path`.
    fn install(&self, path: &Path, args: &[String]) -> Result<(), ToolError>;
}

/// `virtualenv` to create, the environment's own `pip` to install.
#[derive(Debug, Clone)]
pub struct Virtualenv {
    program: String,
}

impl Virtualenv {
    /// Keeps pip from prompting for credentials through a system keyring.
    const PIP_ENV: [(&'static str, &'static str); 1] =
        [("PYTHON_KEYRING_BACKEND", "keyring.backends.null.Keyring")];

    pub fn new<S: Into<String>>(program: S) -> Self {
        Self { program: program.into() }
    }
}

impl Default for Virtualenv {
    fn default() -> Self {
        Self::new("virtualenv")
    }
}

impl Tooling for Virtualenv {
    fn create(&self, path: &Path, version: &RuntimeVersion) -> Result<(), ToolError> {
        info!("Create python{} environment: {}", version, path.display());
        // Run from a scratch dir so nothing in the caller's cwd is picked up.
        let scratch = tempfile::tempdir().map_err(|source| ToolError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let mut cmd = Command::new(&self.program);
        cmd.arg("-p").arg(version.interpreter()).arg(path).current_dir(scratch.path());
        run(cmd, &self.program)
    }

    fn install(&self, path: &Path, args: &[String]) -> Result<(), ToolError> {
        debug!("Install: {}", args.join(" "));
        let pip = crate::environment::bin_dir(path).join(exe("pip"));
        let mut cmd = Command::new(&pip);
        cmd.arg("install").args(args).envs(Self::PIP_ENV);
        run(cmd, &pip.display().to_string())
    }
}

#[cfg(windows)]
fn exe(name: &str) -> String {
    format!("{name}.exe")
}

#[cfg(not(windows))]
fn exe(name: &str) -> String {
    name.to_string()
}

/// Runs to completion with the tool's stdout sent to our stderr, keeping our stdout
/// free for the program the caller eventually runs.
fn run(mut cmd: Command, program: &str) -> Result<(), ToolError> {
    let status = cmd
        .stdout(Stdio::from(std::io::stderr()))
        .status()
        .map_err(|source| ToolError::Spawn {
            program: program.to_string(),
            source,
        })?;
    if !status.success() {
        return Err(ToolError::Status {
            program: program.to_string(),
            status,
        });
    }
    Ok(())
}
