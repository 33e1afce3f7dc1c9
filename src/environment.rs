use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use serde::Serialize;
use tracing::debug;
use walkdir::WalkDir;
use crate::error::{IoContext, PoolError, Result};
use crate::hold::HoldQuery;
use crate::lock::{LockedDirectory, READERS_DIR};
use crate::recipe::{canonical_name, InstallRecipe, Requirement, RuntimeVersion};
use crate::tooling::Tooling;

/// Directory holding the environment's executables.
#[cfg(windows)]
pub fn bin_dir(env: &Path) -> PathBuf {
    env.join("Scripts")
}

#[cfg(not(windows))]
pub fn bin_dir(env: &Path) -> PathBuf {
    env.join("bin")
}

/// A distribution found in the environment's site-packages.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
}

impl InstalledPackage {
    /// Parses `<name>-<version>.dist-info` or `<name>-<version>[-pyX.Y].egg-info`.
    fn from_metadata_dir(file_name: &str) -> Option<InstalledPackage> {
        let stem = file_name
            .strip_suffix(".dist-info")
            .or_else(|| file_name.strip_suffix(".egg-info"))?;
        let (name, rest) = stem.split_once('-')?;
        let version = rest.split('-').next()?;
        if name.is_empty() || version.is_empty() {
            return None;
        }
        Some(InstalledPackage {
            name: name.to_string(),
            version: version.to_string(),
        })
    }
}

/// Resolved program plus the variables to overlay on the caller's environment.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: PathBuf,
    pub overlay: Vec<(String, OsString)>,
}

impl Invocation {
    pub fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Command::new(&self.program);
        cmd.args(args).envs(self.overlay.iter().map(|(k, v)| (k, v)));
        cmd
    }
}

/// One virtualenv in the pool.
#[derive(Clone)]
pub struct Environment {
    path: PathBuf,
    version: RuntimeVersion,
    lock: LockedDirectory,
    tooling: Arc<dyn Tooling>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("path", &self.path)
            .field("version", &self.version)
            .finish()
    }
}

impl Environment {
    /// Wraps an environment directory that already exists on disk.
    pub fn open<P: AsRef<Path>>(
        path: P,
        version: RuntimeVersion,
        tooling: Arc<dyn Tooling>,
        hold: Arc<dyn HoldQuery>,
    ) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            lock: LockedDirectory::new(&path, hold),
            path,
            version,
            tooling,
        }
    }

    /// Bootstraps a fresh environment in the (empty, write-locked) directory `path`.
    ///
    /// # Errors
    /// [`PoolError::Provision`] when the tooling fails. The directory is left as is;
    /// cleaning it up is the caller's job.
    pub fn provision<P: AsRef<Path>>(
        path: P,
        version: RuntimeVersion,
        tooling: Arc<dyn Tooling>,
        hold: Arc<dyn HoldQuery>,
    ) -> Result<Self> {
        let env = Self::open(path, version, tooling, hold);
        env.tooling
            .create(&env.path, &env.version)
            .map_err(|source| PoolError::Provision {
                path: env.path.clone(),
                source,
            })?;
        Ok(env)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> &RuntimeVersion {
        &self.version
    }

    pub fn lock(&self) -> &LockedDirectory {
        &self.lock
    }

    /// Installs the recipe on top of whatever is already there. Never uninstalls.
    pub fn install_recipe(&self, recipe: &InstallRecipe) -> Result<()> {
        let args = recipe.install_args();
        if args.is_empty() {
            return Ok(());
        }
        self.tooling
            .install(&self.path, &args)
            .map_err(|source| PoolError::Install {
                path: self.path.clone(),
                source,
            })
    }

    #[cfg(windows)]
    pub fn site_packages(&self) -> Result<PathBuf> {
        Ok(self.path.join("Lib").join("site-packages"))
    }

    /// `lib/<pythonX.Y>/site-packages`; the `lib` dir must hold exactly one interpreter.
    #[cfg(not(windows))]
    pub fn site_packages(&self) -> Result<PathBuf> {
        let lib = self.path.join("lib");
        let mut names = std::fs::read_dir(&lib)
            .at(&lib)?
            .map(|entry| entry.map(|e| e.file_name()))
            .collect::<io::Result<Vec<_>>>()
            .at(&lib)?;
        if names.len() != 1 {
            return Err(PoolError::io(
                &lib,
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("expected one interpreter dir, found {}", names.len()),
                ),
            ));
        }
        Ok(lib.join(names.remove(0)).join("site-packages"))
    }

    /// Distributions currently installed, in directory order.
    pub fn installed(&self) -> Result<Vec<InstalledPackage>> {
        let site = self.site_packages()?;
        let mut packages = Vec::new();
        for entry in std::fs::read_dir(&site).at(&site)? {
            let entry = entry.at(&site)?;
            let file_name = entry.file_name();
            if let Some(pkg) = file_name.to_str().and_then(InstalledPackage::from_metadata_dir) {
                packages.push(pkg);
            }
        }
        Ok(packages)
    }

    /// True iff every requirement is already satisfied here.
    ///
    /// Anything that can't be judged with confidence counts as unsatisfied, so the
    /// caller provisions a fresh environment rather than reusing a doubtful one.
    pub fn is_compatible(&self, recipe: &InstallRecipe) -> bool {
        let installed = match self.installed() {
            Ok(installed) => installed,
            Err(e) => {
                debug!("Unreadable environment {}: {}", self.path.display(), e);
                return false;
            }
        };
        for req in recipe.requirements() {
            let satisfied = match req {
                Requirement::Index { name, .. } => match req.applies_to(&self.version) {
                    // pip skips it for this interpreter, so there is nothing to check.
                    Some(false) => true,
                    None => false,
                    Some(true) => {
                        let wanted = canonical_name(name);
                        installed
                            .iter()
                            .find(|p| canonical_name(&p.name) == wanted)
                            .and_then(|p| req.accepts(&p.version))
                            .unwrap_or(false)
                    }
                },
                Requirement::Local { name, path } => self.links_to(name, path),
                Requirement::Opaque(_) => false,
            };
            if !satisfied {
                return false;
            }
        }
        debug!("Found compatible venv: {}", self.path.display());
        true
    }

    /// Whether the project `name` is installed in editable mode from `project`.
    fn links_to(&self, name: &str, project: &Path) -> bool {
        let Ok(site) = self.site_packages() else {
            return false;
        };
        let Ok(entries) = std::fs::read_dir(&site) else {
            return false;
        };
        let wanted = canonical_name(name);
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(stem) = file_name.to_str().and_then(|n| n.strip_suffix(".egg-link")) else {
                continue;
            };
            if canonical_name(stem) != wanted {
                continue;
            }
            // First line is the project dir, assumed absolute.
            return std::fs::read_to_string(entry.path())
                .ok()
                .and_then(|content| content.lines().next().map(|l| PathBuf::from(l.trim())))
                .is_some_and(|linked| linked == project);
        }
        false
    }

    /// Path of an executable inside the environment. Does not check that it exists.
    pub fn program_path(&self, name: &str) -> PathBuf {
        #[cfg(windows)]
        let name = if Path::new(name).extension().is_none() {
            format!("{name}.exe")
        } else {
            name.to_string()
        };
        bin_dir(&self.path).join(name)
    }

    /// What a caller needs to run `program` inside this environment: its path, plus
    /// `PATH`, `VIRTUAL_ENV` and `PYTHONPATH` (prefixed with `project_paths`).
    pub fn invocation<P: AsRef<Path>>(
        &self,
        program: &str,
        project_paths: &[P],
    ) -> Result<Invocation> {
        let path_var = prepend(std::iter::once(bin_dir(&self.path)), "PATH").at(&self.path)?;
        let mut overlay = vec![
            ("VIRTUAL_ENV".to_string(), self.path.clone().into_os_string()),
            ("PATH".to_string(), path_var),
        ];
        if !project_paths.is_empty() {
            let paths = project_paths.iter().map(|p| p.as_ref().to_path_buf());
            overlay.push(("PYTHONPATH".to_string(), prepend(paths, "PYTHONPATH").at(&self.path)?));
        }
        Ok(Invocation {
            program: self.program_path(program),
            overlay,
        })
    }

    /// Replaces every file whose storage is shared with another path by a private
    /// copy, so writing to it can't leak into a sibling environment.
    /// Returns how many files were copied.
    ///
    /// Only call this under the write lock.
    pub fn unshare_files(&self) -> Result<usize> {
        let mut copied = 0;
        let walker = WalkDir::new(&self.path)
            .into_iter()
            .filter_entry(|e| e.depth() != 1 || e.file_name() != READERS_DIR);
        for entry in walker {
            let entry = entry.map_err(|e| walk_error(&self.path, e))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let meta = entry.metadata().map_err(|e| walk_error(entry.path(), e))?;
            if link_count(&meta) == 1 {
                continue;
            }
            unshare(entry.path(), &meta)?;
            copied += 1;
        }
        if copied > 0 {
            debug!("Unshared {} files in: {}", copied, self.path.display());
        }
        Ok(copied)
    }

    /// Removes the whole environment from disk.
    pub fn delete(&self) -> Result<()> {
        debug!("Delete venv: {}", self.path.display());
        std::fs::remove_dir_all(&self.path).at(&self.path)
    }
}

fn prepend<I: IntoIterator<Item = PathBuf>>(head: I, var: &str) -> io::Result<OsString> {
    let current = std::env::var_os(var).unwrap_or_default();
    let tail = std::env::split_paths(&current).filter(|p| !p.as_os_str().is_empty());
    std::env::join_paths(head.into_iter().chain(tail))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn unshare(path: &Path, meta: &std::fs::Metadata) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let tmp = tempfile::NamedTempFile::new_in(dir).at(dir)?;
    std::fs::copy(path, tmp.path()).at(path)?;
    if let Ok(modified) = meta.modified() {
        tmp.as_file().set_modified(modified).at(tmp.path())?;
    }
    tmp.persist(path).map_err(|e| PoolError::io(path, e.error))?;
    Ok(())
}

pub(crate) fn walk_error(path: &Path, e: walkdir::Error) -> PoolError {
    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| path.to_path_buf());
    let source = e.into_io_error().unwrap_or_else(|| io::Error::other("filesystem loop"));
    PoolError::io(path, source)
}

#[cfg(unix)]
pub(crate) fn link_count(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.nlink()
}

/// Without a portable link count, every file is treated as private. The compactor
/// never links on these platforms, so nothing can be shared.
#[cfg(not(unix))]
pub(crate) fn link_count(_meta: &std::fs::Metadata) -> u64 {
    1
}
