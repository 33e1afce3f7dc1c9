//! Hands out environments from the pool under one of three modes.
//!
//! Nothing here blocks on another process: a busy environment is simply skipped, and
//! when no existing environment fits, a new one is provisioned.

use std::fmt;
use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use crate::config::PoolConfig;
use crate::environment::Environment;
use crate::error::{IoContext, PoolError, Result};
use crate::hold::{default_hold_query, HoldQuery};
use crate::lock::ReadToken;
use crate::recipe::{InstallRecipe, RuntimeVersion};
use crate::tooling::{Tooling, Virtualenv};

const ENV_PREFIX: &str = "venv";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// A private environment, deleted on release.
    Transient,
    /// A shared environment that must not be modified.
    ReadOnly,
    /// An exclusive environment the caller may modify; it goes back to the pool on release.
    ReadWrite,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Transient => "transient",
            Mode::ReadOnly => "read-only",
            Mode::ReadWrite => "read-write",
        })
    }
}

/// A lock that can be tried on an environment without waiting.
trait Claim: Sized {
    fn try_claim(env: &Environment) -> Result<Option<Self>>;
    fn give_back(self, env: &Environment) -> Result<()>;
}

impl Claim for ReadToken {
    fn try_claim(env: &Environment) -> Result<Option<Self>> {
        env.lock().try_read_lock()
    }

    fn give_back(self, env: &Environment) -> Result<()> {
        env.lock().unlock(self)
    }
}

struct WriteClaim;

impl Claim for WriteClaim {
    fn try_claim(env: &Environment) -> Result<Option<Self>> {
        Ok(env.lock().try_write_lock()?.then_some(WriteClaim))
    }

    fn give_back(self, env: &Environment) -> Result<()> {
        env.lock().write_unlock()
    }
}

enum Release {
    Delete,
    ReadUnlock(ReadToken),
    WriteUnlock,
}

/// An environment on loan from the pool. Released when dropped.
///
/// Use [`Lease::release`] to observe release errors; on drop they can only be logged.
pub struct Lease {
    env: Environment,
    mode: Mode,
    release: Option<Release>,
}

impl Lease {
    fn new(env: Environment, mode: Mode, release: Release) -> Self {
        Self {
            env,
            mode,
            release: Some(release),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    pub fn release(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        match self.release.take() {
            None => Ok(()),
            Some(Release::Delete) => self.env.delete(),
            Some(Release::ReadUnlock(token)) => self.env.lock().unlock(token),
            Some(Release::WriteUnlock) => self.env.lock().write_unlock(),
        }
    }
}

impl Deref for Lease {
    type Target = Environment;

    fn deref(&self) -> &Environment {
        &self.env
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!(
                "Failed to release {} environment {}: {}",
                self.mode,
                self.env.path().display(),
                e
            );
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("env", &self.env)
            .field("mode", &self.mode)
            .field("released", &self.release.is_none())
            .finish()
    }
}

/// The pool: one directory per runtime version, one directory per environment.
#[derive(Clone)]
pub struct Pool {
    config: PoolConfig,
    tooling: Arc<dyn Tooling>,
    hold: Arc<dyn HoldQuery>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool").field("config", &self.config).finish()
    }
}

impl Pool {
    /// A pool that provisions with `virtualenv` and detects stale readers the
    /// platform's way.
    pub fn new(config: PoolConfig) -> Self {
        let tooling = Arc::new(Virtualenv::new(config.virtualenv.clone()));
        Self::with_parts(config, tooling, Arc::from(default_hold_query()))
    }

    pub fn with_parts(
        config: PoolConfig,
        tooling: Arc<dyn Tooling>,
        hold: Arc<dyn HoldQuery>,
    ) -> Self {
        Self { config, tooling, hold }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn version_dir(&self, version: &RuntimeVersion) -> PathBuf {
        self.config.root.join(version.as_str())
    }

    /// Runtime versions that have a directory in the pool.
    pub fn versions(&self) -> Result<Vec<RuntimeVersion>> {
        Ok(list_dirs(&self.config.root)?
            .into_iter()
            .filter_map(|dir| {
                let name = dir.file_name()?.to_str()?;
                RuntimeVersion::parse(name).ok()
            })
            .collect())
    }

    /// Environments of one version, sorted by path, whatever their lock state.
    pub fn environments(&self, version: &RuntimeVersion) -> Result<Vec<Environment>> {
        Ok(list_dirs(&self.version_dir(version))?
            .into_iter()
            .map(|path| {
                Environment::open(path, version.clone(), self.tooling.clone(), self.hold.clone())
            })
            .collect())
    }

    /// Environments of every version.
    pub fn all_environments(&self) -> Result<Vec<Environment>> {
        let mut all = Vec::new();
        for version in self.versions()? {
            all.extend(self.environments(&version)?);
        }
        Ok(all)
    }

    /// Finds or creates an environment for `recipe` and locks it according to `mode`.
    ///
    /// # Errors
    /// - [`PoolError::Provision`] / [`PoolError::Install`] when a new environment
    ///   can't be built (it is deleted again first);
    /// - [`PoolError::Unsatisfiable`] when read-only acquisition provisioned
    ///   `max_provision_attempts` environments without one ever satisfying the recipe;
    /// - [`PoolError::LockState`] / [`PoolError::Io`] from the lock primitives.
    pub fn acquire(
        &self,
        mode: Mode,
        version: &RuntimeVersion,
        recipe: &InstallRecipe,
    ) -> Result<Lease> {
        match mode {
            Mode::Transient => self.transient(version, recipe),
            Mode::ReadOnly => self.read_only(version, recipe),
            Mode::ReadWrite => self.read_write(version, recipe),
        }
    }

    fn transient(&self, version: &RuntimeVersion, recipe: &InstallRecipe) -> Result<Lease> {
        let env = self.new_environment(version, recipe)?;
        Ok(Lease::new(env, Mode::Transient, Release::Delete))
    }

    fn read_only(&self, version: &RuntimeVersion, recipe: &InstallRecipe) -> Result<Lease> {
        let mut provisioned = 0;
        for pass in 0u32.. {
            std::thread::sleep(self.config.backoff(pass));
            if let Some((env, token)) = self.find_compatible::<ReadToken>(version, recipe)? {
                return Ok(Lease::new(env, Mode::ReadOnly, Release::ReadUnlock(token)));
            }
            if provisioned >= self.config.max_provision_attempts {
                break;
            }
            let env = self.new_environment(version, recipe)?;
            provisioned += 1;
            if !env.is_compatible(recipe) {
                // A fresh install that doesn't satisfy the recipe never will, and
                // nobody else would pick it either.
                if let Err(e) = env.delete() {
                    warn!("Failed to delete unusable environment {}: {}", env.path().display(), e);
                }
                break;
            }
            // Publish it; the next pass competes for it like for any other.
            env.lock().write_unlock()?;
        }
        Err(PoolError::Unsatisfiable {
            version: version.to_string(),
            recipe: recipe.to_string(),
            attempts: provisioned,
        })
    }

    fn read_write(&self, version: &RuntimeVersion, recipe: &InstallRecipe) -> Result<Lease> {
        let env = match self.find_compatible::<WriteClaim>(version, recipe)? {
            Some((env, WriteClaim)) => {
                // Compaction may have linked files to other environments.
                if let Err(e) = env.unshare_files() {
                    if let Err(unlock) = env.lock().write_unlock() {
                        warn!("Failed to unlock {}: {}", env.path().display(), unlock);
                    }
                    return Err(e);
                }
                env
            }
            None => self.new_environment(version, recipe)?,
        };
        Ok(Lease::new(env, Mode::ReadWrite, Release::WriteUnlock))
    }

    fn find_compatible<C: Claim>(
        &self,
        version: &RuntimeVersion,
        recipe: &InstallRecipe,
    ) -> Result<Option<(Environment, C)>> {
        for env in self.environments(version)? {
            let Some(claim) = C::try_claim(&env)? else {
                debug!("Busy: {}", env.path().display());
                continue;
            };
            if env.is_compatible(recipe) {
                return Ok(Some((env, claim)));
            }
            claim.give_back(&env)?;
        }
        Ok(None)
    }

    /// Provisions and installs a new environment. It is born write-locked, as its
    /// `readers` dir doesn't exist yet. On failure it is deleted again.
    fn new_environment(
        &self,
        version: &RuntimeVersion,
        recipe: &InstallRecipe,
    ) -> Result<Environment> {
        let dir = self.version_dir(version);
        std::fs::create_dir_all(&dir).at(&dir)?;
        let path = tempfile::Builder::new()
            .prefix(ENV_PREFIX)
            .tempdir_in(&dir)
            .at(&dir)?
            .keep();
        info!("Provision python{} environment for {}: {}", version, recipe, path.display());
        let built =
            Environment::provision(&path, version.clone(), self.tooling.clone(), self.hold.clone())
                .and_then(|env| env.install_recipe(recipe).map(|()| env));
        if built.is_err() {
            match std::fs::remove_dir_all(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to delete partial environment {}: {}", path.display(), e),
            }
        }
        built
    }
}

fn list_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(PoolError::io(dir, e)),
    };
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.at(dir)?;
        if entry.file_type().at(entry.path())?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}
