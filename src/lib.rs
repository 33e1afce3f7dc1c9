//! # venvpool
//!
//! A pool of reusable Python virtualenvs, shared by any number of unrelated processes
//! (test runners, build tools, scripts) without a daemon. All coordination happens on
//! the filesystem, and a process that dies while holding an environment is cleaned up
//! after by the next one that needs it.
//!
//! ```no_run
//! use venvpool::{InstallRecipe, Mode, Pool, PoolConfig, RuntimeVersion};
//!
//! let pool = Pool::new(PoolConfig::load()?);
//! let recipe = InstallRecipe::parse(["pyflakes>=2.0"])?;
//! let venv = pool.acquire(Mode::ReadOnly, &RuntimeVersion::parse("3")?, &recipe)?;
//! let status = venv.invocation("pyflakes", &["."])?.command(["src"]).status()?;
//! venv.release()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Modules Overview
//! - [`lock`] – Reader/writer locking of a directory, with stale reader reclamation
//! - [`hold`] – Platform query for "is this marker file still open somewhere"
//! - [`environment`] – One virtualenv: provisioning, compatibility, program paths
//! - [`pool`] – Finding or creating a compatible environment under a lock
//! - [`compact`] – Hard-link deduplication across idle environments
//! - [`recipe`] – Runtime versions, requirements and install recipes
//! - [`tooling`] – The `virtualenv`/`pip` commands that build environments
//! - [`config`] – Pool settings
//! - [`global`] – Platform directories (config, cache)

pub mod error;
pub mod config;
pub mod hold;
pub mod lock;
pub mod recipe;
pub mod tooling;
pub mod environment;
pub mod pool;
pub mod compact;
pub mod global;

pub use error::{PoolError, Result, ToolError};
pub use config::PoolConfig;
pub use hold::{default_hold_query, HoldQuery};
pub use lock::{LockState, LockedDirectory, ReadToken};
pub use recipe::{InstallRecipe, Marker, Requirement, RuntimeVersion, Specifier};
pub use tooling::{Tooling, Virtualenv};
pub use environment::{Environment, InstalledPackage, Invocation};
pub use pool::{Lease, Mode, Pool};
pub use compact::{compact, CompactionReport};
