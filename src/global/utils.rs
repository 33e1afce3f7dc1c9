use std::path::PathBuf;
use anyhow::{anyhow, Result};
use directories::ProjectDirs;

pub fn get_global_config_dir() -> Result<PathBuf> {
    let (config_dir, _) = get_global_dirs()?;
    Ok(config_dir)
}

pub fn get_global_cache_dir() -> Result<PathBuf> {
    let (_, cache_dir) = get_global_dirs()?;
    Ok(cache_dir)
}

/// Default location of the pool: `<cache dir>/pool`.
pub fn get_default_pool_root() -> Result<PathBuf> {
    Ok(get_global_cache_dir()?.join("pool"))
}

/// Default location of the config file: `<config dir>/config.toml`.
pub fn get_default_config_file() -> Result<PathBuf> {
    Ok(get_global_config_dir()?.join("config.toml"))
}

pub fn get_global_dirs() -> Result<(PathBuf, PathBuf)> {
    let proj_dirs = ProjectDirs::from("org", "venvpool", "venvpool")
        .ok_or_else(|| anyhow!("Could not get project directories"))?;

    let config_dir = proj_dirs.config_dir().to_path_buf();
    let cache_dir = proj_dirs.cache_dir().to_path_buf();

    Ok((config_dir, cache_dir))
}
