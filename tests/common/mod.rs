#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use venvpool::*;

/// Stands in for virtualenv + pip: lays out a venv-shaped tree and "installs" the
/// highest release of each requirement from a fixed index.
pub struct FakeIndex {
    releases: HashMap<String, Vec<String>>,
    pub creates: AtomicUsize,
    pub installs: AtomicUsize,
    pub fail_create: AtomicBool,
    pub fail_install: AtomicBool,
}

impl FakeIndex {
    pub fn new(releases: &[(&str, &[&str])]) -> Self {
        Self {
            releases: releases
                .iter()
                .map(|(name, versions)| {
                    (name.to_string(), versions.iter().map(|v| v.to_string()).collect())
                })
                .collect(),
            creates: AtomicUsize::new(0),
            installs: AtomicUsize::new(0),
            fail_create: AtomicBool::new(false),
            fail_install: AtomicBool::new(false),
        }
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }
}

#[cfg(windows)]
pub fn site_packages(env: &Path) -> PathBuf {
    env.join("Lib").join("site-packages")
}

#[cfg(not(windows))]
pub fn site_packages(env: &Path) -> PathBuf {
    let lib = env.join("lib");
    let interp = std::fs::read_dir(&lib).unwrap().next().unwrap().unwrap().file_name();
    lib.join(interp).join("site-packages")
}

fn release_key(v: &str) -> Vec<u64> {
    v.split('.').map(|p| p.parse().unwrap_or(0)).collect()
}

impl Tooling for FakeIndex {
    fn create(&self, path: &Path, version: &RuntimeVersion) -> std::result::Result<(), ToolError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_create.load(Ordering::SeqCst) {
            // Leave something behind, as a half-finished virtualenv would.
            std::fs::create_dir_all(path.join("bin")).unwrap();
            return Err(ToolError::Failed("python not found".to_string()));
        }
        let site = if cfg!(windows) {
            path.join("Lib").join("site-packages")
        } else {
            path.join("lib").join(version.interpreter()).join("site-packages")
        };
        std::fs::create_dir_all(&site).unwrap();
        let bin = venvpool::environment::bin_dir(path);
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("python"), b"#!/bin/sh\n").unwrap();
        std::fs::write(bin.join("activate"), b"# activate this venv\n").unwrap();
        Ok(())
    }

    fn install(&self, path: &Path, args: &[String]) -> std::result::Result<(), ToolError> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        if self.fail_install.load(Ordering::SeqCst) {
            return Err(ToolError::Failed("index unreachable".to_string()));
        }
        let site = site_packages(path);
        let mut args = args.iter();
        while let Some(arg) = args.next() {
            if arg == "-e" {
                let project = PathBuf::from(args.next().unwrap());
                let name = project.file_name().unwrap().to_string_lossy().into_owned();
                let link = format!("{}\n.\n", project.display());
                std::fs::write(site.join(format!("{name}.egg-link")), link).unwrap();
                continue;
            }
            let req = Requirement::parse(arg).map_err(|e| ToolError::Failed(e.to_string()))?;
            let Requirement::Index { name, .. } = &req else {
                // Installed somehow, but leaves nothing we can recognise.
                continue;
            };
            // Every test pool is python3.
            if req.applies_to(&RuntimeVersion::parse("3").unwrap()) == Some(false) {
                continue;
            }
            let mut candidates: Vec<&String> = self
                .releases
                .get(name)
                .into_iter()
                .flatten()
                .filter(|v| req.accepts(v) == Some(true))
                .collect();
            candidates.sort_by_key(|v| release_key(v));
            let version = candidates
                .pop()
                .ok_or_else(|| ToolError::Failed(format!("no matching distribution for {arg}")))?;
            let dist = site.join(format!("{name}-{version}.dist-info"));
            std::fs::create_dir_all(&dist).unwrap();
            let metadata = format!("Name: {name}\nVersion: {version}\n");
            std::fs::write(dist.join("METADATA"), metadata).unwrap();
            let module = site.join(name);
            std::fs::create_dir_all(&module).unwrap();
            std::fs::write(module.join("__init__.py"), format!("VERSION = '{version}'\n")).unwrap();
        }
        Ok(())
    }
}

/// Every marker counts as held: nothing is ever swept.
pub struct AlwaysHeld;

impl HoldQuery for AlwaysHeld {
    fn is_held(&self, _marker: &Path) -> io::Result<bool> {
        Ok(true)
    }
}

pub fn setup_pool(index: FakeIndex) -> (TempDir, Pool, Arc<FakeIndex>) {
    setup_pool_with(index, Arc::new(AlwaysHeld), |_| {})
}

/// A pool under a fresh temp dir that never sleeps between scans; `tune` adjusts the
/// rest of its config.
pub fn setup_pool_with(
    index: FakeIndex,
    hold: Arc<dyn HoldQuery>,
    tune: impl FnOnce(&mut PoolConfig),
) -> (TempDir, Pool, Arc<FakeIndex>) {
    let dir = TempDir::new().unwrap();
    let mut config = PoolConfig {
        initial_backoff_ms: 0,
        max_backoff_ms: 0,
        ..PoolConfig::with_root(dir.path().join("pool"))
    };
    tune(&mut config);
    let index = Arc::new(index);
    let pool = Pool::with_parts(config, index.clone(), hold);
    (dir, pool, index)
}

pub fn recipe(lines: &[&str]) -> InstallRecipe {
    InstallRecipe::parse(lines).unwrap()
}

pub fn v3() -> RuntimeVersion {
    RuntimeVersion::parse("3").unwrap()
}
