use std::path::{Path, PathBuf};
use std::process::Command;
use anyhow::{bail, Context, Result};
use serde::Serialize;
use venvpool::{
    compact, InstallRecipe, InstalledPackage, Lease, LockState, Mode, Pool, PoolConfig,
    RuntimeVersion,
};
use crate::cli::{VenvpoolCommand, CLI};

const REQUIREMENTS_FILE: &str = "requirements.txt";

pub fn execute(cli: CLI) -> Result<()> {
    let mut config = PoolConfig::load().context("Could not load config")?;
    if let Some(root) = cli.root {
        config.root = root;
    }
    let pool = Pool::new(config);
    match cli.command {
        VenvpoolCommand::Run { python, requirements, with, transient, write, program, args } => {
            let mode = match (transient, write) {
                (true, _) => Mode::Transient,
                (false, true) => Mode::ReadWrite,
                (false, false) => Mode::ReadOnly,
            };
            execute_run(&pool, &python, requirements, with, mode, &program, args)
        }
        VenvpoolCommand::Launch { python, script, args } => {
            execute_launch(&pool, &python, &script, args)
        }
        VenvpoolCommand::Compact => {
            execute_compact(&pool)
        }
        VenvpoolCommand::List { json } => {
            execute_list(&pool, json)
        }
    }
}

pub fn execute_run(
    pool: &Pool,
    python: &str,
    requirements: Option<PathBuf>,
    with: Vec<String>,
    mode: Mode,
    program: &str,
    args: Vec<String>,
) -> Result<()> {
    let version = RuntimeVersion::parse(python)?;
    let mut lines: Vec<String> = match requirements {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("Could not read {}", path.display()))?
            .lines()
            .map(str::to_string)
            .collect(),
        None => Vec::new(),
    };
    lines.extend(with);
    let recipe = InstallRecipe::parse(&lines)?;

    let venv = pool.acquire(mode, &version, &recipe)?;
    let invocation = venv.invocation(program, &[] as &[PathBuf])?;
    let status = invocation
        .command(&args)
        .status()
        .with_context(|| format!("Could not run {}", invocation.program.display()))?;
    venv.release()?;
    if !status.success() {
        std::process::exit(status.code().unwrap_or(1));
    }
    Ok(())
}

/// Finds the nearest directory at or above `start` that has a requirements file.
fn find_project_dir(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(REQUIREMENTS_FILE).is_file())
        .map(Path::to_path_buf)
}

/// Dotted module name of `script` relative to `project_dir`.
fn module_name(script: &Path, project_dir: &Path) -> Result<String> {
    let relative = script
        .with_extension("")
        .strip_prefix(project_dir)
        .with_context(|| format!("{} is not inside {}", script.display(), project_dir.display()))?
        .to_path_buf();
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("."))
}

pub fn execute_launch(pool: &Pool, python: &str, script: &Path, args: Vec<String>) -> Result<()> {
    let script = std::path::absolute(script)?;
    if script.extension().and_then(|e| e.to_str()) != Some("py") {
        bail!("Not a python script: {}", script.display());
    }
    let script_dir = script.parent().context("Script has no parent directory")?;
    let project_dir = find_project_dir(script_dir)
        .with_context(|| format!("No {} found above {}", REQUIREMENTS_FILE, script.display()))?;
    let recipe = InstallRecipe::load(project_dir.join(REQUIREMENTS_FILE))?;
    let module = module_name(&script, &project_dir)?;

    let version = RuntimeVersion::parse(python)?;
    let venv = pool.acquire(Mode::ReadOnly, &version, &recipe)?;
    let invocation = venv.invocation("python", &[&project_dir])?;
    let mut cmd = invocation.command(["-m", module.as_str()]);
    cmd.args(&args);
    hand_over(cmd, venv)
}

/// Replaces this process with `cmd`. The read marker is inherited across exec and
/// keeps the environment in use until the program exits; a later sweep reclaims it.
#[cfg(unix)]
fn hand_over(mut cmd: Command, venv: Lease) -> Result<()> {
    use std::os::unix::process::CommandExt;
    let err = cmd.exec();
    drop(venv);
    Err(err).with_context(|| format!("Could not exec {}", cmd.get_program().to_string_lossy()))
}

#[cfg(not(unix))]
fn hand_over(mut cmd: Command, venv: Lease) -> Result<()> {
    let status = cmd
        .status()
        .with_context(|| format!("Could not run {}", cmd.get_program().to_string_lossy()))?;
    venv.release()?;
    if !status.success() {
        std::process::exit(status.code().unwrap_or(1));
    }
    Ok(())
}

pub fn execute_compact(pool: &Pool) -> Result<()> {
    let report = compact(pool)?;
    println!("Compacted {} environments ({} busy)", report.environments, report.busy);
    println!("  linked: {} files", report.files_linked);
    println!("  saved:  {} bytes", report.bytes_saved);
    Ok(())
}

#[derive(Serialize)]
struct EnvironmentRow {
    version: String,
    path: PathBuf,
    lock: LockState,
    packages: Vec<InstalledPackage>,
}

pub fn execute_list(pool: &Pool, json: bool) -> Result<()> {
    let mut rows = Vec::new();
    for env in pool.all_environments()? {
        rows.push(EnvironmentRow {
            version: env.version().to_string(),
            path: env.path().to_path_buf(),
            lock: env.lock().state()?,
            packages: env.installed().unwrap_or_default(),
        });
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("No environments in {}", pool.root().display());
        return Ok(());
    }
    for row in &rows {
        let lock = match row.lock {
            LockState::Unlocked => "unlocked".to_string(),
            LockState::ReadLocked(n) => format!("read-locked by {n}"),
            LockState::WriteLocked => "write-locked".to_string(),
        };
        println!("python{}: {}", row.version, row.path.display());
        println!("   {}", lock);
        for pkg in &row.packages {
            println!("   {}=={}", pkg.name, pkg.version);
        }
        println!();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_find_project_dir_walks_up() {
        let dir = tempdir().unwrap();
        let pkg = dir.path().join("proj").join("pkg");
        std::fs::create_dir_all(&pkg).unwrap();
        std::fs::write(dir.path().join("proj").join(REQUIREMENTS_FILE), "six\n").unwrap();

        assert_eq!(find_project_dir(&pkg), Some(dir.path().join("proj")));
    }

    #[test]
    fn test_module_name_is_dotted() {
        let project = Path::new("/work/proj");
        let script = project.join("pkg").join("tool.py");
        assert_eq!(module_name(&script, project).unwrap(), "pkg.tool");
    }
}
