//! Offline deduplication of identical files across the pool's environments.
//!
//! Every environment that can be write-locked right now takes part; busy ones are
//! skipped. Identical files are replaced by hard links to a single copy, which is why
//! read-write acquisition has to unshare files before handing an environment out.

use std::path::PathBuf;
use serde::Serialize;
use tracing::{debug, info, warn};
use crate::environment::Environment;
use crate::error::Result;
use crate::pool::Pool;

#[derive(Serialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    /// Environments that were locked and compacted.
    pub environments: usize,
    /// Environments skipped because someone was using them.
    pub busy: usize,
    pub files_linked: usize,
    pub bytes_saved: u64,
}

/// Write locks taken for a compaction run, given back newest first.
#[derive(Default)]
struct Locked {
    envs: Vec<Environment>,
}

impl Locked {
    fn release(mut self) -> Result<()> {
        let mut first = None;
        while let Some(env) = self.envs.pop() {
            if let Err(e) = env.lock().write_unlock() {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

impl Drop for Locked {
    fn drop(&mut self) {
        while let Some(env) = self.envs.pop() {
            if let Err(e) = env.lock().write_unlock() {
                warn!("Failed to unlock {}: {}", env.path().display(), e);
            }
        }
    }
}

/// Compacts every environment of every version that isn't in use.
pub fn compact(pool: &Pool) -> Result<CompactionReport> {
    let mut locked = Locked::default();
    let mut busy = 0;
    for env in pool.all_environments()? {
        if env.lock().try_write_lock()? {
            locked.envs.push(env);
        } else {
            debug!("Busy: {}", env.path().display());
            busy += 1;
        }
    }
    info!("Compact {} venvs.", locked.envs.len());
    let roots: Vec<PathBuf> = locked.envs.iter().map(|env| env.path().to_path_buf()).collect();
    let mut report = dedupe(&roots)?;
    report.environments = roots.len();
    report.busy = busy;
    locked.release()?;
    info!("Compaction complete.");
    Ok(report)
}

#[cfg(not(unix))]
fn dedupe(roots: &[PathBuf]) -> Result<CompactionReport> {
    if !roots.is_empty() {
        warn!("Hard-link compaction is only supported on Unix, nothing linked");
    }
    Ok(CompactionReport::default())
}

/// Links identical regular files under `roots` together.
///
/// Files are candidates when they are non-empty and agree on size, device and
/// permission bits; they are grouped by SHA-256 and compared byte for byte before
/// linking. The copy that survives is the one with the most links already (then the
/// first path), so repeated runs converge and a second run changes nothing.
#[cfg(unix)]
fn dedupe(roots: &[PathBuf]) -> Result<CompactionReport> {
    use std::collections::BTreeMap;
    use crate::error::IoContext;

    let mut by_shape: BTreeMap<(u64, u64, u32), Vec<unix::Candidate>> = BTreeMap::new();
    for root in roots {
        for candidate in unix::candidates(root)? {
            by_shape.entry(candidate.shape()).or_default().push(candidate);
        }
    }

    let mut report = CompactionReport::default();
    for (_, group) in by_shape {
        if !unix::has_distinct_inodes(&group) {
            continue;
        }
        let mut by_digest: BTreeMap<String, Vec<unix::Candidate>> = BTreeMap::new();
        for candidate in group {
            let digest = unix::digest(&candidate.path).at(&candidate.path)?;
            by_digest.entry(digest).or_default().push(candidate);
        }
        for (_, mut same) in by_digest {
            if !unix::has_distinct_inodes(&same) {
                continue;
            }
            same.sort_by(|a, b| b.nlink.cmp(&a.nlink).then_with(|| a.path.cmp(&b.path)));
            let keep = same.remove(0);
            for dup in same {
                if dup.ino == keep.ino {
                    continue;
                }
                if !unix::same_content(&keep.path, &dup.path).at(&dup.path)? {
                    continue;
                }
                unix::link_over(&keep.path, &dup.path).at(&dup.path)?;
                debug!("Linked {} to {}", dup.path.display(), keep.path.display());
                report.files_linked += 1;
                report.bytes_saved += dup.len;
            }
        }
    }
    Ok(report)
}

#[cfg(unix)]
mod unix {
    use std::fs::File;
    use std::io::{self, BufRead, BufReader};
    use std::os::unix::fs::MetadataExt;
    use std::path::{Path, PathBuf};
    use sha2::{Digest, Sha256};
    use walkdir::WalkDir;
    use crate::environment::walk_error;
    use crate::error::Result;
    use crate::lock::READERS_DIR;

    pub struct Candidate {
        pub path: PathBuf,
        pub len: u64,
        pub dev: u64,
        pub ino: u64,
        pub mode: u32,
        pub nlink: u64,
    }

    impl Candidate {
        pub fn shape(&self) -> (u64, u64, u32) {
            (self.len, self.dev, self.mode)
        }
    }

    pub fn candidates(root: &Path) -> Result<Vec<Candidate>> {
        let mut found = Vec::new();
        let walker = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() != 1 || e.file_name() != READERS_DIR);
        for entry in walker {
            let entry = entry.map_err(|e| walk_error(root, e))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let meta = entry.metadata().map_err(|e| walk_error(entry.path(), e))?;
            if meta.len() == 0 {
                continue;
            }
            found.push(Candidate {
                path: entry.into_path(),
                len: meta.len(),
                dev: meta.dev(),
                ino: meta.ino(),
                mode: meta.mode() & 0o7777,
                nlink: meta.nlink(),
            });
        }
        Ok(found)
    }

    pub fn has_distinct_inodes(group: &[Candidate]) -> bool {
        group.iter().any(|c| c.ino != group[0].ino)
    }

    pub fn digest(path: &Path) -> io::Result<String> {
        let mut hasher = Sha256::new();
        io::copy(&mut File::open(path)?, &mut hasher)?;
        Ok(hex::encode(hasher.finalize()))
    }

    pub fn same_content(a: &Path, b: &Path) -> io::Result<bool> {
        let mut ra = BufReader::new(File::open(a)?);
        let mut rb = BufReader::new(File::open(b)?);
        loop {
            let ba = ra.fill_buf()?;
            let bb = rb.fill_buf()?;
            if ba.is_empty() || bb.is_empty() {
                return Ok(ba.is_empty() && bb.is_empty());
            }
            let n = ba.len().min(bb.len());
            if ba[..n] != bb[..n] {
                return Ok(false);
            }
            ra.consume(n);
            rb.consume(n);
        }
    }

    /// Atomically replaces `dup` with a hard link to `keep`.
    pub fn link_over(keep: &Path, dup: &Path) -> io::Result<()> {
        let name = dup.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let tmp = dup.with_file_name(format!(".{name}.venvpool-link"));
        match std::fs::remove_file(&tmp) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        std::fs::hard_link(keep, &tmp)?;
        std::fs::rename(&tmp, dup)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::{MetadataExt, PermissionsExt};
    use std::path::Path;
    use tempfile::tempdir;

    fn write(path: &Path, content: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn ino(path: &Path) -> u64 {
        std::fs::metadata(path).unwrap().ino()
    }

    #[test]
    fn test_identical_files_are_linked() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("venvA");
        let b = dir.path().join("venvB");
        write(&a.join("lib/six.py"), b"import sys\n");
        write(&b.join("lib/six.py"), b"import sys\n");
        write(&b.join("lib/other.py"), b"import os\n");

        let report = dedupe(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(report.files_linked, 1);
        assert_eq!(report.bytes_saved, 11);
        assert_eq!(ino(&a.join("lib/six.py")), ino(&b.join("lib/six.py")));
        assert_ne!(ino(&a.join("lib/six.py")), ino(&b.join("lib/other.py")));
    }

    #[test]
    fn test_second_run_changes_nothing() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("venvA");
        let b = dir.path().join("venvB");
        let c = dir.path().join("venvC");
        for root in [&a, &b, &c] {
            write(&root.join("bin/activate"), b"# shared\n");
        }
        let first = dedupe(&[a.clone(), b.clone(), c.clone()]).unwrap();
        assert_eq!(first.files_linked, 2);
        let inode = ino(&a.join("bin/activate"));

        let second = dedupe(&[a.clone(), b.clone(), c.clone()]).unwrap();
        assert_eq!(second.files_linked, 0);
        for root in [&a, &b, &c] {
            assert_eq!(ino(&root.join("bin/activate")), inode);
        }
    }

    #[test]
    fn test_same_size_different_content_not_linked() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("venvA");
        let b = dir.path().join("venvB");
        write(&a.join("x.py"), b"aaaa");
        write(&b.join("x.py"), b"bbbb");
        assert_eq!(dedupe(&[a, b]).unwrap().files_linked, 0);
    }

    #[test]
    fn test_empty_files_and_differing_modes_skipped() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("venvA");
        let b = dir.path().join("venvB");
        write(&a.join("__init__.py"), b"");
        write(&b.join("__init__.py"), b"");
        write(&a.join("bin/tool"), b"#!/bin/sh\n");
        write(&b.join("bin/tool"), b"#!/bin/sh\n");
        let mode = |m| std::fs::Permissions::from_mode(m);
        std::fs::set_permissions(a.join("bin/tool"), mode(0o755)).unwrap();
        std::fs::set_permissions(b.join("bin/tool"), mode(0o644)).unwrap();

        assert_eq!(dedupe(&[a, b]).unwrap().files_linked, 0);
    }
}
