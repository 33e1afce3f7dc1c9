//! Answers "does any live process still hold this marker file open?".
//!
//! This is the only platform-specific piece of the locking protocol. A reader marker
//! that nobody holds open belongs to a process that died without unlocking, so the
//! sweep may delete it.

use std::io;
use std::path::Path;

pub trait HoldQuery: Send + Sync {
    fn is_held(&self, marker: &Path) -> io::Result<bool>;
}

/// Scans `/proc/<pid>/fd` of every visible process for a descriptor on the marker.
///
/// Processes whose descriptor table can't be read (other users, or already exited)
/// are skipped.
#[cfg(target_os = "linux")]
pub struct ProcFdScan;

#[cfg(target_os = "linux")]
impl HoldQuery for ProcFdScan {
    fn is_held(&self, marker: &Path) -> io::Result<bool> {
        let marker = match std::fs::canonicalize(marker) {
            Ok(path) => path,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        for entry in std::fs::read_dir("/proc")? {
            let entry = entry?;
            let is_pid = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.bytes().all(|b| b.is_ascii_digit()));
            if !is_pid {
                continue;
            }
            let fds = match std::fs::read_dir(entry.path().join("fd")) {
                Ok(fds) => fds,
                Err(_) => continue,
            };
            for fd in fds.flatten() {
                if std::fs::read_link(fd.path()).is_ok_and(|target| target == marker) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

/// Asks `lsof -t <marker>`; any pid on stdout means the marker is held.
///
/// lsof exits non-zero both when nothing holds the file and on real failures, so
/// stderr rather than the exit code tells the two apart.
#[cfg(unix)]
pub struct Lsof;

#[cfg(unix)]
impl HoldQuery for Lsof {
    fn is_held(&self, marker: &Path) -> io::Result<bool> {
        let output = std::process::Command::new("lsof").arg("-t").arg(marker).output()?;
        if !output.stdout.is_empty() {
            return Ok(true);
        }
        if !output.stderr.is_empty() {
            return Err(io::Error::other(format!(
                "lsof failed on {}: {}",
                marker.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(false)
    }
}

/// Windows refuses to delete a file that is open, so attempting the delete is the query.
/// A successful probe leaves the marker already removed.
#[cfg(windows)]
pub struct RemovalProbe;

#[cfg(windows)]
impl HoldQuery for RemovalProbe {
    fn is_held(&self, marker: &Path) -> io::Result<bool> {
        match std::fs::remove_file(marker) {
            Ok(()) => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => Ok(true),
            Err(e) => Err(e),
        }
    }
}

/// The best query available on this platform.
pub fn default_hold_query() -> Box<dyn HoldQuery> {
    #[cfg(target_os = "linux")]
    {
        Box::new(ProcFdScan)
    }
    #[cfg(all(unix, not(target_os = "linux")))]
    {
        Box::new(Lsof)
    }
    #[cfg(windows)]
    {
        Box::new(RemovalProbe)
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_file_is_held() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lock1");
        let file = std::fs::File::create(&path).unwrap();
        assert!(ProcFdScan.is_held(&path).unwrap());
        drop(file);
        assert!(!ProcFdScan.is_held(&path).unwrap());
    }

    #[test]
    fn test_missing_file_is_not_held() {
        let dir = tempdir().unwrap();
        assert!(!ProcFdScan.is_held(&dir.path().join("gone")).unwrap());
    }
}
