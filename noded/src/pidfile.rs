//! Single-instance pid file guarded by `flock`.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{info, warn};

use crate::proc::process_exists;

#[derive(Debug, thiserror::Error)]
pub enum PidFileError {
    #[error("another daemon holds {path} (pid {pid:?})")]
    Locked { path: PathBuf, pid: Option<i32> },
    #[error("pid file {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

/// Held for the daemon's lifetime; the lock is released when dropped.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    file: File,
}

impl PidFile {
    pub fn acquire(path: &Path) -> Result<Self, PidFileError> {
        let io_err = |source| PidFileError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;
        if file.try_lock_exclusive().is_err() {
            return Err(PidFileError::Locked {
                path: path.to_path_buf(),
                pid: read_pid(path),
            });
        }
        file.set_len(0).map_err(io_err)?;
        file.seek(SeekFrom::Start(0)).map_err(io_err)?;
        writeln!(file, "{}", std::process::id()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

pub fn read_pid(path: &Path) -> Option<i32> {
    let mut raw = String::new();
    File::open(path).ok()?.read_to_string(&mut raw).ok()?;
    raw.trim().parse().ok()
}

/// Terminate a daemon still holding `path`: SIGTERM, then SIGKILL once
/// `grace` has elapsed. Returns the pid that was signalled, if any.
pub fn kill_previous(path: &Path, grace: Duration) -> Option<i32> {
    let pid = read_pid(path)?;
    if pid <= 0 || pid == std::process::id() as i32 || !process_exists(pid) {
        return None;
    }
    info!(pid, "terminating previous daemon");
    let target = Pid::from_raw(pid);
    if let Err(err) = kill(target, Signal::SIGTERM) {
        warn!(pid, %err, "failed to signal previous daemon");
        return None;
    }
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !process_exists(pid) {
            return Some(pid);
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    warn!(pid, "previous daemon ignored SIGTERM; sending SIGKILL");
    let _ = kill(target, Signal::SIGKILL);
    Some(pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noded.pid");
        let held = PidFile::acquire(&path).unwrap();
        assert_eq!(read_pid(held.path()), Some(std::process::id() as i32));

        match PidFile::acquire(&path) {
            Err(PidFileError::Locked { pid, .. }) => {
                assert_eq!(pid, Some(std::process::id() as i32))
            }
            other => panic!("expected lock failure, got {other:?}"),
        }

        drop(held);
        assert!(!path.exists());
        let _again = PidFile::acquire(&path).unwrap();
    }

    #[test]
    fn kill_previous_ignores_own_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noded.pid");
        let _held = PidFile::acquire(&path).unwrap();
        assert_eq!(kill_previous(&path, Duration::from_millis(10)), None);
    }
}
