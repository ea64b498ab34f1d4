//! Batch script spool.

use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::unistd::{chown, geteuid, Gid, Uid};
use tracing::debug;

use noded_common::JobId;

pub const SCRIPT_NAME: &str = "script";

/// Write `spool/job<ID>/script` with mode 0500, owned by the job's user when
/// the daemon is privileged enough to hand it over.
pub fn write_script(
    job_dir: &Path,
    job_id: JobId,
    script: &str,
    uid: u32,
    gid: u32,
) -> io::Result<PathBuf> {
    if let Some(parent) = job_dir.parent() {
        fs::create_dir_all(parent)?;
    }
    match DirBuilder::new().mode(0o700).create(job_dir) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
        Err(err) => return Err(err),
    }

    let path = job_dir.join(SCRIPT_NAME);
    let _ = fs::remove_file(&path);
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o700)
            .open(&path)?;
        file.write_all(script.as_bytes())?;
        file.sync_all()?;
    }
    fs::set_permissions(&path, fs::Permissions::from_mode(0o500))?;

    if geteuid().is_root() {
        let owner = Some(Uid::from_raw(uid));
        let group = Some(Gid::from_raw(gid));
        chown(job_dir, owner, group).map_err(io::Error::from)?;
        chown(&path, owner, group).map_err(io::Error::from)?;
    }
    debug!(job_id, path = %path.display(), "batch script written");
    Ok(path)
}

/// Remove the job's spool directory; missing directories are fine.
pub fn remove_job_dir(job_dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(job_dir) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}
