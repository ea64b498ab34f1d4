//! Forking and exec'ing one user task.
//!
//! Everything the child needs (program path, argv, environment, group list,
//! working directory) is converted to C strings in the parent. Between
//! `fork` and `execve` the child only makes raw libc calls and leaves through
//! `_exit`.

use std::collections::BTreeMap;
use std::ffi::{CString, OsStr};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::unistd::{fork, ForkResult, Gid, Pid, Uid, User};
use tracing::{debug, warn};

/// Exit status of a task whose `execve` failed.
pub const EXEC_FAILED: i32 = 127;

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("argument contains an interior NUL byte")]
    Nul(#[from] std::ffi::NulError),
    #[error("empty argv")]
    EmptyArgv,
    #[error("pipe: {0}")]
    Pipe(io::Error),
    #[error("fork: {0}")]
    Fork(Errno),
}

/// Credentials the task runs under.
#[derive(Debug, Clone)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
    groups: Vec<libc::gid_t>,
    /// False when the manager is not root: tasks keep the manager's identity.
    switch: bool,
}

impl Identity {
    pub fn for_user(uid: u32, gid: u32) -> Self {
        let switch = nix::unistd::geteuid().is_root();
        let groups = if switch {
            supplementary_groups(uid, gid)
        } else {
            Vec::new()
        };
        Self {
            uid,
            gid,
            groups,
            switch,
        }
    }

    pub fn switches(&self) -> bool {
        self.switch
    }

    /// Run `f` with the effective ids of the job owner, then restore root.
    /// Used for opening files on the user's behalf.
    pub fn as_effective<T>(&self, f: impl FnOnce() -> io::Result<T>) -> io::Result<T> {
        if !self.switch {
            return f();
        }
        let saved_groups = nix::unistd::getgroups().map_err(io::Error::from)?;
        let user_groups: Vec<Gid> = self.groups.iter().map(|g| Gid::from_raw(*g)).collect();
        nix::unistd::setgroups(&user_groups).map_err(io::Error::from)?;
        nix::unistd::setegid(Gid::from_raw(self.gid)).map_err(io::Error::from)?;
        nix::unistd::seteuid(Uid::from_raw(self.uid)).map_err(io::Error::from)?;

        let result = f();

        nix::unistd::seteuid(Uid::from_raw(0)).map_err(io::Error::from)?;
        nix::unistd::setegid(Gid::from_raw(0)).map_err(io::Error::from)?;
        nix::unistd::setgroups(&saved_groups).map_err(io::Error::from)?;
        result
    }
}

fn supplementary_groups(uid: u32, gid: u32) -> Vec<libc::gid_t> {
    let user = match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => user,
        _ => return vec![gid],
    };
    let Ok(name) = CString::new(user.name.as_bytes()) else {
        return vec![gid];
    };
    match nix::unistd::getgrouplist(&name, Gid::from_raw(gid)) {
        Ok(groups) => groups.into_iter().map(|g| g.as_raw()).collect(),
        Err(err) => {
            warn!(uid, %err, "getgrouplist failed; using primary group only");
            vec![gid]
        }
    }
}

/// Child-side descriptors installed over 0, 1 and 2.
#[derive(Debug)]
pub struct ChildStdio {
    pub stdin: OwnedFd,
    pub stdout: OwnedFd,
    pub stderr: OwnedFd,
}

impl ChildStdio {
    /// All three streams on `/dev/null`.
    pub fn null() -> io::Result<Self> {
        let input = File::open("/dev/null")?;
        let output = std::fs::OpenOptions::new().write(true).open("/dev/null")?;
        Ok(Self {
            stdin: input.into(),
            stdout: output.try_clone()?.into(),
            stderr: output.into(),
        })
    }
}

/// Close-on-exec pipe: `(read, write)`.
pub fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: `fds` is a valid two-element array for pipe2 to fill.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe2 succeeded, so both descriptors are open and owned by us.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// A task ready to be forked.
#[derive(Debug)]
pub struct PreparedTask {
    pub local_id: u32,
    pub global_id: u32,
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    cwd: CString,
    fallback_cwd: CString,
}

impl PreparedTask {
    pub fn new(
        local_id: u32,
        global_id: u32,
        argv: &[String],
        env: &BTreeMap<String, String>,
        cwd: &Path,
        fallback_cwd: &Path,
    ) -> Result<Self, TaskError> {
        let first = argv.first().ok_or(TaskError::EmptyArgv)?;
        let search_path = env.get("PATH").map(String::as_str).unwrap_or(DEFAULT_PATH);
        let program = resolve_program(first, search_path, cwd);
        Ok(Self {
            local_id,
            global_id,
            program: CString::new(program.as_os_str().as_bytes())?,
            argv: argv
                .iter()
                .map(|arg| CString::new(arg.as_bytes()))
                .collect::<Result<_, _>>()?,
            envp: env
                .iter()
                .map(|(key, value)| CString::new(format!("{key}={value}")))
                .collect::<Result<_, _>>()?,
            cwd: CString::new(cwd.as_os_str().as_bytes())?,
            fallback_cwd: CString::new(fallback_cwd.as_os_str().as_bytes())?,
        })
    }

    pub fn program(&self) -> &OsStr {
        OsStr::from_bytes(self.program.as_bytes())
    }
}

/// Program path for `argv0`: names containing a slash are taken relative to
/// `cwd`, bare names are searched in `search_path`.
pub fn resolve_program(argv0: &str, search_path: &str, cwd: &Path) -> PathBuf {
    if argv0.contains('/') {
        let path = PathBuf::from(argv0);
        return if path.is_absolute() {
            path
        } else {
            cwd.join(path)
        };
    }
    search_path
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(argv0))
        .find(|candidate| {
            candidate
                .metadata()
                .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        })
        .unwrap_or_else(|| PathBuf::from(argv0))
}

#[derive(Debug)]
pub struct SpawnedTask {
    pub pid: Pid,
    /// Set when the child reported an `execve` failure; it has exited with
    /// [`EXEC_FAILED`].
    pub exec_error: Option<Errno>,
}

/// Fork and exec one task. `group` is the task group to join; `None` makes the
/// new task the leader of a fresh group.
pub fn spawn(
    task: &PreparedTask,
    identity: &Identity,
    stdio: ChildStdio,
    group: Option<Pid>,
) -> Result<SpawnedTask, TaskError> {
    let (err_read, err_write) = cloexec_pipe().map_err(TaskError::Pipe)?;

    let mut argv: Vec<*const libc::c_char> = task.argv.iter().map(|a| a.as_ptr()).collect();
    argv.push(std::ptr::null());
    let mut envp: Vec<*const libc::c_char> = task.envp.iter().map(|e| e.as_ptr()).collect();
    envp.push(std::ptr::null());
    let pgid = group.map(Pid::as_raw).unwrap_or(0);
    let fds = [
        stdio.stdin.as_raw_fd(),
        stdio.stdout.as_raw_fd(),
        stdio.stderr.as_raw_fd(),
    ];
    let err_fd = err_write.as_raw_fd();

    // SAFETY: the child branch below only calls async-signal-safe libc
    // functions on data prepared before the fork, then execs or `_exit`s.
    match unsafe { fork() }.map_err(TaskError::Fork)? {
        ForkResult::Child => unsafe {
            libc::setpgid(0, pgid);
            if identity.switch {
                if libc::setgroups(identity.groups.len(), identity.groups.as_ptr()) != 0
                    || libc::setgid(identity.gid) != 0
                    || libc::setuid(identity.uid) != 0
                {
                    child_fail(err_fd);
                }
            }
            for (target, fd) in fds.iter().enumerate() {
                if libc::dup2(*fd, target as libc::c_int) < 0 {
                    child_fail(err_fd);
                }
            }
            let mut empty: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut empty);
            libc::sigprocmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut());
            for sig in [
                libc::SIGPIPE,
                libc::SIGINT,
                libc::SIGTERM,
                libc::SIGHUP,
                libc::SIGQUIT,
                libc::SIGCHLD,
            ] {
                libc::signal(sig, libc::SIG_DFL);
            }
            if libc::chdir(task.cwd.as_ptr()) != 0 {
                libc::chdir(task.fallback_cwd.as_ptr());
            }
            libc::execve(task.program.as_ptr(), argv.as_ptr(), envp.as_ptr());
            child_fail(err_fd)
        },
        ForkResult::Parent { child } => {
            drop(err_write);
            drop(stdio);
            // Both sides set the group so it exists before the next task joins.
            let leader = group.unwrap_or(child);
            let _ = nix::unistd::setpgid(child, leader);

            let mut report = Vec::with_capacity(4);
            File::from(err_read)
                .read_to_end(&mut report)
                .map_err(TaskError::Pipe)?;
            let exec_error = <[u8; 4]>::try_from(report.as_slice())
                .ok()
                .map(|raw| Errno::from_i32(i32::from_ne_bytes(raw)));
            debug!(pid = child.as_raw(), local_id = task.local_id, "task forked");
            Ok(SpawnedTask {
                pid: child,
                exec_error,
            })
        }
    }
}

/// Report errno on the error pipe and leave without running destructors.
unsafe fn child_fail(err_fd: RawFd) -> ! {
    let errno = Errno::last() as i32;
    let bytes = errno.to_ne_bytes();
    libc::write(err_fd, bytes.as_ptr().cast(), bytes.len());
    libc::_exit(EXEC_FAILED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::{waitpid, WaitStatus};
    use std::io::Read;

    fn env_with_path() -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), DEFAULT_PATH.to_string());
        env.insert("TASK_MARK".to_string(), "on".to_string());
        env
    }

    #[test]
    fn resolves_bare_names_on_path() {
        let resolved = resolve_program("sh", DEFAULT_PATH, Path::new("/"));
        assert!(resolved.is_absolute());
        assert_eq!(
            resolve_program("./a.out", DEFAULT_PATH, Path::new("/work")),
            PathBuf::from("/work/./a.out")
        );
    }

    #[test]
    fn task_output_reaches_the_pipe() {
        let (read, write) = cloexec_pipe().unwrap();
        let null = ChildStdio::null().unwrap();
        let stdio = ChildStdio {
            stdin: null.stdin,
            stdout: write,
            stderr: null.stderr,
        };
        let task = PreparedTask::new(
            0,
            3,
            &["sh".into(), "-c".into(), "echo $TASK_MARK; pwd".into()],
            &env_with_path(),
            Path::new("/nonexistent-dir"),
            Path::new("/"),
        )
        .unwrap();
        let identity = Identity::for_user(
            nix::unistd::getuid().as_raw(),
            nix::unistd::getgid().as_raw(),
        );
        let spawned = spawn(&task, &identity, stdio, None).unwrap();
        assert!(spawned.exec_error.is_none());

        let mut out = String::new();
        File::from(read).read_to_string(&mut out).unwrap();
        assert_eq!(out, "on\n/\n");
        assert_eq!(
            waitpid(spawned.pid, None).unwrap(),
            WaitStatus::Exited(spawned.pid, 0)
        );
    }

    #[test]
    fn exec_failure_is_reported_and_exits_127() {
        let task = PreparedTask::new(
            0,
            0,
            &["/nonexistent/program".into()],
            &env_with_path(),
            Path::new("/"),
            Path::new("/"),
        )
        .unwrap();
        let identity = Identity::for_user(
            nix::unistd::getuid().as_raw(),
            nix::unistd::getgid().as_raw(),
        );
        let spawned = spawn(&task, &identity, ChildStdio::null().unwrap(), None).unwrap();
        assert_eq!(spawned.exec_error, Some(Errno::ENOENT));
        assert_eq!(
            waitpid(spawned.pid, None).unwrap(),
            WaitStatus::Exited(spawned.pid, EXEC_FAILED)
        );
    }

    #[test]
    fn empty_argv_is_rejected() {
        let err = PreparedTask::new(0, 0, &[], &BTreeMap::new(), Path::new("/"), Path::new("/"))
            .unwrap_err();
        assert!(matches!(err, TaskError::EmptyArgv));
    }
}
