use std::fs;
use std::io;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Minimal view of `/proc/[pid]/stat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcStat {
    pub ppid: i32,
    pub pgrp: i32,
    pub session: i32,
    pub starttime: u64,
}

/// Parse `/proc/[pid]/stat`. The command name may contain spaces, so fields
/// are counted from the closing parenthesis.
pub fn read_proc_stat(pid: i32) -> io::Result<ProcStat> {
    let path = format!("/proc/{pid}/stat");
    let content = fs::read_to_string(&path)?;
    parse_stat(&content).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected layout in {path}"),
        )
    })
}

fn parse_stat(content: &str) -> Option<ProcStat> {
    let rest = &content[content.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is the state letter (field 3 of stat).
    Some(ProcStat {
        ppid: fields.get(1)?.parse().ok()?,
        pgrp: fields.get(2)?.parse().ok()?,
        session: fields.get(3)?.parse().ok()?,
        starttime: fields.get(19)?.parse().ok()?,
    })
}

/// `kill(pid, 0)`; a permission error still proves the process exists.
pub fn process_exists(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
}

/// Same probe against a whole process group.
pub fn group_exists(pgid: i32) -> bool {
    if pgid <= 0 {
        return false;
    }
    matches!(kill(Pid::from_raw(-pgid), None), Ok(()) | Err(Errno::EPERM))
}

/// Every live process whose session id is `sid`.
pub fn session_members(sid: i32) -> Vec<i32> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .filter(|pid| read_proc_stat(*pid).map_or(false, |stat| stat.session == sid))
        .collect()
}

/// SIGKILL a whole session, rescanning until it is empty so that members
/// forked during a pass are caught by the next one. Returns how many
/// processes were signalled.
pub fn kill_session(sid: i32) -> usize {
    if sid <= 1 {
        return 0;
    }
    let mut killed = 0;
    for _ in 0..5 {
        let members = session_members(sid);
        if members.is_empty() {
            break;
        }
        for pid in members {
            if kill(Pid::from_raw(pid), Signal::SIGKILL).is_ok() {
                killed += 1;
            }
        }
    }
    killed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::{CommandExt, ExitStatusExt};
    use std::process::Command;

    #[test]
    fn parses_names_with_spaces() {
        let line = "1234 (my prog) S 1 1234 1234 0 -1 4194560 100 0 0 0 1 2 0 0 20 0 1 0 5678 0 0";
        let stat = parse_stat(line).unwrap();
        assert_eq!(stat.ppid, 1);
        assert_eq!(stat.pgrp, 1234);
        assert_eq!(stat.session, 1234);
        assert_eq!(stat.starttime, 5678);
    }

    #[test]
    fn own_process_is_visible() {
        let me = std::process::id() as i32;
        assert!(process_exists(me));
        let stat = read_proc_stat(me).unwrap();
        assert_eq!(stat.pgrp, nix::unistd::getpgrp().as_raw());
        assert!(!process_exists(0));
    }

    #[test]
    fn kill_session_reaches_every_member() {
        let mut command = Command::new("sleep");
        command.arg("30");
        // SAFETY: setsid is async-signal-safe.
        unsafe {
            command.pre_exec(|| nix::unistd::setsid().map(drop).map_err(Into::into));
        }
        let mut child = command.spawn().unwrap();
        let sid = child.id() as i32;
        assert_eq!(session_members(sid), vec![sid]);
        assert_eq!(session_members(std::process::id() as i32 + 1_000_000), Vec::<i32>::new());

        assert!(kill_session(sid) >= 1);
        assert_eq!(child.wait().unwrap().signal(), Some(Signal::SIGKILL as i32));
        assert!(session_members(sid).is_empty());
    }
}
