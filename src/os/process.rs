//! Process-level controls: liveness, thread count, and SIGSTOP/SIGCONT
//! pausing used by the solorun profiler and the swapper.

use std::fs;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::error::OsError;

/// True if `/proc/<pid>` still exists. Cheaper than sending a signal and
/// matches how liveness is checked elsewhere in this module.
pub fn is_running(pid: i32) -> bool {
    std::path::Path::new(&format!("/proc/{}", pid)).exists()
}

/// Number of threads reported for `pid` in `/proc/<pid>/status`, or 0 if
/// the process is gone or the field is missing.
pub fn thread_count(pid: i32) -> u32 {
    let path = format!("/proc/{}/status", pid);
    let Ok(text) = fs::read_to_string(&path) else {
        return 0;
    };
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("Threads:") {
            if let Ok(n) = rest.trim().parse() {
                return n;
            }
        }
    }
    0
}

fn send(pid: i32, signal: Signal) -> Result<(), OsError> {
    match signal::kill(Pid::from_raw(pid), signal) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::ESRCH) => Err(OsError::ProcessGone { pid }),
        Err(e) => Err(OsError::from_io(
            format!("kill({}, {:?})", pid, signal),
            std::io::Error::from_raw_os_error(e as i32),
        )),
    }
}

pub fn stop(pid: i32) -> Result<(), OsError> {
    send(pid, Signal::SIGSTOP)
}

pub fn cont(pid: i32) -> Result<(), OsError> {
    send(pid, Signal::SIGCONT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_running() {
        let pid = std::process::id() as i32;
        assert!(is_running(pid));
    }

    #[test]
    fn bogus_pid_is_not_running() {
        assert!(!is_running(i32::MAX - 1));
    }

    #[test]
    fn stopping_a_gone_pid_is_process_gone() {
        // A pid this large is exceedingly unlikely to be live.
        let err = stop(i32::MAX - 2).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn current_process_has_at_least_one_thread() {
        let pid = std::process::id() as i32;
        assert!(thread_count(pid) >= 1);
    }
}
