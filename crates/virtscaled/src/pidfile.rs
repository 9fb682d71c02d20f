//! Pidfile handling and signal delivery.
//!
//! The pidfile is a process-lifecycle artifact, not fleet state: it exists
//! so `virtscaled stop` can find the daemon and so a second `start` can
//! refuse to run concurrently. A pidfile whose process is gone is stale
//! and silently replaced.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Location of the pidfile inside the daemon workdir.
pub fn path(workdir: &Path) -> PathBuf {
    workdir.join("virtscaled.pid")
}

/// Record the current process. Fails if another live daemon owns the file.
pub fn write(path: &Path) -> io::Result<()> {
    if let Some(existing) = read(path)? {
        if process_alive(existing) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("daemon already running with pid {existing}"),
            ));
        }
        warn!(pid = existing, "replacing stale pidfile");
    }
    std::fs::write(path, format!("{}\n", std::process::id()))
}

/// Read the recorded pid, if any.
pub fn read(path: &Path) -> io::Result<Option<i32>> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(raw.trim().parse::<i32>().ok()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

pub fn remove(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            debug!(path = %path.display(), error = %e, "failed to remove pidfile");
        }
    }
}

/// Whether a process with this pid exists (signal 0 probe).
pub fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // kill(pid, 0) delivers nothing; EPERM still proves the pid is live.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Deliver SIGTERM to the daemon.
pub fn send_sigterm(pid: i32) -> io::Result<()> {
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = path(dir.path());
        write(&pidfile).unwrap();
        assert_eq!(read(&pidfile).unwrap(), Some(std::process::id() as i32));
        remove(&pidfile);
        assert_eq!(read(&pidfile).unwrap(), None);
    }

    #[test]
    fn live_pidfile_blocks_second_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = path(dir.path());
        // Our own pid is certainly alive.
        write(&pidfile).unwrap();
        let err = write(&pidfile).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[test]
    fn stale_pidfile_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = path(dir.path());
        // i32::MAX is above any real pid_max.
        std::fs::write(&pidfile, format!("{}\n", i32::MAX)).unwrap();
        write(&pidfile).unwrap();
        assert_eq!(read(&pidfile).unwrap(), Some(std::process::id() as i32));
    }

    #[test]
    fn garbage_pidfile_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = path(dir.path());
        std::fs::write(&pidfile, "not-a-pid\n").unwrap();
        assert_eq!(read(&pidfile).unwrap(), None);
    }

    #[test]
    fn nonexistent_process_is_not_alive() {
        assert!(!process_alive(i32::MAX));
        assert!(!process_alive(0));
        assert!(!process_alive(-4));
    }
}
