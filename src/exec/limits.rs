/// Child-side resource constraints, applied between fork and exec.
///
/// Everything here runs in the forked child, so it only makes raw syscalls:
/// no allocation, no logging, no locks.
use crate::config::types::InterpreterConfig;
use std::io;

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type RlimitResource = libc::__rlimit_resource_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type RlimitResource = libc::c_int;

/// Constraints applied to every interpreter child
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChildLimits {
    /// Address-space limit in bytes
    pub memory_limit: Option<u64>,
    /// CPU time limit in seconds
    pub cpu_limit_secs: Option<u64>,
    /// Scheduling priority
    pub nice: Option<i32>,
    /// Deliver SIGKILL to the child when the host dies
    pub parent_death_kill: bool,
}

impl ChildLimits {
    pub fn from_config(config: &InterpreterConfig) -> Self {
        Self {
            memory_limit: config.memory_limit,
            cpu_limit_secs: config.cpu_limit_secs,
            nice: config.nice,
            parent_death_kill: true,
        }
    }

    /// Apply every configured constraint to the calling process.
    ///
    /// EINVAL from setrlimit is tolerated: some kernels refuse RLIMIT_AS, and
    /// lowering a limit below current usage is not worth failing the spawn.
    pub fn apply(&self) -> io::Result<()> {
        if self.parent_death_kill {
            set_parent_death_signal()?;
        }
        if let Some(nice) = self.nice {
            // SAFETY: setpriority on our own pid touches no memory.
            let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        if let Some(bytes) = self.memory_limit {
            apply_rlimit_value(libc::RLIMIT_AS, bytes)?;
        }
        if let Some(secs) = self.cpu_limit_secs {
            apply_rlimit_value(libc::RLIMIT_CPU, secs)?;
        }
        Ok(())
    }

    /// Short human-readable summary for logs.
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(bytes) = self.memory_limit {
            parts.push(format!("as={}", bytes));
        }
        if let Some(secs) = self.cpu_limit_secs {
            parts.push(format!("cpu={}s", secs));
        }
        if let Some(nice) = self.nice {
            parts.push(format!("nice={}", nice));
        }
        if self.parent_death_kill {
            parts.push("pdeathsig".to_string());
        }
        if parts.is_empty() {
            "none".to_string()
        } else {
            parts.join(" ")
        }
    }
}

fn apply_rlimit_value(resource: RlimitResource, value: u64) -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };

    // SAFETY: `limit` is a valid rlimit for the duration of the call.
    let rc = unsafe { libc::setrlimit(resource, &limit) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EINVAL) {
        Ok(())
    } else {
        Err(err)
    }
}

fn set_parent_death_signal() -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: PR_SET_PDEATHSIG only reads its integer argument.
        let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Clear FD_CLOEXEC on `fd` so it survives exec.
pub fn inherit_fd(fd: libc::c_int) -> io::Result<()> {
    // SAFETY: fcntl on an fd we own; flags are plain integers.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_from_config_copies_limits() {
        let config = InterpreterConfig::default();
        let limits = ChildLimits::from_config(&config);
        assert_eq!(limits.memory_limit, Some(32 * 1024 * 1024));
        assert_eq!(limits.cpu_limit_secs, Some(600));
        assert_eq!(limits.nice, Some(5));
        assert!(limits.parent_death_kill);
    }

    #[test]
    fn test_describe() {
        assert_eq!(ChildLimits::default().describe(), "none");
        let limits = ChildLimits {
            memory_limit: Some(1024),
            cpu_limit_secs: None,
            nice: Some(3),
            parent_death_kill: false,
        };
        assert_eq!(limits.describe(), "as=1024 nice=3");
    }

    #[test]
    fn test_inherit_fd_clears_cloexec() {
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        inherit_fd(fd).unwrap();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_eq!(flags & libc::FD_CLOEXEC, 0);
    }

    #[test]
    fn test_limits_apply_in_child() {
        // Run in a forked child so the test process keeps its own limits.
        let status = unsafe {
            let pid = libc::fork();
            if pid == 0 {
                let limits = ChildLimits {
                    memory_limit: None,
                    cpu_limit_secs: Some(30),
                    nice: Some(1),
                    parent_death_kill: true,
                };
                let code = match limits.apply() {
                    Ok(()) => {
                        let mut got = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
                        libc::getrlimit(libc::RLIMIT_CPU, &mut got);
                        if got.rlim_cur == 30 { 0 } else { 2 }
                    }
                    Err(_) => 1,
                };
                libc::_exit(code);
            }
            let mut status = 0;
            libc::waitpid(pid, &mut status, 0);
            status
        };
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 0);
    }
}
