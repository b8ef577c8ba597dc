use std::process::ExitStatus;

use tokio::process::{Child, Command};
use tracing::{debug, trace};

use crate::error::{ExecError, ExecResult};

/// How a task process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Success,
    /// Terminated by SIGKILL or SIGTERM.
    Killed,
    Failed,
}

/// Launch `cmd` so that it and all of its descendants can be signalled as one group.
///
/// On Unix the child calls `setpgid(0, 0)` between `fork` and `exec`, so its pid is also the process
/// group id. On Windows a plain launch is enough because [`kill_group`] terminates the process tree.
pub fn spawn_in_group(cmd: &mut Command) -> ExecResult<Child> {
    #[cfg(unix)]
    unix_impl::attach_setpgid(cmd);

    let child = cmd.spawn().map_err(|e| ExecError::Spawn(e.to_string()))?;
    trace!(target: "ibex.exec", pid = ?child.id(), "spawned in own process group");
    Ok(child)
}

/// Terminate the whole process group led by `pid`.
pub fn kill_group(pid: u32) -> ExecResult<()> {
    debug!(target: "ibex.exec", pid, "killing process group");

    #[cfg(unix)]
    {
        unix_impl::killpg(pid)
    }

    #[cfg(windows)]
    {
        let status = std::process::Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(ExecError::Kill {
                pgid: pid as i32,
                reason: format!("taskkill exited with {status}"),
            })
        }
    }
}

/// Map an exit status onto the task outcome labels.
pub fn classify_exit(status: ExitStatus) -> ExitKind {
    if status.success() {
        return ExitKind::Success;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;

        if matches!(status.signal(), Some(libc::SIGKILL) | Some(libc::SIGTERM)) {
            return ExitKind::Killed;
        }
    }

    ExitKind::Failed
}

#[cfg(unix)]
mod unix_impl {
    use std::io;

    use nix::{
        sys::signal::{Signal, killpg as nix_killpg},
        unistd::Pid,
    };
    use tokio::process::Command;

    use crate::error::{ExecError, ExecResult};

    pub fn attach_setpgid(cmd: &mut Command) {
        unsafe {
            cmd.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    pub fn killpg(pid: u32) -> ExecResult<()> {
        let pgid = i32::try_from(pid).map_err(|_| ExecError::Kill {
            pgid: -1,
            reason: format!("pid {pid} out of range"),
        })?;
        nix_killpg(Pid::from_raw(pgid), Signal::SIGKILL).map_err(|errno| ExecError::Kill {
            pgid,
            reason: errno.to_string(),
        })
    }
}
