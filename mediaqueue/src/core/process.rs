//! Cross-platform process helpers.
//!
//! Worker processes are spawned from a GUI host, so on Windows the console window
//! must be suppressed. Liveness probing and graceful termination requests go
//! through the OS directly because a restarted orchestrator only knows a pid.

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Apply platform-specific flags to a std process command.
pub fn configure_std_command(cmd: &mut std::process::Command) {
    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    #[cfg(not(target_os = "windows"))]
    let _ = cmd;
}

/// Best-effort check whether a process with `pid` is still running.
///
/// On platforms without a cheap probe this returns `false`, leaving liveness to
/// the stale-claim timeout.
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        if pid == 0 || pid > i32::MAX as u32 {
            return false;
        }
        // Signal 0 performs permission and existence checks only.
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        if rc == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Ask a process to terminate gracefully (SIGTERM on Unix).
///
/// Returns `Unsupported` where no graceful request exists; callers fall back to a hard kill.
pub fn request_termination(pid: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        if pid == 0 || pid > i32::MAX as u32 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid pid {pid}"),
            ));
        }
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "graceful termination is not supported on this platform",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn std_command_configuration_is_idempotent() {
        #[cfg(target_os = "windows")]
        let mut cmd = std::process::Command::new("cmd");
        #[cfg(not(target_os = "windows"))]
        let mut cmd = std::process::Command::new("echo");

        configure_std_command(&mut cmd);
        configure_std_command(&mut cmd);
    }

    #[cfg(unix)]
    #[test]
    fn current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
        assert!(!is_process_alive(0));
    }

    #[cfg(unix)]
    #[test]
    fn terminated_child_is_reported_dead() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id();
        assert!(is_process_alive(pid));

        request_termination(pid).unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
        assert!(!is_process_alive(pid));
    }
}
