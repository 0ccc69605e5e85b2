//! Host process facts used by the instance lock: liveness of a recorded pid and
//! the identity of the current process.

use tracing::{info, warn};

/// Whether the process recorded as `pid` is still running.
///
/// Blank or unparsable ids and ids the OS reports as unknown count as not
/// running. Any other failure to ask the OS answers `true`, so an
/// inconclusive check never deletes a lock that might be live.
pub fn is_process_running(pid: &str) -> bool {
    let trimmed = pid.trim();
    if trimmed.is_empty() {
        return false;
    }
    let Ok(pid) = trimmed.parse::<u32>() else {
        warn!(
            target: "cespiti",
            event = "lock_pid_invalid",
            pid = trimmed
        );
        return false;
    };

    let running = check_alive(pid);
    if !running {
        info!(target: "cespiti", event = "lock_pid_not_running", pid);
    }
    running
}

#[cfg(unix)]
fn check_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // 0 and negative values address process groups.
    if pid <= 0 {
        return false;
    }
    unsafe {
        if libc::kill(pid, 0) == 0 {
            return true;
        }
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::ESRCH) => false,
        Some(libc::EPERM) => true,
        other => {
            warn!(
                target: "cespiti",
                event = "lock_pid_check_inconclusive",
                pid,
                os_code = ?other
            );
            true
        }
    }
}

#[cfg(windows)]
fn check_alive(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::{
        CloseHandle, GetLastError, ERROR_ACCESS_DENIED, ERROR_INVALID_PARAMETER, STILL_ACTIVE,
    };
    use windows_sys::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };

    if pid == 0 {
        return false;
    }
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle == 0 {
            return match GetLastError() {
                ERROR_INVALID_PARAMETER => false,
                ERROR_ACCESS_DENIED => true,
                other => {
                    warn!(
                        target: "cespiti",
                        event = "lock_pid_check_inconclusive",
                        pid,
                        os_code = other
                    );
                    true
                }
            };
        }
        let mut exit_code: u32 = 0;
        let queried = GetExitCodeProcess(handle, &mut exit_code);
        CloseHandle(handle);
        if queried == 0 {
            return true;
        }
        exit_code == STILL_ACTIVE as u32
    }
}

#[cfg(not(any(unix, windows)))]
fn check_alive(_pid: u32) -> bool {
    true
}

pub fn current_user_name() -> String {
    ["USER", "USERNAME", "LOGNAME"]
        .iter()
        .find_map(|key| std::env::var(key).ok().filter(|v| !v.trim().is_empty()))
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(unix)]
pub fn current_host_name() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc == 0 {
        let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
        let name = String::from_utf8_lossy(&buf[..end]).trim().to_string();
        if !name.is_empty() {
            return name;
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(not(unix))]
pub fn current_host_name() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_running() {
        assert!(is_process_running(&std::process::id().to_string()));
    }

    #[test]
    fn blank_and_garbage_pids_are_not_running() {
        assert!(!is_process_running(""));
        assert!(!is_process_running("   "));
        assert!(!is_process_running("abc"));
        assert!(!is_process_running("-5"));
        assert!(!is_process_running("0"));
    }

    #[cfg(unix)]
    #[test]
    fn out_of_range_pid_is_not_running() {
        assert!(!is_process_running(&u32::MAX.to_string()));
    }

    #[test]
    fn identity_is_never_blank() {
        assert!(!current_user_name().trim().is_empty());
        assert!(!current_host_name().trim().is_empty());
    }
}
