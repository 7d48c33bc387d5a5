//! Keep party signing keys out of core dumps.
//!
//! [`guard_key_material`] runs right before the first private key is read from
//! config. Setting `ESCROW_ALLOW_COREDUMPS=1` skips it for debugging sessions.

use std::io;

const ALLOW_COREDUMPS_ENV: &str = "ESCROW_ALLOW_COREDUMPS";

/// What happened to this process's dump settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpPolicy {
    Disabled,
    AllowedByOverride,
}

/// Make the process non-dumpable unless the override is set.
pub fn guard_key_material() -> io::Result<DumpPolicy> {
    let policy = policy_for(std::env::var(ALLOW_COREDUMPS_ENV).ok().as_deref());
    match policy {
        DumpPolicy::Disabled => platform::disable_dumps()?,
        DumpPolicy::AllowedByOverride => tracing::warn!(
            env_var = ALLOW_COREDUMPS_ENV,
            "Core dumps left enabled while private keys are loaded"
        ),
    }
    Ok(policy)
}

fn policy_for(override_value: Option<&str>) -> DumpPolicy {
    let allowed = override_value.is_some_and(|raw| {
        let raw = raw.trim();
        raw == "1" || raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("yes")
    });
    if allowed {
        DumpPolicy::AllowedByOverride
    } else {
        DumpPolicy::Disabled
    }
}

#[cfg(unix)]
mod platform {
    use std::io;

    pub fn disable_dumps() -> io::Result<()> {
        let no_core = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: `no_core` outlives the call and is fully initialized.
        if unsafe { libc::setrlimit(libc::RLIMIT_CORE, &raw const no_core) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // Also blocks ptrace attach and /proc/<pid>/mem reads by other users.
        #[cfg(target_os = "linux")]
        {
            // SAFETY: integer-only arguments.
            if unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0, 0, 0, 0) } != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

#[cfg(windows)]
mod platform {
    use std::io;

    use windows_sys::Win32::System::Diagnostics::Debug::{
        SEM_FAILCRITICALERRORS, SEM_NOGPFAULTERRORBOX, SetErrorMode,
    };
    use windows_sys::Win32::System::ErrorReporting::{WER_FAULT_REPORTING_NO_UI, WerSetFlags};

    pub fn disable_dumps() -> io::Result<()> {
        // SAFETY: both calls only flip process-wide error reporting flags.
        let hr = unsafe {
            SetErrorMode(SEM_FAILCRITICALERRORS | SEM_NOGPFAULTERRORBOX);
            WerSetFlags(WER_FAULT_REPORTING_NO_UI)
        };
        if hr < 0 {
            return Err(io::Error::other(format!("WerSetFlags returned 0x{:08X}", hr as u32)));
        }
        Ok(())
    }
}

#[cfg(not(any(unix, windows)))]
mod platform {
    pub fn disable_dumps() -> std::io::Result<()> {
        Ok(())
    }
}
