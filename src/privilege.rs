//! One-shot, memoized probe for the elevation required to enumerate kernel
//! socket-ownership tables.

use crate::error::NetmonError;
use std::sync::OnceLock;

static ELEVATION: OnceLock<Result<bool, String>> = OnceLock::new();

/// Whether the current process holds administrator (or platform-equivalent)
/// privileges.
///
/// The underlying system call runs at most once per process lifetime; both
/// success and failure are memoized, so a failed probe is never re-attempted.
pub fn is_elevated() -> Result<bool, NetmonError> {
    ELEVATION
        .get_or_init(probe)
        .clone()
        .map_err(NetmonError::PrivilegeCheckFailed)
}

/// Checks membership of the local administrators group for the process token.
#[cfg(windows)]
fn probe() -> Result<bool, String> {
    use windows::Win32::Foundation::BOOL;
    use windows::Win32::Security::{
        AllocateAndInitializeSid, CheckTokenMembership, FreeSid, PSID, SECURITY_NT_AUTHORITY,
    };
    use windows::Win32::System::SystemServices::{
        DOMAIN_ALIAS_RID_ADMINS, SECURITY_BUILTIN_DOMAIN_RID,
    };

    unsafe {
        let mut sid = PSID::default();
        AllocateAndInitializeSid(
            &SECURITY_NT_AUTHORITY,
            2,
            SECURITY_BUILTIN_DOMAIN_RID as u32,
            DOMAIN_ALIAS_RID_ADMINS as u32,
            0,
            0,
            0,
            0,
            0,
            0,
            &mut sid,
        )
        .map_err(|e| format!("AllocateAndInitializeSid failed: {}", e))?;

        let mut is_member = BOOL::default();
        let result = CheckTokenMembership(None, sid, &mut is_member);
        let _ = FreeSid(sid);
        result.map_err(|e| format!("CheckTokenMembership failed: {}", e))?;

        Ok(is_member.as_bool())
    }
}

#[cfg(unix)]
fn probe() -> Result<bool, String> {
    Ok(unsafe { libc::geteuid() } == 0)
}

#[cfg(not(any(windows, unix)))]
fn probe() -> Result<bool, String> {
    Ok(false)
}
