//! Resolves a process identifier to its executable path and display name.

use crate::error::NetmonError;

/// Identity of the process owning a network flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub path: String,
}

/// Looks up the executable path and short name for a pid.
///
/// Opens the process with query-information and VM-read rights, reads the
/// full image path, and derives the display name from the last path
/// component. Errors (access denied, process already exited) surface as
/// `ProcessQueryFailed` and the caller records the packet unattributed.
#[cfg(windows)]
pub fn query_process(pid: u32) -> Result<ProcessInfo, NetmonError> {
    use windows::Win32::Foundation::CloseHandle;
    use windows::Win32::System::ProcessStatus::GetModuleFileNameExW;
    use windows::Win32::System::Threading::{
        OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ,
    };

    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, false, pid)
            .map_err(|e| NetmonError::ProcessQueryFailed {
                pid,
                reason: format!("OpenProcess failed: {}", e),
            })?;

        let mut path_buf = [0u16; 260];
        let len = GetModuleFileNameExW(handle, None, &mut path_buf);
        let _ = CloseHandle(handle);

        if len == 0 {
            return Err(NetmonError::ProcessQueryFailed {
                pid,
                reason: "GetModuleFileNameExW returned no path".to_string(),
            });
        }

        let path = String::from_utf16_lossy(&path_buf[..len as usize]);
        Ok(ProcessInfo {
            pid,
            name: short_name(&path).to_string(),
            path,
        })
    }
}

#[cfg(not(windows))]
pub fn query_process(_pid: u32) -> Result<ProcessInfo, NetmonError> {
    Err(NetmonError::UnsupportedPlatform)
}

/// Last component of an executable path, accepting both separator styles.
pub fn short_name(path: &str) -> &str {
    path.rsplit(['\\', '/']).next().unwrap_or(path)
}
