//! Maps a transport flow to its owning process via the kernel
//! socket-ownership tables.
//!
//! The tables arrive as a packed byte buffer: a 4-byte row count followed by
//! fixed-size rows. Row scanning is plain safe code over that buffer so the
//! matching logic is testable without the platform call; only the fetch is
//! platform-specific.

use crate::error::NetmonError;
use crate::privilege;
use crate::process::{self, ProcessInfo};

/// Resolves (protocol, local port, remote port) tuples to process identity.
pub trait FlowResolver: Send + Sync {
    /// TCP lookup. A `remote_port` of zero matches any remote port.
    fn find_tcp(&self, local_port: u16, remote_port: u16) -> Result<ProcessInfo, NetmonError>;

    /// UDP lookup by local port only.
    fn find_udp(&self, local_port: u16) -> Result<ProcessInfo, NetmonError>;
}

// Packed row layouts of the owner-PID tables:
// TCP: state, local addr, local port, remote addr, remote port, pid (6 x u32).
// UDP: local addr, local port, pid (3 x u32).
const TCP_ROW_SIZE: usize = 24;
const UDP_ROW_SIZE: usize = 12;

const TCP_LOCAL_PORT_OFFSET: usize = 8;
const TCP_REMOTE_PORT_OFFSET: usize = 16;
const TCP_PID_OFFSET: usize = 20;
const UDP_LOCAL_PORT_OFFSET: usize = 4;
const UDP_PID_OFFSET: usize = 8;

/// Ports in the tables sit in the low 16 bits in network byte order; the
/// caller's host-order port is swapped for comparison.
fn port_to_table_order(port: u16) -> u32 {
    u32::from(port.swap_bytes())
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn row_count(buf: &[u8], row_size: usize) -> Result<usize, NetmonError> {
    if buf.len() < 4 {
        return Err(NetmonError::TableTruncated);
    }
    let count = read_u32(buf, 0) as usize;
    if count == 0 {
        return Err(NetmonError::TableEmpty);
    }
    if buf.len() < 4 + count * row_size {
        return Err(NetmonError::TableTruncated);
    }
    Ok(count)
}

/// Scans a TCP owner-PID table for the first row matching the ports.
///
/// Tables are sorted by pid, so the first match is the winner.
pub fn scan_tcp_table(
    buf: &[u8],
    local_port: u16,
    remote_port: u16,
) -> Result<u32, NetmonError> {
    let count = row_count(buf, TCP_ROW_SIZE)?;
    let local_n = port_to_table_order(local_port);
    let remote_n = port_to_table_order(remote_port);

    for i in 0..count {
        let row = 4 + i * TCP_ROW_SIZE;
        let row_local = read_u32(buf, row + TCP_LOCAL_PORT_OFFSET);
        let row_remote = read_u32(buf, row + TCP_REMOTE_PORT_OFFSET);

        if row_local == local_n && (remote_port == 0 || row_remote == remote_n) {
            return Ok(read_u32(buf, row + TCP_PID_OFFSET));
        }
    }

    Err(NetmonError::NoMatchingFlow {
        local: local_port,
        remote: remote_port,
    })
}

/// Scans a UDP owner-PID table for the first row bound to `local_port`.
pub fn scan_udp_table(buf: &[u8], local_port: u16) -> Result<u32, NetmonError> {
    let count = row_count(buf, UDP_ROW_SIZE)?;
    let local_n = port_to_table_order(local_port);

    for i in 0..count {
        let row = 4 + i * UDP_ROW_SIZE;
        if read_u32(buf, row + UDP_LOCAL_PORT_OFFSET) == local_n {
            return Ok(read_u32(buf, row + UDP_PID_OFFSET));
        }
    }

    Err(NetmonError::NoMatchingFlow {
        local: local_port,
        remote: 0,
    })
}

fn ensure_elevated() -> Result<(), NetmonError> {
    match privilege::is_elevated()? {
        true => Ok(()),
        false => Err(NetmonError::ElevationRequired),
    }
}

/// Resolver backed by the operating system's extended TCP/UDP tables.
pub struct SystemResolver;

#[cfg(windows)]
mod platform {
    use super::*;
    use std::ffi::c_void;
    use windows::Win32::NetworkManagement::IpHelper::{
        GetExtendedTcpTable, GetExtendedUdpTable, TCP_TABLE_CLASS, UDP_TABLE_CLASS,
    };
    use windows::Win32::Networking::WinSock::AF_INET;

    const TCP_TABLE_OWNER_PID_ALL: TCP_TABLE_CLASS = TCP_TABLE_CLASS(5);
    const UDP_TABLE_OWNER_PID: UDP_TABLE_CLASS = UDP_TABLE_CLASS(1);
    const ERROR_INSUFFICIENT_BUFFER: u32 = 122;

    pub(super) enum Table {
        Tcp,
        Udp,
    }

    /// Fetches an owner-PID table, growing the buffer on demand.
    ///
    /// Starts at 8 KiB and doubles on ERROR_INSUFFICIENT_BUFFER, three
    /// attempts total. Any other nonzero status is retried and the last
    /// status reported when attempts are exhausted.
    pub(super) fn fetch_table(table: Table) -> Result<Vec<u8>, NetmonError> {
        let mut size: u32 = 8192;
        let mut last_status = 0u32;

        for _ in 0..3 {
            let mut buf = vec![0u8; size as usize];
            let status = unsafe {
                match table {
                    Table::Tcp => GetExtendedTcpTable(
                        Some(buf.as_mut_ptr() as *mut c_void),
                        &mut size,
                        true,
                        AF_INET.0 as u32,
                        TCP_TABLE_OWNER_PID_ALL,
                        0,
                    ),
                    Table::Udp => GetExtendedUdpTable(
                        Some(buf.as_mut_ptr() as *mut c_void),
                        &mut size,
                        true,
                        AF_INET.0 as u32,
                        UDP_TABLE_OWNER_PID,
                        0,
                    ),
                }
            };

            match status {
                0 => return Ok(buf),
                ERROR_INSUFFICIENT_BUFFER => {
                    size = size.saturating_mul(2);
                    last_status = status;
                }
                other => last_status = other,
            }
        }

        Err(NetmonError::TableQueryFailed(last_status))
    }
}

#[cfg(windows)]
impl FlowResolver for SystemResolver {
    fn find_tcp(&self, local_port: u16, remote_port: u16) -> Result<ProcessInfo, NetmonError> {
        ensure_elevated()?;
        let buf = platform::fetch_table(platform::Table::Tcp)?;
        let pid = scan_tcp_table(&buf, local_port, remote_port)?;
        process::query_process(pid)
    }

    fn find_udp(&self, local_port: u16) -> Result<ProcessInfo, NetmonError> {
        ensure_elevated()?;
        let buf = platform::fetch_table(platform::Table::Udp)?;
        let pid = scan_udp_table(&buf, local_port)?;
        process::query_process(pid)
    }
}

#[cfg(not(windows))]
impl FlowResolver for SystemResolver {
    fn find_tcp(&self, _local_port: u16, _remote_port: u16) -> Result<ProcessInfo, NetmonError> {
        Err(NetmonError::UnsupportedPlatform)
    }

    fn find_udp(&self, _local_port: u16) -> Result<ProcessInfo, NetmonError> {
        Err(NetmonError::UnsupportedPlatform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a synthetic TCP table from (local, remote, pid) triples with
    /// ports written in network byte order, as the platform produces them.
    fn tcp_table(rows: &[(u16, u16, u32)]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(rows.len() as u32).to_ne_bytes());
        for &(local, remote, pid) in rows {
            buf.extend_from_slice(&0u32.to_ne_bytes()); // state
            buf.extend_from_slice(&0u32.to_ne_bytes()); // local addr
            buf.extend_from_slice(&local.to_be_bytes());
            buf.extend_from_slice(&[0, 0]);
            buf.extend_from_slice(&0u32.to_ne_bytes()); // remote addr
            buf.extend_from_slice(&remote.to_be_bytes());
            buf.extend_from_slice(&[0, 0]);
            buf.extend_from_slice(&pid.to_ne_bytes());
        }
        buf
    }

    fn udp_table(rows: &[(u16, u32)]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(rows.len() as u32).to_ne_bytes());
        for &(local, pid) in rows {
            buf.extend_from_slice(&0u32.to_ne_bytes()); // local addr
            buf.extend_from_slice(&local.to_be_bytes());
            buf.extend_from_slice(&[0, 0]);
            buf.extend_from_slice(&pid.to_ne_bytes());
        }
        buf
    }

    #[test]
    fn matches_network_order_port() {
        // The row carries 443 in network byte order; the caller passes host
        // order and the scan must byte-swap for comparison.
        let buf = tcp_table(&[(80, 0, 7), (443, 52_100, 42)]);
        assert_eq!(scan_tcp_table(&buf, 443, 0).unwrap(), 42);
    }

    #[test]
    fn zero_remote_port_is_wildcard() {
        let buf = tcp_table(&[(5555, 443, 99)]);
        assert_eq!(scan_tcp_table(&buf, 5555, 0).unwrap(), 99);
        assert_eq!(scan_tcp_table(&buf, 5555, 443).unwrap(), 99);
        assert!(matches!(
            scan_tcp_table(&buf, 5555, 8080),
            Err(NetmonError::NoMatchingFlow { .. })
        ));
    }

    #[test]
    fn first_matching_row_wins() {
        let buf = tcp_table(&[(443, 0, 10), (443, 0, 20)]);
        assert_eq!(scan_tcp_table(&buf, 443, 0).unwrap(), 10);
    }

    #[test]
    fn empty_table_is_reported() {
        let buf = tcp_table(&[]);
        assert!(matches!(
            scan_tcp_table(&buf, 443, 0),
            Err(NetmonError::TableEmpty)
        ));
    }

    #[test]
    fn truncated_table_is_rejected() {
        // Claims two rows but carries only one.
        let mut buf = tcp_table(&[(443, 0, 42)]);
        buf[..4].copy_from_slice(&2u32.to_ne_bytes());
        assert!(matches!(
            scan_tcp_table(&buf, 443, 0),
            Err(NetmonError::TableTruncated)
        ));

        assert!(matches!(
            scan_tcp_table(&[0u8; 2], 443, 0),
            Err(NetmonError::TableTruncated)
        ));
    }

    #[test]
    fn udp_scan_matches_local_port() {
        let buf = udp_table(&[(53, 11), (54_321, 17)]);
        assert_eq!(scan_udp_table(&buf, 54_321).unwrap(), 17);
        assert!(matches!(
            scan_udp_table(&buf, 5353),
            Err(NetmonError::NoMatchingFlow { .. })
        ));
    }
}
