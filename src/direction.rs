//! Classifies a packet's orientation relative to this host from its source
//! and destination addresses.

use std::collections::HashSet;
use std::fmt;

/// Packet orientation relative to the local host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
    Internal,
    External,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
            Direction::Internal => "internal",
            Direction::External => "external",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of the currently bound local addresses.
///
/// The live implementation re-enumerates interfaces on every call so that
/// address changes are picked up; tests substitute a fixed set.
pub trait LocalAddressSource: Send + Sync {
    fn addresses(&self) -> HashSet<String>;
}

/// Enumerates the addresses bound to local interfaces via the OS.
pub struct SystemAddresses;

impl LocalAddressSource for SystemAddresses {
    fn addresses(&self) -> HashSet<String> {
        // Enumeration failure yields an empty set: every non-loopback address
        // then classifies as non-local, so the conservative result is
        // `external` rather than a misattributed direction.
        match get_if_addrs::get_if_addrs() {
            Ok(ifaces) => ifaces.iter().map(|i| i.ip().to_string()).collect(),
            Err(_) => HashSet::new(),
        }
    }
}

/// Classifies direction against the given set of locally bound addresses.
pub fn classify(src: &str, dst: &str, locals: &HashSet<String>) -> Direction {
    let src_local = is_local_ip(src, locals);
    let dst_local = is_local_ip(dst, locals);

    match (src_local, dst_local) {
        (true, true) => Direction::Internal,
        (true, false) => Direction::Outgoing,
        (false, true) => Direction::Incoming,
        (false, false) => Direction::External,
    }
}

fn is_local_ip(ip: &str, locals: &HashSet<String>) -> bool {
    ip.starts_with("127.") || ip == "::1" || locals.contains(ip)
}
