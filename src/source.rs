//! Packet sources: an abstract stream of decoded frames plus the live
//! pcap-backed implementation.

use crate::error::NetmonError;
use etherparse::{InternetSlice, SlicedPacket, TransportSlice};
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Network- and transport-layer metadata decoded from one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub src_ip: String,
    pub dst_ip: String,
    /// Port in string form; empty when the transport has no ports.
    pub src_port: String,
    pub dst_port: String,
    pub protocol: String,
    pub length: usize,
}

/// One captured frame. `network` is `None` when the frame lacks a network
/// or transport layer; the pipeline drops such frames silently.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub network: Option<NetworkInfo>,
}

/// An infinite, best-effort sequence of captured frames.
///
/// `next_frame` blocks until a frame arrives; `None` means the source has
/// closed (stop requested or unrecoverable handle error) and the consuming
/// task should exit.
pub trait PacketSource: Send {
    fn next_frame(&mut self) -> Option<CapturedFrame>;
}

/// Live capture on one named interface.
pub struct LiveSource {
    name: String,
    cap: pcap::Capture<pcap::Active>,
    stop: Arc<AtomicBool>,
}

impl LiveSource {
    /// Opens the interface with a 1024-byte snapshot length, promiscuous
    /// mode, and the read timeout disabled (reads wait indefinitely).
    pub fn open(name: &str, stop: Arc<AtomicBool>) -> Result<Self, NetmonError> {
        let cap = pcap::Capture::from_device(name)
            .map_err(|e| NetmonError::InterfaceOpenFailed {
                name: name.to_string(),
                reason: e.to_string(),
            })?
            .snaplen(1024)
            .promisc(true)
            .timeout(0)
            .open()
            .map_err(|e| NetmonError::InterfaceOpenFailed {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        Ok(LiveSource {
            name: name.to_string(),
            cap,
            stop,
        })
    }
}

impl PacketSource for LiveSource {
    fn next_frame(&mut self) -> Option<CapturedFrame> {
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return None;
            }
            match self.cap.next_packet() {
                Ok(packet) => {
                    return Some(CapturedFrame {
                        network: decode_frame(packet.data),
                    })
                }
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(e) => {
                    debug!("capture on {} ended: {}", self.name, e);
                    return None;
                }
            }
        }
    }
}

/// Decodes an Ethernet frame down to transport ports.
///
/// Returns `None` unless the frame carries both an IPv4/IPv6 network layer
/// and a TCP/UDP transport layer.
pub fn decode_frame(data: &[u8]) -> Option<NetworkInfo> {
    let sliced = SlicedPacket::from_ethernet(data).ok()?;

    let (src_ip, dst_ip) = match sliced.ip {
        Some(InternetSlice::Ipv4(header, _)) => (
            header.source_addr().to_string(),
            header.destination_addr().to_string(),
        ),
        Some(InternetSlice::Ipv6(header, _)) => (
            header.source_addr().to_string(),
            header.destination_addr().to_string(),
        ),
        None => return None,
    };

    let (src_port, dst_port, protocol) = match sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => (
            tcp.source_port().to_string(),
            tcp.destination_port().to_string(),
            "TCP",
        ),
        Some(TransportSlice::Udp(udp)) => (
            udp.source_port().to_string(),
            udp.destination_port().to_string(),
            "UDP",
        ),
        _ => return None,
    };

    Some(NetworkInfo {
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        protocol: protocol.to_string(),
        length: data.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    #[test]
    fn decodes_tcp_frame() {
        let builder = PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv4([10, 0, 0, 1], [8, 8, 8, 8], 64)
            .tcp(5555, 443, 0, 4096);
        let mut frame = Vec::new();
        builder.write(&mut frame, &[0u8; 8]).unwrap();

        let info = decode_frame(&frame).unwrap();
        assert_eq!(info.src_ip, "10.0.0.1");
        assert_eq!(info.dst_ip, "8.8.8.8");
        assert_eq!(info.src_port, "5555");
        assert_eq!(info.dst_port, "443");
        assert_eq!(info.protocol, "TCP");
        assert_eq!(info.length, frame.len());
    }

    #[test]
    fn decodes_udp_frame() {
        let builder = PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv4([8, 8, 8, 8], [10, 0, 0, 1], 64)
            .udp(53, 54_321);
        let mut frame = Vec::new();
        builder.write(&mut frame, &[0u8; 16]).unwrap();

        let info = decode_frame(&frame).unwrap();
        assert_eq!(info.protocol, "UDP");
        assert_eq!(info.src_port, "53");
        assert_eq!(info.dst_port, "54321");
    }

    #[test]
    fn frame_without_transport_layer_is_dropped() {
        // IPv4 payload carried under an unassigned protocol number: a
        // network layer is present but no port-bearing transport.
        let builder = PacketBuilder::ethernet2([1; 6], [2; 6]).ipv4(
            [10, 0, 0, 1],
            [10, 0, 0, 2],
            64,
        );
        let mut frame = Vec::new();
        builder.write(&mut frame, 253, &[0u8; 4]).unwrap();

        assert!(decode_frame(&frame).is_none());
    }

    #[test]
    fn garbage_is_dropped() {
        assert!(decode_frame(&[0xde, 0xad, 0xbe, 0xef]).is_none());
    }
}
