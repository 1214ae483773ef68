/// Utility functions for formatting and host discovery

use std::net::{IpAddr, UdpSocket};
use std::time::Duration;

/// Formatting and display utilities
pub mod format {
    use super::*;

    /// Format byte array as hex string
    pub fn bytes_to_hex(bytes: &[u8]) -> String {
        bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Uptime as `[<d>d ]HH:MM:SS`, whole seconds only
    pub fn format_uptime(uptime: Duration) -> String {
        let total = uptime.as_secs();
        let (days, rest) = (total / 86_400, total % 86_400);
        let clock = format!("{:02}:{:02}:{:02}", rest / 3600, rest % 3600 / 60, rest % 60);
        if days > 0 {
            format!("{}d {}", days, clock)
        } else {
            clock
        }
    }
}

/// Network helpers
pub mod network {
    use super::*;

    /// Address of the interface used for outbound traffic
    ///
    /// Connecting a UDP socket only selects a route; no packet is sent.
    pub fn outbound_ip_address() -> Option<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        socket.local_addr().ok().map(|addr| addr.ip())
    }
}
