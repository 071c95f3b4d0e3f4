use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// Local address the OS would use for outbound traffic.
///
/// Connecting a UDP socket only selects a route; nothing is sent.
pub fn outbound_local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(("8.8.8.8", 80)).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

/// First three octets of an IPv4 address, e.g. `"192.168.1"`.
pub fn subnet_prefix(ip: Ipv4Addr) -> String {
    let [a, b, c, _] = ip.octets();
    format!("{a}.{b}.{c}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_drops_host_octet() {
        assert_eq!(subnet_prefix(Ipv4Addr::new(192, 168, 1, 100)), "192.168.1");
        assert_eq!(subnet_prefix(Ipv4Addr::new(10, 0, 0, 1)), "10.0.0");
    }
}
