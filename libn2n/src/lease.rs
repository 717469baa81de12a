use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

/// The addresses of an established tunnel.
///
/// Local address, peer and netmask only ever exist together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub local: Ipv4Addr,
    pub peer: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

impl Lease {
    /// Builds a lease from the address the DHCP client configured.
    ///
    /// n2n communities hand out addresses with the supernode-side router on
    /// `.1`, so the peer is the local address with the last octet set to 1.
    pub fn from_network(network: Ipv4Network) -> Self {
        let local = network.ip();
        let [a, b, c, _] = local.octets();
        Self {
            local,
            peer: Ipv4Addr::new(a, b, c, 1),
            netmask: network.mask(),
        }
    }

    /// The (network, netmask) pair routed through the tunnel.
    pub fn prefix(&self) -> Option<(Ipv4Addr, Ipv4Addr)> {
        Ipv4Network::with_netmask(self.local, self.netmask)
            .ok()
            .map(|net| (net.network(), net.mask()))
    }
}
