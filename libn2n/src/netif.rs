use std::net::IpAddr;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::TryStreamExt;
use ipnetwork::Ipv4Network;
use log::debug;
use netlink_packet_route::{AddressFamily, address::AddressAttribute};
use rtnetlink::{Handle, new_connection};

/// OS queries the supervisor needs about the tunnel interface.
#[async_trait]
pub trait NetProbe: Send + Sync + 'static {
    /// Whether an interface with this name currently exists.
    async fn interface_exists(&self, name: &str) -> anyhow::Result<bool>;

    /// The first IPv4 address (with prefix) assigned to the interface, if any.
    async fn ipv4_address(&self, name: &str) -> anyhow::Result<Option<Ipv4Network>>;
}

/// [`NetProbe`] backed by an rtnetlink connection.
#[derive(Clone)]
pub struct NetlinkProbe {
    handle: Handle,
}

impl NetlinkProbe {
    /// Opens the netlink socket. Must be called inside a tokio runtime.
    pub fn new() -> anyhow::Result<Self> {
        let (connection, handle, _) =
            new_connection().map_err(|e| anyhow!("Failed to create rtnetlink connection: {}", e))?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    async fn link_index(&self, name: &str) -> anyhow::Result<Option<u32>> {
        let mut links = self.handle.link().get().match_name(name.to_string()).execute();
        match links.try_next().await {
            Ok(link) => Ok(link.map(|l| l.header.index)),
            // the kernel answers ENODEV for unknown names
            Err(rtnetlink::Error::NetlinkError(e)) => {
                debug!("link {name} not found: {e}");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl NetProbe for NetlinkProbe {
    async fn interface_exists(&self, name: &str) -> anyhow::Result<bool> {
        Ok(self.link_index(name).await?.is_some())
    }

    async fn ipv4_address(&self, name: &str) -> anyhow::Result<Option<Ipv4Network>> {
        let Some(index) = self.link_index(name).await? else {
            return Ok(None);
        };

        let mut stream = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();

        while let Some(msg) = stream.try_next().await? {
            if msg.header.family != AddressFamily::Inet {
                continue;
            }
            let mut local = None;
            let mut address = None;
            for attr in &msg.attributes {
                match attr {
                    AddressAttribute::Local(IpAddr::V4(ip)) => local = Some(*ip),
                    AddressAttribute::Address(IpAddr::V4(ip)) => address = Some(*ip),
                    _ => {}
                }
            }
            // IFA_LOCAL is the interface's own address on point-to-point links
            if let Some(ip) = local.or(address) {
                return Ok(Some(Ipv4Network::new(ip, msg.header.prefix_len)?));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires netlink access"]
    async fn test_loopback_has_ipv4() {
        let probe = NetlinkProbe::new().unwrap();
        assert!(probe.interface_exists("lo").await.unwrap());
        let addr = probe.ipv4_address("lo").await.unwrap().unwrap();
        assert!(addr.ip().is_loopback());
    }

    #[tokio::test]
    #[ignore = "requires netlink access"]
    async fn test_missing_interface() {
        let probe = NetlinkProbe::new().unwrap();
        assert!(!probe.interface_exists("n2n-missing0").await.unwrap());
        assert!(probe.ipv4_address("n2n-missing0").await.unwrap().is_none());
    }
}
