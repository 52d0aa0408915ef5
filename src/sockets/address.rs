//! Socket addresses in the shape guests exchange them.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;

use super::{ErrorCode, SocketError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IpAddressFamily {
    Ipv4,
    Ipv6,
}

impl From<IpAddressFamily> for cap_net_ext::AddressFamily {
    fn from(family: IpAddressFamily) -> Self {
        match family {
            IpAddressFamily::Ipv4 => cap_net_ext::AddressFamily::Ipv4,
            IpAddressFamily::Ipv6 => cap_net_ext::AddressFamily::Ipv6,
        }
    }
}

impl From<cap_net_ext::AddressFamily> for IpAddressFamily {
    fn from(family: cap_net_ext::AddressFamily) -> Self {
        match family {
            cap_net_ext::AddressFamily::Ipv4 => IpAddressFamily::Ipv4,
            cap_net_ext::AddressFamily::Ipv6 => IpAddressFamily::Ipv6,
        }
    }
}

pub type Ipv4Address = (u8, u8, u8, u8);
pub type Ipv6Address = (u16, u16, u16, u16, u16, u16, u16, u16);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IpSocketAddress {
    Ipv4 {
        port: u16,
        address: Ipv4Address,
    },
    Ipv6 {
        port: u16,
        flow_info: u32,
        address: Ipv6Address,
        scope_id: u32,
    },
}

impl IpSocketAddress {
    pub fn family(&self) -> IpAddressFamily {
        match self {
            IpSocketAddress::Ipv4 { .. } => IpAddressFamily::Ipv4,
            IpSocketAddress::Ipv6 { .. } => IpAddressFamily::Ipv6,
        }
    }

    pub fn port(&self) -> u16 {
        match *self {
            IpSocketAddress::Ipv4 { port, .. } | IpSocketAddress::Ipv6 { port, .. } => port,
        }
    }
}

fn from_ipv4_addr(addr: Ipv4Addr) -> Ipv4Address {
    let [x0, x1, x2, x3] = addr.octets();
    (x0, x1, x2, x3)
}

fn to_ipv4_addr(addr: Ipv4Address) -> Ipv4Addr {
    let (x0, x1, x2, x3) = addr;
    Ipv4Addr::new(x0, x1, x2, x3)
}

fn from_ipv6_addr(addr: Ipv6Addr) -> Ipv6Address {
    let [x0, x1, x2, x3, x4, x5, x6, x7] = addr.segments();
    (x0, x1, x2, x3, x4, x5, x6, x7)
}

fn to_ipv6_addr(addr: Ipv6Address) -> Ipv6Addr {
    let (x0, x1, x2, x3, x4, x5, x6, x7) = addr;
    Ipv6Addr::new(x0, x1, x2, x3, x4, x5, x6, x7)
}

impl From<SocketAddr> for IpSocketAddress {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => IpSocketAddress::Ipv4 {
                port: v4.port(),
                address: from_ipv4_addr(*v4.ip()),
            },
            SocketAddr::V6(v6) => IpSocketAddress::Ipv6 {
                port: v6.port(),
                flow_info: v6.flowinfo(),
                address: from_ipv6_addr(*v6.ip()),
                scope_id: v6.scope_id(),
            },
        }
    }
}

impl From<IpSocketAddress> for SocketAddr {
    fn from(addr: IpSocketAddress) -> Self {
        match addr {
            IpSocketAddress::Ipv4 { port, address } => {
                SocketAddr::V4(SocketAddrV4::new(to_ipv4_addr(address), port))
            }
            IpSocketAddress::Ipv6 {
                port,
                flow_info,
                address,
                scope_id,
            } => SocketAddr::V6(SocketAddrV6::new(
                to_ipv6_addr(address),
                port,
                flow_info,
                scope_id,
            )),
        }
    }
}

/// Renders `a.b.c.d:port` or `[v6]:port`, with `%scope` when set. Flow info
/// is not part of the textual form.
impl fmt::Display for IpSocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        SocketAddr::from(*self).fmt(f)
    }
}

impl FromStr for IpSocketAddress {
    type Err = SocketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>()
            .map(IpSocketAddress::from)
            .map_err(|e| SocketError::with_detail(ErrorCode::InvalidArgument, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn textual_addr() -> impl Strategy<Value = SocketAddr> {
        prop_oneof![
            (any::<[u8; 4]>(), any::<u16>())
                .prop_map(|(ip, port)| SocketAddr::from((Ipv4Addr::from(ip), port))),
            (any::<[u16; 8]>(), any::<u16>(), any::<u32>()).prop_map(|(ip, port, scope)| {
                SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(ip), port, 0, scope))
            }),
        ]
    }

    proptest! {
        #[test]
        fn text_form_round_trips(addr in textual_addr()) {
            let text = IpSocketAddress::from(addr).to_string();
            let parsed: IpSocketAddress = text.parse().unwrap();
            prop_assert_eq!(parsed.to_string(), text);
            prop_assert_eq!(SocketAddr::from(parsed), addr);
        }
    }

    #[test]
    fn garbage_is_invalid_argument() {
        let err = "localhost:80".parse::<IpSocketAddress>().unwrap_err();
        assert_eq!(*err.code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn family_follows_variant() {
        let v4: IpSocketAddress = "127.0.0.1:8080".parse().unwrap();
        assert_eq!(v4.family(), IpAddressFamily::Ipv4);
        assert_eq!(v4.port(), 8080);
        let v6: IpSocketAddress = "[::1]:1".parse().unwrap();
        assert_eq!(v6.family(), IpAddressFamily::Ipv6);
    }
}
