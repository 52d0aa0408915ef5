use std::io;
use std::net::{IpAddr, Ipv6Addr, ToSocketAddrs};
use std::str::FromStr;

use super::util::to_canonical;
use super::{AllowedNetworkUses, ErrorCode, SocketError, SocketResult};
use crate::runtime::spawn_blocking;

/// Resolves `name` to the IP addresses it stands for.
///
/// IP literals are returned as-is without touching the resolver. Results are
/// canonicalized (IPv4-mapped IPv6 addresses become IPv4) and de-duplicated,
/// keeping the resolver's order.
pub(crate) async fn resolve_addresses(
    allowed: &AllowedNetworkUses,
    name: &str,
) -> SocketResult<Vec<IpAddr>> {
    allowed.check_allowed_ip_name_lookup()?;
    match parse(name)? {
        url::Host::Ipv4(v4) => Ok(vec![IpAddr::V4(v4)]),
        url::Host::Ipv6(v6) => Ok(vec![IpAddr::V6(v6)]),
        url::Host::Domain(domain) => {
            let resolved = spawn_blocking(move || {
                (domain.as_str(), 0)
                    .to_socket_addrs()
                    .map(|addrs| addrs.map(|a| to_canonical(&a.ip())).collect::<Vec<_>>())
            })
            .await
            .map_err(lookup_error)?;
            let mut addresses = Vec::with_capacity(resolved.len());
            for addr in resolved {
                if !addresses.contains(&addr) {
                    addresses.push(addr);
                }
            }
            Ok(addresses)
        }
    }
}

fn parse(name: &str) -> SocketResult<url::Host> {
    // `url::Host::parse` only accepts bracketed IPv6 literals.
    if let Ok(v6) = Ipv6Addr::from_str(name) {
        return Ok(url::Host::Ipv6(v6));
    }
    url::Host::parse(name).map_err(|e| SocketError::with_detail(ErrorCode::InvalidArgument, e.to_string()))
}

fn lookup_error(err: io::Error) -> SocketError {
    let code = match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::InvalidInput => ErrorCode::NameUnresolvable,
        io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            ErrorCode::TemporaryResolverFailure
        }
        _ => {
            // getaddrinfo reports its own codes as `Other`; the message says
            // whether the name does not exist.
            let message = err.to_string();
            if message.contains("not known") || message.contains("No address") {
                ErrorCode::NameUnresolvable
            } else if message.contains("Temporary failure") || message.contains("try again") {
                ErrorCode::TemporaryResolverFailure
            } else {
                ErrorCode::PermanentResolverFailure
            }
        }
    };
    SocketError::with_detail(code, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed() -> AllowedNetworkUses {
        AllowedNetworkUses {
            ip_name_lookup: true,
            ..AllowedNetworkUses::default()
        }
    }

    #[tokio::test]
    async fn literals_skip_the_resolver() {
        let v4 = resolve_addresses(&allowed(), "127.0.0.1").await.unwrap();
        assert_eq!(v4, vec![IpAddr::from([127, 0, 0, 1])]);
        let v6 = resolve_addresses(&allowed(), "::1").await.unwrap();
        assert_eq!(v6, vec![IpAddr::V6(Ipv6Addr::LOCALHOST)]);
        let bracketed = resolve_addresses(&allowed(), "[::1]").await.unwrap();
        assert_eq!(bracketed, v6);
    }

    #[tokio::test]
    async fn invalid_names_are_invalid_argument() {
        for name in ["", "exa mple.com", "a:b"] {
            let err = resolve_addresses(&allowed(), name).await.unwrap_err();
            assert_eq!(*err.code(), ErrorCode::InvalidArgument, "{name:?}");
        }
    }

    #[tokio::test]
    async fn lookup_must_be_enabled() {
        let err = resolve_addresses(&AllowedNetworkUses::default(), "localhost")
            .await
            .unwrap_err();
        assert_eq!(*err.code(), ErrorCode::AccessDenied);
    }

    #[test]
    fn resolver_messages_are_classified() {
        let err = io::Error::other("failed to lookup address information: Name or service not known");
        assert_eq!(*lookup_error(err).code(), ErrorCode::NameUnresolvable);
        let err = io::Error::other("Temporary failure in name resolution");
        assert_eq!(*lookup_error(err).code(), ErrorCode::TemporaryResolverFailure);
    }
}
