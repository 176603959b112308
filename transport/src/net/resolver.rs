use std::{
    io,
    net::{SocketAddr, ToSocketAddrs},
};

/// Orders candidate addresses for an active connection attempt.
///
/// The transport tries candidates strictly in the returned order, so a
/// resolver controls the racing preference (e.g. IPv6 before IPv4).
pub trait Resolver: Send + Sync {
    /// Resolve `host`/`service` to a non-empty, ordered candidate list.
    fn resolve(&self, host: &str, service: &str) -> io::Result<Vec<SocketAddr>>;
}

/// System resolver backed by `getaddrinfo` through [`ToSocketAddrs`].
///
/// The service must be numeric; named services are not supported by the
/// standard library lookup.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str, service: &str) -> io::Result<Vec<SocketAddr>> {
        let port: u16 = service.parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("service \"{service}\" is not a numeric port"),
            )
        })?;

        let candidates: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
        if candidates.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses found for \"{host}:{service}\""),
            ));
        }
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_host_resolves() {
        let candidates = SystemResolver.resolve("127.0.0.1", "8080").unwrap();
        assert_eq!(candidates, vec!["127.0.0.1:8080".parse().unwrap()]);
    }

    #[test]
    fn test_non_numeric_service_is_rejected() {
        let err = SystemResolver.resolve("127.0.0.1", "https").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_localhost_resolves_to_loopback() {
        let candidates = SystemResolver.resolve("localhost", "80").unwrap();
        assert!(!candidates.is_empty());
        assert!(candidates.iter().all(|addr| addr.ip().is_loopback()));
    }
}
