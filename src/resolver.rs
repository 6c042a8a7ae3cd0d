use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use log::debug;

use crate::address::NetLocation;

pub trait Resolver: Send + Sync {
    fn resolve_location(
        &self,
        location: &NetLocation,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<Vec<SocketAddr>>> + Send>>;
}

pub struct NativeResolver;

impl NativeResolver {
    pub fn new() -> Self {
        NativeResolver {}
    }
}

impl Default for NativeResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver for NativeResolver {
    fn resolve_location(
        &self,
        location: &NetLocation,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<Vec<SocketAddr>>> + Send>> {
        // Already-numeric locations skip the system resolver.
        if let Some(addr) = location.to_socket_addr() {
            return Box::pin(async move { Ok(vec![addr]) });
        }

        let address = location.address().clone();
        let port = location.port();
        use futures::future::FutureExt;
        Box::pin(
            tokio::net::lookup_host((address.to_string(), port)).map(move |result| {
                let ret = result.map(|r| {
                    r.filter(|addr| !addr.ip().is_unspecified())
                        .collect::<Vec<_>>()
                });
                debug!("NativeResolver resolved {}:{} -> {:?}", address, port, ret);
                ret
            }),
        )
    }
}

pub async fn resolve_single_address(
    resolver: &Arc<dyn Resolver>,
    location: &NetLocation,
) -> std::io::Result<SocketAddr> {
    let resolve_results = resolver.resolve_location(location).await?;
    if resolve_results.is_empty() {
        return Err(std::io::Error::other(format!(
            "could not resolve location: {location}"
        )));
    }
    Ok(resolve_results[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;

    #[tokio::test]
    async fn test_resolve_numeric() {
        let resolver: Arc<dyn Resolver> = Arc::new(NativeResolver::new());
        let location = NetLocation::from_str("127.0.0.1:9999").unwrap();
        let addr = resolve_single_address(&resolver, &location).await.unwrap();
        assert_eq!(addr, "127.0.0.1:9999".parse().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let resolver: Arc<dyn Resolver> = Arc::new(NativeResolver::new());
        let location = NetLocation::new(Address::Hostname("localhost".to_string()), 80);
        let addr = resolve_single_address(&resolver, &location).await.unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 80);
    }
}
