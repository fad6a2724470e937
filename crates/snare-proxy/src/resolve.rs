//! Name resolution for the upstream transport.
//!
//! When a `dns_server` is configured, the reverse proxy's connector resolves
//! origin hosts through that server instead of the system resolver. The
//! override is threaded into the connector explicitly rather than mutating
//! any process-wide state.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use hyper_util::client::legacy::connect::dns::Name;

/// Resolver handed to the HTTP connector. Without an override it defers to
/// the system's `getaddrinfo` via tokio.
#[derive(Clone)]
pub struct UpstreamResolver {
    custom: Option<Arc<TokioResolver>>,
}

impl std::fmt::Debug for UpstreamResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResolver")
            .field("custom", &self.custom.is_some())
            .finish()
    }
}

impl UpstreamResolver {
    pub fn system() -> Self {
        Self { custom: None }
    }

    /// Resolver pinned to one nameserver, queried over UDP and TCP on
    /// port 53.
    pub fn with_nameserver(server: IpAddr) -> Self {
        let group = NameServerConfigGroup::from_ips_clear(&[server], 53, true);
        let config = ResolverConfig::from_parts(None, Vec::new(), group);
        let resolver =
            TokioResolver::builder_with_config(config, TokioConnectionProvider::default()).build();
        Self {
            custom: Some(Arc::new(resolver)),
        }
    }
}

impl tower_service::Service<Name> for UpstreamResolver {
    type Response = std::vec::IntoIter<SocketAddr>;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = io::Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, name: Name) -> Self::Future {
        let custom = self.custom.clone();
        Box::pin(async move {
            match custom {
                Some(resolver) => {
                    let lookup = resolver
                        .lookup_ip(name.as_str())
                        .await
                        .map_err(|error| io::Error::other(error.to_string()))?;
                    let addrs: Vec<SocketAddr> = lookup
                        .iter()
                        .map(|ip| SocketAddr::new(ip, 0))
                        .collect();
                    Ok(addrs.into_iter())
                }
                None => {
                    let addrs: Vec<SocketAddr> =
                        tokio::net::lookup_host((name.as_str(), 0)).await?.collect();
                    Ok(addrs.into_iter())
                }
            }
        })
    }
}
