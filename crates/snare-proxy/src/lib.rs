//! MITM HTTP/HTTPS interception proxy.
//!
//! The supervisor ([`MitmProxy`]) terminates TLS with certificates minted
//! per SNI by [`snare_certs::CertStore`], relays every request to its
//! origin through the [`ReverseProxy`] handler, and optionally runs a
//! redirecting DNS server that points victims at the proxy. Intended for
//! clients that trust the proxy's private CA in controlled test
//! environments.

mod body;
mod http_server;
mod resolve;
mod reverse_proxy;
mod supervisor;
mod tls_server;

pub use body::{LogFinisher, TeeBody};
pub use http_server::HttpServer;
pub use resolve::UpstreamResolver;
pub use reverse_proxy::{ProxyBody, RequestHandler, ReverseProxy};
pub use supervisor::{MitmProxy, ShutdownHandle};
pub use tls_server::TlsServer;
