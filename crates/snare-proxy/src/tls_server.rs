//! TLS listener with per-SNI certificate selection.

use std::sync::Arc;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use snare_certs::CertStore;
use snare_core::{ErrorKind, ProxyError};
use snare_log::Logger;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio_rustls::TlsAcceptor;

use crate::reverse_proxy::RequestHandler;

/// Picks the leaf certificate during the handshake from the SNI the client
/// sent. An absent certificate fails the handshake, which is the desired
/// outcome for empty SNI. The first request for a new host blocks here for
/// the duration of the mint.
#[derive(Debug)]
struct SniResolver {
    certs: Arc<CertStore>,
    logger: Logger,
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name().unwrap_or_default();
        self.logger
            .with_field("server_name", server_name)
            .debug("sni lookup");

        match self.certs.get(server_name) {
            Ok(certified) => certified,
            Err(error) => {
                self.logger
                    .with_field("server_name", server_name)
                    .with_error(&error)
                    .error("sni certificate lookup failed");
                None
            }
        }
    }
}

/// Serves HTTPS on one port: rustls termination with the SNI resolver,
/// HTTP/1.1 and HTTP/2 negotiated over ALPN.
pub struct TlsServer {
    pub listen_addr: String,
    pub port: u16,
    pub certs: Arc<CertStore>,
    pub logger: Logger,
    pub handler: Arc<dyn RequestHandler>,
}

impl TlsServer {
    pub async fn listen_and_serve(
        self,
        ready: oneshot::Sender<u16>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ProxyError> {
        let resolver = Arc::new(SniResolver {
            certs: Arc::clone(&self.certs),
            logger: self.logger.clone(),
        });
        let mut tls_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let listener = TcpListener::bind((self.listen_addr.as_str(), self.port))
            .await
            .map_err(|error| {
                ProxyError::new(ErrorKind::TlsProxyStart)
                    .with_reason(format!("{}:{}", self.listen_addr, self.port))
                    .with_cause(error)
            })?;
        let bound = listener.local_addr().map_err(|error| {
            ProxyError::new(ErrorKind::TlsProxyStart).with_cause(error)
        })?;

        self.logger
            .with_field("addr", bound.to_string())
            .info("https server started");
        let _ = ready.send(bound.port());

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        let acceptor = acceptor.clone();
                        let handler = Arc::clone(&self.handler);
                        let logger = self.logger.clone();
                        let port = bound.port();
                        tokio::spawn(async move {
                            let tls_stream = match acceptor.accept(stream).await {
                                Ok(tls_stream) => tls_stream,
                                Err(error) => {
                                    logger
                                        .with_field("server", "https")
                                        .with_field("port", port)
                                        .with_error(&error)
                                        .debug("tls handshake failed");
                                    return;
                                }
                            };

                            let service = service_fn(move |request| {
                                let handler = Arc::clone(&handler);
                                async move {
                                    let response =
                                        handler.handle(request, remote_addr, true).await;
                                    Ok::<_, std::convert::Infallible>(response)
                                }
                            });
                            let served = auto::Builder::new(TokioExecutor::new())
                                .serve_connection(TokioIo::new(tls_stream), service)
                                .await;
                            if let Err(error) = served {
                                logger
                                    .with_field("server", "https")
                                    .with_field("port", port)
                                    .with_error(&error)
                                    .error("connection failed");
                            }
                        });
                    }
                    Err(error) => {
                        self.logger
                            .with_field("server", "https")
                            .with_field("port", bound.port())
                            .with_error(&error)
                            .error("accept failed");
                    }
                },
                _ = shutdown.changed() => break,
            }
        }

        Err(ProxyError::new(ErrorKind::ServerClosed))
    }
}
