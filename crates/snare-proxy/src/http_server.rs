//! Plaintext HTTP listener.

use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use snare_core::{ErrorKind, ProxyError};
use snare_log::Logger;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};

use crate::reverse_proxy::RequestHandler;

/// Serves plaintext HTTP/1.1 on one port with the shared request handler.
/// Port `0` binds an ephemeral port, reported over the `ready` channel.
pub struct HttpServer {
    pub listen_addr: String,
    pub port: u16,
    pub logger: Logger,
    pub handler: Arc<dyn RequestHandler>,
}

impl HttpServer {
    /// Binds, signals readiness with the bound port, and serves until the
    /// shutdown signal flips. The benign terminal result is
    /// [`ErrorKind::ServerClosed`].
    pub async fn listen_and_serve(
        self,
        ready: oneshot::Sender<u16>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ProxyError> {
        let listener = TcpListener::bind((self.listen_addr.as_str(), self.port))
            .await
            .map_err(|error| {
                ProxyError::new(ErrorKind::HttpProxyStart)
                    .with_reason(format!("{}:{}", self.listen_addr, self.port))
                    .with_cause(error)
            })?;
        let bound = listener.local_addr().map_err(|error| {
            ProxyError::new(ErrorKind::HttpProxyStart).with_cause(error)
        })?;

        self.logger
            .with_field("addr", bound.to_string())
            .info("http server started");
        let _ = ready.send(bound.port());

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        let handler = Arc::clone(&self.handler);
                        let logger = self.logger.clone();
                        let port = bound.port();
                        tokio::spawn(async move {
                            let service = service_fn(move |request| {
                                let handler = Arc::clone(&handler);
                                async move {
                                    let response =
                                        handler.handle(request, remote_addr, false).await;
                                    Ok::<_, std::convert::Infallible>(response)
                                }
                            });
                            let served = http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), service)
                                .await;
                            if let Err(error) = served {
                                logger
                                    .with_field("server", "http")
                                    .with_field("port", port)
                                    .with_error(&error)
                                    .error("connection failed");
                            }
                        });
                    }
                    Err(error) => {
                        self.logger
                            .with_field("server", "http")
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
