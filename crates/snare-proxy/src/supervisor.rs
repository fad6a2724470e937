//! The proxy supervisor: owns the configuration, brings up the certificate
//! store, the DNS interceptor, and every listener, then watches one errors
//! channel until something terminates.

use std::sync::Arc;
use std::time::Duration;

use snare_certs::CertStore;
use snare_core::{Config, ErrorKind, ProxyError, DNS_SERVER_FATAL};
use snare_dns::DnsServer;
use snare_log::Logger;
use tokio::sync::{mpsc, oneshot, watch};

use crate::http_server::HttpServer;
use crate::resolve::UpstreamResolver;
use crate::reverse_proxy::{RequestHandler, ReverseProxy};
use crate::tls_server::TlsServer;

/// How long each listener gets to report readiness after spawn.
const READY_TIMEOUT: Duration = Duration::from_secs(1);
/// Deadline for collecting every listener's terminal result at shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Requests a supervisor shutdown from another task.
#[derive(Clone)]
pub struct ShutdownHandle {
    signal: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.signal.send(true);
    }
}

/// Brings the whole proxy up and supervises it. Lifecycle:
/// `new` → [`MitmProxy::start`] (certs, DNS, listeners ready) →
/// [`MitmProxy::wait`] (first terminal result) → [`MitmProxy::shutdown`].
/// [`MitmProxy::run`] chains all three.
pub struct MitmProxy {
    config: Config,
    logger: Logger,
    certs: Option<Arc<CertStore>>,
    handler: Option<Arc<dyn RequestHandler>>,
    shutdown_signal: watch::Sender<bool>,
    errors: Option<mpsc::Receiver<ProxyError>>,
    remaining: usize,
}

impl MitmProxy {
    pub fn new(config: Config, logger: Logger) -> Self {
        let (shutdown_signal, _) = watch::channel(false);
        Self {
            config,
            logger,
            certs: None,
            handler: None,
            shutdown_signal,
            errors: None,
            remaining: 0,
        }
    }

    /// Replaces the reverse proxy with a custom request handler.
    pub fn with_handler(config: Config, logger: Logger, handler: Arc<dyn RequestHandler>) -> Self {
        let mut proxy = Self::new(config, logger);
        proxy.handler = Some(handler);
        proxy
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bound HTTPS ports, populated once `start` returns.
    pub fn https_ports(&self) -> &[u16] {
        &self.config.https_ports
    }

    pub fn http_ports(&self) -> &[u16] {
        &self.config.http_ports
    }

    pub fn certs(&self) -> Option<&Arc<CertStore>> {
        self.certs.as_ref()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            signal: self.shutdown_signal.clone(),
        }
    }

    /// Starts everything and blocks until the first listener terminates.
    /// A benign termination (someone asked for shutdown) drains the rest
    /// and returns success; anything else shuts the proxy down and
    /// propagates.
    pub async fn run(&mut self) -> Result<(), ProxyError> {
        self.start().await?;
        self.wait().await
    }

    /// Phase one: certificate store, DNS interceptor, then one listener per
    /// configured port, each awaited for readiness. Ephemeral ports are
    /// written back into the config vectors.
    pub async fn start(&mut self) -> Result<(), ProxyError> {
        let certs = Arc::new(CertStore::new(self.config.ca_key_bits));
        if !self.config.ca_cert_file.is_empty() && !self.config.ca_key_file.is_empty() {
            certs.load_ca(&self.config.ca_key_file, &self.config.ca_cert_file)?;
        } else {
            certs.generate_ca(Duration::ZERO)?;
            let (cert_path, key_path) =
                certs.write_ca(&self.config.ca_cert_file, &self.config.ca_key_file)?;
            self.logger
                .with_field("ca_cert_file", cert_path.display().to_string())
                .with_field("ca_key_file", key_path.display().to_string())
                .info("certificate authority written");
        }
        self.certs = Some(Arc::clone(&certs));

        let handler = match self.handler.clone() {
            Some(handler) => handler,
            None => {
                let resolver = self.upstream_resolver();
                let handler: Arc<dyn RequestHandler> = Arc::new(ReverseProxy::new(
                    resolver,
                    self.config.log_responses,
                    self.logger.clone(),
                ));
                self.handler = Some(Arc::clone(&handler));
                handler
            }
        };

        if self.config.dns_port > 0 {
            let upstream = if self.config.dns_server.is_empty() {
                snare_dns::DEFAULT_DNS_SERVER.to_string()
            } else {
                self.config.dns_server.clone()
            };
            let dns = DnsServer::new(
                self.config.listen_addr.clone(),
                self.config.dns_port,
                upstream,
                self.config.dns_regex.clone(),
                self.logger.clone(),
            );
            let logger = self.logger.clone();
            tokio::spawn(async move {
                if let Err(error) = dns.listen_and_serve().await {
                    logger
                        .with_error(&error)
                        .with_exit_code(DNS_SERVER_FATAL)
                        .fatal("dns server failed");
                }
            });
        }

        let total = self.config.https_ports.len() + self.config.http_ports.len();
        let (error_tx, error_rx) = mpsc::channel(total.max(1));

        for index in 0..self.config.https_ports.len() {
            let server = TlsServer {
                listen_addr: self.config.listen_addr.clone(),
                port: self.config.https_ports[index],
                certs: Arc::clone(&certs),
                logger: self.logger.clone(),
                handler: Arc::clone(&handler),
            };
            let port = self
                .spawn_listener(index, error_tx.clone(), ErrorKind::TlsProxyStart, |ready, shutdown| {
                    Box::pin(server.listen_and_serve(ready, shutdown))
                })
                .await?;
            self.config.https_ports[index] = port;
        }

        for index in 0..self.config.http_ports.len() {
            let server = HttpServer {
                listen_addr: self.config.listen_addr.clone(),
                port: self.config.http_ports[index],
                logger: self.logger.clone(),
                handler: Arc::clone(&handler),
            };
            let port = self
                .spawn_listener(index, error_tx.clone(), ErrorKind::HttpProxyStart, |ready, shutdown| {
                    Box::pin(server.listen_and_serve(ready, shutdown))
                })
                .await?;
            self.config.http_ports[index] = port;
        }

        self.errors = Some(error_rx);
        self.remaining = total;
        Ok(())
    }

    /// Phase two: block on the first terminal result from any listener.
    pub async fn wait(&mut self) -> Result<(), ProxyError> {
        let first = match self.errors.as_mut() {
            Some(errors) => errors.recv().await,
            None => None,
        };

        match first {
            None => Ok(()),
            Some(error) => {
                self.remaining = self.remaining.saturating_sub(1);
                if error == ErrorKind::ServerClosed {
                    self.shutdown().await
                } else {
                    self.logger.with_error(&error).error("proxy server failed");
                    self.shutdown().await?;
                    Err(error)
                }
            }
        }
    }

    /// Signals every listener to stop and collects their terminal results
    /// under one deadline. The first non-benign result is propagated;
    /// missing the deadline is a shutdown failure of its own.
    pub async fn shutdown(&mut self) -> Result<(), ProxyError> {
        let _ = self.shutdown_signal.send(true);

        let Some(errors) = self.errors.as_mut() else {
            return Ok(());
        };

        let deadline = tokio::time::Instant::now() + SHUTDOWN_TIMEOUT;
        let mut failure: Option<ProxyError> = None;
        while self.remaining > 0 {
            match tokio::time::timeout_at(deadline, errors.recv()).await {
                Err(_) => {
                    return Err(ProxyError::new(ErrorKind::ProxyShutdown).with_reason("timeout"));
                }
                Ok(None) => break,
                Ok(Some(error)) => {
                    self.remaining -= 1;
                    if error != ErrorKind::ServerClosed && failure.is_none() {
                        failure = Some(error);
                    }
                }
            }
        }

        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn upstream_resolver(&self) -> UpstreamResolver {
        if self.config.dns_server.is_empty() {
            return UpstreamResolver::system();
        }
        match self.config.dns_server.parse() {
            Ok(server) => UpstreamResolver::with_nameserver(server),
            Err(error) => {
                self.logger
                    .with_field("dns_server", self.config.dns_server.clone())
                    .with_error(&error)
                    .warning("dns_server is not an IP address, using the system resolver");
                UpstreamResolver::system()
            }
        }
    }

    async fn spawn_listener<F>(
        &self,
        index: usize,
        error_tx: mpsc::Sender<ProxyError>,
        start_kind: ErrorKind,
        serve: F,
    ) -> Result<u16, ProxyError>
    where
        F: FnOnce(
            oneshot::Sender<u16>,
            watch::Receiver<bool>,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<(), ProxyError>> + Send>,
        >,
    {
        let (ready_tx, ready_rx) = oneshot::channel();
        let shutdown_rx = self.shutdown_signal.subscribe();
        let task = serve(ready_tx, shutdown_rx);
        tokio::spawn(async move {
            let terminal = match task.await {
                Ok(()) => ProxyError::new(ErrorKind::ServerClosed),
                Err(error) => error,
            };
            let _ = error_tx.send(terminal).await;
        });

        match tokio::time::timeout(READY_TIMEOUT, ready_rx).await {
            Ok(Ok(port)) => Ok(port),
            _ => Err(ProxyError::new(start_kind)
                .with_reason(format!("listener {index} never reported ready"))),
        }
    }
}
