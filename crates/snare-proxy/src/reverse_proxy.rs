//! The shared request handler: transparent reverse proxying with streamed,
//! tee-captured bodies and deferred structured logging.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::RootCertStore;
use snare_log::{BodyCapture, Logger, RequestRecord, ResponseRecord};

use crate::body::{LogFinisher, TeeBody};
use crate::resolve::UpstreamResolver;

/// Body type every listener hands back to hyper.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

type UpstreamClient =
    Client<HttpsConnector<HttpConnector<UpstreamResolver>>, TeeBody<Incoming>>;

/// Per-request entry point shared by the HTTP and TLS listeners. The
/// supervisor installs [`ReverseProxy`]; tests may install their own.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(
        self: Arc<Self>,
        request: Request<Incoming>,
        remote_addr: SocketAddr,
        tls: bool,
    ) -> Pin<Box<dyn Future<Output = Response<ProxyBody>> + Send>>;
}

/// Round-trips each received request to the origin named by its Host,
/// streaming both bodies and logging one structured message per request
/// once the response body has been relayed.
pub struct ReverseProxy {
    client: UpstreamClient,
    log_responses: bool,
    logger: Logger,
}

impl ReverseProxy {
    pub fn new(resolver: UpstreamResolver, log_responses: bool, logger: Logger) -> Self {
        Self {
            client: build_client(resolver),
            log_responses,
            logger,
        }
    }

    async fn serve(
        &self,
        request: Request<Incoming>,
        remote_addr: SocketAddr,
        tls: bool,
    ) -> Response<ProxyBody> {
        let (mut parts, body) = request.into_parts();

        // The origin is whatever the client believes it is talking to.
        let host = parts
            .uri
            .authority()
            .map(|authority| authority.to_string())
            .or_else(|| {
                parts
                    .headers
                    .get(http::header::HOST)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string)
            });
        let Some(host) = host else {
            self.logger
                .with_field("remote_addr", remote_addr.to_string())
                .error("request carries no host");
            return status_response(StatusCode::INTERNAL_SERVER_ERROR);
        };

        let scheme = if tls { "https" } else { "http" };
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|path| path.as_str())
            .unwrap_or("/");
        let uri: Uri = match format!("{scheme}://{host}{path_and_query}").parse() {
            Ok(uri) => uri,
            Err(error) => {
                self.logger
                    .with_error(&error)
                    .with_field("host", host)
                    .error("failed to build upstream url");
                return status_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };
        parts.uri = uri.clone();

        let request_capture = BodyCapture::default();
        let record = RequestRecord::from_parts(&parts, remote_addr, tls, request_capture.clone());
        let msg = self.logger.message().with_request(record);

        let mut upstream_request = Request::new(TeeBody::new(
            body,
            Some(request_capture),
            None,
        ));
        *upstream_request.method_mut() = parts.method.clone();
        *upstream_request.uri_mut() = uri;
        *upstream_request.headers_mut() = parts.headers.clone();

        let upstream_response = match self.client.request(upstream_request).await {
            Ok(response) => response,
            Err(error) => {
                msg.with_error(&error).error("failed round trip");
                return status_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        let (upstream_parts, upstream_body) = upstream_response.into_parts();
        let mut msg = msg.with_field("status_code", upstream_parts.status.as_u16());

        let response_capture = if self.log_responses {
            let capture = BodyCapture::default();
            msg = msg.with_response(ResponseRecord::from_parts(&upstream_parts, capture.clone()));
            Some(capture)
        } else {
            None
        };

        let tee = TeeBody::new(upstream_body, response_capture, Some(LogFinisher::new(msg)));
        let mut response = Response::new(tee.boxed());
        *response.status_mut() = upstream_parts.status;
        // Copied verbatim, hop-by-hop headers included.
        *response.headers_mut() = upstream_parts.headers;
        response
    }
}

impl RequestHandler for ReverseProxy {
    fn handle(
        self: Arc<Self>,
        request: Request<Incoming>,
        remote_addr: SocketAddr,
        tls: bool,
    ) -> Pin<Box<dyn Future<Output = Response<ProxyBody>> + Send>> {
        Box::pin(async move { self.serve(request, remote_addr, tls).await })
    }
}

pub(crate) fn status_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(
        Empty::<Bytes>::new()
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = status;
    response
}

fn build_client(resolver: UpstreamResolver) -> UpstreamClient {
    let mut http = HttpConnector::new_with_resolver(resolver);
    http.enforce_http(false);

    let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    Client::builder(TokioExecutor::new()).build(connector)
}

