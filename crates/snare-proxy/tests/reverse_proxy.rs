//! The real reverse-proxy handler, end to end over plaintext HTTP: body
//! streaming, tee capture, deferred logging, and the 500 path.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use snare_log::{Level, Logger, MemoryWriter};
use snare_proxy::{HttpServer, ReverseProxy, UpstreamResolver};
use tokio::sync::{oneshot, watch};

/// Origin that records every request body and answers with a fixed payload.
async fn spawn_origin(received: Arc<Mutex<Vec<Vec<u8>>>>) -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind origin");
    let port = listener.local_addr().expect("addr").port();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let received = Arc::clone(&received);
            tokio::spawn(async move {
                let service = service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
                    let received = Arc::clone(&received);
                    async move {
                        let body = request
                            .into_body()
                            .collect()
                            .await
                            .expect("origin body")
                            .to_bytes();
                        received.lock().expect("lock poisoned").push(body.to_vec());
                        Ok::<_, std::convert::Infallible>(hyper::Response::new(Full::new(
                            Bytes::from_static(b"origin payload"),
                        )))
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    port
}

async fn spawn_proxy(logger: Logger) -> (u16, watch::Sender<bool>) {
    let handler = Arc::new(ReverseProxy::new(
        UpstreamResolver::system(),
        true,
        logger.clone(),
    ));
    let server = HttpServer {
        listen_addr: "127.0.0.1".to_string(),
        port: 0,
        logger,
        handler,
    };

    let (ready_tx, ready_rx) = oneshot::channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = server.listen_and_serve(ready_tx, shutdown_rx).await;
    });
    let port = tokio::time::timeout(Duration::from_secs(1), ready_rx)
        .await
        .expect("ready in time")
        .expect("ready value");
    (port, shutdown_tx)
}

async fn wait_for_emission(writer: &MemoryWriter) -> serde_json::Value {
    for _ in 0..100 {
        for line in writer.snapshot() {
            let value: serde_json::Value = serde_json::from_str(&line).expect("json line");
            if value.get("request").is_some() {
                return value;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("request log message never emitted");
}

#[tokio::test(flavor = "multi_thread")]
async fn proxied_bodies_stream_through_and_are_captured_for_the_log() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let origin_port = spawn_origin(Arc::clone(&received)).await;

    let writer = MemoryWriter::default();
    let logger = Logger::builder(Level::Info).writer(writer.clone()).build();
    let (proxy_port, _shutdown) = spawn_proxy(logger).await;

    let payload = vec![0x5au8; 16 * 1024];
    let client = Client::builder(TokioExecutor::new()).build_http();
    let request = hyper::Request::builder()
        .method(hyper::Method::POST)
        .uri(format!("http://127.0.0.1:{proxy_port}/submit"))
        .header(hyper::header::HOST, format!("127.0.0.1:{origin_port}"))
        .body(Full::new(Bytes::from(payload.clone())))
        .expect("request");

    let response = client.request(request).await.expect("proxied request");
    assert_eq!(response.status(), 200);
    let body = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    assert_eq!(body.as_ref(), b"origin payload");

    // The origin saw every forwarded byte.
    let seen = received.lock().expect("lock poisoned").clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0], payload);

    // The log message emitted after the response body finished, carrying
    // the tee'd request body and the response snapshot.
    let message = wait_for_emission(&writer).await;
    assert_eq!(message["level"], "INFO");
    assert_eq!(message["fields"]["status_code"], 200);
    assert_eq!(
        message["fields"]["response_bytes"],
        "origin payload".len()
    );
    assert_eq!(message["request"]["method"], "POST");
    assert_eq!(message["request"]["body"], STANDARD.encode(&payload));
    assert_eq!(
        message["response"]["body"],
        STANDARD.encode(b"origin payload")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_origin_yields_500_and_an_error_log() {
    // Bind and drop to find a port with nothing behind it.
    let closed_port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("probe");
        listener.local_addr().expect("addr").port()
    };

    let writer = MemoryWriter::default();
    let logger = Logger::builder(Level::Info).writer(writer.clone()).build();
    let (proxy_port, _shutdown) = spawn_proxy(logger).await;

    let client = Client::builder(TokioExecutor::new()).build_http();
    let request = hyper::Request::builder()
        .uri(format!("http://127.0.0.1:{proxy_port}/"))
        .header(hyper::header::HOST, format!("127.0.0.1:{closed_port}"))
        .body(Full::new(Bytes::new()))
        .expect("request");

    let response = client.request(request).await.expect("request completes");
    assert_eq!(response.status(), 500);

    let message = wait_for_emission(&writer).await;
    assert_eq!(message["level"], "ERROR");
    assert_eq!(message["message"], "failed round trip");
    assert!(message.get("error").is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn listener_reports_server_closed_after_shutdown() {
    let writer = MemoryWriter::default();
    let logger = Logger::builder(Level::Info).writer(writer.clone()).build();

    let handler = Arc::new(ReverseProxy::new(
        UpstreamResolver::system(),
        false,
        logger.clone(),
    ));
    let server = HttpServer {
        listen_addr: "127.0.0.1".to_string(),
        port: 0,
        logger,
        handler,
    };

    let (ready_tx, ready_rx) = oneshot::channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let serving = tokio::spawn(server.listen_and_serve(ready_tx, shutdown_rx));
    let _port = ready_rx.await.expect("ready");

    shutdown_tx.send(true).expect("signal shutdown");
    let terminal = tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .expect("terminates promptly")
        .expect("join");
    let error = terminal.expect_err("clean shutdown reports the sentinel");
    assert!(error.is(snare_core::ErrorKind::ServerClosed));
}
