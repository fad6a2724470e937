use std::fs::{File, OpenOptions};
use std::io::{self, Write as _};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http_body_util::Full;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::RootCertStore;

use crate::{Message, Writer};

/// Human-readable lines on stdout.
pub struct TextWriter;

impl Writer for TextWriter {
    fn write(&self, msg: &Message) -> io::Result<()> {
        println!("{}", msg.render_text());
        Ok(())
    }
}

/// One JSON object per line on stdout.
pub struct JsonWriter;

impl Writer for JsonWriter {
    fn write(&self, msg: &Message) -> io::Result<()> {
        println!("{}", msg.to_json().map_err(io::Error::other)?);
        Ok(())
    }
}

/// Appends request/response/DNS messages as JSON lines to a file opened
/// with mode 0600. Messages without records are ignored.
pub struct RequestWriter {
    path: String,
    file: Mutex<Option<File>>,
}

impl RequestWriter {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }
}

impl Writer for RequestWriter {
    fn write(&self, msg: &Message) -> io::Result<()> {
        if self.path.is_empty() || !msg.has_records() {
            return Ok(());
        }

        let mut guard = self.file.lock().expect("lock poisoned");
        if guard.is_none() {
            let mut options = OpenOptions::new();
            options.append(true).create(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            *guard = Some(options.open(&self.path)?);
        }

        let file = guard.as_mut().expect("file just opened");
        let line = msg.to_json().map_err(io::Error::other)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }
}

type WebhookClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// POSTs request/response/DNS messages as JSON to a webhook URL. Delivery
/// is fire-and-forget on the current tokio runtime; failures are counted
/// rather than surfaced to the caller.
pub struct WebhookWriter {
    url: String,
    client: WebhookClient,
    delivered: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl WebhookWriter {
    pub fn new(url: impl Into<String>) -> Self {
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .build();

        Self {
            url: url.into(),
            client: Client::builder(TokioExecutor::new()).build(connector),
            delivered: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

impl Writer for WebhookWriter {
    fn write(&self, msg: &Message) -> io::Result<()> {
        if self.url.is_empty() || !msg.has_records() {
            return Ok(());
        }

        let body = msg.to_json().map_err(io::Error::other)?;
        let request = hyper::Request::builder()
            .method(hyper::Method::POST)
            .uri(&self.url)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(io::Error::other)?;

        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| io::Error::other("webhook writer requires a tokio runtime"))?;
        let client = self.client.clone();
        let url = self.url.clone();
        let delivered = Arc::clone(&self.delivered);
        let failed = Arc::clone(&self.failed);
        handle.spawn(async move {
            match client.request(request).await {
                Ok(response) if response.status().is_success() => {
                    delivered.fetch_add(1, Ordering::Relaxed);
                }
                Ok(response) => {
                    failed.fetch_add(1, Ordering::Relaxed);
                    eprintln!(
                        "webhook {url} returned non-success status {}",
                        response.status()
                    );
                }
                Err(error) => {
                    failed.fetch_add(1, Ordering::Relaxed);
                    eprintln!("webhook {url} delivery failed: {error}");
                }
            }
        });
        Ok(())
    }
}

/// Collects emitted messages as JSON strings; test support.
#[derive(Clone, Default)]
pub struct MemoryWriter {
    messages: Arc<Mutex<Vec<String>>>,
}

impl MemoryWriter {
    pub fn snapshot(&self) -> Vec<String> {
        self.messages.lock().expect("lock poisoned").clone()
    }
}

impl Writer for MemoryWriter {
    fn write(&self, msg: &Message) -> io::Result<()> {
        self.messages
            .lock()
            .expect("lock poisoned")
            .push(msg.to_json().map_err(io::Error::other)?);
        Ok(())
    }
}
