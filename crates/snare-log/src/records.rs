use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Serialize, Serializer};
use time::OffsetDateTime;

/// Shared buffer a tee'd body writes into as it streams. The captured bytes
/// are read back (base64) only when the owning record serializes, so capture
/// never delays forwarding.
#[derive(Clone, Default)]
pub struct BodyCapture {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl BodyCapture {
    pub fn append(&self, bytes: &[u8]) {
        self.buf.lock().expect("lock poisoned").extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.buf.lock().expect("lock poisoned").as_slice())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.buf.lock().expect("lock poisoned").clone()
    }
}

impl fmt::Debug for BodyCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyCapture").field("len", &self.len()).finish()
    }
}

fn capture_is_empty(capture: &Option<BodyCapture>) -> bool {
    capture.as_ref().map_or(true, BodyCapture::is_empty)
}

fn capture_base64<S: Serializer>(
    capture: &Option<BodyCapture>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match capture {
        Some(capture) => serializer.serialize_str(&capture.to_base64()),
        None => serializer.serialize_str(""),
    }
}

fn header_map(headers: &http::HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        map.entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    map
}

fn proto_name(version: http::Version) -> &'static str {
    match version {
        http::Version::HTTP_09 => "HTTP/0.9",
        http::Version::HTTP_10 => "HTTP/1.0",
        http::Version::HTTP_11 => "HTTP/1.1",
        http::Version::HTTP_2 => "HTTP/2.0",
        http::Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/?",
    }
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

/// Snapshot of a proxied request, captured before the upstream round trip.
#[derive(Debug, Serialize)]
pub struct RequestRecord {
    method: String,
    url: String,
    proto: String,
    header: BTreeMap<String, Vec<String>>,
    #[serde(
        rename = "body",
        serialize_with = "capture_base64",
        skip_serializing_if = "capture_is_empty"
    )]
    capture: Option<BodyCapture>,
    #[serde(skip_serializing_if = "is_zero")]
    content_length: u64,
    host: String,
    remote_addr: String,
    request_uri: String,
    tls: bool,
    #[serde(with = "time::serde::rfc3339")]
    time_stamp: OffsetDateTime,
}

impl RequestRecord {
    pub fn from_parts(
        parts: &http::request::Parts,
        remote_addr: SocketAddr,
        tls: bool,
        capture: BodyCapture,
    ) -> Self {
        let content_length = parts
            .headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);
        let host = parts
            .uri
            .authority()
            .map(|authority| authority.to_string())
            .or_else(|| {
                parts
                    .headers
                    .get(http::header::HOST)
                    .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
            })
            .unwrap_or_default();

        Self {
            method: parts.method.to_string(),
            url: parts.uri.to_string(),
            proto: proto_name(parts.version).to_string(),
            header: header_map(&parts.headers),
            capture: Some(capture),
            content_length,
            host,
            remote_addr: remote_addr.to_string(),
            request_uri: parts
                .uri
                .path_and_query()
                .map(|path| path.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            tls,
            time_stamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn body_capture(&self) -> Option<&BodyCapture> {
        self.capture.as_ref()
    }
}

/// Snapshot of the upstream response, captured before streaming to the
/// client.
#[derive(Debug, Serialize)]
pub struct ResponseRecord {
    status: String,
    status_code: u16,
    proto: String,
    header: BTreeMap<String, Vec<String>>,
    #[serde(
        rename = "body",
        serialize_with = "capture_base64",
        skip_serializing_if = "capture_is_empty"
    )]
    capture: Option<BodyCapture>,
    #[serde(skip_serializing_if = "is_zero")]
    content_length: u64,
    #[serde(with = "time::serde::rfc3339")]
    time_stamp: OffsetDateTime,
}

impl ResponseRecord {
    pub fn from_parts(parts: &http::response::Parts, capture: BodyCapture) -> Self {
        let content_length = parts
            .headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);
        let status = match parts.status.canonical_reason() {
            Some(reason) => format!("{} {}", parts.status.as_u16(), reason),
            None => parts.status.as_u16().to_string(),
        };

        Self {
            status,
            status_code: parts.status.as_u16(),
            proto: proto_name(parts.version).to_string(),
            header: header_map(&parts.headers),
            capture: Some(capture),
            content_length,
            time_stamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn body_capture(&self) -> Option<&BodyCapture> {
        self.capture.as_ref()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DnsQuestion {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    class: String,
}

impl DnsQuestion {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            class: class.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DnsAnswer {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    record: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl: Option<u32>,
    #[serde(rename = "nx_domain", skip_serializing_if = "Option::is_none")]
    nx_domain: Option<String>,
}

/// Questions and answers attached to a "[DNS]" message.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DnsRecord {
    questions: Vec<DnsQuestion>,
    answers: Vec<DnsAnswer>,
}

impl DnsRecord {
    pub fn add_questions(&mut self, questions: impl IntoIterator<Item = DnsQuestion>) {
        self.questions.extend(questions);
    }

    pub fn add_answer(&mut self, name: &str, ttl: u32, record: &str) {
        self.answers.push(DnsAnswer {
            name: Some(name.to_string()),
            record: Some(record.to_string()),
            ttl: Some(ttl),
            nx_domain: None,
        });
    }

    pub fn add_nxdomain(&mut self) {
        self.answers.push(DnsAnswer {
            name: None,
            record: None,
            ttl: None,
            nx_domain: Some("NXDomain".to_string()),
        });
    }

    pub(crate) fn render_text(&self, out: &mut String) {
        if !self.questions.is_empty() {
            let rendered: Vec<String> = self
                .questions
                .iter()
                .map(|q| format!("{{Name:{},Type:{},Class:{}}}", q.name, q.kind, q.class))
                .collect();
            out.push_str(&format!(" questions=[{}]", rendered.join(",")));
        }
        if !self.answers.is_empty() {
            let rendered: Vec<String> = self
                .answers
                .iter()
                .map(|a| match (&a.name, &a.record, a.ttl) {
                    (Some(name), Some(record), Some(ttl)) => {
                        format!("{{Name:{name},TTL:{ttl},Record:{record}}}")
                    }
                    _ => "{NXDomain}".to_string(),
                })
                .collect();
            out.push_str(&format!(" answers=[{}]", rendered.join(",")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_serializes_bytes_written_after_record_creation() {
        let capture = BodyCapture::default();
        let record = ResponseRecord::from_parts(
            &http::Response::builder()
                .status(200)
                .body(())
                .expect("response")
                .into_parts()
                .0,
            capture.clone(),
        );

        capture.append(b"streamed later");
        let encoded = serde_json::to_value(&record).expect("encode");
        assert_eq!(encoded["body"], STANDARD.encode(b"streamed later"));
        assert_eq!(encoded["status_code"], 200);
    }

    #[test]
    fn empty_capture_is_omitted_from_json() {
        let record = ResponseRecord::from_parts(
            &http::Response::builder()
                .status(404)
                .body(())
                .expect("response")
                .into_parts()
                .0,
            BodyCapture::default(),
        );
        let encoded = serde_json::to_value(&record).expect("encode");
        assert!(encoded.get("body").is_none());
        assert_eq!(encoded["status"], "404 Not Found");
    }

    #[test]
    fn request_record_reads_host_and_multi_valued_headers() {
        let request = http::Request::builder()
            .method("POST")
            .uri("http://victim.test/login?next=%2F")
            .header("cookie", "a=1")
            .header("cookie", "b=2")
            .header("content-length", "11")
            .body(())
            .expect("request");
        let (parts, _) = request.into_parts();
        let record = RequestRecord::from_parts(
            &parts,
            "127.0.0.1:9999".parse().expect("addr"),
            false,
            BodyCapture::default(),
        );

        let encoded = serde_json::to_value(&record).expect("encode");
        assert_eq!(encoded["host"], "victim.test");
        assert_eq!(encoded["content_length"], 11);
        assert_eq!(encoded["request_uri"], "/login?next=%2F");
        assert_eq!(
            encoded["header"]["cookie"],
            serde_json::json!(["a=1", "b=2"])
        );
    }

    #[test]
    fn dns_record_renders_questions_and_answers() {
        let mut record = DnsRecord::default();
        record.add_questions([DnsQuestion::new("victim.test.", "A", "IN")]);
        record.add_answer("victim.test.", 60, "10.0.0.1");
        record.add_nxdomain();

        let mut out = String::new();
        record.render_text(&mut out);
        assert!(out.contains("questions=[{Name:victim.test.,Type:A,Class:IN}]"));
        assert!(out.contains("{Name:victim.test.,TTL:60,Record:10.0.0.1}"));
        assert!(out.contains("{NXDomain}"));
    }
}
