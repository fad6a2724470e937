//! Structured logging for the snare proxy.
//!
//! A [`Logger`] fans messages out to a set of [`Writer`]s. Messages are
//! built with the `with_*` methods and emitted at a level; emitting at
//! [`Level::Fatal`] terminates the process with the attached exit code.
//! Request, response, and DNS snapshots ride along as structured records
//! and serialize to one JSON object per line.

mod records;
mod writers;

use std::collections::BTreeMap;
use std::fmt;
use std::process;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub use records::{BodyCapture, DnsAnswer, DnsQuestion, DnsRecord, RequestRecord, ResponseRecord};
pub use writers::{JsonWriter, MemoryWriter, RequestWriter, TextWriter, WebhookWriter};

/// Log severity. Declaration order gives `Fatal < Error < … < Debug`, so a
/// message passes a logger whose level is at least as verbose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Fatal,
    Error,
    Warning,
    Info,
    Debug,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fatal => "FATAL",
            Self::Error => "ERROR",
            Self::Warning => "WARNING",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = std::convert::Infallible;

    /// Unrecognized names parse to `Error`, matching the config loader's
    /// forgiving behavior.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value.to_ascii_uppercase().as_str() {
            "FATAL" => Self::Fatal,
            "DEBUG" => Self::Debug,
            "INFO" => Self::Info,
            "WARNING" => Self::Warning,
            _ => Self::Error,
        })
    }
}

impl Serialize for Level {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Level {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(value.parse().expect("level parsing is infallible"))
    }
}

/// Stdout rendering, text or JSON lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Text,
    Json,
}

impl Format {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
        }
    }
}

impl FromStr for Format {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value.to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Text,
        })
    }
}

impl Serialize for Format {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Format {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(value.parse().expect("format parsing is infallible"))
    }
}

/// Destination for emitted messages.
pub trait Writer: Send + Sync {
    fn write(&self, msg: &Message) -> std::io::Result<()>;
}

struct LoggerInner {
    level: Level,
    writers: Vec<Box<dyn Writer>>,
    write_errors: AtomicU64,
    last_error: Mutex<Option<String>>,
}

/// Cheaply cloneable handle to the shared logger state.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<LoggerInner>,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("level", &self.inner.level)
            .field("writers", &self.inner.writers.len())
            .finish()
    }
}

impl Logger {
    pub fn builder(level: Level) -> LoggerBuilder {
        LoggerBuilder {
            level,
            writers: Vec::new(),
        }
    }

    /// Logger that drops everything. Fatal messages still exit.
    pub fn discard() -> Self {
        Self::builder(Level::Fatal).build()
    }

    pub fn level(&self) -> Level {
        self.inner.level
    }

    /// Count of writer failures since startup.
    pub fn write_errors(&self) -> u64 {
        self.inner.write_errors.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().expect("lock poisoned").clone()
    }

    pub fn message(&self) -> Message {
        Message::new(self.clone())
    }

    pub fn with_field(&self, key: &str, value: impl Into<serde_json::Value>) -> Message {
        self.message().with_field(key, value)
    }

    pub fn with_error(&self, error: &dyn fmt::Display) -> Message {
        self.message().with_error(error)
    }

    pub fn with_exit_code(&self, exit_code: i32) -> Message {
        self.message().with_exit_code(exit_code)
    }

    pub fn with_request(&self, record: RequestRecord) -> Message {
        self.message().with_request(record)
    }

    pub fn info(&self, text: &str) {
        self.message().info(text);
    }

    pub fn debug(&self, text: &str) {
        self.message().debug(text);
    }

    pub fn warning(&self, text: &str) {
        self.message().warning(text);
    }

    pub fn error(&self, text: &str) {
        self.message().error(text);
    }

    pub fn fatal(&self, text: &str) {
        self.message().fatal(text);
    }

    fn write(&self, msg: &Message) {
        if msg.level <= self.inner.level {
            for writer in &self.inner.writers {
                if let Err(error) = writer.write(msg) {
                    self.inner.write_errors.fetch_add(1, Ordering::Relaxed);
                    *self.inner.last_error.lock().expect("lock poisoned") =
                        Some(error.to_string());
                    eprintln!("log writer failed: {error}");
                }
            }
        }
    }
}

pub struct LoggerBuilder {
    level: Level,
    writers: Vec<Box<dyn Writer>>,
}

impl LoggerBuilder {
    pub fn writer(mut self, writer: impl Writer + 'static) -> Self {
        self.writers.push(Box::new(writer));
        self
    }

    /// Stdout writer for the given format.
    pub fn stdout(self, format: Format) -> Self {
        match format {
            Format::Text => self.writer(TextWriter),
            Format::Json => self.writer(JsonWriter),
        }
    }

    pub fn build(self) -> Logger {
        Logger {
            inner: Arc::new(LoggerInner {
                level: self.level,
                writers: self.writers,
                write_errors: AtomicU64::new(0),
                last_error: Mutex::new(None),
            }),
        }
    }
}

/// One log message under construction. Terminal emit methods consume the
/// message and hand it to every writer that passes the level gate.
#[derive(Serialize)]
pub struct Message {
    #[serde(skip)]
    logger: Logger,
    #[serde(skip)]
    exit_code: i32,

    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    message: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    fields: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request: Option<RequestRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<ResponseRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dns: Option<DnsRecord>,
    #[serde(rename = "error", skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    level: Level,
}

impl Message {
    fn new(logger: Logger) -> Self {
        Self {
            logger,
            exit_code: 0,
            timestamp: OffsetDateTime::now_utc(),
            message: String::new(),
            fields: BTreeMap::new(),
            request: None,
            response: None,
            dns: None,
            error_message: None,
            level: Level::Info,
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn with_error(mut self, error: &dyn fmt::Display) -> Self {
        self.error_message = Some(error.to_string());
        self
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn with_request(mut self, record: RequestRecord) -> Self {
        self.request = Some(record);
        self
    }

    pub fn with_response(mut self, record: ResponseRecord) -> Self {
        self.response = Some(record);
        self
    }

    pub fn with_dns_questions(mut self, questions: impl IntoIterator<Item = DnsQuestion>) -> Self {
        self.dns
            .get_or_insert_with(DnsRecord::default)
            .add_questions(questions);
        self
    }

    pub fn with_dns_answer(mut self, name: &str, ttl: u32, record: &str) -> Self {
        self.dns
            .get_or_insert_with(DnsRecord::default)
            .add_answer(name, ttl, record);
        self
    }

    pub fn with_dns_nxdomain(mut self) -> Self {
        self.dns.get_or_insert_with(DnsRecord::default).add_nxdomain();
        self
    }

    /// True when the message carries a request, response, or DNS record.
    /// The request-log and webhook writers only forward such messages.
    pub fn has_records(&self) -> bool {
        self.request.is_some() || self.response.is_some() || self.dns.is_some()
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn info(self, text: &str) {
        self.log(Level::Info, text);
    }

    pub fn debug(self, text: &str) {
        self.log(Level::Debug, text);
    }

    pub fn warning(self, text: &str) {
        self.log(Level::Warning, text);
    }

    pub fn error(self, text: &str) {
        self.log(Level::Error, text);
    }

    /// Emits the message and terminates the process with the attached exit
    /// code, or 1 when none was set.
    pub fn fatal(self, text: &str) -> ! {
        let exit_code = if self.exit_code > 0 { self.exit_code } else { 1 };
        self.log(Level::Fatal, text);
        process::exit(exit_code);
    }

    fn log(mut self, level: Level, text: &str) {
        self.level = level;
        self.timestamp = OffsetDateTime::now_utc();
        self.message = text.to_string();
        let logger = self.logger.clone();
        logger.write(&self);
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Text rendering: timestamp, level, optional request/DNS marker, the
    /// message, the error, then fields sorted by key.
    pub fn render_text(&self) -> String {
        let timestamp = self
            .timestamp
            .format(&Rfc3339)
            .unwrap_or_else(|_| self.timestamp.unix_timestamp().to_string());
        let mut out = format!("{timestamp} {}:", self.level);

        if let Some(request) = &self.request {
            out.push_str(&format!(" [{}] {}", request.method(), request.url()));
        } else if self.dns.is_some() {
            out.push_str(" [DNS]");
        }

        if !self.message.is_empty() {
            out.push(' ');
            out.push_str(&self.message.replace('"', "\\\""));
        }

        if let Some(error) = &self.error_message {
            out.push_str(&format!(" err=\"{}\"", error.replace('"', "\\\"")));
        }

        for (key, value) in &self.fields {
            let rendered = match value {
                serde_json::Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            out.push_str(&format!(
                " {}=\"{}\"",
                key.replace(' ', "_"),
                rendered.replace('"', "\\\"")
            ));
        }

        if let Some(dns) = &self.dns {
            dns.render_text(&mut out);
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::{Format, Level, Logger, MemoryWriter};

    #[test]
    fn level_parses_with_error_fallback() {
        assert_eq!("debug".parse::<Level>().unwrap(), Level::Debug);
        assert_eq!("FATAL".parse::<Level>().unwrap(), Level::Fatal);
        assert_eq!("Warning".parse::<Level>().unwrap(), Level::Warning);
        assert_eq!("nonsense".parse::<Level>().unwrap(), Level::Error);
    }

    #[test]
    fn level_ordering_gates_verbosity() {
        assert!(Level::Fatal < Level::Error);
        assert!(Level::Error < Level::Warning);
        assert!(Level::Warning < Level::Info);
        assert!(Level::Info < Level::Debug);
    }

    #[test]
    fn format_parses_with_text_fallback() {
        assert_eq!("JSON".parse::<Format>().unwrap(), Format::Json);
        assert_eq!("text".parse::<Format>().unwrap(), Format::Text);
        assert_eq!("yaml".parse::<Format>().unwrap(), Format::Text);
    }

    #[test]
    fn messages_below_logger_level_are_dropped() {
        let writer = MemoryWriter::default();
        let logger = Logger::builder(Level::Warning).writer(writer.clone()).build();

        logger.info("not recorded");
        logger.debug("not recorded");
        logger.warning("recorded");
        logger.error("recorded");

        assert_eq!(writer.snapshot().len(), 2);
    }

    #[test]
    fn fields_render_sorted_and_escaped() {
        let logger = Logger::discard();
        let rendered = logger
            .with_field("zeta", "z")
            .with_field("alpha", "say \"hi\"")
            .with_field("count", 3)
            .render_text();

        let alpha = rendered.find("alpha=\"say \\\"hi\\\"\"").expect("alpha field");
        let count = rendered.find("count=\"3\"").expect("count field");
        let zeta = rendered.find("zeta=\"z\"").expect("zeta field");
        assert!(alpha < count && count < zeta);
    }

    #[test]
    fn json_encoding_skips_empty_sections() {
        let logger = Logger::discard();
        let msg = logger.with_field("port", 8080);
        let encoded = msg.to_json().expect("encode");
        let value: serde_json::Value = serde_json::from_str(&encoded).expect("decode");

        assert!(value.get("timestamp").is_some());
        assert!(value.get("level").is_some());
        assert!(value.get("request").is_none());
        assert!(value.get("error").is_none());
        assert_eq!(value["fields"]["port"], 8080);
    }

    #[test]
    fn error_and_exit_code_attach() {
        let writer = MemoryWriter::default();
        let logger = Logger::builder(Level::Info).writer(writer.clone()).build();

        let error = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        logger.with_error(&error).error("request failed");

        let lines = writer.snapshot();
        assert_eq!(lines.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&lines[0]).expect("decode");
        assert_eq!(value["error"], "boom");
        assert_eq!(value["level"], "ERROR");
    }
}
