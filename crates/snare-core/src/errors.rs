use std::error::Error as StdError;
use std::fmt;

/// The tag identifying what failed. Two [`ProxyError`]s compare equal when
/// their kinds match, regardless of cause or reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    CaRead,
    CaParse,
    CaExpired,
    GenCa,
    GenHostKey,
    WriteCa,
    NoCa,
    GenerateKey,
    X509Create,
    X509Parse,
    TlsProxyStart,
    HttpProxyStart,
    ProxyShutdown,
    /// Benign sentinel a listener reports after a clean shutdown.
    ServerClosed,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CaRead => "error reading certificate authority file",
            Self::CaParse => "error parsing certificate authority",
            Self::CaExpired => "certificate authority expired",
            Self::GenCa => "error generating certificate authority",
            Self::GenHostKey => "error generating host certificate",
            Self::WriteCa => "error writing certificate authority",
            Self::NoCa => "no certificate authority set",
            Self::GenerateKey => "error generating private key",
            Self::X509Create => "error creating x509 certificate",
            Self::X509Parse => "error parsing x509 certificate",
            Self::TlsProxyStart => "tls proxy server failed to start",
            Self::HttpProxyStart => "http proxy server failed to start",
            Self::ProxyShutdown => "proxy shutdown failed",
            Self::ServerClosed => "server closed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type shared across the proxy workspace: a kind tag, an optional
/// nested cause, and an optional free-form reason. Cause and reason are
/// informational only and never participate in equality.
#[derive(Debug)]
pub struct ProxyError {
    kind: ErrorKind,
    cause: Option<Box<dyn StdError + Send + Sync>>,
    reason: Option<String>,
}

impl ProxyError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            cause: None,
            reason: None,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind.as_str())?;
        if let Some(reason) = &self.reason {
            write!(f, ": {reason}")?;
        }
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl StdError for ProxyError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.as_deref().map(|cause| cause as _)
    }
}

impl PartialEq for ProxyError {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl PartialEq<ErrorKind> for ProxyError {
    fn eq(&self, other: &ErrorKind) -> bool {
        self.kind == *other
    }
}

impl From<ErrorKind> for ProxyError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}
