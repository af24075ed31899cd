//! Crate error type. Per-endpoint failures inside discovery and profiling are
//! collected, not propagated; control returns these to the caller directly.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("operation timed out")]
    Timeout,

    #[error("TLS failure: {0}")]
    TlsFailure(String),

    #[error("HTTP status {0}")]
    HttpStatus(u16),

    #[error("malformed XML: {0}")]
    MalformedXml(String),

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("SOAP fault {code}: {desc}")]
    SoapFault {
        code: String,
        desc: String,
        upnp_code: Option<u32>,
    },

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("canceled")]
    Canceled,

    #[error("cache error: {0}")]
    Cache(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// UPnP fault codes that describe a transient device state worth retrying
const TRANSIENT_UPNP_CODES: &[u32] = &[
    603, // Out of Memory
    705, // Transport is locked
    715, // Content BUSY
];

impl Error {
    /// Whether a retry could plausibly succeed. Connection errors, timeouts,
    /// 5xx and 408 qualify; other 4xx, argument and action errors never do.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Timeout | Error::NetworkUnreachable(_) => true,
            Error::HttpStatus(code) => *code >= 500 || *code == 408,
            Error::SoapFault {
                upnp_code: Some(code),
                ..
            } => TRANSIENT_UPNP_CODES.contains(code),
            _ => false,
        }
    }

    /// Short machine-readable kind tag for structured results
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NetworkUnreachable(_) => "NetworkUnreachable",
            Error::Timeout => "Timeout",
            Error::TlsFailure(_) => "TlsFailure",
            Error::HttpStatus(_) => "HttpStatus",
            Error::MalformedXml(_) => "MalformedXml",
            Error::UnknownService(_) => "UnknownService",
            Error::UnknownAction(_) => "UnknownAction",
            Error::InvalidArgument(_) => "InvalidArgument",
            Error::SoapFault { .. } => "SoapFault",
            Error::NotImplemented(_) => "NotImplemented",
            Error::Canceled => "Canceled",
            Error::Cache(_) => "Cache",
            Error::Io(_) => "Io",
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout
        } else if e.is_connect() {
            Error::NetworkUnreachable(e.to_string())
        } else if e.to_string().to_lowercase().contains("certificate")
            || e.to_string().to_lowercase().contains("tls")
        {
            Error::TlsFailure(e.to_string())
        } else if let Some(status) = e.status() {
            Error::HttpStatus(status.as_u16())
        } else {
            Error::NetworkUnreachable(e.to_string())
        }
    }
}
