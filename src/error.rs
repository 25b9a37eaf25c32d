use thiserror::Error;

use crate::response::HttpResponse;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Redirect,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Redirect => "redirect",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CacheOperation {
    Get,
    Set,
}

impl std::fmt::Display for CacheOperation {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Get => "get",
            Self::Set => "set",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUrl,
    InvalidHeaderName,
    InvalidHeaderValue,
    Transport,
    Timeout,
    HttpStatus,
    Deserialize,
    CacheStore,
    InvalidConfig,
    TlsInit,
    RuntimeUnavailable,
    DispatcherClosed,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUrl => "invalid_url",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::HttpStatus => "http_status",
            Self::Deserialize => "deserialize",
            Self::CacheStore => "cache_store",
            Self::InvalidConfig => "invalid_config",
            Self::TlsInit => "tls_init",
            Self::RuntimeUnavailable => "runtime_unavailable",
            Self::DispatcherClosed => "dispatcher_closed",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request url: {url}")]
    InvalidUrl { url: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("http transport error ({kind}) for {url}: {source}")]
    Transport {
        kind: TransportErrorKind,
        url: String,
        #[source]
        source: BoxError,
    },
    #[error("http request timed out after {timeout_ms}ms for {url}")]
    Timeout { timeout_ms: u128, url: String },
    #[error("http status error {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        response: Box<HttpResponse>,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
        body: String,
    },
    #[error("cache store {operation} failed for {key}: {source}")]
    CacheStore {
        operation: CacheOperation,
        key: String,
        #[source]
        source: BoxError,
    },
    #[error("invalid dispatcher config field {field}: {message}")]
    InvalidConfig {
        field: &'static str,
        message: &'static str,
    },
    #[error("failed to initialize tls: {message}")]
    TlsInit { message: String },
    #[error("dispatcher workers need a tokio runtime")]
    RuntimeUnavailable,
    #[error("dispatcher is closed")]
    DispatcherClosed,
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUrl { .. } => ErrorCode::InvalidUrl,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::CacheStore { .. } => ErrorCode::CacheStore,
            Self::InvalidConfig { .. } => ErrorCode::InvalidConfig,
            Self::TlsInit { .. } => ErrorCode::TlsInit,
            Self::RuntimeUnavailable => ErrorCode::RuntimeUnavailable,
            Self::DispatcherClosed => ErrorCode::DispatcherClosed,
        }
    }

    /// Timeouts and 5xx statuses; these trip the backoff gate and are retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn response(&self) -> Option<&HttpResponse> {
        match self {
            Self::HttpStatus { response, .. } => Some(response),
            _ => None,
        }
    }

    pub fn into_response(self) -> Option<HttpResponse> {
        match self {
            Self::HttpStatus { response, .. } => Some(*response),
            _ => None,
        }
    }
}
