use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{AUTHORIZATION, COOKIE, HeaderMap, HeaderValue, USER_AGENT};
use http::{Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{BoxError, TransportErrorKind};
use crate::request::FetchRequest;
use crate::response::HttpResponse;
use crate::util::{
    classify_transport_error, is_redirect_status, redact_uri_for_logs, redirect_location,
    resolve_redirect_uri, same_origin,
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 8;
const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 8 * 1024 * 1024;
const DEFAULT_USER_AGENT: &str = concat!("etagq/", env!("CARGO_PKG_VERSION"));
const DEFAULT_MAX_REDIRECTS: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RedirectPolicy {
    enabled: bool,
    max_redirects: usize,
}

impl RedirectPolicy {
    pub const fn none() -> Self {
        Self {
            enabled: false,
            max_redirects: 0,
        }
    }

    pub const fn limited(max_redirects: usize) -> Self {
        Self {
            enabled: true,
            max_redirects,
        }
    }

    pub const fn enabled(self) -> bool {
        self.enabled
    }

    pub const fn max_redirects(self) -> usize {
        if self.enabled { self.max_redirects } else { 0 }
    }
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        Self::limited(DEFAULT_MAX_REDIRECTS)
    }
}

/// Failure with no HTTP response at all.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u128 },
    #[error("request failed ({kind}): {source}")]
    Failed {
        kind: TransportErrorKind,
        #[source]
        source: BoxError,
    },
}

impl TransportError {
    pub fn failed(kind: TransportErrorKind, source: impl Into<BoxError>) -> Self {
        Self::Failed {
            kind,
            source: source.into(),
        }
    }
}

/// Performs one GET. Every HTTP status, including 4xx/5xx, is an `Ok` response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: FetchRequest) -> Result<HttpResponse, TransportError>;
}

#[cfg(feature = "tls-rustls-ring")]
type Connector = hyper_rustls::HttpsConnector<HttpConnector>;
#[cfg(not(feature = "tls-rustls-ring"))]
type Connector = HttpConnector;

type HyperClient = Client<Connector, Full<Bytes>>;

#[derive(Clone, Debug)]
pub struct HyperTransportBuilder {
    connect_timeout: Duration,
    pool_idle_timeout: Duration,
    pool_max_idle_per_host: usize,
    max_response_body_bytes: usize,
    user_agent: String,
    redirect_policy: RedirectPolicy,
}

impl Default for HyperTransportBuilder {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            redirect_policy: RedirectPolicy::default(),
        }
    }
}

impl HyperTransportBuilder {
    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn pool_idle_timeout(mut self, pool_idle_timeout: Duration) -> Self {
        self.pool_idle_timeout = pool_idle_timeout;
        self
    }

    pub fn pool_max_idle_per_host(mut self, pool_max_idle_per_host: usize) -> Self {
        self.pool_max_idle_per_host = pool_max_idle_per_host;
        self
    }

    pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.max_response_body_bytes = max_response_body_bytes.max(1);
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn redirect_policy(mut self, redirect_policy: RedirectPolicy) -> Self {
        self.redirect_policy = redirect_policy;
        self
    }

    pub fn try_build(self) -> crate::Result<HyperTransport> {
        let user_agent = crate::util::parse_header_value(USER_AGENT.as_str(), &self.user_agent)?;
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(self.connect_timeout));
        let connector = wrap_connector(http)?;
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(self.pool_idle_timeout)
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .build(connector);
        Ok(HyperTransport {
            client,
            max_response_body_bytes: self.max_response_body_bytes,
            user_agent,
            redirect_policy: self.redirect_policy,
        })
    }
}

#[cfg(feature = "tls-rustls-ring")]
fn wrap_connector(http: HttpConnector) -> crate::Result<Connector> {
    use std::sync::Arc;

    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config =
        rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|source| crate::Error::TlsInit {
                message: source.to_string(),
            })?
            .with_root_certificates(root_store)
            .with_no_client_auth();
    Ok(hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http))
}

#[cfg(not(feature = "tls-rustls-ring"))]
fn wrap_connector(http: HttpConnector) -> crate::Result<Connector> {
    Ok(http)
}

/// Default [`Transport`] over a pooled hyper client.
#[derive(Clone)]
pub struct HyperTransport {
    client: HyperClient,
    max_response_body_bytes: usize,
    user_agent: HeaderValue,
    redirect_policy: RedirectPolicy,
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HyperTransport")
            .field("max_response_body_bytes", &self.max_response_body_bytes)
            .field("user_agent", &self.user_agent)
            .field("redirect_policy", &self.redirect_policy)
            .finish_non_exhaustive()
    }
}

impl HyperTransport {
    pub fn builder() -> HyperTransportBuilder {
        HyperTransportBuilder::default()
    }

    pub fn new() -> crate::Result<Self> {
        Self::builder().try_build()
    }

    fn wire_parts(&self, request: &FetchRequest) -> Result<(Uri, HeaderMap), TransportError> {
        let uri: Uri = request
            .target_url()
            .parse()
            .map_err(|source: http::uri::InvalidUri| {
                TransportError::failed(TransportErrorKind::Other, source)
            })?;
        let mut headers = request
            .wire_headers()
            .map_err(|source| TransportError::failed(TransportErrorKind::Other, source))?;
        if !headers.contains_key(USER_AGENT) {
            headers.insert(USER_AGENT, self.user_agent.clone());
        }
        Ok((uri, headers))
    }

    fn build_request(uri: &Uri, headers: &HeaderMap) -> Result<Request<Full<Bytes>>, TransportError> {
        let mut builder = Request::builder().method(Method::GET).uri(uri.clone());
        if let Some(target) = builder.headers_mut() {
            target.extend(headers.clone());
        }
        builder
            .body(Full::new(Bytes::new()))
            .map_err(|source| TransportError::failed(TransportErrorKind::Other, source))
    }

    async fn exchange(&self, request: Request<Full<Bytes>>) -> Result<HttpResponse, TransportError> {
        let response = self.client.request(request).await.map_err(|source| {
            let kind = classify_transport_error(&source);
            TransportError::failed(kind, source)
        })?;
        let (parts, body) = response.into_parts();
        let body = read_all_body_limited(body, self.max_response_body_bytes).await?;
        Ok(HttpResponse::new(parts.status, parts.headers, body))
    }

    // A 3xx without a Location header is returned as the response.
    async fn follow(&self, mut uri: Uri, mut headers: HeaderMap) -> Result<HttpResponse, TransportError> {
        let mut redirect_count = 0_usize;
        loop {
            let response = self.exchange(Self::build_request(&uri, &headers)?).await?;
            if !self.redirect_policy.enabled() || !is_redirect_status(response.status()) {
                return Ok(response);
            }
            let Some(location) = redirect_location(response.headers()) else {
                return Ok(response);
            };
            let max_redirects = self.redirect_policy.max_redirects();
            if redirect_count >= max_redirects {
                return Err(TransportError::failed(
                    TransportErrorKind::Redirect,
                    format!("redirect limit of {max_redirects} exceeded"),
                ));
            }
            let Some(next_uri) = resolve_redirect_uri(&uri, location) else {
                return Err(TransportError::failed(
                    TransportErrorKind::Redirect,
                    format!("invalid redirect location: {}", redact_uri_for_logs(location)),
                ));
            };
            if !same_origin(&uri, &next_uri) {
                headers.remove(AUTHORIZATION);
                headers.remove(COOKIE);
            }
            debug!(
                status = response.status().as_u16(),
                from = %redact_uri_for_logs(&uri.to_string()),
                to = %redact_uri_for_logs(&next_uri.to_string()),
                "following redirect"
            );
            uri = next_uri;
            redirect_count += 1;
        }
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn send(&self, request: FetchRequest) -> Result<HttpResponse, TransportError> {
        let request_timeout = request.timeout();
        let (uri, headers) = self.wire_parts(&request)?;
        match timeout(request_timeout, self.follow(uri, headers)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                timeout_ms: request_timeout.as_millis(),
            }),
        }
    }
}

async fn read_all_body_limited(mut body: Incoming, max_bytes: usize) -> Result<Bytes, TransportError> {
    let mut collected = Vec::new();
    let mut total_len = 0_usize;

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|source| TransportError::failed(TransportErrorKind::Read, source))?;
        if let Some(data) = frame.data_ref() {
            total_len = total_len.saturating_add(data.len());
            if total_len > max_bytes {
                return Err(TransportError::failed(
                    TransportErrorKind::Read,
                    format!("response body too large ({total_len} bytes > {max_bytes} bytes)"),
                ));
            }
            collected.extend_from_slice(data);
        }
    }

    Ok(Bytes::from(collected))
}
