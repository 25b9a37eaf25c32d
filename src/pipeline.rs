use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;
use crate::error::Error;
use crate::request::FetchRequest;
use crate::response::HttpResponse;
use crate::transport::{Transport, TransportError};
use crate::util::{parse_request_uri, redact_uri_for_logs};

/// `on_request` runs in registration order, `on_response` in reverse; only 2xx arrives as `Ok`.
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn on_request(&self, _request: &mut FetchRequest) -> Result<()> {
        Ok(())
    }

    async fn on_response(
        &self,
        _request: &FetchRequest,
        result: Result<HttpResponse>,
    ) -> Result<HttpResponse> {
        result
    }
}

#[derive(Clone)]
pub struct Pipeline {
    transport: Arc<dyn Transport>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Pipeline")
            .field("interceptors", &self.interceptors.len())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            interceptors: Vec::new(),
        }
    }

    pub fn interceptor_arc(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn interceptor<I>(self, interceptor: I) -> Self
    where
        I: Interceptor + 'static,
    {
        self.interceptor_arc(Arc::new(interceptor))
    }

    pub async fn get(&self, url: impl Into<String>) -> Result<HttpResponse> {
        self.execute(FetchRequest::get(url)).await
    }

    pub async fn execute(&self, mut request: FetchRequest) -> Result<HttpResponse> {
        parse_request_uri(request.url())?;
        for interceptor in &self.interceptors {
            interceptor.on_request(&mut request).await?;
        }

        let redacted_url = redact_uri_for_logs(request.url());
        let raw = self.transport.send(request.clone()).await;
        let mut result = classify_transport_result(raw, redacted_url);
        for interceptor in self.interceptors.iter().rev() {
            result = interceptor.on_response(&request, result).await;
        }
        result
    }
}

pub(crate) fn classify_transport_result(
    raw: std::result::Result<HttpResponse, TransportError>,
    url: String,
) -> Result<HttpResponse> {
    match raw {
        Ok(response) if response.is_success() => Ok(response),
        Ok(response) => Err(Error::HttpStatus {
            status: response.status().as_u16(),
            url,
            response: Box::new(response),
        }),
        Err(TransportError::Timeout { timeout_ms }) => Err(Error::Timeout { timeout_ms, url }),
        Err(TransportError::Failed { kind, source }) => Err(Error::Transport { kind, url, source }),
    }
}
