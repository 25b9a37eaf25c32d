//! Conditional caching with entity-tag validators.
//!
//! [`EtagCache`] is an [`Interceptor`]: it sends `If-None-Match` for urls it
//! has a validator for, records every 2xx response, and answers a `304 Not
//! Modified` with the stored body. A 304 with nothing stored is passed on
//! untouched.

use std::sync::Arc;

use async_trait::async_trait;
use http::header::IF_NONE_MATCH;
use http::header::HeaderValue;
use tracing::{debug, warn};

use crate::Result;
use crate::cache::{CacheEntry, CacheKey, CacheStore};
use crate::error::{CacheOperation, Error};
use crate::pipeline::Interceptor;
use crate::request::FetchRequest;
use crate::response::HttpResponse;
use crate::util::redact_uri_for_logs;

const NOT_MODIFIED: u16 = 304;

#[derive(Clone)]
pub struct EtagCache {
    store: Arc<dyn CacheStore>,
}

impl std::fmt::Debug for EtagCache {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("EtagCache").finish_non_exhaustive()
    }
}

impl EtagCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub async fn lookup(&self, url: &str) -> Result<Option<CacheEntry>> {
        let key = CacheKey::for_url(url);
        self.store
            .get(key.as_str())
            .await
            .map_err(|source| Error::CacheStore {
                operation: CacheOperation::Get,
                key: key.into_string(),
                source,
            })
    }

    pub async fn store(&self, url: &str, response: &HttpResponse) -> Result<()> {
        let key = CacheKey::for_url(url);
        self.store
            .set(key.as_str(), CacheEntry::from_response(response))
            .await
            .map_err(|source| Error::CacheStore {
                operation: CacheOperation::Set,
                key: key.into_string(),
                source,
            })
    }
}

#[async_trait]
impl Interceptor for EtagCache {
    async fn on_request(&self, request: &mut FetchRequest) -> Result<()> {
        let Some(entry) = self.lookup(request.url()).await? else {
            return Ok(());
        };
        let Some(etag) = entry.etag() else {
            return Ok(());
        };
        match HeaderValue::from_str(etag) {
            Ok(value) => {
                debug!(url = %redact_uri_for_logs(request.url()), etag, "attaching cached validator");
                request.headers_mut().insert(IF_NONE_MATCH, value);
            }
            Err(_) => {
                warn!(url = %redact_uri_for_logs(request.url()), "ignoring unusable cached etag");
            }
        }
        Ok(())
    }

    async fn on_response(
        &self,
        request: &FetchRequest,
        result: Result<HttpResponse>,
    ) -> Result<HttpResponse> {
        match result {
            Ok(response) => {
                self.store(request.url(), &response).await?;
                Ok(response)
            }
            Err(Error::HttpStatus {
                status: NOT_MODIFIED,
                url,
                response,
            }) => match self.lookup(request.url()).await? {
                Some(entry) => {
                    debug!(url = %url, "serving cached body for not-modified response");
                    Ok((*response).revalidated(entry.data))
                }
                None => Err(Error::HttpStatus {
                    status: NOT_MODIFIED,
                    url,
                    response,
                }),
            },
            Err(error) => Err(error),
        }
    }
}
