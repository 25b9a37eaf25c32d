//! `etagq` dispatches outbound HTTP GETs through a bounded worker pool with
//! a shared backoff gate, bounded retries and entity-tag revalidation.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use etagq::prelude::{Dispatcher, DispatcherConfig, MemoryCacheStore, QueueItem};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dispatcher = Dispatcher::builder()
//!         .config(
//!             DispatcherConfig::default()
//!                 .with_concurrent(4)
//!                 .with_max_timeout(Duration::from_secs(5))
//!                 .with_retry_delay(Duration::from_secs(2)),
//!         )
//!         .cache_store(MemoryCacheStore::new())
//!         .try_build()?;
//!
//!     let item = QueueItem::new("https://api.example.com/v1/items").param("page", "1");
//!     let response = dispatcher.push(item.clone()).await?;
//!     println!("status={} bytes={}", response.status(), response.body().len());
//!
//!     // Same url again: sent with If-None-Match, a 304 resolves with the cached body.
//!     let again = dispatcher.push(item).await?;
//!     println!("status={}", again.status());
//!
//!     dispatcher.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Outcomes
//!
//! - 2xx and revalidated 304 resolve as `Ok`.
//! - Other non-5xx statuses (4xx included) also resolve as `Ok`; check `status()`.
//! - Timeouts and 5xx are retried up to `max_retries` times and trip the backoff gate.
//! - Everything else resolves as `Err` with a stable [`ErrorCode`].

mod backoff;
mod cache;
mod config;
mod dispatcher;
mod error;
mod etag;
mod pipeline;
mod reporter;
mod request;
mod response;
mod stats;
mod transport;
mod util;

pub use crate::backoff::{BackoffController, BackoffSnapshot};
pub use crate::cache::{CACHE_KEY_PREFIX, CacheEntry, CacheKey, CacheStore, MemoryCacheStore};
pub use crate::config::DispatcherConfig;
pub use crate::dispatcher::{Dispatcher, DispatcherBuilder};
pub use crate::error::{BoxError, CacheOperation, Error, ErrorCode, TransportErrorKind};
pub use crate::etag::EtagCache;
pub use crate::pipeline::{Interceptor, Pipeline};
pub use crate::reporter::{Reporter, TracingReporter};
pub use crate::request::{Credentials, FetchRequest, QueueItem};
pub use crate::response::HttpResponse;
pub use crate::stats::QueueStats;
pub use crate::transport::{
    HyperTransport, HyperTransportBuilder, RedirectPolicy, Transport, TransportError,
};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        BackoffController, CacheEntry, CacheKey, CacheStore, Credentials, Dispatcher,
        DispatcherBuilder, DispatcherConfig, Error, ErrorCode, EtagCache, FetchRequest,
        HttpResponse, HyperTransport, Interceptor, MemoryCacheStore, Pipeline, QueueItem,
        QueueStats, RedirectPolicy, Reporter, Result, Transport, TransportError,
    };
}
