use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{Instrument, debug, info_span, warn};

use crate::Result;
use crate::backoff::BackoffController;
use crate::cache::CacheStore;
use crate::config::DispatcherConfig;
use crate::error::Error;
use crate::etag::EtagCache;
use crate::pipeline::{Interceptor, Pipeline};
use crate::reporter::{Reporter, TracingReporter};
use crate::request::{FetchRequest, QueueItem};
use crate::response::HttpResponse;
use crate::stats::{QueueCounters, QueueStats};
use crate::transport::{HyperTransport, Transport};
use crate::util::{lock_unpoisoned, redact_uri_for_logs, transport_timeout};

const NOT_MODIFIED: u16 = 304;

struct Job {
    item: QueueItem,
    reply: oneshot::Sender<Result<HttpResponse>>,
}

type JobReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>;

enum Disposition {
    Deliver(HttpResponse),
    Retry(Error),
    Fail(Error),
}

#[derive(Default)]
pub struct DispatcherBuilder {
    config: DispatcherConfig,
    transport: Option<Arc<dyn Transport>>,
    cache_store: Option<Arc<dyn CacheStore>>,
    reporter: Option<Arc<dyn Reporter>>,
    backoff: Option<Arc<BackoffController>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl DispatcherBuilder {
    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transport_arc(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn transport<T>(self, transport: T) -> Self
    where
        T: Transport + 'static,
    {
        self.transport_arc(Arc::new(transport))
    }

    /// Enables conditional caching.
    pub fn cache_store_arc(mut self, cache_store: Arc<dyn CacheStore>) -> Self {
        self.cache_store = Some(cache_store);
        self
    }

    pub fn cache_store<S>(self, cache_store: S) -> Self
    where
        S: CacheStore + 'static,
    {
        self.cache_store_arc(Arc::new(cache_store))
    }

    pub fn reporter_arc(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn reporter<R>(self, reporter: R) -> Self
    where
        R: Reporter + 'static,
    {
        self.reporter_arc(Arc::new(reporter))
    }

    pub fn backoff(mut self, backoff: Arc<BackoffController>) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Runs outside the etag cache: `on_response` sees a revalidated 304 as 200.
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

    pub fn try_build(self) -> Result<Dispatcher> {
        self.config.validate()?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| Error::RuntimeUnavailable)?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::new()?) as Arc<dyn Transport>,
        };
        let mut pipeline = Pipeline::new(transport);
        for interceptor in self.interceptors {
            pipeline = pipeline.interceptor_arc(interceptor);
        }
        let caching = self.cache_store.is_some();
        if let Some(cache_store) = self.cache_store {
            pipeline = pipeline.interceptor(EtagCache::new(cache_store));
        }
        let backoff = self
            .backoff
            .unwrap_or_else(|| Arc::new(BackoffController::new(self.config.backoff_step)));
        let reporter = self
            .reporter
            .unwrap_or_else(|| Arc::new(TracingReporter) as Arc<dyn Reporter>);

        let shared = Arc::new(Shared {
            config: self.config,
            pipeline,
            caching,
            backoff,
            reporter,
            counters: QueueCounters::default(),
        });

        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver: JobReceiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let workers = (0..shared.config.concurrent)
            .map(|worker| {
                let shared = Arc::clone(&shared);
                let receiver = Arc::clone(&receiver);
                runtime.spawn(run_worker(shared, receiver, worker))
            })
            .collect();

        Ok(Dispatcher {
            shared,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }
}

/// Bounded worker pool in front of a fetch pipeline. Non-5xx statuses resolve as `Ok`.
pub struct Dispatcher {
    shared: Arc<Shared>,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Dispatcher")
            .field("config", &self.shared.config)
            .field("caching", &self.shared.caching)
            .field("backoff", &self.shared.backoff)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    /// Dispatcher over [`HyperTransport`] with caching disabled.
    pub fn new(config: DispatcherConfig) -> Result<Self> {
        Self::builder().config(config).try_build()
    }

    pub async fn push(&self, item: impl Into<QueueItem>) -> Result<HttpResponse> {
        let outcome = self.submit(item.into())?;
        outcome.await.map_err(|_| Error::DispatcherClosed)?
    }

    /// Outcomes come back in submission order.
    pub async fn push_many<I, T>(&self, items: I) -> Vec<Result<HttpResponse>>
    where
        I: IntoIterator<Item = T>,
        T: Into<QueueItem>,
    {
        let submitted: Vec<_> = items
            .into_iter()
            .map(|item| self.submit(item.into()))
            .collect();
        let mut results = Vec::with_capacity(submitted.len());
        for outcome in submitted {
            let result = match outcome {
                Ok(receiver) => receiver.await.unwrap_or(Err(Error::DispatcherClosed)),
                Err(error) => Err(error),
            };
            results.push(result);
        }
        results
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.counters.snapshot(self.shared.backoff.trips())
    }

    pub fn backoff(&self) -> &Arc<BackoffController> {
        &self.shared.backoff
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }

    pub fn is_closed(&self) -> bool {
        lock_unpoisoned(&self.sender).is_none()
    }

    /// Stops intake and waits until every queued item has resolved.
    pub async fn shutdown(&self) {
        lock_unpoisoned(&self.sender).take();
        let workers = std::mem::take(&mut *lock_unpoisoned(&self.workers));
        for worker in workers {
            if let Err(error) = worker.await {
                warn!(error = %error, "dispatcher worker ended abnormally");
            }
        }
    }

    fn submit(&self, item: QueueItem) -> Result<oneshot::Receiver<Result<HttpResponse>>> {
        let sender = lock_unpoisoned(&self.sender);
        let Some(sender) = sender.as_ref() else {
            return Err(Error::DispatcherClosed);
        };
        let (reply, outcome) = oneshot::channel();
        self.shared.counters.record_submitted();
        if sender.send(Job { item, reply }).is_err() {
            self.shared.counters.record_unsent();
            return Err(Error::DispatcherClosed);
        }
        Ok(outcome)
    }
}

struct Shared {
    config: DispatcherConfig,
    pipeline: Pipeline,
    caching: bool,
    backoff: Arc<BackoffController>,
    reporter: Arc<dyn Reporter>,
    counters: QueueCounters,
}

async fn run_worker(shared: Arc<Shared>, receiver: JobReceiver, worker: usize) {
    loop {
        // Leave items queued while the gate is closed.
        while !shared.backoff.is_allowed() {
            sleep(shared.config.admission_poll_interval).await;
        }
        let job = receiver.lock().await.recv().await;
        let Some(job) = job else {
            debug!(worker, "dispatcher worker stopping");
            return;
        };
        shared.counters.record_dequeued();

        let started_at = Instant::now();
        let result = shared.process(&job.item).await;
        shared.counters.record_completed(&result, started_at.elapsed());
        // The submitter may have stopped waiting; the item still ran to completion.
        let _ = job.reply.send(result);
    }
}

impl Shared {
    async fn process(&self, item: &QueueItem) -> Result<HttpResponse> {
        let url = redact_uri_for_logs(&item.url);
        let request = match FetchRequest::from_item(
            item,
            transport_timeout(self.config.max_timeout, self.config.timeout_margin),
        ) {
            Ok(request) => request,
            Err(error) => {
                self.reporter.warn(&format!("{url} failed: {error}"));
                return Err(error);
            }
        };
        let max_attempts = self.config.max_attempts();
        let mut attempt = 1_usize;

        loop {
            self.admit().await;
            let _active = self.counters.enter_active();
            let span = info_span!(
                "etagq.fetch",
                url = %url,
                attempt = attempt,
                max_attempts = max_attempts
            );

            let outcome = async {
                debug!("sending request");
                self.reporter.verbose(&format!("fetching {url}"));
                self.attempt(request.clone(), &url).await
            }
            .instrument(span.clone())
            .await;

            let error = match self.classify(outcome) {
                Disposition::Deliver(response) => return Ok(response),
                Disposition::Fail(error) => {
                    self.reporter.warn(&format!("{url} failed: {error}"));
                    return Err(error);
                }
                Disposition::Retry(error) => error,
            };

            if matches!(error, Error::Timeout { .. }) {
                self.reporter.warn(&format!("{url} timed out"));
            }
            self.backoff.trigger();
            if attempt >= max_attempts {
                self.reporter.warn(&format!("{url} failed: {error}"));
                return Err(error);
            }

            span.in_scope(|| {
                warn!(
                    delay_ms = self.config.retry_delay.as_millis() as u64,
                    error = %error,
                    "retrying request"
                );
            });
            self.counters.record_retry();
            if !self.config.retry_delay.is_zero() {
                sleep(self.config.retry_delay).await;
            }
            attempt += 1;
        }
    }

    async fn admit(&self) {
        if self.backoff.is_allowed() {
            return;
        }
        let _held = self.counters.enter_held();
        debug!("holding request while backoff is active");
        while !self.backoff.is_allowed() {
            sleep(self.config.admission_poll_interval).await;
        }
    }

    async fn attempt(&self, request: FetchRequest, url: &str) -> Result<HttpResponse> {
        match timeout(self.config.max_timeout, self.pipeline.execute(request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                timeout_ms: self.config.max_timeout.as_millis(),
                url: url.to_owned(),
            }),
        }
    }

    fn classify(&self, outcome: Result<HttpResponse>) -> Disposition {
        match outcome {
            Ok(response) => Disposition::Deliver(response),
            Err(error) if error.is_transient() => Disposition::Retry(error),
            Err(
                error @ Error::HttpStatus {
                    status: NOT_MODIFIED,
                    ..
                },
            ) if self.caching => Disposition::Fail(error),
            Err(Error::HttpStatus { response, .. }) => Disposition::Deliver(*response),
            Err(error) => Disposition::Fail(error),
        }
    }
}
