use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use etagq::prelude::{
    CacheKey, CacheStore, Dispatcher, DispatcherConfig, Error, ErrorCode, FetchRequest,
    HyperTransport, MemoryCacheStore, Pipeline, QueueItem, RedirectPolicy, Transport,
    TransportError,
};
use etagq::{Credentials, TransportErrorKind};
use http::StatusCode;

#[derive(Clone)]
struct MockResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    delay: Duration,
}

impl MockResponse {
    fn new(status: u16, headers: Vec<(&str, &str)>, body: &str) -> Self {
        Self {
            status,
            headers: headers
                .into_iter()
                .map(|(name, value)| (name.to_owned(), value.to_owned()))
                .collect(),
            body: body.as_bytes().to_vec(),
            delay: Duration::ZERO,
        }
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|window| window == b"\r\n\r\n")
}

fn read_http_head(stream: &mut TcpStream) -> std::io::Result<String> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;

    let mut raw = Vec::new();
    loop {
        let mut chunk = [0_u8; 1024];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..read]);
        if let Some(header_end) = find_header_end(&raw) {
            raw.truncate(header_end);
            break;
        }
    }

    Ok(String::from_utf8_lossy(&raw).into_owned())
}

fn write_http_response(stream: &mut TcpStream, response: &MockResponse) -> std::io::Result<()> {
    let mut raw = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        status_text(response.status),
        response.body.len()
    )
    .into_bytes();

    for (name, value) in &response.headers {
        raw.extend_from_slice(name.as_bytes());
        raw.extend_from_slice(b": ");
        raw.extend_from_slice(value.as_bytes());
        raw.extend_from_slice(b"\r\n");
    }
    raw.extend_from_slice(b"\r\n");
    raw.extend_from_slice(&response.body);

    stream.write_all(&raw)?;
    stream.flush()
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        404 => "Not Found",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Serves one scripted response per connection, in order, and records each request head.
struct MockServer {
    authority: String,
    heads: Arc<Mutex<Vec<String>>>,
    join: Option<JoinHandle<()>>,
}

impl MockServer {
    fn start(responses: Vec<MockResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let authority = listener
            .local_addr()
            .expect("read local address")
            .to_string();
        listener
            .set_nonblocking(true)
            .expect("set listener nonblocking");

        let heads = Arc::new(Mutex::new(Vec::new()));
        let heads_clone = Arc::clone(&heads);
        let join = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut remaining = responses.into_iter();
            let mut next = remaining.next();

            while let Some(response) = next.take() {
                if Instant::now() >= deadline {
                    break;
                }
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        let _ = stream.set_nonblocking(false);
                        if let Ok(head) = read_http_head(&mut stream) {
                            lock_unpoisoned(&heads_clone).push(head);
                        }
                        if !response.delay.is_zero() {
                            thread::sleep(response.delay);
                        }
                        let _ = write_http_response(&mut stream, &response);
                        next = remaining.next();
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(2));
                        next = Some(response);
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            authority,
            heads,
            join: Some(join),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.authority)
    }

    fn heads(&self) -> Vec<String> {
        lock_unpoisoned(&self.heads).clone()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn header_line<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.split("\r\n").find_map(|line| {
        let (line_name, value) = line.split_once(':')?;
        line_name
            .trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim())
    })
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn http_transport() -> HyperTransport {
    init_tracing();
    HyperTransport::new().expect("build hyper transport")
}

fn fast_config() -> DispatcherConfig {
    init_tracing();
    DispatcherConfig::default()
        .with_max_timeout(Duration::from_secs(2))
        .with_retry_delay(Duration::from_millis(20))
        .with_backoff_step(Duration::from_millis(10))
        .with_admission_poll_interval(Duration::from_millis(5))
}

#[tokio::test]
async fn transport_sends_query_credentials_and_user_agent() {
    let server = MockServer::start(vec![MockResponse::new(200, vec![], "ok")]);

    let request = FetchRequest::get(server.url("/items"))
        .with_param("page", "2")
        .with_auth(Credentials::new("aladdin", "opensesame"));
    let response = http_transport()
        .send(request)
        .await
        .expect("request should succeed");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text_lossy(), "ok");

    let heads = server.heads();
    assert_eq!(heads.len(), 1);
    assert!(heads[0].starts_with("GET /items?page=2 HTTP/1.1"));
    assert_eq!(
        header_line(&heads[0], "authorization"),
        Some("Basic YWxhZGRpbjpvcGVuc2VzYW1l")
    );
    let user_agent = header_line(&heads[0], "user-agent").expect("user agent header");
    assert!(user_agent.starts_with("etagq/"));
}

#[tokio::test]
async fn transport_returns_error_statuses_as_responses() {
    let server = MockServer::start(vec![MockResponse::new(503, vec![], "busy")]);

    let response = http_transport()
        .send(FetchRequest::get(server.url("/busy")))
        .await
        .expect("status is not a transport failure");
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.text_lossy(), "busy");
}

#[tokio::test]
async fn transport_enforces_body_limit() {
    let server = MockServer::start(vec![MockResponse::new(200, vec![], "too long body")]);
    let transport = HyperTransport::builder()
        .max_response_body_bytes(4)
        .try_build()
        .expect("build hyper transport");

    let error = Pipeline::new(Arc::new(transport))
        .get(server.url("/big"))
        .await
        .expect_err("body over limit");
    match error {
        Error::Transport { kind, .. } => assert_eq!(kind, TransportErrorKind::Read),
        other => panic!("unexpected error variant: {other}"),
    }
}

#[tokio::test]
async fn transport_times_out_slow_server() {
    let server = MockServer::start(vec![
        MockResponse::new(200, vec![], "late").delayed(Duration::from_millis(400)),
    ]);

    let error = http_transport()
        .send(FetchRequest::get(server.url("/slow")).with_timeout(Duration::from_millis(100)))
        .await
        .expect_err("slow server should time out");
    assert!(matches!(error, TransportError::Timeout { timeout_ms: 100 }));
}

#[tokio::test]
async fn refused_connection_is_classified_as_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("reserve a free port");
    let authority = listener
        .local_addr()
        .expect("read local address")
        .to_string();
    drop(listener);

    let error = http_transport()
        .send(FetchRequest::get(format!("http://{authority}/")))
        .await
        .expect_err("nothing listens on the port");
    match error {
        TransportError::Failed { kind, .. } => assert_eq!(kind, TransportErrorKind::Connect),
        other => panic!("unexpected transport error: {other}"),
    }
}

#[tokio::test]
async fn dispatcher_revalidates_with_server_etag() {
    let server = MockServer::start(vec![
        MockResponse::new(200, vec![("ETag", "\"abc\"")], "payload"),
        MockResponse::new(304, vec![("ETag", "\"abc\"")], ""),
    ]);
    let store = Arc::new(MemoryCacheStore::new());
    let dispatcher = Dispatcher::builder()
        .config(fast_config())
        .cache_store_arc(store.clone())
        .try_build()
        .expect("build dispatcher");
    let url = server.url("/doc");

    let first = dispatcher.push(url.as_str()).await.expect("first fetch");
    assert_eq!(first.text_lossy(), "payload");
    assert_eq!(store.len(), 1);

    let second = dispatcher.push(url.as_str()).await.expect("revalidated fetch");
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.text_lossy(), "payload");

    let heads = server.heads();
    assert_eq!(heads.len(), 2);
    assert_eq!(header_line(&heads[0], "if-none-match"), None);
    assert_eq!(header_line(&heads[1], "if-none-match"), Some("\"abc\""));
}

#[tokio::test]
async fn dispatcher_retries_server_error_and_delivers_client_error() {
    let server = MockServer::start(vec![
        MockResponse::new(503, vec![], "busy"),
        MockResponse::new(200, vec![], "recovered"),
        MockResponse::new(404, vec![], "missing"),
    ]);
    let dispatcher = Dispatcher::builder()
        .config(fast_config().with_concurrent(1))
        .try_build()
        .expect("build dispatcher");

    let recovered = dispatcher
        .push(server.url("/flaky"))
        .await
        .expect("retry recovers");
    assert_eq!(recovered.text_lossy(), "recovered");

    let missing = dispatcher
        .push(QueueItem::new(server.url("/missing")))
        .await
        .expect("4xx is delivered");
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let stats = dispatcher.stats();
    assert_eq!(stats.retries, 1);
    assert_eq!(stats.backoff_trips, 1);
    assert_eq!(stats.succeeded, 2);
    assert_eq!(server.heads().len(), 3);
}

#[tokio::test]
async fn dispatcher_times_out_slow_server_without_retries() {
    let server = MockServer::start(vec![
        MockResponse::new(200, vec![], "late").delayed(Duration::from_millis(600)),
    ]);
    let dispatcher = Dispatcher::builder()
        .config(
            fast_config()
                .with_max_timeout(Duration::from_millis(300))
                .with_max_retries(0),
        )
        .try_build()
        .expect("build dispatcher");

    let error = dispatcher
        .push(server.url("/slow"))
        .await
        .expect_err("attempt should time out");
    assert_eq!(error.code(), ErrorCode::Timeout);
    assert_eq!(dispatcher.backoff().trips(), 1);
}

#[tokio::test]
async fn dispatcher_follows_redirect_and_caches_under_submitted_url() {
    let server = MockServer::start(vec![
        MockResponse::new(301, vec![("Location", "/moved")], ""),
        MockResponse::new(200, vec![("ETag", "\"t1\"")], "target"),
    ]);
    let store = Arc::new(MemoryCacheStore::new());
    let dispatcher = Dispatcher::builder()
        .config(fast_config())
        .cache_store_arc(store.clone())
        .try_build()
        .expect("build dispatcher");
    let old_url = server.url("/old");

    let response = dispatcher.push(old_url.as_str()).await.expect("redirect followed");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text_lossy(), "target");

    let entry = store
        .get(CacheKey::for_url(&old_url).as_str())
        .await
        .expect("read store")
        .expect("entry under the submitted url");
    assert_eq!(entry.data.as_ref(), b"target");
    assert_eq!(entry.etag(), Some("\"t1\""));
    assert!(
        store
            .get(CacheKey::for_url(&server.url("/moved")).as_str())
            .await
            .expect("read store")
            .is_none()
    );

    let heads = server.heads();
    assert_eq!(heads.len(), 2);
    assert!(heads[0].starts_with("GET /old HTTP/1.1"));
    assert!(heads[1].starts_with("GET /moved HTTP/1.1"));
}

#[tokio::test]
async fn transport_fails_when_redirect_limit_is_exceeded() {
    let server = MockServer::start(vec![
        MockResponse::new(302, vec![("Location", "/b")], ""),
        MockResponse::new(302, vec![("Location", "/c")], ""),
    ]);
    init_tracing();
    let transport = HyperTransport::builder()
        .redirect_policy(RedirectPolicy::limited(1))
        .try_build()
        .expect("build hyper transport");

    let error = Pipeline::new(Arc::new(transport))
        .get(server.url("/a"))
        .await
        .expect_err("second hop exceeds the limit");
    match error {
        Error::Transport { kind, .. } => assert_eq!(kind, TransportErrorKind::Redirect),
        other => panic!("unexpected error variant: {other}"),
    }
    assert_eq!(server.heads().len(), 2);
}

#[tokio::test]
async fn transport_returns_redirect_when_following_is_disabled() {
    let server = MockServer::start(vec![MockResponse::new(
        301,
        vec![("Location", "/moved")],
        "",
    )]);
    init_tracing();
    let transport = HyperTransport::builder()
        .redirect_policy(RedirectPolicy::none())
        .try_build()
        .expect("build hyper transport");

    let response = transport
        .send(FetchRequest::get(server.url("/old")))
        .await
        .expect("redirect status is a response");
    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(server.heads().len(), 1);
}

#[tokio::test]
async fn cross_origin_redirect_drops_credentials() {
    let target = MockServer::start(vec![MockResponse::new(200, vec![], "elsewhere")]);
    let target_url = target.url("/landing");
    let origin = MockServer::start(vec![MockResponse::new(
        302,
        vec![("Location", target_url.as_str())],
        "",
    )]);

    let response = http_transport()
        .send(
            FetchRequest::get(origin.url("/start"))
                .with_auth(Credentials::new("aladdin", "opensesame")),
        )
        .await
        .expect("cross-origin redirect followed");
    assert_eq!(response.text_lossy(), "elsewhere");

    let origin_heads = origin.heads();
    assert!(header_line(&origin_heads[0], "authorization").is_some());
    let target_heads = target.heads();
    assert_eq!(target_heads.len(), 1);
    assert_eq!(header_line(&target_heads[0], "authorization"), None);
}
