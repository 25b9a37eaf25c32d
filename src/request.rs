use std::collections::BTreeMap;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::HeaderMap;
use http::header::{AUTHORIZATION, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_MAX_TIMEOUT;
use crate::error::Error;
use crate::util::{append_query_pairs, header_map_from_pairs};

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub(crate) fn basic_authorization(&self) -> Result<HeaderValue, Error> {
        let token = STANDARD.encode(format!("{}:{}", self.username, self.password));
        let mut value = HeaderValue::from_str(&format!("Basic {token}")).map_err(|source| {
            Error::InvalidHeaderValue {
                name: AUTHORIZATION.as_str().to_owned(),
                source,
            }
        })?;
        value.set_sensitive(true);
        Ok(value)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Credentials>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

impl QueueItem {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn auth(mut self, credentials: Credentials) -> Self {
        self.auth = Some(credentials);
        self
    }
}

impl From<&str> for QueueItem {
    fn from(url: &str) -> Self {
        Self::new(url)
    }
}

impl From<String> for QueueItem {
    fn from(url: String) -> Self {
        Self::new(url)
    }
}

/// One GET attempt. `params` are merged into the url only on the wire.
#[derive(Clone, Debug)]
pub struct FetchRequest {
    url: String,
    headers: HeaderMap,
    params: Vec<(String, String)>,
    auth: Option<Credentials>,
    timeout: Duration,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HeaderMap::new(),
            params: Vec::new(),
            auth: None,
            timeout: DEFAULT_MAX_TIMEOUT,
        }
    }

    pub(crate) fn from_item(item: &QueueItem, timeout: Duration) -> Result<Self, Error> {
        Ok(Self {
            url: item.url.clone(),
            headers: header_map_from_pairs(&item.headers)?,
            params: item
                .params
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            auth: item.auth.clone(),
            timeout,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_header(mut self, name: http::header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn with_auth(mut self, credentials: Credentials) -> Self {
        self.auth = Some(credentials);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn auth(&self) -> Option<&Credentials> {
        self.auth.as_ref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn target_url(&self) -> String {
        append_query_pairs(&self.url, &self.params)
    }

    /// Headers to put on the wire, including Basic auth when credentials are set.
    pub fn wire_headers(&self) -> Result<HeaderMap, Error> {
        let mut headers = self.headers.clone();
        if let Some(credentials) = &self.auth {
            headers.insert(AUTHORIZATION, credentials.basic_authorization()?);
        }
        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::header::AUTHORIZATION;

    use super::{Credentials, FetchRequest, QueueItem};
    use crate::error::Error;

    #[test]
    fn from_item_keeps_url_verbatim_and_defers_params() {
        let item = QueueItem::new("https://example.com/a?x=1")
            .param("page", "2")
            .header("accept", "text/html");
        let request =
            FetchRequest::from_item(&item, Duration::from_secs(1)).expect("item should convert");

        assert_eq!(request.url(), "https://example.com/a?x=1");
        assert_eq!(request.target_url(), "https://example.com/a?x=1&page=2");
        assert_eq!(
            request.headers().get("accept").map(|value| value.as_bytes()),
            Some(&b"text/html"[..])
        );
    }

    #[test]
    fn from_item_rejects_invalid_header_name() {
        let item = QueueItem::new("https://example.com/").header("bad header", "x");
        let error = FetchRequest::from_item(&item, Duration::from_secs(1))
            .expect_err("header with space should be rejected");
        match error {
            Error::InvalidHeaderName { name, .. } => assert_eq!(name, "bad header"),
            other => panic!("unexpected error variant: {other}"),
        }
    }

    #[test]
    fn wire_headers_add_basic_authorization() {
        let request = FetchRequest::get("https://example.com/")
            .with_auth(Credentials::new("aladdin", "opensesame"));
        let headers = request.wire_headers().expect("credentials should encode");
        assert_eq!(
            headers.get(AUTHORIZATION).map(|value| value.as_bytes()),
            Some(&b"Basic YWxhZGRpbjpvcGVuc2VzYW1l"[..])
        );
        assert!(request.headers().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn credentials_debug_hides_password() {
        let text = format!("{:?}", Credentials::new("user", "hunter2"));
        assert!(!text.contains("hunter2"));
    }

    #[test]
    fn queue_item_deserializes_with_optional_fields_absent() {
        let item: QueueItem = serde_json::from_str(r#"{"url": "https://example.com/a"}"#)
            .expect("minimal item should parse");
        assert_eq!(item, QueueItem::new("https://example.com/a"));
    }
}
