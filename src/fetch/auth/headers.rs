use crate::fetch::client::HttpClient;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

/// An [`HttpClient`] wrapper that injects a fixed set of HTTP headers, such as
/// an agency API key (`X-API-Key: <key>`).
///
/// Names and values are validated once at construction so that `execute`
/// cannot fail on a malformed header.
pub struct StaticHeaders<C> {
    inner: C,
    headers: HeaderMap,
}

impl<C> StaticHeaders<C> {
    pub fn new<'a>(inner: C, pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name '{name}'"))?;
            let header_value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header '{name}'"))?;
            headers.insert(header_name, header_value);
        }
        Ok(Self { inner, headers })
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for StaticHeaders<C> {
    async fn execute(&self, mut req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        for (name, value) in &self.headers {
            req.headers_mut().insert(name.clone(), value.clone());
        }
        self.inner.execute(req).await
    }
}
